//! Loss recovery and congestion control (RFC 9002).
//!
//! NewReno with packet- and time-threshold loss detection, a PTO timer with
//! exponential backoff, and interval pacing. All clocks are injected
//! `Instant`s so the state machine stays deterministic under test.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::frame::Frame;
use crate::packet::Epoch;

/// Reordering threshold in packets before a gap declares loss.
const PACKET_THRESHOLD: u64 = 3;

/// Time threshold numerator/denominator: 9/8 · max(srtt, latest_rtt).
const TIME_THRESHOLD_NUM: u32 = 9;
const TIME_THRESHOLD_DEN: u32 = 8;

/// Timer granularity floor.
const GRANULARITY: Duration = Duration::from_millis(1);

/// RTT estimate before the first sample (RFC 9002 §6.2.2).
const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Pacing gain applied over cwnd/srtt.
const PACING_GAIN: f64 = 1.25;

/// Packets allowed to leave unpaced after quiescence.
const PACING_BURST: usize = 10;

/// Smoothed RTT state (RFC 9002 §5).
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Option<Duration>,
    var: Duration,
    min: Duration,
}

impl Default for RttEstimator {
    fn default() -> Self {
        RttEstimator {
            latest: INITIAL_RTT,
            smoothed: None,
            var: INITIAL_RTT / 2,
            min: INITIAL_RTT,
        }
    }
}

impl RttEstimator {
    /// Feed one RTT sample; `ack_delay` is already scaled to a duration and
    /// bounded by the peer's max_ack_delay.
    pub fn on_sample(&mut self, rtt: Duration, ack_delay: Duration) {
        self.latest = rtt;
        match self.smoothed {
            None => {
                self.smoothed = Some(rtt);
                self.var = rtt / 2;
                self.min = rtt;
            }
            Some(smoothed) => {
                self.min = self.min.min(rtt);
                // Only credit ack delay when it leaves rtt above min.
                let adjusted = if rtt >= self.min + ack_delay { rtt - ack_delay } else { rtt };
                let delta = if smoothed > adjusted {
                    smoothed - adjusted
                } else {
                    adjusted - smoothed
                };
                self.var = (3 * self.var + delta) / 4;
                self.smoothed = Some((7 * smoothed + adjusted) / 8);
            }
        }
    }

    pub fn smoothed(&self) -> Duration {
        self.smoothed.unwrap_or(INITIAL_RTT)
    }

    pub fn latest(&self) -> Duration {
        self.latest
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn var(&self) -> Duration {
        self.var
    }

    /// Base PTO interval: srtt + max(4·rttvar, granularity).
    pub fn pto_base(&self) -> Duration {
        self.smoothed() + (4 * self.var).max(GRANULARITY)
    }
}

/// NewReno congestion controller (RFC 9002 §7).
#[derive(Debug)]
pub struct NewReno {
    max_datagram_size: usize,
    cwnd: usize,
    ssthresh: usize,
    bytes_in_flight: usize,
    /// Packets sent before this time are in the current recovery episode.
    recovery_start: Option<Instant>,
    /// Acked bytes accumulated toward the next cwnd increment in avoidance.
    avoidance_credit: usize,
}

impl NewReno {
    pub fn new(max_datagram_size: usize) -> Self {
        let initial = (10 * max_datagram_size).min(14_720.max(2 * max_datagram_size));
        NewReno {
            max_datagram_size,
            cwnd: initial,
            ssthresh: usize::MAX,
            bytes_in_flight: 0,
            recovery_start: None,
            avoidance_credit: 0,
        }
    }

    pub fn cwnd(&self) -> usize {
        self.cwnd
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.bytes_in_flight
    }

    pub fn available_window(&self) -> usize {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    pub fn on_packet_sent(&mut self, bytes: usize) {
        self.bytes_in_flight += bytes;
    }

    pub fn on_packet_acked(&mut self, bytes: usize, time_sent: Instant) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
        // No growth for packets sent during recovery.
        if let Some(start) = self.recovery_start {
            if time_sent <= start {
                return;
            }
            self.recovery_start = None;
        }
        if self.in_slow_start() {
            self.cwnd += bytes;
        } else {
            self.avoidance_credit += bytes;
            if self.avoidance_credit >= self.cwnd {
                self.avoidance_credit -= self.cwnd;
                self.cwnd += self.max_datagram_size;
            }
        }
    }

    /// Congestion event: halve the window once per recovery episode.
    pub fn on_congestion_event(&mut self, now: Instant, time_sent: Instant) {
        if let Some(start) = self.recovery_start {
            if time_sent <= start {
                return;
            }
        }
        self.recovery_start = Some(now);
        self.cwnd = (self.cwnd / 2).max(2 * self.max_datagram_size);
        self.ssthresh = self.cwnd;
        self.avoidance_credit = 0;
        debug!(cwnd = self.cwnd, "congestion event, window halved");
    }

    pub fn on_packet_lost(&mut self, bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    pub fn on_packet_discarded(&mut self, bytes: usize) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes);
    }

    /// Persistent congestion collapses to the minimum window.
    pub fn on_persistent_congestion(&mut self) {
        self.cwnd = 2 * self.max_datagram_size;
        self.avoidance_credit = 0;
        debug!(cwnd = self.cwnd, "persistent congestion");
    }

    /// Restart slow start after an idle period (RFC 9002 §7.8).
    pub fn on_idle_restart(&mut self) {
        let initial = (10 * self.max_datagram_size).min(14_720.max(2 * self.max_datagram_size));
        self.cwnd = self.cwnd.min(initial);
    }
}

/// A sent packet retained until acknowledged or declared lost.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet_number: u64,
    pub time_sent: Instant,
    pub size: usize,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    /// Frames to re-queue on loss.
    pub frames: Vec<Frame>,
}

#[derive(Debug, Default)]
struct SpaceRecovery {
    sent: BTreeMap<u64, SentPacket>,
    largest_acked: Option<u64>,
    loss_time: Option<Instant>,
    last_ack_eliciting_sent: Option<Instant>,
}

/// Result of processing one ACK frame.
#[derive(Debug, Default)]
pub struct AckOutcome {
    pub newly_acked: Vec<SentPacket>,
    pub lost: Vec<SentPacket>,
    pub rtt_updated: bool,
}

/// Per-connection loss recovery spanning all three packet-number spaces.
pub struct LossRecovery {
    spaces: [SpaceRecovery; Epoch::COUNT],
    pub rtt: RttEstimator,
    pub congestion: NewReno,
    pto_count: u32,
    max_ack_delay: Duration,
}

impl LossRecovery {
    pub fn new(max_datagram_size: usize) -> Self {
        LossRecovery {
            spaces: Default::default(),
            rtt: RttEstimator::default(),
            congestion: NewReno::new(max_datagram_size),
            pto_count: 0,
            max_ack_delay: Duration::from_millis(25),
        }
    }

    pub fn set_max_ack_delay(&mut self, delay: Duration) {
        self.max_ack_delay = delay;
    }

    pub fn pto_count(&self) -> u32 {
        self.pto_count
    }

    fn space(&mut self, epoch: Epoch) -> &mut SpaceRecovery {
        &mut self.spaces[epoch as usize]
    }

    pub fn on_packet_sent(&mut self, epoch: Epoch, packet: SentPacket) {
        if packet.in_flight {
            self.congestion.on_packet_sent(packet.size);
            if packet.ack_eliciting {
                self.space(epoch).last_ack_eliciting_sent = Some(packet.time_sent);
            }
        }
        self.space(epoch).sent.insert(packet.packet_number, packet);
    }

    /// Largest packet number acknowledged in a space, if any.
    pub fn largest_acked(&self, epoch: Epoch) -> Option<u64> {
        self.spaces[epoch as usize].largest_acked
    }

    /// Whether any ack-eliciting packets remain outstanding anywhere.
    pub fn has_ack_eliciting_in_flight(&self) -> bool {
        self.spaces
            .iter()
            .any(|s| s.sent.values().any(|p| p.ack_eliciting && p.in_flight))
    }

    /// Process an ACK frame for `epoch`.
    ///
    /// `ack_delay` must already be scaled by the peer's exponent.
    pub fn on_ack_received(
        &mut self,
        epoch: Epoch,
        largest: u64,
        ack_delay: Duration,
        ranges: &[(u64, u64)],
        now: Instant,
    ) -> AckOutcome {
        let max_ack_delay = self.max_ack_delay;
        let space = &mut self.spaces[epoch as usize];
        let mut outcome = AckOutcome::default();

        if space.largest_acked.is_none_or(|l| largest > l) {
            space.largest_acked = Some(largest);
        }

        for &(start, end) in ranges {
            let acked: Vec<u64> = space.sent.range(start..=end).map(|(pn, _)| *pn).collect();
            for pn in acked {
                if let Some(packet) = space.sent.remove(&pn) {
                    outcome.newly_acked.push(packet);
                }
            }
        }
        if outcome.newly_acked.is_empty() {
            return outcome;
        }

        // RTT sample only when the largest acked is newly acked and
        // ack-eliciting (RFC 9002 §5.1).
        if let Some(largest_pkt) =
            outcome.newly_acked.iter().find(|p| p.packet_number == largest)
        {
            if largest_pkt.ack_eliciting {
                let delay = if epoch == Epoch::Application {
                    ack_delay.min(max_ack_delay)
                } else {
                    Duration::ZERO
                };
                self.rtt.on_sample(now.duration_since(largest_pkt.time_sent), delay);
                outcome.rtt_updated = true;
            }
        }

        for packet in &outcome.newly_acked {
            if packet.in_flight {
                self.congestion.on_packet_acked(packet.size, packet.time_sent);
            }
        }

        self.pto_count = 0;
        outcome.lost = self.detect_lost(epoch, now);
        outcome
    }

    /// Run loss detection for a space, removing and returning lost packets.
    fn detect_lost(&mut self, epoch: Epoch, now: Instant) -> Vec<SentPacket> {
        let loss_delay = TIME_THRESHOLD_NUM
            * self.rtt.smoothed().max(self.rtt.latest()).max(GRANULARITY)
            / TIME_THRESHOLD_DEN;
        let space = &mut self.spaces[epoch as usize];
        let Some(largest_acked) = space.largest_acked else {
            return Vec::new();
        };

        let mut lost = Vec::new();
        space.loss_time = None;
        let candidates: Vec<u64> =
            space.sent.range(..largest_acked).map(|(pn, _)| *pn).collect();
        for pn in candidates {
            let packet = &space.sent[&pn];
            let time_lost = packet.time_sent + loss_delay;
            if largest_acked >= pn + PACKET_THRESHOLD || time_lost <= now {
                if let Some(packet) = space.sent.remove(&pn) {
                    trace!(pn, epoch = ?epoch, "packet declared lost");
                    lost.push(packet);
                }
            } else {
                let next = space.loss_time.map_or(time_lost, |t: Instant| t.min(time_lost));
                space.loss_time = Some(next);
            }
        }

        if let Some(first) = lost.iter().filter(|p| p.in_flight).min_by_key(|p| p.time_sent) {
            let newest = lost
                .iter()
                .filter(|p| p.in_flight)
                .max_by_key(|p| p.time_sent)
                .unwrap_or(first);
            for packet in lost.iter().filter(|p| p.in_flight) {
                self.congestion.on_packet_lost(packet.size);
            }
            self.congestion.on_congestion_event(now, newest.time_sent);

            // Persistent congestion: losses spanning the persistence window.
            let duration = (self.rtt.smoothed() + (4 * self.rtt.var()).max(GRANULARITY)
                + self.max_ack_delay)
                * 3;
            if newest.time_sent.duration_since(first.time_sent) > duration {
                self.congestion.on_persistent_congestion();
            }
        }
        lost
    }

    /// Earliest timer across loss times and the PTO.
    pub fn loss_detection_timeout(&self) -> Option<Instant> {
        let loss = self.spaces.iter().filter_map(|s| s.loss_time).min();
        if loss.is_some() {
            return loss;
        }
        // PTO applies to the space with the oldest outstanding
        // ack-eliciting packet.
        let pto = self.pto_base() * 2u32.pow(self.pto_count.min(16));
        self.spaces
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sent.values().any(|p| p.ack_eliciting && p.in_flight))
            .filter_map(|(i, s)| {
                let extra = if i == Epoch::Application as usize {
                    self.max_ack_delay
                } else {
                    Duration::ZERO
                };
                s.last_ack_eliciting_sent.map(|t| t + pto + extra)
            })
            .min()
    }

    fn pto_base(&self) -> Duration {
        self.rtt.pto_base()
    }

    /// Handle a fired loss-detection timer. Returns packets declared lost;
    /// when empty, the caller must send a probe.
    pub fn on_loss_detection_timeout(&mut self, now: Instant) -> Vec<SentPacket> {
        // A pending loss time takes priority over the PTO.
        let epoch = self
            .spaces
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.loss_time.map(|t| (i, t)))
            .min_by_key(|&(_, t)| t)
            .map(|(i, _)| i);
        if let Some(idx) = epoch {
            let epoch = [Epoch::Initial, Epoch::Handshake, Epoch::Application][idx];
            return self.detect_lost(epoch, now);
        }
        self.pto_count += 1;
        debug!(pto_count = self.pto_count, "probe timeout fired");
        Vec::new()
    }

    /// Current PTO interval including backoff, used for drain timers.
    pub fn pto_interval(&self) -> Duration {
        (self.pto_base() + self.max_ack_delay) * 2u32.pow(self.pto_count.min(16))
    }

    /// Drop all state for a space when its keys are discarded.
    pub fn discard_space(&mut self, epoch: Epoch) {
        let space = &mut self.spaces[epoch as usize];
        for (_, packet) in std::mem::take(&mut space.sent) {
            if packet.in_flight {
                self.congestion.on_packet_discarded(packet.size);
            }
        }
        space.loss_time = None;
        space.last_ack_eliciting_sent = None;
    }

    /// Frames from still-outstanding packets in a space, for retransmission
    /// after 0-RTT rejection or PTO probing.
    pub fn take_outstanding_frames(&mut self, epoch: Epoch) -> Vec<Frame> {
        let space = &mut self.spaces[epoch as usize];
        let mut frames = Vec::new();
        for (_, packet) in std::mem::take(&mut space.sent) {
            if packet.in_flight {
                self.congestion.on_packet_discarded(packet.size);
            }
            frames.extend(packet.frames);
        }
        frames
    }
}

/// Interval pacer: spreads sends at `PACING_GAIN · cwnd / srtt` with a
/// small burst allowance out of quiescence.
#[derive(Debug)]
pub struct Pacer {
    burst_tokens: usize,
    next_release: Option<Instant>,
}

impl Default for Pacer {
    fn default() -> Self {
        Pacer { burst_tokens: PACING_BURST, next_release: None }
    }
}

impl Pacer {
    /// Earliest time the next packet may leave. `None` means immediately.
    pub fn next_send_time(&self) -> Option<Instant> {
        if self.burst_tokens > 0 {
            return None;
        }
        self.next_release
    }

    pub fn on_packet_sent(
        &mut self,
        now: Instant,
        bytes: usize,
        bytes_in_flight: usize,
        cwnd: usize,
        srtt: Duration,
    ) {
        if bytes_in_flight == 0 {
            self.burst_tokens = PACING_BURST;
        }
        if self.burst_tokens > 0 {
            self.burst_tokens -= 1;
            self.next_release = None;
            return;
        }
        let rate = PACING_GAIN * cwnd as f64 / srtt.as_secs_f64().max(1e-6);
        let delay = Duration::from_secs_f64(bytes as f64 / rate.max(1.0));
        let base = self.next_release.map_or(now, |t| t.max(now));
        self.next_release = Some(base + delay);
    }
}
