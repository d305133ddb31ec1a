//! Client connection state machine (RFC 9000 §5–§10).
//!
//! Sans-IO: datagrams go in through [`Connection::recv`], come out through
//! [`Connection::poll_send`], and time is an injected [`Instant`]. The
//! driver task owns the socket and timers; everything protocol-visible
//! happens here, which makes handshake interleavings, loss and 0-RTT
//! rejection all testable without a network.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::crypto::{DirectionalKeys, PacketKeys, TAG_LEN};
use crate::error::{ConnectionError, TransportError};
use crate::frame::{self, Frame};
use crate::packet::{
    decrypt_packet, parse_header, ConnectionId, Epoch, PacketBuilder, PacketType,
};
use crate::params::TransportParameters;
use crate::recovery::{LossRecovery, Pacer, SentPacket};
use crate::stream::{Side, StreamId, StreamMap, StreamPriority};
use crate::tls::TlsSession;

/// Datagrams carrying a client Initial must be at least this large.
const INITIAL_DATAGRAM_MIN: usize = 1200;

/// Estimated per-frame header overhead used when budgeting payload space.
const FRAME_OVERHEAD: usize = 24;

/// ACK delay exponent this endpoint advertises.
const LOCAL_ACK_DELAY_EXPONENT: u32 = 3;

/// Ack-eliciting packets received before an ACK is forced out.
const ACK_ELICITING_THRESHOLD: u32 = 2;

/// Bytes the client lets itself send per handshake attempt before any
/// packet from the server has authenticated the path (RFC 9000 §8.1
/// discipline, mirrored client-side so retransmission flights and early
/// data stay bounded toward an unvalidated address).
const PREVALIDATION_SEND_FACTOR: usize = 3;

/// Connection-level configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub local_params: TransportParameters,
    /// Maximum datagram size this endpoint will emit.
    pub max_datagram_size: usize,
    /// Keep-alive PING interval once established.
    pub keep_alive: Option<Duration>,
    /// Handshake retransmission budget.
    pub handshake_retries: u32,
    pub handshake_base_timeout: Duration,
    pub handshake_max_timeout: Duration,
    /// Initiate a local key update after this many 1-RTT packets.
    pub key_update_interval: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            local_params: TransportParameters::client_default(),
            max_datagram_size: 1350,
            keep_alive: Some(Duration::from_secs(15)),
            handshake_retries: 3,
            handshake_base_timeout: Duration::from_millis(500),
            handshake_max_timeout: Duration::from_secs(3),
            key_update_interval: None,
        }
    }
}

/// Externally visible connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Connected,
    /// We sent CONNECTION_CLOSE and linger to answer stray packets.
    Closing,
    /// Peer closed; we absorb in-flight packets until the drain deadline.
    Draining,
    Closed,
}

/// Events surfaced to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { used_early_data: bool },
    ZeroRttRejected,
    StreamReadable(StreamId),
    StreamReset { id: StreamId, error_code: u64 },
    StreamStopped { id: StreamId, error_code: u64 },
    NewToken(Vec<u8>),
    SessionTicket { ticket: Vec<u8>, suite: crate::crypto::CipherSuite },
    Closed(ConnectionError),
}

/// Counters exposed through the client's `stats()` surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Default)]
struct CryptoStream {
    recv: crate::stream::RecvBuffer,
    pending: VecDeque<Bytes>,
    send_offset: u64,
}

/// Received packet-number tracking for one space.
#[derive(Default)]
struct AckTracker {
    /// Inclusive, disjoint, ascending ranges of received packet numbers.
    ranges: Vec<(u64, u64)>,
    largest_time: Option<Instant>,
    ack_queued: bool,
    eliciting_since_ack: u32,
}

impl AckTracker {
    /// Record receipt; returns false for duplicates.
    fn record(&mut self, pn: u64, now: Instant) -> bool {
        let pos = self.ranges.iter().position(|&(s, e)| pn >= s.saturating_sub(1) && pn <= e + 1);
        match pos {
            Some(i) => {
                let (s, e) = self.ranges[i];
                if pn >= s && pn <= e {
                    return false;
                }
                self.ranges[i] = (s.min(pn), e.max(pn));
                // Merge with a neighbor if the gap closed.
                if i + 1 < self.ranges.len() && self.ranges[i].1 + 1 >= self.ranges[i + 1].0 {
                    let (ns, ne) = self.ranges[i + 1];
                    self.ranges[i] = (self.ranges[i].0.min(ns), self.ranges[i].1.max(ne));
                    self.ranges.remove(i + 1);
                } else if i > 0 && self.ranges[i - 1].1 + 1 >= self.ranges[i].0 {
                    let (ps, pe) = self.ranges[i - 1];
                    self.ranges[i - 1] = (ps.min(self.ranges[i].0), pe.max(self.ranges[i].1));
                    self.ranges.remove(i);
                }
            }
            None => {
                let insert_at =
                    self.ranges.partition_point(|&(s, _)| s < pn);
                self.ranges.insert(insert_at, (pn, pn));
                if self.ranges.len() > 32 {
                    self.ranges.remove(0);
                }
            }
        }
        if self.largest() == Some(pn) {
            self.largest_time = Some(now);
        }
        true
    }

    fn largest(&self) -> Option<u64> {
        self.ranges.last().map(|&(_, e)| e)
    }

    fn ack_frame(&self, now: Instant) -> Option<Frame> {
        let largest = self.largest()?;
        let delay_us = self
            .largest_time
            .map(|t| now.saturating_duration_since(t).as_micros() as u64)
            .unwrap_or(0);
        let mut ranges: Vec<(u64, u64)> = self.ranges.clone();
        ranges.reverse();
        Some(Frame::Ack {
            largest,
            delay: delay_us >> LOCAL_ACK_DELAY_EXPONENT,
            ranges,
            ecn: None,
        })
    }
}

/// A QUIC client connection.
pub struct Connection {
    config: ConnectionConfig,
    state: ConnectionState,
    tls: Box<dyn TlsSession>,

    scid: ConnectionId,
    dcid: ConnectionId,
    original_dcid: ConnectionId,
    dcid_updated: bool,
    retry_used: bool,
    token: Vec<u8>,

    keys: [Option<PacketKeys>; Epoch::COUNT],
    zero_rtt_keys: Option<DirectionalKeys>,
    /// Previous 1-RTT generation, kept until the expiry instant so
    /// reordered packets from before a key update still decrypt
    /// (RFC 9001 §6.4).
    old_app_keys: Option<(PacketKeys, Instant)>,
    key_phase: bool,
    packets_since_key_update: u64,
    app_acked_since_update: bool,

    next_pn: [u64; Epoch::COUNT],
    acks: [AckTracker; Epoch::COUNT],
    crypto: [CryptoStream; Epoch::COUNT],
    retransmit: [VecDeque<Frame>; Epoch::COUNT],
    control: VecDeque<Frame>,

    pub streams: StreamMap,
    recovery: LossRecovery,
    pacer: Pacer,

    peer_params: Option<TransportParameters>,
    peer_ack_delay_exponent: u32,
    idle_timeout: Option<Duration>,

    last_activity: Instant,
    last_send: Instant,
    handshake_deadline: Option<Instant>,
    handshake_attempts: u32,
    ack_timer: Option<Instant>,
    drain_deadline: Option<Instant>,
    close_error: Option<ConnectionError>,
    close_frame: Option<Frame>,
    close_sent: bool,

    early_data_attempted: bool,
    early_data_state_replayed: bool,
    handshake_confirmed: bool,
    connected_emitted: bool,
    ping_queued: bool,
    /// True once any authenticated packet (or a valid Retry) arrived
    /// from the peer address.
    peer_address_validated: bool,
    prevalidation_bytes_sent: usize,

    events: VecDeque<ConnectionEvent>,
    stats: ConnectionStats,
}

impl Connection {
    /// Start a client connection. The ClientHello is queued immediately;
    /// `cached_params` enables 0-RTT flow-control limits from a prior
    /// session when early data is attempted.
    pub fn new_client(
        mut tls: Box<dyn TlsSession>,
        config: ConnectionConfig,
        attempt_early_data: bool,
        cached_params: Option<&[u8]>,
        now: Instant,
    ) -> Result<Connection, TransportError> {
        let scid = ConnectionId::random(8);
        let dcid = ConnectionId::random(8);
        let mut local_params = config.local_params.clone();
        local_params.initial_source_cid = Some(scid);
        tls.set_transport_parameters(&local_params.encode());

        let mut streams = StreamMap::new(Side::Client);
        streams.apply_local_limits(
            local_params.initial_max_data,
            local_params.initial_max_streams_bidi,
            local_params.initial_max_streams_uni,
            local_params.initial_max_stream_data_bidi_local,
        );

        let idle = local_params.max_idle_timeout_ms;
        let mut conn = Connection {
            recovery: LossRecovery::new(config.max_datagram_size),
            config,
            state: ConnectionState::Handshaking,
            tls,
            scid,
            dcid,
            original_dcid: dcid,
            dcid_updated: false,
            retry_used: false,
            token: Vec::new(),
            keys: [
                Some(PacketKeys::initial(dcid.as_ref(), true)),
                None,
                None,
            ],
            zero_rtt_keys: None,
            old_app_keys: None,
            key_phase: false,
            packets_since_key_update: 0,
            app_acked_since_update: false,
            next_pn: [0; Epoch::COUNT],
            acks: Default::default(),
            crypto: Default::default(),
            retransmit: Default::default(),
            control: VecDeque::new(),
            streams,
            pacer: Pacer::default(),
            peer_params: None,
            peer_ack_delay_exponent: 3,
            idle_timeout: (idle > 0).then(|| Duration::from_millis(idle)),
            last_activity: now,
            last_send: now,
            handshake_deadline: None,
            handshake_attempts: 0,
            ack_timer: None,
            drain_deadline: None,
            close_error: None,
            close_frame: None,
            close_sent: false,
            early_data_attempted: false,
            early_data_state_replayed: false,
            handshake_confirmed: false,
            connected_emitted: false,
            ping_queued: false,
            peer_address_validated: false,
            prevalidation_bytes_sent: 0,
            events: VecDeque::new(),
            stats: ConnectionStats::default(),
        };

        if attempt_early_data {
            if let Some(secrets) = conn.tls.early_secrets() {
                conn.zero_rtt_keys =
                    Some(crate::crypto::PacketKeys::from_secrets(
                        secrets.suite,
                        &secrets.client_secret,
                        &secrets.server_secret,
                    )
                    .local);
                conn.early_data_attempted = true;
                if let Some(raw) = cached_params {
                    if let Ok(params) = TransportParameters::decode(raw) {
                        conn.apply_peer_params(&params);
                    }
                }
                debug!("0-RTT keys installed from session ticket");
            }
        }

        conn.drive_tls()?;
        conn.handshake_deadline = Some(now + conn.config.handshake_base_timeout);
        Ok(conn)
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnectionState::Closed)
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.recovery.rtt.smoothed()
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    pub fn peer_params(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    /// Whether an authenticated packet (or valid Retry) has confirmed
    /// the peer address.
    pub fn peer_address_validated(&self) -> bool {
        self.peer_address_validated
    }

    // ------------------------------------------------------------------
    // Stream API
    // ------------------------------------------------------------------

    /// Open the next locally-initiated stream.
    pub fn open_stream(&mut self, bidi: bool) -> Result<StreamId, TransportError> {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Draining
            | ConnectionState::Closed)
        {
            return Err(TransportError::Internal("connection closed"));
        }
        self.streams.open(bidi)
    }

    pub fn stream_send(
        &mut self,
        id: StreamId,
        data: Bytes,
        fin: bool,
    ) -> Result<(), TransportError> {
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(TransportError::StreamState("unknown stream"))?;
        if !data.is_empty() {
            stream.send.write(data);
        }
        if fin {
            stream.send.finish();
        }
        Ok(())
    }

    /// Pull the next chunk of in-order data; `fin` marks the stream end.
    pub fn stream_recv(&mut self, id: StreamId) -> Option<(Bytes, bool)> {
        let stream = self.streams.get_mut(id)?;
        if stream.recv.fin_delivered() {
            return None;
        }
        let chunk = stream.recv.read();
        let fin = stream.recv.is_finished();
        if fin {
            stream.recv.set_fin_delivered();
        }
        match chunk {
            Some(data) => Some((data, fin)),
            None if fin => Some((Bytes::new(), true)),
            None => None,
        }
    }

    pub fn set_stream_priority(&mut self, id: StreamId, priority: StreamPriority) {
        if let Some(stream) = self.streams.get_mut(id) {
            stream.priority = priority;
        }
    }

    /// Abort sending on a stream with an application error code.
    pub fn reset_stream(&mut self, id: StreamId, error_code: u64) {
        if let Some(stream) = self.streams.get_mut(id) {
            if stream.reset_sent.is_none() {
                stream.reset_sent = Some(error_code);
                let final_size = stream.send.next_offset();
                stream.abandon_send();
                self.control.push_back(Frame::ResetStream {
                    stream_id: id.0,
                    error_code,
                    final_size,
                });
            }
        }
    }

    /// Ask the peer to stop sending on a stream.
    pub fn stop_sending(&mut self, id: StreamId, error_code: u64) {
        self.control.push_back(Frame::StopSending { stream_id: id.0, error_code });
    }

    // ------------------------------------------------------------------
    // Close / timers
    // ------------------------------------------------------------------

    /// Close with an application error code.
    pub fn close(&mut self, error_code: u64, reason: &str, now: Instant) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Draining
            | ConnectionState::Closed)
        {
            return;
        }
        self.close_frame = Some(Frame::ConnectionClose {
            error_code,
            frame_type: None,
            reason: Bytes::copy_from_slice(reason.as_bytes()),
        });
        self.close_error = Some(ConnectionError::LocallyClosed);
        self.enter_closing(now);
    }

    fn close_on_error(&mut self, error: TransportError, now: Instant) {
        warn!(%error, "closing connection on transport error");
        self.close_frame = Some(Frame::ConnectionClose {
            error_code: error.wire_code(),
            frame_type: Some(0),
            reason: Bytes::new(),
        });
        self.close_error = Some(ConnectionError::Transport(error));
        self.enter_closing(now);
    }

    fn enter_closing(&mut self, now: Instant) {
        self.state = ConnectionState::Closing;
        self.drain_deadline = Some(now + 3 * self.recovery.pto_interval());
        if let Some(err) = &self.close_error {
            self.events.push_back(ConnectionEvent::Closed(err.clone()));
        }
    }

    fn enter_draining(&mut self, error: ConnectionError, now: Instant) {
        self.state = ConnectionState::Draining;
        self.drain_deadline = Some(now + 3 * self.recovery.pto_interval());
        self.events.push_back(ConnectionEvent::Closed(error.clone()));
        self.close_error = Some(error);
    }

    /// Earliest instant at which [`on_timeout`](Connection::on_timeout)
    /// must run.
    pub fn timeout(&self) -> Option<Instant> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        let mut candidates: Vec<Instant> = Vec::with_capacity(6);
        if let Some(deadline) = self.drain_deadline {
            candidates.push(deadline);
        }
        if self.state == ConnectionState::Handshaking {
            if let Some(deadline) = self.handshake_deadline {
                candidates.push(deadline);
            }
        }
        if matches!(self.state, ConnectionState::Handshaking | ConnectionState::Connected) {
            if let Some(t) = self.recovery.loss_detection_timeout() {
                candidates.push(t);
            }
            if let Some(t) = self.ack_timer {
                candidates.push(t);
            }
            if let Some(idle) = self.idle_timeout {
                candidates.push(self.last_activity + idle);
            }
            if self.state == ConnectionState::Connected {
                if let Some(interval) = self.config.keep_alive {
                    candidates.push(self.last_send + interval);
                }
            }
            if let Some(t) = self.pacer.next_send_time() {
                candidates.push(t);
            }
        }
        candidates.into_iter().min()
    }

    /// Fire whichever timers have expired at `now`.
    pub fn on_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.drain_deadline {
            if now >= deadline
                && matches!(self.state, ConnectionState::Closing | ConnectionState::Draining)
            {
                self.state = ConnectionState::Closed;
                return;
            }
        }
        if self.state == ConnectionState::Closed {
            return;
        }

        if let Some(idle) = self.idle_timeout {
            if now.saturating_duration_since(self.last_activity) >= idle
                && matches!(self.state, ConnectionState::Handshaking | ConnectionState::Connected)
            {
                debug!("idle timeout, closing silently");
                self.state = ConnectionState::Closed;
                self.events.push_back(ConnectionEvent::Closed(ConnectionError::Transport(
                    TransportError::IdleTimeout,
                )));
                return;
            }
        }

        if self.state == ConnectionState::Handshaking {
            if let Some(deadline) = self.handshake_deadline {
                if now >= deadline {
                    self.on_handshake_timeout(now);
                    return;
                }
            }
        }

        if let Some(t) = self.recovery.loss_detection_timeout() {
            if now >= t {
                let lost = self.recovery.on_loss_detection_timeout(now);
                if lost.is_empty() {
                    // PTO: send a probe in the latest active epoch.
                    self.ping_queued = true;
                } else {
                    self.stats.packets_lost += lost.len() as u64;
                    for packet in lost {
                        self.requeue_lost(packet);
                    }
                }
            }
        }

        if let Some(t) = self.ack_timer {
            if now >= t {
                self.acks[Epoch::Application as usize].ack_queued = true;
                self.ack_timer = None;
            }
        }

        if self.state == ConnectionState::Connected {
            if let Some(interval) = self.config.keep_alive {
                if now.saturating_duration_since(self.last_send) >= interval {
                    trace!("keep-alive ping queued");
                    self.ping_queued = true;
                }
            }
        }

        // Previous-generation keys lapse 3·PTO after a key update.
        if let Some((_, expiry)) = &self.old_app_keys {
            if now >= *expiry {
                self.old_app_keys = None;
                trace!("previous key generation discarded");
            }
        }
    }

    fn on_handshake_timeout(&mut self, now: Instant) {
        self.handshake_attempts += 1;
        if self.handshake_attempts > self.config.handshake_retries {
            debug!(attempts = self.handshake_attempts, "handshake retry budget exhausted");
            self.state = ConnectionState::Closed;
            self.events.push_back(ConnectionEvent::Closed(ConnectionError::Transport(
                TransportError::HandshakeTimeout,
            )));
            return;
        }
        // Retransmit everything outstanding in the handshake epochs.
        for epoch in [Epoch::Initial, Epoch::Handshake] {
            if self.keys[epoch as usize].is_some() {
                for frame in self.recovery.take_outstanding_frames(epoch) {
                    self.queue_retransmittable(epoch, frame);
                }
            }
        }
        let backoff = self
            .config
            .handshake_base_timeout
            .checked_mul(1 << self.handshake_attempts.min(8))
            .unwrap_or(self.config.handshake_max_timeout)
            .min(self.config.handshake_max_timeout);
        self.handshake_deadline = Some(now + backoff);
        debug!(attempt = self.handshake_attempts, ?backoff, "handshake flight retransmitted");
    }

    fn requeue_lost(&mut self, packet: SentPacket) {
        // Lost frames go back out in their own epoch; Application frames
        // retransmit under whatever 1-RTT generation is current.
        for frame in packet.frames {
            // Epoch is recoverable from the frame type for CRYPTO; stream
            // and control frames only exist in the application space.
            let epoch = match &frame {
                Frame::Crypto { .. } if self.keys[Epoch::Initial as usize].is_some()
                    && !self.handshake_confirmed
                    && packet.packet_number < self.next_pn[Epoch::Initial as usize] =>
                {
                    Epoch::Initial
                }
                Frame::Crypto { .. } => Epoch::Handshake,
                _ => Epoch::Application,
            };
            self.queue_retransmittable(epoch, frame);
        }
    }

    fn queue_retransmittable(&mut self, epoch: Epoch, frame: Frame) {
        match frame {
            Frame::Padding(_) | Frame::Ack { .. } | Frame::Ping
            | Frame::ConnectionClose { .. } | Frame::PathResponse(_) => {}
            other => self.retransmit[epoch as usize].push_back(other),
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Ingest one UDP datagram, which may hold several coalesced packets.
    pub fn recv(&mut self, datagram: &[u8], now: Instant) -> Result<(), ConnectionError> {
        if matches!(
            self.state,
            ConnectionState::Closed | ConnectionState::Draining | ConnectionState::Closing
        ) {
            return Ok(());
        }
        self.stats.bytes_received += datagram.len() as u64;
        let mut offset = 0;
        while offset < datagram.len() {
            let parsed = match parse_header(datagram, offset, self.scid.len()) {
                Ok(p) => p,
                Err(e) => {
                    trace!(%e, "undecodable packet, dropping rest of datagram");
                    break;
                }
            };
            let packet_len = parsed.packet_len.max(1);
            let packet_start = offset;
            offset += packet_len;

            match parsed.header.ty {
                PacketType::VersionNegotiation => {
                    if self.state == ConnectionState::Handshaking && self.stats.packets_received == 0
                    {
                        let err = TransportError::VersionNegotiation(
                            parsed.header.supported_versions.clone(),
                        );
                        self.state = ConnectionState::Closed;
                        let err = ConnectionError::Transport(err);
                        self.events.push_back(ConnectionEvent::Closed(err.clone()));
                        return Err(err);
                    }
                    continue;
                }
                PacketType::Retry => {
                    self.on_retry(&parsed, &datagram[packet_start..packet_start + packet_len], now);
                    continue;
                }
                _ => {}
            }

            if let Err(e) = self.recv_packet(&parsed, datagram, packet_start, now) {
                if e.is_fatal() {
                    self.close_on_error(e, now);
                    return Err(self.close_error.clone().unwrap_or(
                        ConnectionError::LocallyClosed,
                    ));
                }
                trace!(%e, "packet dropped");
            }
        }
        Ok(())
    }

    fn on_retry(&mut self, parsed: &crate::packet::ParsedPacket, packet: &[u8], now: Instant) {
        if self.retry_used || self.state != ConnectionState::Handshaking {
            return;
        }
        if !crate::crypto::verify_retry_tag(self.original_dcid.as_ref(), packet) {
            debug!("retry integrity tag mismatch, ignoring");
            return;
        }
        let Some(scid) = parsed.header.scid else { return };
        self.retry_used = true;
        self.peer_address_validated = true;
        self.token = parsed.retry_token.clone();
        self.dcid = scid;
        self.dcid_updated = true;
        // Initial keys are re-derived from the server-chosen CID.
        self.keys[Epoch::Initial as usize] =
            Some(PacketKeys::initial(self.dcid.as_ref(), true));
        for frame in self.recovery.take_outstanding_frames(Epoch::Initial) {
            self.queue_retransmittable(Epoch::Initial, frame);
        }
        self.handshake_deadline = Some(now + self.config.handshake_base_timeout);
        debug!(dcid = ?self.dcid, "retry accepted, restarting handshake");
    }

    fn recv_packet(
        &mut self,
        parsed: &crate::packet::ParsedPacket,
        datagram: &[u8],
        packet_start: usize,
        now: Instant,
    ) -> Result<(), TransportError> {
        let Some(epoch) = parsed.header.ty.epoch() else {
            return Ok(());
        };
        if parsed.header.ty == PacketType::ZeroRtt {
            // Servers send no 0-RTT.
            return Err(TransportError::ProtocolViolation("0-RTT from server"));
        }

        let largest = self.acks[epoch as usize].largest();
        if self.keys[epoch as usize].is_none() {
            trace!(?epoch, "no keys for epoch yet, dropping packet");
            return Ok(());
        }

        let first_attempt = {
            let keys = self.keys[epoch as usize]
                .as_ref()
                .ok_or(TransportError::Internal("keys vanished"))?;
            decrypt_packet(&keys.remote, parsed, datagram, packet_start, largest)
        };
        let plain = match first_attempt {
            Ok(p) => p,
            Err(TransportError::AeadFailure) if parsed.header.ty == PacketType::OneRtt => {
                // Reordered packet from before the last key update, or
                // the first packet of a peer-initiated update.
                match self.try_old_keys_open(parsed, datagram, packet_start, largest, now) {
                    Some(p) => p,
                    None => self.try_key_update_open(parsed, datagram, packet_start, largest, now)?,
                }
            }
            Err(e) => return Err(e),
        };

        // Any authenticated packet validates the server's address.
        self.peer_address_validated = true;

        // The server-chosen SCID becomes our DCID from its first Initial
        // (RFC 9000 §7.2); initial keys stay bound to the original DCID.
        if !self.dcid_updated && parsed.header.ty == PacketType::Initial {
            if let Some(scid) = parsed.header.scid {
                self.dcid = scid;
                self.dcid_updated = true;
            }
        }

        if !self.acks[epoch as usize].record(plain.packet_number, now) {
            trace!(pn = plain.packet_number, "duplicate packet");
            return Ok(());
        }

        self.stats.packets_received += 1;
        self.last_activity = now;

        let frames = frame::parse_payload(&plain.payload, parsed.header.ty)?;
        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        if ack_eliciting {
            let tracker = &mut self.acks[epoch as usize];
            tracker.eliciting_since_ack += 1;
            if epoch != Epoch::Application
                || tracker.eliciting_since_ack >= ACK_ELICITING_THRESHOLD
            {
                tracker.ack_queued = true;
                self.ack_timer = None;
            } else if self.ack_timer.is_none() {
                self.ack_timer = Some(now + Duration::from_millis(25));
            }
        }

        for f in frames {
            self.on_frame(f, epoch, now)?;
        }
        self.drive_tls()?;
        Ok(())
    }

    /// Attempt a 1-RTT decrypt with the retained previous generation.
    ///
    /// Only packets still carrying the old key-phase bit qualify; the
    /// retained keys expire 3·PTO after the update.
    fn try_old_keys_open(
        &mut self,
        parsed: &crate::packet::ParsedPacket,
        datagram: &[u8],
        packet_start: usize,
        largest: Option<u64>,
        now: Instant,
    ) -> Option<crate::packet::PlainPacket> {
        if let Some((_, expiry)) = &self.old_app_keys {
            if now >= *expiry {
                self.old_app_keys = None;
            }
        }
        let (keys, _) = self.old_app_keys.as_ref()?;
        let plain = decrypt_packet(&keys.remote, parsed, datagram, packet_start, largest).ok()?;
        if plain.key_phase == self.key_phase {
            return None;
        }
        trace!(pn = plain.packet_number, "reordered packet opened with previous keys");
        Some(plain)
    }

    fn try_key_update_open(
        &mut self,
        parsed: &crate::packet::ParsedPacket,
        datagram: &[u8],
        packet_start: usize,
        largest: Option<u64>,
        now: Instant,
    ) -> Result<crate::packet::PlainPacket, TransportError> {
        let current = self.keys[Epoch::Application as usize]
            .as_ref()
            .ok_or(TransportError::AeadFailure)?;
        let next = current.update();
        let plain = decrypt_packet(&next.remote, parsed, datagram, packet_start, largest)?;
        if plain.key_phase == self.key_phase {
            // Same phase bit under next-generation keys is nonsense.
            return Err(TransportError::AeadFailure);
        }
        debug!("peer-initiated key update accepted");
        let expiry = now + 3 * self.recovery.pto_interval();
        self.old_app_keys = self.keys[Epoch::Application as usize]
            .take()
            .map(|keys| (keys, expiry));
        self.keys[Epoch::Application as usize] = Some(next);
        self.key_phase = !self.key_phase;
        self.packets_since_key_update = 0;
        self.app_acked_since_update = false;
        Ok(plain)
    }

    fn on_frame(&mut self, f: Frame, epoch: Epoch, now: Instant) -> Result<(), TransportError> {
        match f {
            Frame::Padding(_) | Frame::Ping => {}
            Frame::Ack { largest, delay, ranges, ecn: _ } => {
                let scaled = Duration::from_micros(
                    delay.saturating_mul(1 << self.peer_ack_delay_exponent),
                );
                let outcome =
                    self.recovery.on_ack_received(epoch, largest, scaled, &ranges, now);
                if epoch == Epoch::Application && !outcome.newly_acked.is_empty() {
                    self.app_acked_since_update = true;
                }
                self.stats.packets_lost += outcome.lost.len() as u64;
                for packet in outcome.lost {
                    self.requeue_lost(packet);
                }
            }
            Frame::Crypto { offset, data } => {
                let cs = &mut self.crypto[epoch as usize];
                cs.recv.push(offset, data, false)?;
                while let Some(chunk) = cs.recv.read() {
                    self.tls.write_handshake_message(epoch, &chunk)?;
                }
            }
            Frame::Stream { stream_id, offset, data, fin } => {
                let id = StreamId(stream_id);
                if self.streams.is_closed(id) {
                    return Ok(());
                }
                let prev_high = self
                    .streams
                    .get(id)
                    .map(|s| s.recv.highest_seen())
                    .unwrap_or(0);
                let stream = self.streams.recv_stream(id)?;
                if stream.reset_received.is_some() {
                    return Ok(());
                }
                let end = offset + data.len() as u64;
                if end > stream.max_recv_data {
                    return Err(TransportError::FlowControl("stream receive limit"));
                }
                stream.recv.push(offset, data, fin)?;
                let readable = stream.recv.has_ready() || stream.recv.is_finished();
                let new_bytes = end.saturating_sub(prev_high);
                self.streams.on_data_received(new_bytes)?;
                if readable {
                    self.events.push_back(ConnectionEvent::StreamReadable(id));
                }
            }
            Frame::ResetStream { stream_id, error_code, final_size } => {
                let id = StreamId(stream_id);
                if self.streams.is_closed(id) {
                    return Ok(());
                }
                let prev_high = self
                    .streams
                    .get(id)
                    .map(|s| s.recv.highest_seen())
                    .unwrap_or(0);
                let stream = self.streams.recv_stream(id)?;
                stream.on_reset_received(error_code, final_size)?;
                self.streams
                    .on_data_received(final_size.saturating_sub(prev_high))?;
                self.events
                    .push_back(ConnectionEvent::StreamReset { id, error_code });
            }
            Frame::StopSending { stream_id, error_code } => {
                let id = StreamId(stream_id);
                if self.streams.is_closed(id) {
                    return Ok(());
                }
                let stream = self.streams.send_stream(id)?;
                stream.stop_sending_received = Some(error_code);
                self.events
                    .push_back(ConnectionEvent::StreamStopped { id, error_code });
                // Answer with RESET_STREAM carrying the same code.
                self.reset_stream(id, error_code);
            }
            Frame::MaxData(max) => {
                self.streams.peer_max_data = self.streams.peer_max_data.max(max);
            }
            Frame::MaxStreamData { stream_id, max } => {
                if let Some(stream) = self.streams.get_mut(StreamId(stream_id)) {
                    stream.max_send_data = stream.max_send_data.max(max);
                }
            }
            Frame::MaxStreams { bidi, max } => {
                if bidi {
                    self.streams.peer_max_streams_bidi =
                        self.streams.peer_max_streams_bidi.max(max);
                } else {
                    self.streams.peer_max_streams_uni =
                        self.streams.peer_max_streams_uni.max(max);
                }
            }
            Frame::DataBlocked(_) | Frame::StreamDataBlocked { .. }
            | Frame::StreamsBlocked { .. } => {
                // Peer is blocked on our limits; window updates flow from
                // the stream map on consumption.
            }
            Frame::NewConnectionId { seq: _, retire_prior_to, cid: _, reset_token: _ } => {
                // This client sticks to the handshake CID; retire
                // everything the server asks us to.
                if retire_prior_to > 0 {
                    self.control
                        .push_back(Frame::RetireConnectionId { seq: retire_prior_to - 1 });
                }
            }
            Frame::RetireConnectionId { .. } => {}
            Frame::PathChallenge(data) => {
                self.control.push_back(Frame::PathResponse(data));
            }
            Frame::PathResponse(_) => {}
            Frame::NewToken { token } => {
                if epoch != Epoch::Application {
                    return Err(TransportError::ProtocolViolation("NEW_TOKEN outside 1-RTT"));
                }
                self.events.push_back(ConnectionEvent::NewToken(token.to_vec()));
            }
            Frame::HandshakeDone => {
                if !self.handshake_confirmed {
                    self.handshake_confirmed = true;
                    self.keys[Epoch::Handshake as usize] = None;
                    self.recovery.discard_space(Epoch::Handshake);
                    self.retransmit[Epoch::Handshake as usize].clear();
                    debug!("handshake confirmed, handshake keys discarded");
                }
            }
            Frame::ConnectionClose { error_code, frame_type, reason } => {
                let reason = String::from_utf8_lossy(&reason).into_owned();
                let error = if frame_type.is_some() {
                    ConnectionError::PeerClosed { code: error_code, reason }
                } else {
                    ConnectionError::ApplicationClosed { code: error_code, reason }
                };
                self.enter_draining(error, now);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // TLS plumbing
    // ------------------------------------------------------------------

    fn drive_tls(&mut self) -> Result<(), TransportError> {
        // Queue outbound handshake bytes per epoch.
        for epoch in Epoch::iter() {
            let out = self.tls.read_handshake_messages(epoch);
            if !out.is_empty() {
                self.crypto[epoch as usize].pending.push_back(Bytes::from(out));
            }
        }

        // Install newly available keys.
        if self.keys[Epoch::Handshake as usize].is_none() {
            if let Some(secrets) = self.tls.secrets(Epoch::Handshake) {
                self.keys[Epoch::Handshake as usize] = Some(PacketKeys::from_secrets(
                    secrets.suite,
                    &secrets.client_secret,
                    &secrets.server_secret,
                ));
                debug!("handshake keys installed");
            }
        }
        if self.keys[Epoch::Application as usize].is_none() {
            if let Some(secrets) = self.tls.secrets(Epoch::Application) {
                self.keys[Epoch::Application as usize] = Some(PacketKeys::from_secrets(
                    secrets.suite,
                    &secrets.client_secret,
                    &secrets.server_secret,
                ));
                debug!("application keys installed");
            }
        }

        // Peer transport parameters arrive inside the TLS extension.
        if self.peer_params.is_none() {
            if let Some(raw) = self.tls.peer_transport_parameters() {
                let params = TransportParameters::decode(&raw)?;
                if params.ack_delay_exponent > 20 {
                    return Err(TransportError::TransportParameter("ack_delay_exponent"));
                }
                self.apply_peer_params(&params);
                self.peer_params = Some(params);
            }
        }

        // 0-RTT verdict.
        if self.early_data_attempted && !self.early_data_state_replayed {
            match self.tls.early_data_accepted() {
                Some(true) => {
                    self.early_data_state_replayed = true;
                    debug!("0-RTT accepted by server");
                }
                Some(false) => {
                    self.early_data_state_replayed = true;
                    self.zero_rtt_keys = None;
                    // Everything sent in 0-RTT is replayed under 1-RTT.
                    for frame in self.recovery.take_outstanding_frames(Epoch::Application) {
                        self.queue_retransmittable(Epoch::Application, frame);
                    }
                    self.events.push_back(ConnectionEvent::ZeroRttRejected);
                    debug!("0-RTT rejected, stream state replayed in 1-RTT");
                }
                None => {}
            }
        }

        if self.tls.is_complete()
            && self.keys[Epoch::Application as usize].is_some()
            && !self.connected_emitted
        {
            self.connected_emitted = true;
            self.state = ConnectionState::Connected;
            self.handshake_deadline = None;
            let used_early_data = self.early_data_attempted
                && self.tls.early_data_accepted() == Some(true);
            self.events
                .push_back(ConnectionEvent::Connected { used_early_data });
            debug!(used_early_data, "connection established");
        }

        if let Some(ticket) = self.tls.take_session_ticket() {
            let suite = self
                .tls
                .secrets(Epoch::Application)
                .map(|s| s.suite)
                .unwrap_or(crate::crypto::CipherSuite::Aes128Gcm);
            self.events
                .push_back(ConnectionEvent::SessionTicket { ticket, suite });
        }
        Ok(())
    }

    fn apply_peer_params(&mut self, params: &TransportParameters) {
        self.streams.apply_peer_limits(
            params.initial_max_data,
            params.initial_max_streams_bidi,
            params.initial_max_streams_uni,
            params.initial_max_stream_data_bidi_remote,
        );
        self.peer_ack_delay_exponent = params.ack_delay_exponent as u32;
        self.recovery
            .set_max_ack_delay(Duration::from_millis(params.max_ack_delay_ms));
        // Effective idle timeout is min(local, peer), zero meaning unset.
        let peer_idle = params.max_idle_timeout_ms;
        if peer_idle > 0 {
            let peer = Duration::from_millis(peer_idle);
            self.idle_timeout = Some(match self.idle_timeout {
                Some(local) => local.min(peer),
                None => peer,
            });
        }
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Produce the next datagram to transmit, if anything is due.
    pub fn poll_send(&mut self, now: Instant) -> Option<Vec<u8>> {
        match self.state {
            ConnectionState::Closed | ConnectionState::Draining => return None,
            ConnectionState::Closing => return self.poll_send_close(now),
            _ => {}
        }

        if let Some(t) = self.pacer.next_send_time() {
            if t > now && !self.acks.iter().any(|a| a.ack_queued) {
                return None;
            }
        }

        // Before anything authenticated arrived from the server, cap what
        // flows toward its address; the budget grows with each handshake
        // retransmission attempt so the handshake itself never starves.
        if !self.peer_address_validated {
            let cap = PREVALIDATION_SEND_FACTOR
                * INITIAL_DATAGRAM_MIN
                * (self.handshake_attempts as usize + 1);
            if self.prevalidation_bytes_sent >= cap {
                trace!(cap, "pre-validation send budget exhausted");
                return None;
            }
        }

        let budget = self.config.max_datagram_size.min(
            self.peer_params
                .as_ref()
                .map(|p| p.max_udp_payload_size as usize)
                .unwrap_or(usize::MAX),
        );

        let mut out = BytesMut::with_capacity(budget);
        let mut includes_initial = false;
        let mut sent_handshake = false;
        let mut plans: Vec<(PacketType, Vec<Frame>, bool)> = Vec::new();

        for epoch in Epoch::iter() {
            if self.keys[epoch as usize].is_none() {
                continue;
            }
            let remaining = budget.saturating_sub(plans_size(&plans));
            if remaining < 64 {
                break;
            }
            let (frames, eliciting) = self.collect_frames(epoch, remaining, now);
            if frames.is_empty() {
                continue;
            }
            let ty = match epoch {
                Epoch::Initial => PacketType::Initial,
                Epoch::Handshake => PacketType::Handshake,
                Epoch::Application => PacketType::OneRtt,
            };
            if ty == PacketType::Initial {
                includes_initial = true;
            }
            if ty == PacketType::Handshake {
                sent_handshake = true;
            }
            plans.push((ty, frames, eliciting));
        }

        // 0-RTT rides after the Initial while the handshake is pending.
        if self.state == ConnectionState::Handshaking && self.zero_rtt_keys.is_some() {
            let remaining = budget.saturating_sub(plans_size(&plans));
            if remaining >= 64 {
                let (frames, eliciting) = self.collect_zero_rtt_frames(remaining);
                if !frames.is_empty() {
                    plans.push((PacketType::ZeroRtt, frames, eliciting));
                }
            }
        }

        if plans.is_empty() {
            return None;
        }

        let last = plans.len() - 1;
        for (i, (ty, frames, eliciting)) in plans.into_iter().enumerate() {
            let min_total = if i == last && includes_initial {
                INITIAL_DATAGRAM_MIN.saturating_sub(out.len())
            } else {
                0
            };
            if let Err(e) = self.build_packet(ty, frames, eliciting, min_total, &mut out, now) {
                warn!(%e, "packet build failed");
                return None;
            }
        }

        if sent_handshake && self.keys[Epoch::Initial as usize].is_some() {
            // First Handshake send discards Initial keys (RFC 9001 §4.9.1).
            self.keys[Epoch::Initial as usize] = None;
            self.recovery.discard_space(Epoch::Initial);
            self.retransmit[Epoch::Initial as usize].clear();
            debug!("initial keys discarded");
        }

        self.maybe_initiate_key_update(now);
        let reaped = self.streams.reap_drained();
        if !reaped.is_empty() {
            trace!(count = reaped.len(), "drained streams reaped");
        }

        if out.is_empty() {
            return None;
        }
        if !self.peer_address_validated {
            self.prevalidation_bytes_sent += out.len();
        }
        self.last_send = now;
        self.stats.bytes_sent += out.len() as u64;
        Some(out.to_vec())
    }

    fn poll_send_close(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.close_sent {
            return None;
        }
        self.close_sent = true;
        let frame = self.close_frame.clone()?;
        // Send under the newest keys we have.
        let ty = if self.keys[Epoch::Application as usize].is_some() {
            PacketType::OneRtt
        } else if self.keys[Epoch::Handshake as usize].is_some() {
            PacketType::Handshake
        } else {
            PacketType::Initial
        };
        let mut out = BytesMut::new();
        let min_total = if ty == PacketType::Initial { INITIAL_DATAGRAM_MIN } else { 0 };
        self.build_packet(ty, vec![frame], false, min_total, &mut out, now)
            .ok()?;
        Some(out.to_vec())
    }

    /// Assemble the frame list for one epoch under a byte budget.
    fn collect_frames(
        &mut self,
        epoch: Epoch,
        budget: usize,
        now: Instant,
    ) -> (Vec<Frame>, bool) {
        let mut frames = Vec::new();
        let mut used = 0usize;
        let mut eliciting = false;

        // ACK first; it is never congestion-limited.
        if self.acks[epoch as usize].ack_queued {
            if let Some(ack) = self.acks[epoch as usize].ack_frame(now) {
                used += frame_size(&ack);
                frames.push(ack);
                self.acks[epoch as usize].ack_queued = false;
                self.acks[epoch as usize].eliciting_since_ack = 0;
            }
        }

        let window = self.recovery.congestion.available_window();
        let room = budget.saturating_sub(used).min(window.max(0));

        // Retransmissions before new data.
        let mut room_left = room;
        while let Some(f) = self.retransmit[epoch as usize].front() {
            let size = frame_size(f);
            if size > room_left {
                break;
            }
            let f = self.retransmit[epoch as usize]
                .pop_front()
                .unwrap_or(Frame::Ping);
            room_left -= size;
            eliciting = true;
            frames.push(f);
        }

        // Fresh CRYPTO data.
        loop {
            let cs = &mut self.crypto[epoch as usize];
            let Some(chunk) = cs.pending.front_mut() else { break };
            if room_left <= FRAME_OVERHEAD {
                break;
            }
            let take = chunk.len().min(room_left - FRAME_OVERHEAD);
            if take == 0 {
                break;
            }
            let data = chunk.split_to(take);
            if chunk.is_empty() {
                cs.pending.pop_front();
            }
            let offset = cs.send_offset;
            cs.send_offset += data.len() as u64;
            let f = Frame::Crypto { offset, data };
            room_left = room_left.saturating_sub(frame_size(&f));
            eliciting = true;
            frames.push(f);
        }

        if epoch == Epoch::Application {
            // Connection-level control frames.
            if let Some(max) = self.streams.take_max_data_update() {
                self.control.push_back(Frame::MaxData(max));
            }
            for id in self.streams.ids() {
                if let Some(stream) = self.streams.get_mut(id) {
                    if stream.reset_received.is_none() {
                        if let Some(max) = stream.take_max_stream_data_update() {
                            self.control
                                .push_back(Frame::MaxStreamData { stream_id: id.0, max });
                        }
                    }
                }
            }
            while let Some(f) = self.control.front() {
                let size = frame_size(f);
                if size > room_left {
                    break;
                }
                let f = self.control.pop_front().unwrap_or(Frame::Ping);
                room_left -= size;
                eliciting = true;
                frames.push(f);
            }

            if self.ping_queued && room_left > 1 {
                self.ping_queued = false;
                frames.push(Frame::Ping);
                room_left -= 1;
                eliciting = true;
            }

            // Stream data by priority, bounded by both flow-control levels.
            if self.state == ConnectionState::Connected {
                let (stream_frames, any) = self.collect_stream_frames(room_left);
                eliciting |= any;
                frames.extend(stream_frames);
            }
        } else if self.ping_queued && room_left > 1 {
            self.ping_queued = false;
            frames.push(Frame::Ping);
            eliciting = true;
        }

        (frames, eliciting)
    }

    fn collect_stream_frames(&mut self, mut room: usize) -> (Vec<Frame>, bool) {
        let mut frames = Vec::new();
        let mut eliciting = false;
        for id in self.streams.sendable() {
            if room <= FRAME_OVERHEAD {
                break;
            }
            let conn_allowance = self.streams.send_allowance();
            let Some(stream) = self.streams.get_mut(id) else { continue };
            let allowance = stream.send_allowance().min(conn_allowance);
            let max_bytes = (room - FRAME_OVERHEAD).min(allowance as usize);
            if max_bytes == 0 && stream.send.pending_bytes() > 0 {
                // Flow-control blocked; advertise it once.
                continue;
            }
            let Some((offset, data, fin)) = stream.send.poll_transmit(max_bytes) else {
                continue;
            };
            let len = data.len() as u64;
            self.streams.on_data_sent(len);
            let f = Frame::Stream { stream_id: id.0, offset, data, fin };
            room = room.saturating_sub(frame_size(&f));
            eliciting = true;
            frames.push(f);
        }
        (frames, eliciting)
    }

    fn collect_zero_rtt_frames(&mut self, budget: usize) -> (Vec<Frame>, bool) {
        // Early data: stream frames only, under the cached limits.
        let (frames, eliciting) = {
            let mut room = budget;
            let mut frames = Vec::new();
            let mut eliciting = false;
            for id in self.streams.sendable() {
                if room <= FRAME_OVERHEAD {
                    break;
                }
                let conn_allowance = self.streams.send_allowance();
                let Some(stream) = self.streams.get_mut(id) else { continue };
                let allowance = stream.send_allowance().min(conn_allowance);
                let max_bytes = (room - FRAME_OVERHEAD).min(allowance as usize);
                let Some((offset, data, fin)) = stream.send.poll_transmit(max_bytes) else {
                    continue;
                };
                self.streams.on_data_sent(data.len() as u64);
                let f = Frame::Stream { stream_id: id.0, offset, data, fin };
                room = room.saturating_sub(frame_size(&f));
                eliciting = true;
                frames.push(f);
            }
            (frames, eliciting)
        };
        (frames, eliciting)
    }

    fn build_packet(
        &mut self,
        ty: PacketType,
        frames: Vec<Frame>,
        eliciting: bool,
        min_total: usize,
        out: &mut BytesMut,
        now: Instant,
    ) -> Result<(), TransportError> {
        let epoch = ty.epoch().ok_or(TransportError::Internal("unsendable type"))?;
        let mut payload = Vec::with_capacity(256);
        for f in &frames {
            f.encode(&mut payload);
        }

        let pn = self.next_pn[epoch as usize];
        self.next_pn[epoch as usize] += 1;
        let largest_acked = self.recovery.largest_acked(epoch);

        let builder = PacketBuilder {
            ty,
            dcid: self.dcid,
            scid: self.scid,
            token: &self.token,
            packet_number: pn,
            largest_acked,
            key_phase: self.key_phase,
        };

        let written = {
            let keys: &DirectionalKeys = if ty == PacketType::ZeroRtt {
                self.zero_rtt_keys
                    .as_ref()
                    .ok_or(TransportError::Internal("no 0-RTT keys"))?
            } else {
                &self.keys[epoch as usize]
                    .as_ref()
                    .ok_or(TransportError::Internal("no keys for epoch"))?
                    .local
            };
            builder.finish(keys, payload, min_total, out)?
        };

        self.stats.packets_sent += 1;
        let retransmittable: Vec<Frame> = frames
            .into_iter()
            .filter(|f| {
                !matches!(
                    f,
                    Frame::Ack { .. } | Frame::Padding(_) | Frame::ConnectionClose { .. }
                )
            })
            .collect();
        let sent = SentPacket {
            packet_number: pn,
            time_sent: now,
            size: written,
            ack_eliciting: eliciting,
            in_flight: eliciting,
            frames: retransmittable,
        };
        if eliciting {
            self.pacer.on_packet_sent(
                now,
                written,
                self.recovery.congestion.bytes_in_flight(),
                self.recovery.congestion.cwnd(),
                self.recovery.rtt.smoothed(),
            );
        }
        self.recovery.on_packet_sent(epoch, sent);
        trace!(?ty, pn, size = written, "packet sent");
        Ok(())
    }

    fn maybe_initiate_key_update(&mut self, now: Instant) {
        let Some(interval) = self.config.key_update_interval else { return };
        if !self.handshake_confirmed || !self.app_acked_since_update {
            return;
        }
        self.packets_since_key_update += 1;
        if self.packets_since_key_update < interval {
            return;
        }
        if let Some(current) = self.keys[Epoch::Application as usize].take() {
            let next = current.update();
            let expiry = now + 3 * self.recovery.pto_interval();
            self.old_app_keys = Some((current, expiry));
            self.keys[Epoch::Application as usize] = Some(next);
            self.key_phase = !self.key_phase;
            self.packets_since_key_update = 0;
            self.app_acked_since_update = false;
            debug!("local key update initiated");
        }
    }
}

fn plans_size(plans: &[(PacketType, Vec<Frame>, bool)]) -> usize {
    plans
        .iter()
        .map(|(_, frames, _)| {
            frames.iter().map(frame_size).sum::<usize>() + 64 + TAG_LEN
        })
        .sum()
}

/// Serialized size of a frame, for budgeting.
fn frame_size(f: &Frame) -> usize {
    let mut buf = Vec::with_capacity(64);
    f.encode(&mut buf);
    buf.len()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPeer;
    use crate::tls::testing::{
        MockTlsSession, MOCK_CLIENT_FINISHED, MOCK_CLIENT_HELLO,
    };

    fn now() -> Instant {
        Instant::now()
    }

    fn client(early: bool) -> Connection {
        let tls = Box::new(MockTlsSession::new(early));
        Connection::new_client(tls, ConnectionConfig::default(), early, None, now())
            .expect("client construction")
    }

    fn client_with_cached_params(early: bool) -> Connection {
        let tls = Box::new(MockTlsSession::new(early));
        let params = TestPeer::server_params().encode();
        Connection::new_client(
            tls,
            ConnectionConfig::default(),
            early,
            Some(&params),
            now(),
        )
        .expect("client construction")
    }

    /// Run the full handshake; returns (client, peer) in Connected state.
    fn establish() -> (Connection, TestPeer) {
        establish_with(ConnectionConfig::default())
    }

    fn establish_with(config: ConnectionConfig) -> (Connection, TestPeer) {
        let t = now();
        let tls = Box::new(MockTlsSession::new(false));
        let mut conn =
            Connection::new_client(tls, config, false, None, t).expect("client construction");
        let mut peer = TestPeer::new();

        let first = conn.poll_send(t).expect("initial flight");
        assert!(first.len() >= 1200, "client initial must be padded");
        let received = peer.recv(&first);
        let crypto_seen = received.iter().any(|(ty, frames)| {
            *ty == PacketType::Initial
                && frames.iter().any(|f| {
                    matches!(f, Frame::Crypto { data, .. }
                        if data.starts_with(MOCK_CLIENT_HELLO))
                })
        });
        assert!(crypto_seen, "client hello expected in initial packet");

        let flight = peer.handshake_flight(false);
        conn.recv(&flight, t).expect("server flight processed");
        assert!(conn.is_established());

        // Client answers with ACKs and its Finished.
        let fin = conn.poll_send(t).expect("finished flight");
        let received = peer.recv(&fin);
        let fin_seen = received.iter().any(|(ty, frames)| {
            *ty == PacketType::Handshake
                && frames.iter().any(|f| {
                    matches!(f, Frame::Crypto { data, .. }
                        if data.as_ref() == MOCK_CLIENT_FINISHED)
                })
        });
        assert!(fin_seen, "client finished expected in handshake packet");

        let done = peer.handshake_done();
        conn.recv(&done, t).expect("handshake done processed");
        (conn, peer)
    }

    #[test]
    fn test_full_handshake_establishes() {
        let (mut conn, _peer) = establish();
        let mut connected = false;
        while let Some(event) = conn.poll_event() {
            if let ConnectionEvent::Connected { used_early_data } = event {
                connected = true;
                assert!(!used_early_data);
            }
        }
        assert!(connected, "connected event expected");
        assert!(conn.handshake_confirmed);
        assert!(conn.keys[Epoch::Initial as usize].is_none(), "initial keys discarded");
        assert!(conn.keys[Epoch::Handshake as usize].is_none(), "handshake keys discarded");
    }

    #[test]
    fn test_packet_numbers_strictly_increase() {
        let (mut conn, mut peer) = establish();
        let t = now();
        let mut last = None;
        for i in 0..3u8 {
            let id = conn.open_stream(true).unwrap();
            conn.stream_send(id, Bytes::from(vec![i; 10]), true).unwrap();
            let datagram = conn.poll_send(t).expect("stream datagram");
            let _ = peer.recv(&datagram);
            let pn = conn.next_pn[Epoch::Application as usize];
            if let Some(prev) = last {
                assert!(pn > prev);
            }
            last = Some(pn);
        }
    }

    #[test]
    fn test_stream_round_trip() {
        let (mut conn, mut peer) = establish();
        let t = now();
        let id = conn.open_stream(true).expect("stream open");
        conn.stream_send(id, Bytes::from_static(b"GET /index.html"), true)
            .unwrap();

        let datagram = conn.poll_send(t).expect("request datagram");
        let received = peer.recv(&datagram);
        let (data, fin) = TestPeer::stream_data(&received, id.0);
        assert_eq!(data, b"GET /index.html");
        assert!(fin);

        // Server responds on the same stream.
        let response = peer.build(&[(
            PacketType::OneRtt,
            vec![Frame::Stream {
                stream_id: id.0,
                offset: 0,
                data: Bytes::from_static(b"200 OK"),
                fin: true,
            }],
        )]);
        conn.recv(&response, t).unwrap();

        let mut readable = false;
        while let Some(event) = conn.poll_event() {
            if event == ConnectionEvent::StreamReadable(id) {
                readable = true;
            }
        }
        assert!(readable);
        let (data, fin) = conn.stream_recv(id).expect("response data");
        assert_eq!(data.as_ref(), b"200 OK");
        assert!(fin);
    }

    #[test]
    fn test_flow_control_limits_sending() {
        let (mut conn, mut peer) = establish();
        let t = now();
        let id = conn.open_stream(true).unwrap();
        // Stream limit from server params is 100_000; try to send double.
        conn.stream_send(id, Bytes::from(vec![0xaa; 200_000]), true).unwrap();

        let mut total = 0usize;
        for _ in 0..400 {
            let Some(datagram) = conn.poll_send(t) else { break };
            let received = peer.recv(&datagram);
            let (data, _) = TestPeer::stream_data(&received, id.0);
            let _ = data;
            total = total.max({
                let s = conn.streams.get(id);
                s.map(|s| s.send.next_offset() as usize).unwrap_or(0)
            });
        }
        assert!(total <= 100_000, "sent {total} bytes past MAX_STREAM_DATA");
    }

    #[test]
    fn test_stream_limit_enforced_on_open() {
        let (mut conn, _peer) = establish();
        for _ in 0..16 {
            conn.open_stream(true).unwrap();
        }
        assert_eq!(conn.open_stream(true).unwrap_err(), TransportError::StreamLimit);
    }

    #[test]
    fn test_reset_stream_emitted_once_connection_survives() {
        let (mut conn, mut peer) = establish();
        let t = now();
        let id = conn.open_stream(true).unwrap();
        conn.stream_send(id, Bytes::from_static(b"partial"), false).unwrap();
        let _ = conn.poll_send(t).map(|d| peer.recv(&d));

        conn.reset_stream(id, 0x10c); // H3_REQUEST_CANCELLED
        conn.reset_stream(id, 0x10c); // second call must not duplicate
        let datagram = conn.poll_send(t).expect("reset datagram");
        let received = peer.recv(&datagram);
        let resets: Vec<_> = received
            .iter()
            .flat_map(|(_, frames)| frames.iter())
            .filter(|f| matches!(f, Frame::ResetStream { stream_id, error_code, .. }
                if *stream_id == id.0 && *error_code == 0x10c))
            .collect();
        assert_eq!(resets.len(), 1, "exactly one RESET_STREAM expected");
        assert!(conn.is_established(), "connection survives stream reset");

        // A new stream on the same connection still works.
        let id2 = conn.open_stream(true).unwrap();
        conn.stream_send(id2, Bytes::from_static(b"again"), true).unwrap();
        let datagram = conn.poll_send(t).expect("second request");
        let received = peer.recv(&datagram);
        let (data, _) = TestPeer::stream_data(&received, id2.0);
        assert_eq!(data, b"again");
    }

    #[test]
    fn test_zero_rtt_accepted() {
        let t = now();
        let mut conn = client_with_cached_params(true);
        let mut peer = TestPeer::new();

        let id = conn.open_stream(true).expect("0-RTT stream");
        conn.stream_send(id, Bytes::from_static(b"GET /a.css"), true).unwrap();

        let first = conn.poll_send(t).expect("coalesced initial + 0-RTT");
        let received = peer.recv(&first);
        assert!(received.iter().any(|(ty, _)| *ty == PacketType::Initial));
        let (data, fin) = TestPeer::stream_data(&received, id.0);
        assert_eq!(data, b"GET /a.css");
        assert!(fin);

        let flight = peer.handshake_flight(true);
        conn.recv(&flight, t).unwrap();
        let _ = conn.poll_send(t).map(|d| peer.recv(&d));
        conn.recv(&peer.handshake_done(), t).unwrap();

        let mut used_early = None;
        while let Some(event) = conn.poll_event() {
            if let ConnectionEvent::Connected { used_early_data } = event {
                used_early = Some(used_early_data);
            }
        }
        assert_eq!(used_early, Some(true));
    }

    #[test]
    fn test_zero_rtt_rejection_replays_in_one_rtt() {
        let t = now();
        let mut conn = client_with_cached_params(true);
        let mut peer = TestPeer::new();

        let id = conn.open_stream(true).unwrap();
        conn.stream_send(id, Bytes::from_static(b"GET /a.css"), true).unwrap();
        let first = conn.poll_send(t).expect("initial + 0-RTT");
        let _ = peer.recv(&first);

        // Server rejects early data.
        let flight = peer.handshake_flight(false);
        conn.recv(&flight, t).unwrap();

        let mut rejected = false;
        let mut used_early = None;
        while let Some(event) = conn.poll_event() {
            match event {
                ConnectionEvent::ZeroRttRejected => rejected = true,
                ConnectionEvent::Connected { used_early_data } => {
                    used_early = Some(used_early_data)
                }
                _ => {}
            }
        }
        assert!(rejected);
        assert_eq!(used_early, Some(false));

        // The request is retransmitted under 1-RTT keys.
        let mut replayed = Vec::new();
        for _ in 0..4 {
            let Some(datagram) = conn.poll_send(t) else { break };
            replayed.extend(peer.recv(&datagram));
        }
        let one_rtt: Vec<_> = replayed
            .iter()
            .filter(|(ty, _)| *ty == PacketType::OneRtt)
            .cloned()
            .collect();
        let (data, fin) = TestPeer::stream_data(&one_rtt, id.0);
        assert_eq!(data, b"GET /a.css", "0-RTT data must replay in 1-RTT");
        assert!(fin);
    }

    #[test]
    fn test_peer_close_enters_draining() {
        let (mut conn, mut peer) = establish();
        let t = now();
        let close = peer.build(&[(
            PacketType::OneRtt,
            vec![Frame::ConnectionClose {
                error_code: 0,
                frame_type: Some(0),
                reason: Bytes::from_static(b"bye"),
            }],
        )]);
        conn.recv(&close, t).unwrap();
        assert_eq!(*conn.state(), ConnectionState::Draining);
        let mut closed = false;
        while let Some(event) = conn.poll_event() {
            if let ConnectionEvent::Closed(ConnectionError::PeerClosed { code, .. }) = event {
                assert_eq!(code, 0);
                closed = true;
            }
        }
        assert!(closed);
        // Draining absorbs packets without replying.
        assert!(conn.poll_send(t).is_none());
    }

    #[test]
    fn test_local_close_sends_connection_close_once() {
        let (mut conn, mut peer) = establish();
        let t = now();
        conn.close(0x100, "done", t);
        let datagram = conn.poll_send(t).expect("close datagram");
        let received = peer.recv(&datagram);
        assert!(received.iter().any(|(_, frames)| frames
            .iter()
            .any(|f| matches!(f, Frame::ConnectionClose { .. }))));
        assert!(conn.poll_send(t).is_none(), "close is sent once");
    }

    #[test]
    fn test_handshake_timeout_exhausts_budget() {
        let t = now();
        let mut conn = client(false);
        let _ = conn.poll_send(t);
        // Fire the handshake timer past every retry; PTO firings interleave.
        let mut at = t;
        for _ in 0..16 {
            let Some(deadline) = conn.timeout() else { break };
            at = at.max(deadline);
            conn.on_timeout(at);
            let _ = conn.poll_send(at);
            if conn.is_closed() {
                break;
            }
        }
        assert!(conn.is_closed());
        let mut saw_timeout = false;
        while let Some(event) = conn.poll_event() {
            if let ConnectionEvent::Closed(ConnectionError::Transport(
                TransportError::HandshakeTimeout,
            )) = event
            {
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);
    }

    #[test]
    fn test_idle_timeout_closes_silently() {
        let (mut conn, _peer) = establish();
        let idle = conn.idle_timeout.expect("idle timeout configured");
        conn.on_timeout(now() + idle + Duration::from_secs(1));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_keep_alive_ping_queued() {
        let (mut conn, mut peer) = establish();
        let interval = conn.config.keep_alive.unwrap();
        let at = now() + interval + Duration::from_millis(10);
        conn.on_timeout(at);
        let datagram = conn.poll_send(at).expect("keep-alive datagram");
        let received = peer.recv(&datagram);
        assert!(received
            .iter()
            .any(|(_, frames)| frames.iter().any(|f| matches!(f, Frame::Ping))));
    }

    #[test]
    fn test_duplicate_packets_ignored() {
        let (mut conn, mut peer) = establish();
        let t = now();
        let id = conn.open_stream(true).unwrap();
        conn.stream_send(id, Bytes::from_static(b"x"), true).unwrap();
        let _ = conn.poll_send(t).map(|d| peer.recv(&d));

        let response = peer.build(&[(
            PacketType::OneRtt,
            vec![Frame::Stream {
                stream_id: id.0,
                offset: 0,
                data: Bytes::from_static(b"body"),
                fin: true,
            }],
        )]);
        conn.recv(&response, t).unwrap();
        let received_before = conn.stats().packets_received;
        // Replay the identical datagram.
        conn.recv(&response, t).unwrap();
        assert_eq!(conn.stats().packets_received, received_before);
        let (data, _) = conn.stream_recv(id).expect("data");
        assert_eq!(data.as_ref(), b"body");
    }

    #[test]
    fn test_new_token_surfaces_as_event() {
        let (mut conn, mut peer) = establish();
        let t = now();
        let datagram = peer.build(&[(
            PacketType::OneRtt,
            vec![Frame::NewToken { token: Bytes::from_static(b"addr-token") }],
        )]);
        conn.recv(&datagram, t).unwrap();
        let mut token = None;
        while let Some(event) = conn.poll_event() {
            if let ConnectionEvent::NewToken(t) = event {
                token = Some(t);
            }
        }
        assert_eq!(token.as_deref(), Some(&b"addr-token"[..]));
    }

    #[test]
    fn test_stop_sending_triggers_reset() {
        let (mut conn, mut peer) = establish();
        let t = now();
        let id = conn.open_stream(true).unwrap();
        conn.stream_send(id, Bytes::from_static(b"upload"), false).unwrap();
        let _ = conn.poll_send(t).map(|d| peer.recv(&d));

        let stop = peer.build(&[(
            PacketType::OneRtt,
            vec![Frame::StopSending { stream_id: id.0, error_code: 0x10b }],
        )]);
        conn.recv(&stop, t).unwrap();
        let datagram = conn.poll_send(t).expect("reset response");
        let received = peer.recv(&datagram);
        assert!(received.iter().any(|(_, frames)| frames.iter().any(
            |f| matches!(f, Frame::ResetStream { stream_id, error_code, .. }
                if *stream_id == id.0 && *error_code == 0x10b)
        )));
    }

    #[test]
    fn test_peer_key_update_keeps_old_generation_for_stragglers() {
        let (mut conn, mut peer) = establish();
        let t = now();
        let id = conn.open_stream(true).unwrap();
        conn.stream_send(id, Bytes::from_static(b"GET /"), true).unwrap();
        let _ = conn.poll_send(t).map(|d| peer.recv(&d));

        // First half of the response sealed under the current generation,
        // held back to simulate reordering.
        let straggler = peer.build(&[(
            PacketType::OneRtt,
            vec![Frame::Stream {
                stream_id: id.0,
                offset: 0,
                data: Bytes::from_static(b"he"),
                fin: false,
            }],
        )]);

        // Server initiates a key update; the second half arrives first.
        peer.update_app_keys();
        let tail = peer.build(&[(
            PacketType::OneRtt,
            vec![Frame::Stream {
                stream_id: id.0,
                offset: 2,
                data: Bytes::from_static(b"llo"),
                fin: true,
            }],
        )]);

        let before = conn.stats().packets_received;
        conn.recv(&tail, t).unwrap();
        assert!(conn.key_phase, "peer-initiated update accepted");
        assert!(conn.old_app_keys.is_some(), "previous generation retained");

        // The straggler still opens under the retained keys.
        conn.recv(&straggler, t).unwrap();
        assert_eq!(conn.stats().packets_received, before + 2);
        let mut data = Vec::new();
        let mut fin = false;
        while let Some((chunk, done)) = conn.stream_recv(id) {
            data.extend_from_slice(&chunk);
            if done {
                fin = true;
                break;
            }
        }
        assert_eq!(data, b"hello");
        assert!(fin);

        // The retained generation lapses after the drain window.
        conn.on_timeout(t + Duration::from_secs(1));
        assert!(conn.old_app_keys.is_none(), "old keys discarded after 3xPTO");
    }

    #[test]
    fn test_local_key_update_after_configured_interval() {
        let config = ConnectionConfig {
            key_update_interval: Some(1),
            ..ConnectionConfig::default()
        };
        let (mut conn, mut peer) = establish_with(config);
        let t = now();

        let id = conn.open_stream(true).unwrap();
        conn.stream_send(id, Bytes::from_static(b"a"), false).unwrap();
        let _ = conn.poll_send(t).map(|d| peer.recv(&d));

        // An ACK for the 1-RTT packet confirms the current generation.
        let ack = peer.build(&[(
            PacketType::OneRtt,
            vec![Frame::Ack { largest: 0, delay: 0, ranges: vec![(0, 0)], ecn: None }],
        )]);
        conn.recv(&ack, t).unwrap();

        assert!(!conn.key_phase);
        conn.stream_send(id, Bytes::from_static(b"b"), true).unwrap();
        let _ = conn.poll_send(t);

        assert!(conn.key_phase, "local key update initiated");
        assert!(conn.old_app_keys.is_some(), "previous generation retained");
    }

    #[test]
    fn test_prevalidation_send_budget_bounds_early_data() {
        let t = now();
        let mut conn = client_with_cached_params(true);
        let mut peer = TestPeer::new();

        // Plenty of early data queued, far beyond the pre-validation cap.
        let id = conn.open_stream(true).unwrap();
        conn.stream_send(id, Bytes::from(vec![0x61; 20_000]), true).unwrap();

        let first = conn.poll_send(t).expect("first flight");
        let _ = peer.recv(&first);
        let mut total = first.len();
        let mut datagrams = 1usize;
        while let Some(datagram) = conn.poll_send(t) {
            total += datagram.len();
            datagrams += 1;
            assert!(datagrams < 50, "send budget never engaged");
        }
        // Soft cap: the gate checks before each datagram, so at most one
        // datagram of overshoot past 3 x 1200.
        assert!(
            total <= 3 * 1200 + 1350,
            "sent {total} bytes to an unvalidated address"
        );

        // The server's flight validates the address and lifts the cap.
        conn.recv(&peer.handshake_flight(true), t).unwrap();
        assert!(conn.peer_address_validated);
        assert!(conn.poll_send(t).is_some(), "sending resumes after validation");
    }
}
