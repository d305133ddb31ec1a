//! Stream state machines and flow control (RFC 9000 §2–§4).
//!
//! A [`Stream`] owns an ordered send queue and a receive assembly buffer
//! with an offset-keyed gap map. The [`StreamMap`] owns every stream of a
//! connection plus both levels of flow control; streams refer to their
//! connection only through the ID handed back to the scheduler, which keeps
//! the ownership graph acyclic.

use std::collections::{BTreeMap, HashMap, VecDeque};

use bytes::Bytes;
use tracing::trace;

use crate::error::TransportError;

/// Which endpoint an ID belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// 62-bit stream identifier; the low two bits encode initiator and
/// directionality (RFC 9000 §2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn from_parts(index: u64, initiator: Side, bidi: bool) -> StreamId {
        let mut id = index << 2;
        if initiator == Side::Server {
            id |= 0x01;
        }
        if !bidi {
            id |= 0x02;
        }
        StreamId(id)
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x01 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn is_bidi(self) -> bool {
        self.0 & 0x02 == 0
    }

    /// Ordinal of this stream within its class.
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

/// Stream priority: class ordering first, then weight descending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamPriority {
    /// 0 = critical .. 4 = background.
    pub class: u8,
    pub weight: f64,
}

impl Default for StreamPriority {
    fn default() -> Self {
        StreamPriority { class: 2, weight: 1.0 }
    }
}

impl StreamPriority {
    /// Ordering key: lower sorts first.
    pub fn order_key(&self) -> (u8, i64) {
        (self.class, -(self.weight * 1000.0) as i64)
    }
}

/// RFC 9000 §3 composite stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    ResetSent,
    ResetReceived,
}

/// Ordered receive assembly with a gap map keyed by byte offset.
#[derive(Debug, Default)]
pub struct RecvBuffer {
    /// Next in-order offset to deliver.
    recv_offset: u64,
    /// Out-of-order segments, keyed by start offset, non-overlapping.
    gaps: BTreeMap<u64, Bytes>,
    /// Contiguous data ready for the application.
    ready: VecDeque<Bytes>,
    /// Highest offset seen in any frame.
    highest_seen: u64,
    final_size: Option<u64>,
    fin_delivered: bool,
}

impl RecvBuffer {
    /// Ingest one STREAM frame's worth of data.
    pub fn push(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<(), TransportError> {
        let end = offset + data.len() as u64;

        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(TransportError::FinalSize);
            }
        }
        if fin {
            if self.highest_seen > end {
                return Err(TransportError::FinalSize);
            }
            self.final_size = Some(end);
        }
        self.highest_seen = self.highest_seen.max(end);

        // Drop bytes already delivered.
        let mut data = data;
        let mut offset = offset;
        if offset < self.recv_offset {
            let skip = (self.recv_offset - offset).min(data.len() as u64) as usize;
            data.advance_checked(skip);
            offset += skip as u64;
        }

        // Slice around existing buffered segments so the map stays
        // non-overlapping; duplicates are ignored.
        while !data.is_empty() {
            // The first buffered segment at or after `offset`, and the one
            // covering it from before, bound what we may insert.
            let covering_end = self
                .gaps
                .range(..=offset)
                .next_back()
                .map(|(start, seg)| start + seg.len() as u64)
                .filter(|&e| e > offset);
            if let Some(covered_to) = covering_end {
                let skip = (covered_to - offset).min(data.len() as u64) as usize;
                data.advance_checked(skip);
                offset += skip as u64;
                continue;
            }
            let next_start = self.gaps.range(offset..).next().map(|(s, _)| *s);
            let take = match next_start {
                Some(s) => (s - offset).min(data.len() as u64) as usize,
                None => data.len(),
            };
            if take > 0 {
                self.gaps.insert(offset, data.split_to(take));
                offset += take as u64;
            } else {
                // Flush against the segment starting exactly here.
                let seg_len = self.gaps[&offset].len();
                let skip = seg_len.min(data.len());
                data.advance_checked(skip);
                offset += skip as u64;
            }
        }

        // Absorb contiguous gap segments into the ready queue.
        while let Some(seg) = self.gaps.remove(&self.recv_offset) {
            self.recv_offset += seg.len() as u64;
            if !seg.is_empty() {
                self.ready.push_back(seg);
            }
        }
        trace!(
            recv_offset = self.recv_offset,
            buffered = self.gaps.len(),
            "stream receive advanced"
        );
        Ok(())
    }

    /// Next chunk of in-order data, if any.
    pub fn read(&mut self) -> Option<Bytes> {
        let chunk = self.ready.pop_front();
        if chunk.is_none() && self.is_finished() {
            self.fin_delivered = true;
        }
        chunk
    }

    /// All buffered in-order data as one contiguous chunk.
    pub fn read_to_end(&mut self) -> Bytes {
        let total: usize = self.ready.iter().map(|b| b.len()).sum();
        let mut out = Vec::with_capacity(total);
        while let Some(chunk) = self.ready.pop_front() {
            out.extend_from_slice(&chunk);
        }
        if self.is_finished() {
            self.fin_delivered = true;
        }
        Bytes::from(out)
    }

    /// True once every byte up to the final size has been delivered.
    pub fn is_finished(&self) -> bool {
        self.final_size == Some(self.recv_offset) && self.ready.is_empty()
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.recv_offset
    }

    /// Highest offset seen in any frame, for flow-control accounting.
    pub fn highest_seen(&self) -> u64 {
        self.highest_seen
    }

    /// Whether the end of the stream has already been handed out.
    pub fn fin_delivered(&self) -> bool {
        self.fin_delivered
    }

    pub(crate) fn set_fin_delivered(&mut self) {
        self.fin_delivered = true;
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    fn discard(&mut self) {
        self.gaps.clear();
        self.ready.clear();
    }
}

trait AdvanceChecked {
    fn advance_checked(&mut self, n: usize);
}

impl AdvanceChecked for Bytes {
    fn advance_checked(&mut self, n: usize) {
        let n = n.min(self.len());
        let _ = self.split_to(n);
    }
}

/// Ordered send queue. Lost data is re-queued at the connection level from
/// the frames retained with each sent packet, so this buffer only tracks
/// not-yet-transmitted bytes.
#[derive(Debug, Default)]
pub struct SendBuffer {
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    /// Offset of the next new byte to transmit.
    next_offset: u64,
    fin_queued: bool,
    fin_sent: bool,
}

impl SendBuffer {
    pub fn write(&mut self, data: Bytes) {
        self.pending_bytes += data.len();
        self.pending.push_back(data);
    }

    /// Mark the send side complete; FIN rides on the last frame.
    pub fn finish(&mut self) {
        self.fin_queued = true;
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || (self.fin_queued && !self.fin_sent)
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Pull up to `max_bytes` for transmission.
    pub fn poll_transmit(&mut self, max_bytes: usize) -> Option<(u64, Bytes, bool)> {
        if !self.has_pending() || (max_bytes == 0 && !self.pending.is_empty()) {
            return None;
        }
        let offset = self.next_offset;
        let mut out = Vec::new();
        let mut taken = 0usize;
        while taken < max_bytes {
            let Some(mut chunk) = self.pending.pop_front() else { break };
            let room = max_bytes - taken;
            if chunk.len() > room {
                let rest = chunk.split_off(room);
                self.pending.push_front(rest);
            }
            taken += chunk.len();
            out.push(chunk);
        }
        self.pending_bytes -= taken;
        self.next_offset += taken as u64;
        let fin = self.fin_queued && self.pending.is_empty();
        if fin {
            self.fin_sent = true;
        }
        if out.is_empty() && !fin {
            return None;
        }
        let data = if out.len() == 1 {
            out.into_iter().next().unwrap_or_default()
        } else {
            let mut joined = Vec::with_capacity(taken);
            for c in &out {
                joined.extend_from_slice(c);
            }
            Bytes::from(joined)
        };
        Some((offset, data, fin))
    }
}

/// One bidirectional or unidirectional stream.
#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    pub send: SendBuffer,
    pub recv: RecvBuffer,
    pub priority: StreamPriority,
    /// Peer's flow-control limit on what we may send.
    pub max_send_data: u64,
    /// Our advertised limit on what the peer may send.
    pub max_recv_data: u64,
    /// Receive window size used when extending `max_recv_data`.
    recv_window: u64,
    pub reset_sent: Option<u64>,
    pub reset_received: Option<(u64, u64)>,
    pub stop_sending_received: Option<u64>,
    local_fin_acked: bool,
}

impl Stream {
    fn new(id: StreamId, max_send_data: u64, max_recv_data: u64) -> Stream {
        Stream {
            id,
            send: SendBuffer::default(),
            recv: RecvBuffer::default(),
            priority: StreamPriority::default(),
            max_send_data,
            max_recv_data,
            recv_window: max_recv_data,
            reset_sent: None,
            reset_received: None,
            stop_sending_received: None,
            local_fin_acked: false,
        }
    }

    /// Composite RFC 9000 §3 state for diagnostics and teardown decisions.
    pub fn state(&self) -> StreamState {
        if self.reset_received.is_some() {
            return StreamState::ResetReceived;
        }
        if self.reset_sent.is_some() {
            return StreamState::ResetSent;
        }
        let send_done = self.send.fin_sent && !self.send.has_pending();
        let recv_done = self.recv.is_finished();
        match (send_done, recv_done) {
            (true, true) => StreamState::Closed,
            (true, false) => StreamState::HalfClosedLocal,
            (false, true) => StreamState::HalfClosedRemote,
            (false, false) => StreamState::Open,
        }
    }

    /// Record a peer RESET_STREAM; the receive buffer is discarded.
    pub fn on_reset_received(&mut self, code: u64, final_size: u64) -> Result<(), TransportError> {
        if let Some(known) = self.recv.final_size() {
            if known != final_size {
                return Err(TransportError::FinalSize);
            }
        }
        if self.recv.highest_seen > final_size {
            return Err(TransportError::FinalSize);
        }
        self.reset_received = Some((code, final_size));
        self.recv.discard();
        Ok(())
    }

    /// Sendable bytes remaining before the peer's stream limit.
    pub fn send_allowance(&self) -> u64 {
        self.max_send_data.saturating_sub(self.send.next_offset())
    }

    /// Drop unsent data after a local RESET_STREAM.
    pub fn abandon_send(&mut self) {
        self.send = SendBuffer::default();
        self.send.fin_sent = true;
    }

    /// Whether both halves are terminal and the stream can be reaped.
    pub fn is_drained(&self) -> bool {
        matches!(
            self.state(),
            StreamState::Closed | StreamState::ResetSent | StreamState::ResetReceived
        ) && !self.send.has_pending()
    }

    /// Extend the receive window when half has been consumed; returns the
    /// new limit to advertise, if an update is due.
    pub fn take_max_stream_data_update(&mut self) -> Option<u64> {
        let consumed = self.recv.bytes_delivered();
        if self.max_recv_data.saturating_sub(consumed) < self.recv_window / 2 {
            self.max_recv_data = consumed + self.recv_window;
            Some(self.max_recv_data)
        } else {
            None
        }
    }
}

/// Every stream of one connection plus both flow-control ledgers.
pub struct StreamMap {
    side: Side,
    streams: HashMap<StreamId, Stream>,
    next_bidi: u64,
    next_uni: u64,
    /// Peer's MAX_STREAMS limits on us.
    pub peer_max_streams_bidi: u64,
    pub peer_max_streams_uni: u64,
    /// Our MAX_STREAMS limits on the peer.
    local_max_streams_bidi: u64,
    local_max_streams_uni: u64,
    /// Highest peer-initiated index seen, per directionality.
    peer_opened_bidi: u64,
    peer_opened_uni: u64,
    /// Peer limits on our aggregate sending.
    pub peer_max_data: u64,
    pub data_sent: u64,
    /// Our limits on the peer's aggregate sending.
    local_max_data: u64,
    data_received: u64,
    recv_window: u64,
    /// Per-stream initial limits from transport parameters.
    initial_max_stream_data_remote: u64,
    initial_max_stream_data_local: u64,
}

impl StreamMap {
    pub fn new(side: Side) -> StreamMap {
        StreamMap {
            side,
            streams: HashMap::new(),
            next_bidi: 0,
            next_uni: 0,
            peer_max_streams_bidi: 0,
            peer_max_streams_uni: 0,
            local_max_streams_bidi: 100,
            local_max_streams_uni: 100,
            peer_opened_bidi: 0,
            peer_opened_uni: 0,
            peer_max_data: 0,
            data_sent: 0,
            local_max_data: 10 * 1024 * 1024,
            data_received: 0,
            recv_window: 10 * 1024 * 1024,
            initial_max_stream_data_remote: 0,
            initial_max_stream_data_local: 1024 * 1024,
        }
    }

    /// Apply the peer's transport parameters once known.
    pub fn apply_peer_limits(
        &mut self,
        max_data: u64,
        max_streams_bidi: u64,
        max_streams_uni: u64,
        max_stream_data: u64,
    ) {
        self.peer_max_data = self.peer_max_data.max(max_data);
        self.peer_max_streams_bidi = self.peer_max_streams_bidi.max(max_streams_bidi);
        self.peer_max_streams_uni = self.peer_max_streams_uni.max(max_streams_uni);
        self.initial_max_stream_data_remote = max_stream_data;
        for stream in self.streams.values_mut() {
            stream.max_send_data = stream.max_send_data.max(max_stream_data);
        }
    }

    /// Record our advertised local limits.
    pub fn apply_local_limits(
        &mut self,
        max_data: u64,
        max_streams_bidi: u64,
        max_streams_uni: u64,
        max_stream_data: u64,
    ) {
        self.local_max_data = max_data;
        self.recv_window = max_data;
        self.local_max_streams_bidi = max_streams_bidi;
        self.local_max_streams_uni = max_streams_uni;
        self.initial_max_stream_data_local = max_stream_data;
    }

    /// Open the next locally-initiated stream of the chosen class.
    pub fn open(&mut self, bidi: bool) -> Result<StreamId, TransportError> {
        let (next, limit) = if bidi {
            (&mut self.next_bidi, self.peer_max_streams_bidi)
        } else {
            (&mut self.next_uni, self.peer_max_streams_uni)
        };
        if *next >= limit {
            return Err(TransportError::StreamLimit);
        }
        let id = StreamId::from_parts(*next, self.side, bidi);
        *next += 1;
        let stream = Stream::new(
            id,
            self.initial_max_stream_data_remote,
            self.initial_max_stream_data_local,
        );
        self.streams.insert(id, stream);
        Ok(id)
    }

    /// Number of locally-initiated streams opened so far.
    pub fn opened(&self, bidi: bool) -> u64 {
        if bidi {
            self.next_bidi
        } else {
            self.next_uni
        }
    }

    /// Look up or lazily create the stream a peer frame refers to.
    ///
    /// Validates initiator bits against the peer's role and enforces our
    /// MAX_STREAMS advertisement.
    pub fn recv_stream(&mut self, id: StreamId) -> Result<&mut Stream, TransportError> {
        if !self.streams.contains_key(&id) {
            if id.initiator() == self.side {
                // A frame for a local stream we never opened.
                return Err(TransportError::StreamState("unopened local stream"));
            }
            // Receiving on a peer uni stream or peer bidi stream: enforce
            // our advertised limit, then create every ID up to this index.
            let limit = if id.is_bidi() {
                self.local_max_streams_bidi
            } else {
                self.local_max_streams_uni
            };
            if id.index() >= limit {
                return Err(TransportError::StreamLimit);
            }
            let opened = if id.is_bidi() {
                &mut self.peer_opened_bidi
            } else {
                &mut self.peer_opened_uni
            };
            *opened = (*opened).max(id.index() + 1);
            let stream = Stream::new(
                id,
                self.initial_max_stream_data_remote,
                self.initial_max_stream_data_local,
            );
            self.streams.insert(id, stream);
        }
        self.streams.get_mut(&id).ok_or(TransportError::Internal("stream vanished"))
    }

    /// Validate that a send-direction frame (MAX_STREAM_DATA,
    /// STOP_SENDING) may reference this ID.
    pub fn send_stream(&mut self, id: StreamId) -> Result<&mut Stream, TransportError> {
        if id.initiator() != self.side && !id.is_bidi() {
            return Err(TransportError::StreamState("peer uni stream is receive-only"));
        }
        self.streams
            .get_mut(&id)
            .ok_or(TransportError::StreamState("unknown stream"))
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    /// True when `id` was a valid stream that has since been reaped;
    /// late frames for it are ignored rather than treated as errors.
    pub fn is_closed(&self, id: StreamId) -> bool {
        if self.streams.contains_key(&id) {
            return false;
        }
        let opened = if id.initiator() == self.side {
            if id.is_bidi() {
                self.next_bidi
            } else {
                self.next_uni
            }
        } else if id.is_bidi() {
            self.peer_opened_bidi
        } else {
            self.peer_opened_uni
        };
        id.index() < opened
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Account received stream bytes against connection flow control.
    pub fn on_data_received(&mut self, new_bytes: u64) -> Result<(), TransportError> {
        self.data_received += new_bytes;
        if self.data_received > self.local_max_data {
            return Err(TransportError::FlowControl("connection receive limit"));
        }
        Ok(())
    }

    /// Account sent stream bytes against the peer's MAX_DATA.
    pub fn on_data_sent(&mut self, bytes: u64) {
        self.data_sent += bytes;
    }

    /// Connection-level send allowance.
    pub fn send_allowance(&self) -> u64 {
        self.peer_max_data.saturating_sub(self.data_sent)
    }

    /// Connection-level MAX_DATA update when half the window is consumed.
    pub fn take_max_data_update(&mut self) -> Option<u64> {
        if self.local_max_data.saturating_sub(self.data_received) < self.recv_window / 2 {
            self.local_max_data = self.data_received + self.recv_window;
            Some(self.local_max_data)
        } else {
            None
        }
    }

    /// Streams with pending send data, best priority first.
    pub fn sendable(&self) -> Vec<StreamId> {
        let mut ids: Vec<&Stream> = self
            .streams
            .values()
            .filter(|s| {
                s.reset_sent.is_none()
                    && s.send.has_pending()
                    && (s.send_allowance() > 0 || s.send.pending_bytes() == 0)
            })
            .collect();
        ids.sort_by_key(|s| (s.priority.order_key(), s.id));
        ids.iter().map(|s| s.id).collect()
    }

    /// Drop streams whose both halves are terminal.
    pub fn reap_drained(&mut self) -> Vec<StreamId> {
        let drained: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.is_drained())
            .map(|(id, _)| *id)
            .collect();
        for id in &drained {
            self.streams.remove(id);
        }
        drained
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn b(s: &[u8]) -> Bytes {
        Bytes::copy_from_slice(s)
    }

    #[test]
    fn test_stream_id_bit_layout() {
        assert_eq!(StreamId::from_parts(0, Side::Client, true).0, 0);
        assert_eq!(StreamId::from_parts(0, Side::Server, true).0, 1);
        assert_eq!(StreamId::from_parts(0, Side::Client, false).0, 2);
        assert_eq!(StreamId::from_parts(0, Side::Server, false).0, 3);
        assert_eq!(StreamId::from_parts(3, Side::Client, true).0, 12);

        let id = StreamId(0x0f);
        assert_eq!(id.initiator(), Side::Server);
        assert!(!id.is_bidi());
        assert_eq!(id.index(), 3);
    }

    #[test]
    fn test_in_order_delivery() {
        let mut recv = RecvBuffer::default();
        recv.push(0, b(b"hello "), false).unwrap();
        recv.push(6, b(b"world"), true).unwrap();
        assert_eq!(recv.read_to_end(), b(b"hello world"));
        assert!(recv.is_finished());
    }

    #[test]
    fn test_reordered_and_duplicate_frames() {
        let mut recv = RecvBuffer::default();
        recv.push(6, b(b"world"), true).unwrap();
        assert!(!recv.has_ready());
        recv.push(0, b(b"hello "), false).unwrap();
        recv.push(6, b(b"world"), true).unwrap(); // duplicate
        recv.push(2, b(b"llo"), false).unwrap(); // fully past
        assert_eq!(recv.read_to_end(), b(b"hello world"));
        assert!(recv.is_finished());
    }

    #[test]
    fn test_overlapping_gap_fill() {
        let mut recv = RecvBuffer::default();
        recv.push(4, b(b"efgh"), false).unwrap();
        recv.push(2, b(b"cdef"), false).unwrap(); // partially overlaps gap
        recv.push(0, b(b"ab"), false).unwrap();
        assert_eq!(recv.read_to_end(), b(b"abcdefgh"));
    }

    #[test]
    fn test_random_interleavings_deliver_in_order() {
        let original: Vec<u8> = (0u8..=200).collect();
        // Split into frames, deliver in a few adversarial orders.
        let orders: [&[usize]; 3] = [&[3, 1, 0, 2, 4], &[4, 3, 2, 1, 0], &[1, 3, 0, 4, 2]];
        for order in orders {
            let mut recv = RecvBuffer::default();
            let chunks: Vec<(u64, Bytes, bool)> = original
                .chunks(45)
                .enumerate()
                .map(|(i, c)| {
                    let offset = (i * 45) as u64;
                    (offset, Bytes::copy_from_slice(c), offset as usize + c.len() == original.len())
                })
                .collect();
            for &i in order {
                let (offset, data, fin) = chunks[i].clone();
                recv.push(offset, data, fin).unwrap();
                // duplicate delivery of the same frame
                let (offset, data, fin) = chunks[i].clone();
                recv.push(offset, data, fin).unwrap();
            }
            assert_eq!(recv.read_to_end().as_ref(), &original[..]);
            assert!(recv.is_finished());
        }
    }

    #[test]
    fn test_final_size_violations() {
        let mut recv = RecvBuffer::default();
        recv.push(0, b(b"abcd"), true).unwrap();
        assert_eq!(recv.push(4, b(b"e"), false).unwrap_err(), TransportError::FinalSize);

        let mut recv = RecvBuffer::default();
        recv.push(0, b(b"abcdef"), false).unwrap();
        assert_eq!(recv.push(0, b(b"abcd"), true).unwrap_err(), TransportError::FinalSize);
    }

    #[test]
    fn test_send_buffer_segments_and_fin() {
        let mut send = SendBuffer::default();
        send.write(b(b"hello world"));
        send.finish();

        let (off, data, fin) = send.poll_transmit(5).unwrap();
        assert_eq!((off, data.as_ref(), fin), (0, &b"hello"[..], false));
        let (off, data, fin) = send.poll_transmit(100).unwrap();
        assert_eq!((off, data.as_ref(), fin), (5, &b" world"[..], true));
        assert!(!send.has_pending());
    }

    #[test]
    fn test_send_buffer_empty_fin() {
        let mut send = SendBuffer::default();
        send.finish();
        let (off, data, fin) = send.poll_transmit(100).unwrap();
        assert_eq!((off, data.len(), fin), (0, 0, true));
    }

    #[test]
    fn test_open_respects_peer_max_streams() {
        let mut map = StreamMap::new(Side::Client);
        map.apply_peer_limits(1_000_000, 2, 0, 65_536);
        assert!(map.open(true).is_ok());
        assert!(map.open(true).is_ok());
        assert_eq!(map.open(true).unwrap_err(), TransportError::StreamLimit);
        assert_eq!(map.open(false).unwrap_err(), TransportError::StreamLimit);
    }

    #[test]
    fn test_recv_stream_validates_initiator() {
        let mut map = StreamMap::new(Side::Client);
        // Client-initiated bidi ID 0 arriving from the peer without us
        // opening it is a stream-state violation.
        assert!(matches!(
            map.recv_stream(StreamId(0)),
            Err(TransportError::StreamState(_))
        ));
        // Server-initiated uni stream (ID 3) is created on first receipt.
        assert!(map.recv_stream(StreamId(3)).is_ok());
    }

    #[test]
    fn test_recv_stream_enforces_local_limit() {
        let mut map = StreamMap::new(Side::Client);
        map.apply_local_limits(1_000_000, 1, 1, 65_536);
        assert!(map.recv_stream(StreamId(3)).is_ok()); // uni index 0
        assert_eq!(
            map.recv_stream(StreamId(7)).unwrap_err(), // uni index 1
            TransportError::StreamLimit
        );
    }

    #[test]
    fn test_connection_flow_control_receive() {
        let mut map = StreamMap::new(Side::Client);
        map.apply_local_limits(10, 10, 10, 65_536);
        assert!(map.on_data_received(8).is_ok());
        assert!(matches!(
            map.on_data_received(3),
            Err(TransportError::FlowControl(_))
        ));
    }

    #[test]
    fn test_sendable_orders_by_priority_then_weight() {
        let mut map = StreamMap::new(Side::Client);
        map.apply_peer_limits(1_000_000, 10, 10, 65_536);
        let low = map.open(true).unwrap();
        let critical = map.open(true).unwrap();
        let heavy = map.open(true).unwrap();

        for (id, class, weight) in [(low, 3, 1.0), (critical, 0, 5.0), (heavy, 3, 9.0)] {
            let s = map.get_mut(id).unwrap();
            s.priority = StreamPriority { class, weight };
            s.send.write(Bytes::from_static(b"x"));
        }
        assert_eq!(map.sendable(), vec![critical, heavy, low]);
    }

    #[test]
    fn test_reset_received_discards_buffer() {
        let mut map = StreamMap::new(Side::Client);
        map.apply_peer_limits(1_000_000, 10, 10, 65_536);
        let id = map.open(true).unwrap();
        let stream = map.get_mut(id).unwrap();
        stream.recv.push(0, b(b"partial"), false).unwrap();
        stream.on_reset_received(0x10c, 100).unwrap();
        assert_eq!(stream.state(), StreamState::ResetReceived);
        assert!(!stream.recv.has_ready());
    }

    #[test]
    fn test_reset_final_size_conflict() {
        let mut map = StreamMap::new(Side::Client);
        map.apply_peer_limits(1_000_000, 10, 10, 65_536);
        let id = map.open(true).unwrap();
        let stream = map.get_mut(id).unwrap();
        stream.recv.push(0, b(b"12345678"), false).unwrap();
        assert_eq!(
            stream.on_reset_received(0, 4).unwrap_err(),
            TransportError::FinalSize
        );
    }

    #[test]
    fn test_max_stream_data_update_after_half_window() {
        let mut map = StreamMap::new(Side::Client);
        map.apply_peer_limits(1_000_000, 10, 10, 65_536);
        map.apply_local_limits(1_000_000, 10, 10, 100);
        let id = map.open(true).unwrap();
        let stream = map.get_mut(id).unwrap();
        assert!(stream.take_max_stream_data_update().is_none());
        stream.recv.push(0, Bytes::from(vec![0u8; 60]), false).unwrap();
        let _ = stream.recv.read_to_end();
        assert_eq!(stream.take_max_stream_data_update(), Some(160));
    }

    #[test]
    fn test_drained_streams_reaped() {
        let mut map = StreamMap::new(Side::Client);
        map.apply_peer_limits(1_000_000, 10, 10, 65_536);
        let id = map.open(true).unwrap();
        let stream = map.get_mut(id).unwrap();
        stream.send.finish();
        let _ = stream.send.poll_transmit(100);
        stream.recv.push(0, b(b"done"), true).unwrap();
        let _ = stream.recv.read_to_end();
        assert_eq!(map.reap_drained(), vec![id]);
        assert!(map.is_empty());
    }
}
