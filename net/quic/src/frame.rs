//! QUIC frame codec (RFC 9000 §19).
//!
//! Every frame type is parsed and serialized symmetrically. Frames carry
//! their payloads as [`Bytes`] so packet payloads are sliced, not copied.
//! Epoch admission is enforced at parse time: a frame arriving in a packet
//! type that may not carry it is a PROTOCOL_VIOLATION.

use bytes::{Buf, BufMut, Bytes};

use crate::error::TransportError;
use crate::packet::{ConnectionId, PacketType, MAX_CID_LEN};
use crate::varint::{decode_len, VarInt};

/// ECN counters attached to an ACK frame (type 0x03).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

/// A parsed QUIC frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A run of consecutive PADDING bytes.
    Padding(usize),
    Ping,
    Ack {
        largest: u64,
        /// Raw ack-delay value; scaling by the exponent happens in recovery.
        delay: u64,
        /// Acknowledged ranges as inclusive `(start, end)` pairs, in
        /// descending order; the first always contains `largest`.
        ranges: Vec<(u64, u64)>,
        ecn: Option<EcnCounts>,
    },
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    NewToken {
        token: Bytes,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
    MaxData(u64),
    MaxStreamData {
        stream_id: u64,
        max: u64,
    },
    MaxStreams {
        bidi: bool,
        max: u64,
    },
    DataBlocked(u64),
    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },
    StreamsBlocked {
        bidi: bool,
        limit: u64,
    },
    NewConnectionId {
        seq: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: [u8; 16],
    },
    RetireConnectionId {
        seq: u64,
    },
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    ConnectionClose {
        error_code: u64,
        /// `Some` for the transport variant (0x1c), `None` for the
        /// application variant (0x1d).
        frame_type: Option<u64>,
        reason: Bytes,
    },
    HandshakeDone,
}

impl Frame {
    /// Whether the frame counts toward bytes in flight and elicits an ACK.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Ack { .. } | Frame::Padding(_) | Frame::ConnectionClose { .. }
        )
    }

    /// Frame admission per packet type (RFC 9000 §12.4 table).
    pub fn permitted_in(&self, ty: PacketType) -> bool {
        match ty {
            PacketType::Initial | PacketType::Handshake => matches!(
                self,
                Frame::Padding(_)
                    | Frame::Ping
                    | Frame::Ack { .. }
                    | Frame::Crypto { .. }
                    | Frame::ConnectionClose { frame_type: Some(_), .. }
            ),
            PacketType::ZeroRtt => !matches!(
                self,
                Frame::Ack { .. }
                    | Frame::Crypto { .. }
                    | Frame::NewToken { .. }
                    | Frame::PathResponse(_)
                    | Frame::HandshakeDone
            ),
            PacketType::OneRtt => true,
            _ => false,
        }
    }

    /// Parse a single frame, consuming its bytes.
    pub fn parse<B: Buf>(buf: &mut B) -> Result<Frame, TransportError> {
        let ty = VarInt::decode(buf)?.value();
        match ty {
            0x00 => {
                let mut len = 1;
                while buf.has_remaining() && buf.chunk()[0] == 0 {
                    buf.advance(1);
                    len += 1;
                }
                Ok(Frame::Padding(len))
            }
            0x01 => Ok(Frame::Ping),
            0x02 | 0x03 => {
                let largest = VarInt::decode(buf)?.value();
                let delay = VarInt::decode(buf)?.value();
                let range_count = VarInt::decode(buf)?.value();
                let first_range = VarInt::decode(buf)?.value();
                if first_range > largest {
                    return Err(TransportError::FrameEncoding("ack range underflow"));
                }
                let mut ranges = Vec::with_capacity(range_count as usize + 1);
                let mut smallest = largest - first_range;
                ranges.push((smallest, largest));
                for _ in 0..range_count {
                    let gap = VarInt::decode(buf)?.value();
                    let len = VarInt::decode(buf)?.value();
                    // gap is two less than the distance between ranges
                    if smallest < gap + 2 {
                        return Err(TransportError::FrameEncoding("ack range underflow"));
                    }
                    let end = smallest - gap - 2;
                    if len > end {
                        return Err(TransportError::FrameEncoding("ack range underflow"));
                    }
                    smallest = end - len;
                    ranges.push((smallest, end));
                }
                let ecn = if ty == 0x03 {
                    Some(EcnCounts {
                        ect0: VarInt::decode(buf)?.value(),
                        ect1: VarInt::decode(buf)?.value(),
                        ce: VarInt::decode(buf)?.value(),
                    })
                } else {
                    None
                };
                Ok(Frame::Ack { largest, delay, ranges, ecn })
            }
            0x04 => Ok(Frame::ResetStream {
                stream_id: VarInt::decode(buf)?.value(),
                error_code: VarInt::decode(buf)?.value(),
                final_size: VarInt::decode(buf)?.value(),
            }),
            0x05 => Ok(Frame::StopSending {
                stream_id: VarInt::decode(buf)?.value(),
                error_code: VarInt::decode(buf)?.value(),
            }),
            0x06 => {
                let offset = VarInt::decode(buf)?.value();
                let len = decode_len(buf)?;
                if buf.remaining() < len {
                    return Err(TransportError::InsufficientData);
                }
                Ok(Frame::Crypto { offset, data: buf.copy_to_bytes(len) })
            }
            0x07 => {
                let len = decode_len(buf)?;
                if len == 0 {
                    return Err(TransportError::FrameEncoding("empty NEW_TOKEN"));
                }
                if buf.remaining() < len {
                    return Err(TransportError::InsufficientData);
                }
                Ok(Frame::NewToken { token: buf.copy_to_bytes(len) })
            }
            0x08..=0x0f => {
                let has_offset = ty & 0x04 != 0;
                let has_len = ty & 0x02 != 0;
                let fin = ty & 0x01 != 0;
                let stream_id = VarInt::decode(buf)?.value();
                let offset = if has_offset { VarInt::decode(buf)?.value() } else { 0 };
                let len = if has_len { decode_len(buf)? } else { buf.remaining() };
                if buf.remaining() < len {
                    return Err(TransportError::InsufficientData);
                }
                if offset + len as u64 > VarInt::MAX.value() {
                    return Err(TransportError::FrameEncoding("stream offset overflow"));
                }
                Ok(Frame::Stream { stream_id, offset, data: buf.copy_to_bytes(len), fin })
            }
            0x10 => Ok(Frame::MaxData(VarInt::decode(buf)?.value())),
            0x11 => Ok(Frame::MaxStreamData {
                stream_id: VarInt::decode(buf)?.value(),
                max: VarInt::decode(buf)?.value(),
            }),
            0x12 | 0x13 => Ok(Frame::MaxStreams {
                bidi: ty == 0x12,
                max: VarInt::decode(buf)?.value(),
            }),
            0x14 => Ok(Frame::DataBlocked(VarInt::decode(buf)?.value())),
            0x15 => Ok(Frame::StreamDataBlocked {
                stream_id: VarInt::decode(buf)?.value(),
                limit: VarInt::decode(buf)?.value(),
            }),
            0x16 | 0x17 => Ok(Frame::StreamsBlocked {
                bidi: ty == 0x16,
                limit: VarInt::decode(buf)?.value(),
            }),
            0x18 => {
                let seq = VarInt::decode(buf)?.value();
                let retire_prior_to = VarInt::decode(buf)?.value();
                let cid_len = buf
                    .try_get_u8()
                    .map_err(|_| TransportError::InsufficientData)?
                    as usize;
                if cid_len == 0 || cid_len > MAX_CID_LEN {
                    return Err(TransportError::FrameEncoding("bad cid length"));
                }
                if buf.remaining() < cid_len + 16 {
                    return Err(TransportError::InsufficientData);
                }
                let cid = ConnectionId::new(&buf.chunk()[..cid_len])
                    .ok_or(TransportError::FrameEncoding("bad cid length"))?;
                buf.advance(cid_len);
                let mut reset_token = [0u8; 16];
                buf.copy_to_slice(&mut reset_token);
                Ok(Frame::NewConnectionId { seq, retire_prior_to, cid, reset_token })
            }
            0x19 => Ok(Frame::RetireConnectionId { seq: VarInt::decode(buf)?.value() }),
            0x1a | 0x1b => {
                if buf.remaining() < 8 {
                    return Err(TransportError::InsufficientData);
                }
                let mut data = [0u8; 8];
                buf.copy_to_slice(&mut data);
                Ok(if ty == 0x1a {
                    Frame::PathChallenge(data)
                } else {
                    Frame::PathResponse(data)
                })
            }
            0x1c | 0x1d => {
                let error_code = VarInt::decode(buf)?.value();
                let frame_type =
                    if ty == 0x1c { Some(VarInt::decode(buf)?.value()) } else { None };
                let len = decode_len(buf)?;
                if buf.remaining() < len {
                    return Err(TransportError::InsufficientData);
                }
                Ok(Frame::ConnectionClose {
                    error_code,
                    frame_type,
                    reason: buf.copy_to_bytes(len),
                })
            }
            0x1e => Ok(Frame::HandshakeDone),
            _ => Err(TransportError::FrameEncoding("unknown frame type")),
        }
    }

    /// Serialize into `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        match self {
            Frame::Padding(len) => {
                for _ in 0..*len {
                    buf.put_u8(0);
                }
            }
            Frame::Ping => buf.put_u8(0x01),
            Frame::Ack { largest, delay, ranges, ecn } => {
                VarInt::from_u32(if ecn.is_some() { 0x03 } else { 0x02 }).encode(buf);
                varint(*largest, buf);
                varint(*delay, buf);
                varint(ranges.len() as u64 - 1, buf);
                varint(largest - ranges[0].0, buf);
                let mut prev_start = ranges[0].0;
                for (start, end) in &ranges[1..] {
                    varint(prev_start - end - 2, buf);
                    varint(end - start, buf);
                    prev_start = *start;
                }
                if let Some(e) = ecn {
                    varint(e.ect0, buf);
                    varint(e.ect1, buf);
                    varint(e.ce, buf);
                }
            }
            Frame::ResetStream { stream_id, error_code, final_size } => {
                buf.put_u8(0x04);
                varint(*stream_id, buf);
                varint(*error_code, buf);
                varint(*final_size, buf);
            }
            Frame::StopSending { stream_id, error_code } => {
                buf.put_u8(0x05);
                varint(*stream_id, buf);
                varint(*error_code, buf);
            }
            Frame::Crypto { offset, data } => {
                buf.put_u8(0x06);
                varint(*offset, buf);
                varint(data.len() as u64, buf);
                buf.put_slice(data);
            }
            Frame::NewToken { token } => {
                buf.put_u8(0x07);
                varint(token.len() as u64, buf);
                buf.put_slice(token);
            }
            Frame::Stream { stream_id, offset, data, fin } => {
                // Always emit OFF and LEN so frames can pack side by side.
                let mut ty = 0x08 | 0x04 | 0x02;
                if *fin {
                    ty |= 0x01;
                }
                buf.put_u8(ty);
                varint(*stream_id, buf);
                varint(*offset, buf);
                varint(data.len() as u64, buf);
                buf.put_slice(data);
            }
            Frame::MaxData(max) => {
                buf.put_u8(0x10);
                varint(*max, buf);
            }
            Frame::MaxStreamData { stream_id, max } => {
                buf.put_u8(0x11);
                varint(*stream_id, buf);
                varint(*max, buf);
            }
            Frame::MaxStreams { bidi, max } => {
                buf.put_u8(if *bidi { 0x12 } else { 0x13 });
                varint(*max, buf);
            }
            Frame::DataBlocked(limit) => {
                buf.put_u8(0x14);
                varint(*limit, buf);
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                buf.put_u8(0x15);
                varint(*stream_id, buf);
                varint(*limit, buf);
            }
            Frame::StreamsBlocked { bidi, limit } => {
                buf.put_u8(if *bidi { 0x16 } else { 0x17 });
                varint(*limit, buf);
            }
            Frame::NewConnectionId { seq, retire_prior_to, cid, reset_token } => {
                buf.put_u8(0x18);
                varint(*seq, buf);
                varint(*retire_prior_to, buf);
                buf.put_u8(cid.len() as u8);
                buf.put_slice(cid.as_ref());
                buf.put_slice(reset_token);
            }
            Frame::RetireConnectionId { seq } => {
                buf.put_u8(0x19);
                varint(*seq, buf);
            }
            Frame::PathChallenge(data) => {
                buf.put_u8(0x1a);
                buf.put_slice(data);
            }
            Frame::PathResponse(data) => {
                buf.put_u8(0x1b);
                buf.put_slice(data);
            }
            Frame::ConnectionClose { error_code, frame_type, reason } => {
                match frame_type {
                    Some(ft) => {
                        buf.put_u8(0x1c);
                        varint(*error_code, buf);
                        varint(*ft, buf);
                    }
                    None => {
                        buf.put_u8(0x1d);
                        varint(*error_code, buf);
                    }
                }
                varint(reason.len() as u64, buf);
                buf.put_slice(reason);
            }
            Frame::HandshakeDone => buf.put_u8(0x1e),
        }
    }
}

fn varint<B: BufMut>(value: u64, buf: &mut B) {
    // Internal values are always in range; clamp defensively anyway.
    VarInt::new(value.min(VarInt::MAX.value()))
        .unwrap_or(VarInt::MAX)
        .encode(buf)
}

/// Parse every frame in a decrypted packet payload, enforcing epoch
/// admission for the packet type that carried them.
pub fn parse_payload(payload: &[u8], ty: PacketType) -> Result<Vec<Frame>, TransportError> {
    let mut buf = Bytes::copy_from_slice(payload);
    let mut frames = Vec::new();
    if buf.is_empty() {
        return Err(TransportError::ProtocolViolation("empty packet payload"));
    }
    while buf.has_remaining() {
        let frame = Frame::parse(&mut buf)?;
        if !frame.permitted_in(ty) {
            return Err(TransportError::ProtocolViolation("frame not allowed in epoch"));
        }
        frames.push(frame);
    }
    Ok(frames)
}
