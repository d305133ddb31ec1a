//! HTTP/3 frame and stream-type codec (RFC 9114 §6–§7).
//!
//! Frames arrive as a byte stream per QUIC stream, so parsing is
//! incremental: a [`FrameReader`] buffers partial frames across packets.
//! Reserved (GREASE) frame and setting identifiers are skipped on
//! receipt.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use quantum_quic::varint::VarInt;

use crate::error::H3Error;

/// Unidirectional stream roles, the first varint on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Control,
    Push,
    QpackEncoder,
    QpackDecoder,
    /// Reserved or unknown types; the stream is ignored.
    Unknown(u64),
}

impl StreamType {
    pub fn from_value(v: u64) -> StreamType {
        match v {
            0x00 => StreamType::Control,
            0x01 => StreamType::Push,
            0x02 => StreamType::QpackEncoder,
            0x03 => StreamType::QpackDecoder,
            other => StreamType::Unknown(other),
        }
    }

    pub fn value(self) -> u64 {
        match self {
            StreamType::Control => 0x00,
            StreamType::Push => 0x01,
            StreamType::QpackEncoder => 0x02,
            StreamType::QpackDecoder => 0x03,
            StreamType::Unknown(v) => v,
        }
    }
}

/// HTTP/3 SETTINGS of interest to this endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub qpack_max_table_capacity: u64,
    pub qpack_blocked_streams: u64,
    pub max_field_section_size: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            qpack_max_table_capacity: 0,
            qpack_blocked_streams: 0,
            max_field_section_size: None,
        }
    }
}

mod setting_id {
    pub const QPACK_MAX_TABLE_CAPACITY: u64 = 0x01;
    pub const MAX_FIELD_SECTION_SIZE: u64 = 0x06;
    pub const QPACK_BLOCKED_STREAMS: u64 = 0x07;
}

impl Settings {
    /// Values this client advertises.
    pub fn local_default() -> Settings {
        Settings {
            qpack_max_table_capacity: 4096,
            qpack_blocked_streams: 16,
            max_field_section_size: None,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        put_varint(&mut out, setting_id::QPACK_MAX_TABLE_CAPACITY);
        put_varint(&mut out, self.qpack_max_table_capacity);
        put_varint(&mut out, setting_id::QPACK_BLOCKED_STREAMS);
        put_varint(&mut out, self.qpack_blocked_streams);
        if let Some(size) = self.max_field_section_size {
            put_varint(&mut out, setting_id::MAX_FIELD_SECTION_SIZE);
            put_varint(&mut out, size);
        }
        out
    }

    pub fn decode_payload(mut payload: &[u8]) -> Result<Settings, H3Error> {
        let mut settings = Settings::default();
        while payload.has_remaining() {
            let id = read_varint(&mut payload)?;
            let value = read_varint(&mut payload)?;
            match id {
                setting_id::QPACK_MAX_TABLE_CAPACITY => {
                    settings.qpack_max_table_capacity = value
                }
                setting_id::QPACK_BLOCKED_STREAMS => settings.qpack_blocked_streams = value,
                setting_id::MAX_FIELD_SECTION_SIZE => {
                    settings.max_field_section_size = Some(value)
                }
                // HTTP/2-only settings are a connection error here.
                0x02 | 0x03 | 0x04 | 0x05 => {
                    return Err(H3Error::Protocol("reserved http/2 setting"))
                }
                _ => {} // unknown or GREASE
            }
        }
        Ok(settings)
    }
}

/// A parsed HTTP/3 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H3Frame {
    Data(Bytes),
    Headers(Bytes),
    CancelPush(u64),
    Settings(Settings),
    PushPromise { push_id: u64, section: Bytes },
    GoAway(u64),
    MaxPushId(u64),
    /// Reserved/unknown type, skipped by the reader.
    Unknown { frame_type: u64 },
}

mod frame_type {
    pub const DATA: u64 = 0x00;
    pub const HEADERS: u64 = 0x01;
    pub const CANCEL_PUSH: u64 = 0x03;
    pub const SETTINGS: u64 = 0x04;
    pub const PUSH_PROMISE: u64 = 0x05;
    pub const GOAWAY: u64 = 0x07;
    pub const MAX_PUSH_ID: u64 = 0x0d;
}

impl H3Frame {
    /// Serialize with type and length prefix.
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        match self {
            H3Frame::Data(data) => {
                encode_varint(out, frame_type::DATA);
                encode_varint(out, data.len() as u64);
                out.put_slice(data);
            }
            H3Frame::Headers(section) => {
                encode_varint(out, frame_type::HEADERS);
                encode_varint(out, section.len() as u64);
                out.put_slice(section);
            }
            H3Frame::CancelPush(id) => {
                encode_varint(out, frame_type::CANCEL_PUSH);
                encode_varint(out, VarInt::size_of(*id) as u64);
                encode_varint(out, *id);
            }
            H3Frame::Settings(settings) => {
                let payload = settings.encode_payload();
                encode_varint(out, frame_type::SETTINGS);
                encode_varint(out, payload.len() as u64);
                out.put_slice(&payload);
            }
            H3Frame::PushPromise { push_id, section } => {
                encode_varint(out, frame_type::PUSH_PROMISE);
                encode_varint(out, (VarInt::size_of(*push_id) + section.len()) as u64);
                encode_varint(out, *push_id);
                out.put_slice(section);
            }
            H3Frame::GoAway(id) => {
                encode_varint(out, frame_type::GOAWAY);
                encode_varint(out, VarInt::size_of(*id) as u64);
                encode_varint(out, *id);
            }
            H3Frame::MaxPushId(id) => {
                encode_varint(out, frame_type::MAX_PUSH_ID);
                encode_varint(out, VarInt::size_of(*id) as u64);
                encode_varint(out, *id);
            }
            H3Frame::Unknown { frame_type } => {
                encode_varint(out, *frame_type);
                encode_varint(out, 0);
            }
        }
    }
}

/// Incremental frame parser for one stream.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<H3Frame>, H3Error> {
        let mut peek = &self.buf[..];
        let Some(frame_type) = try_varint(&mut peek) else { return Ok(None) };
        let Some(len) = try_varint(&mut peek) else { return Ok(None) };
        let len = usize::try_from(len).map_err(|_| H3Error::Frame("frame length"))?;
        if peek.remaining() < len {
            return Ok(None);
        }
        let header_len = self.buf.len() - peek.remaining();
        self.buf.advance(header_len);
        let payload = self.buf.split_to(len).freeze();

        let frame = match frame_type {
            frame_type::DATA => H3Frame::Data(payload),
            frame_type::HEADERS => H3Frame::Headers(payload),
            frame_type::CANCEL_PUSH => {
                H3Frame::CancelPush(read_varint(&mut payload.as_ref())?)
            }
            frame_type::SETTINGS => H3Frame::Settings(Settings::decode_payload(&payload)?),
            frame_type::PUSH_PROMISE => {
                let mut p = payload.as_ref();
                let push_id = read_varint(&mut p)?;
                H3Frame::PushPromise { push_id, section: Bytes::copy_from_slice(p) }
            }
            frame_type::GOAWAY => H3Frame::GoAway(read_varint(&mut payload.as_ref())?),
            frame_type::MAX_PUSH_ID => H3Frame::MaxPushId(read_varint(&mut payload.as_ref())?),
            other => {
                // HTTP/2-era frame types must not appear in HTTP/3.
                if matches!(other, 0x02 | 0x06 | 0x08 | 0x09) {
                    return Err(H3Error::FrameUnexpected("http/2 frame type"));
                }
                H3Frame::Unknown { frame_type: other }
            }
        };
        Ok(Some(frame))
    }
}

fn encode_varint<B: BufMut>(out: &mut B, value: u64) {
    VarInt::new(value.min(VarInt::MAX.value()))
        .unwrap_or(VarInt::MAX)
        .encode(out)
}

fn put_varint(out: &mut Vec<u8>, value: u64) {
    encode_varint(out, value)
}

fn read_varint(buf: &mut &[u8]) -> Result<u64, H3Error> {
    VarInt::decode(buf)
        .map(VarInt::value)
        .map_err(|_| H3Error::Frame("truncated varint"))
}

fn try_varint(buf: &mut &[u8]) -> Option<u64> {
    VarInt::decode(buf).map(VarInt::value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn feed(reader: &mut FrameReader, frame: &H3Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        reader.push(&buf);
    }

    #[test]
    fn test_frame_round_trip() {
        let frames = vec![
            H3Frame::Data(Bytes::from_static(b"hello")),
            H3Frame::Headers(Bytes::from_static(&[0, 0, 0xc0 | 17])),
            H3Frame::CancelPush(3),
            H3Frame::Settings(Settings::local_default()),
            H3Frame::GoAway(8),
            H3Frame::MaxPushId(100),
        ];
        let mut reader = FrameReader::default();
        for frame in &frames {
            feed(&mut reader, frame);
        }
        for expected in &frames {
            let got = reader.next_frame().unwrap().expect("frame ready");
            assert_eq!(&got, expected);
        }
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_incremental_parse_across_boundaries() {
        let mut buf = BytesMut::new();
        H3Frame::Data(Bytes::from_static(b"0123456789")).encode(&mut buf);

        let mut reader = FrameReader::default();
        for chunk in buf.chunks(3) {
            if reader.next_frame().unwrap().is_some() {
                panic!("frame completed early");
            }
            reader.push(chunk);
        }
        match reader.next_frame().unwrap() {
            Some(H3Frame::Data(data)) => assert_eq!(data.as_ref(), b"0123456789"),
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_frame_skipped_with_payload() {
        // GREASE type 0x21 with 4 payload bytes.
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, 0x21);
        encode_varint(&mut buf, 4);
        buf.put_slice(&[1, 2, 3, 4]);
        H3Frame::GoAway(1).encode(&mut buf);

        let mut reader = FrameReader::default();
        reader.push(&buf);
        assert!(matches!(
            reader.next_frame().unwrap(),
            Some(H3Frame::Unknown { frame_type: 0x21 })
        ));
        assert_eq!(reader.next_frame().unwrap(), Some(H3Frame::GoAway(1)));
    }

    #[test]
    fn test_http2_frame_types_rejected() {
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, 0x06); // PING in HTTP/2
        encode_varint(&mut buf, 0);
        let mut reader = FrameReader::default();
        reader.push(&buf);
        assert!(matches!(
            reader.next_frame(),
            Err(H3Error::FrameUnexpected(_))
        ));
    }

    #[test]
    fn test_settings_round_trip_and_reserved() {
        let settings = Settings {
            qpack_max_table_capacity: 4096,
            qpack_blocked_streams: 16,
            max_field_section_size: Some(65_536),
        };
        let payload = settings.encode_payload();
        assert_eq!(Settings::decode_payload(&payload).unwrap(), settings);

        // HTTP/2 SETTINGS_ENABLE_PUSH is forbidden.
        let mut bad = Vec::new();
        put_varint(&mut bad, 0x02);
        put_varint(&mut bad, 1);
        assert!(Settings::decode_payload(&bad).is_err());
    }

    #[test]
    fn test_stream_type_mapping() {
        assert_eq!(StreamType::from_value(0), StreamType::Control);
        assert_eq!(StreamType::from_value(2), StreamType::QpackEncoder);
        assert_eq!(StreamType::from_value(3), StreamType::QpackDecoder);
        assert_eq!(StreamType::from_value(0x21), StreamType::Unknown(0x21));
    }
}
