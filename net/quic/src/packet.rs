//! Packet codec (RFC 9000 §17, RFC 9001 §5.4).
//!
//! Parses long and short headers, removes/applies header protection, seals
//! and opens the protected region, and walks coalesced packets inside a UDP
//! datagram. All functions operate on plain byte slices so the connection
//! can drive them without touching the socket.

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;

use crate::crypto::{DirectionalKeys, SAMPLE_LEN, TAG_LEN};
use crate::error::TransportError;
use crate::varint::{decode_len, VarInt};
use crate::QUIC_VERSION;

/// Maximum connection ID length admitted by QUIC v1.
pub const MAX_CID_LEN: usize = 20;

/// A connection ID of up to 20 bytes, stored inline.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_LEN],
}

impl ConnectionId {
    /// Wrap an existing CID. Returns `None` above 20 bytes.
    pub fn new(data: &[u8]) -> Option<Self> {
        if data.len() > MAX_CID_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_CID_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Some(ConnectionId { len: data.len() as u8, bytes })
    }

    /// Generate a random CID of the given length.
    pub fn random(len: usize) -> Self {
        let len = len.min(MAX_CID_LEN);
        let mut bytes = [0u8; MAX_CID_LEN];
        rand::rng().fill_bytes(&mut bytes[..len]);
        ConnectionId { len: len as u8, bytes }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for ConnectionId {
    fn as_ref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.as_ref() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Cryptographic epoch, doubling as the packet-number space.
///
/// 0-RTT packets use their own keys but share the Application space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Epoch {
    Initial = 0,
    Handshake = 1,
    Application = 2,
}

impl Epoch {
    pub const COUNT: usize = 3;

    pub fn iter() -> impl Iterator<Item = Epoch> {
        [Epoch::Initial, Epoch::Handshake, Epoch::Application].into_iter()
    }
}

/// Wire packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    VersionNegotiation,
    OneRtt,
}

impl PacketType {
    /// Packet-number space this type belongs to.
    pub fn epoch(self) -> Option<Epoch> {
        match self {
            PacketType::Initial => Some(Epoch::Initial),
            PacketType::Handshake => Some(Epoch::Handshake),
            PacketType::ZeroRtt | PacketType::OneRtt => Some(Epoch::Application),
            PacketType::Retry | PacketType::VersionNegotiation => None,
        }
    }

    fn long_type_bits(self) -> u8 {
        match self {
            PacketType::Initial => 0b00,
            PacketType::ZeroRtt => 0b01,
            PacketType::Handshake => 0b10,
            PacketType::Retry => 0b11,
            _ => 0,
        }
    }
}

/// Header fields recovered before header-protection removal.
#[derive(Debug, Clone)]
pub struct PacketHeader {
    pub ty: PacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: Option<ConnectionId>,
    /// Initial packets only.
    pub token: Vec<u8>,
    /// Version Negotiation packets only.
    pub supported_versions: Vec<u32>,
}

/// One packet located inside a datagram, still protected.
#[derive(Debug)]
pub struct ParsedPacket {
    pub header: PacketHeader,
    /// Offset of the (protected) packet number from the datagram start.
    pub pn_offset: usize,
    /// Total bytes of this packet within the datagram.
    pub packet_len: usize,
    /// For Retry: token. For Retry the integrity tag is still attached at
    /// the end of `packet_len`.
    pub retry_token: Vec<u8>,
}

/// Parse the first packet's header inside `datagram[offset..]`.
///
/// `local_cid_len` is the length this endpoint chose for CIDs the peer
/// addresses it with; short headers carry no length byte.
pub fn parse_header(
    datagram: &[u8],
    offset: usize,
    local_cid_len: usize,
) -> Result<ParsedPacket, TransportError> {
    let buf = &datagram[offset..];
    if buf.is_empty() {
        return Err(TransportError::InsufficientData);
    }
    let first = buf[0];

    if first & 0x80 == 0 {
        // Short header: fixed bit, spin, reserved, key phase, pn length.
        if first & 0x40 == 0 {
            return Err(TransportError::MalformedPacket("fixed bit not set"));
        }
        if buf.len() < 1 + local_cid_len + 1 + TAG_LEN {
            return Err(TransportError::MalformedPacket("short header truncated"));
        }
        let dcid = ConnectionId::new(&buf[1..1 + local_cid_len])
            .ok_or(TransportError::MalformedPacket("dcid too long"))?;
        return Ok(ParsedPacket {
            header: PacketHeader {
                ty: PacketType::OneRtt,
                version: QUIC_VERSION,
                dcid,
                scid: None,
                token: Vec::new(),
                supported_versions: Vec::new(),
            },
            pn_offset: offset + 1 + local_cid_len,
            packet_len: buf.len(),
            retry_token: Vec::new(),
        });
    }

    // Long header.
    let mut cursor = &buf[1..];
    if cursor.remaining() < 4 {
        return Err(TransportError::MalformedPacket("missing version"));
    }
    let version = cursor.get_u32();

    let dcid_len = cursor
        .try_get_u8()
        .map_err(|_| TransportError::MalformedPacket("missing dcid length"))? as usize;
    if dcid_len > MAX_CID_LEN || cursor.remaining() < dcid_len {
        return Err(TransportError::MalformedPacket("bad dcid"));
    }
    let dcid = ConnectionId::new(&cursor.chunk()[..dcid_len])
        .ok_or(TransportError::MalformedPacket("bad dcid"))?;
    cursor.advance(dcid_len);

    let scid_len = cursor
        .try_get_u8()
        .map_err(|_| TransportError::MalformedPacket("missing scid length"))? as usize;
    if scid_len > MAX_CID_LEN || cursor.remaining() < scid_len {
        return Err(TransportError::MalformedPacket("bad scid"));
    }
    let scid = ConnectionId::new(&cursor.chunk()[..scid_len])
        .ok_or(TransportError::MalformedPacket("bad scid"))?;
    cursor.advance(scid_len);

    if version == 0 {
        // Version Negotiation: remainder is a list of supported versions.
        let mut versions = Vec::new();
        while cursor.remaining() >= 4 {
            versions.push(cursor.get_u32());
        }
        return Ok(ParsedPacket {
            header: PacketHeader {
                ty: PacketType::VersionNegotiation,
                version,
                dcid,
                scid: Some(scid),
                token: Vec::new(),
                supported_versions: versions,
            },
            pn_offset: 0,
            packet_len: buf.len(),
            retry_token: Vec::new(),
        });
    }

    if first & 0x40 == 0 {
        return Err(TransportError::MalformedPacket("fixed bit not set"));
    }

    let ty = match (first >> 4) & 0x03 {
        0b00 => PacketType::Initial,
        0b01 => PacketType::ZeroRtt,
        0b10 => PacketType::Handshake,
        _ => PacketType::Retry,
    };

    if ty == PacketType::Retry {
        // Token runs to the end minus the 16-byte integrity tag.
        if cursor.remaining() < TAG_LEN {
            return Err(TransportError::MalformedPacket("retry truncated"));
        }
        let token = cursor.chunk()[..cursor.remaining() - TAG_LEN].to_vec();
        return Ok(ParsedPacket {
            header: PacketHeader {
                ty,
                version,
                dcid,
                scid: Some(scid),
                token: Vec::new(),
                supported_versions: Vec::new(),
            },
            pn_offset: 0,
            packet_len: buf.len(),
            retry_token: token,
        });
    }

    let mut token = Vec::new();
    if ty == PacketType::Initial {
        let token_len = decode_len(&mut cursor)?;
        if cursor.remaining() < token_len {
            return Err(TransportError::MalformedPacket("token truncated"));
        }
        token = cursor.chunk()[..token_len].to_vec();
        cursor.advance(token_len);
    }

    let length = decode_len(&mut cursor)?;
    let pn_offset = buf.len() - cursor.remaining();
    let packet_len = pn_offset + length;
    if packet_len > buf.len() || length < 4 + TAG_LEN {
        return Err(TransportError::MalformedPacket("length field out of bounds"));
    }

    Ok(ParsedPacket {
        header: PacketHeader {
            ty,
            version,
            dcid,
            scid: Some(scid),
            token,
            supported_versions: Vec::new(),
        },
        pn_offset: offset + pn_offset,
        packet_len,
        retry_token: Vec::new(),
    })
}

/// A decrypted packet ready for frame processing.
#[derive(Debug)]
pub struct PlainPacket {
    pub ty: PacketType,
    pub packet_number: u64,
    pub key_phase: bool,
    pub payload: Vec<u8>,
}

/// Remove header protection and open the AEAD for a parsed packet.
///
/// The datagram is not modified, so a failed attempt can be retried with
/// different keys (key update). `largest_pn` is the largest packet number
/// received so far in this packet's space.
pub fn decrypt_packet(
    keys: &DirectionalKeys,
    parsed: &ParsedPacket,
    datagram: &[u8],
    packet_start: usize,
    largest_pn: Option<u64>,
) -> Result<PlainPacket, TransportError> {
    let pn_offset = parsed.pn_offset;
    let packet_end = packet_start + parsed.packet_len;

    if datagram.len() < pn_offset + 4 + SAMPLE_LEN || packet_end > datagram.len() {
        return Err(TransportError::MalformedPacket("packet too short to sample"));
    }
    let sample_start = pn_offset + 4;
    let mask = keys
        .hp_mask(&datagram[sample_start..sample_start + SAMPLE_LEN])
        .map_err(|_| TransportError::HeaderProtectionFailure)?;

    let is_long = datagram[packet_start] & 0x80 != 0;
    let first = if is_long {
        datagram[packet_start] ^ (mask[0] & 0x0f)
    } else {
        datagram[packet_start] ^ (mask[0] & 0x1f)
    };
    let pn_len = (first & 0x03) as usize + 1;

    // Unprotected header copy forms the AEAD associated data.
    let mut header = datagram[packet_start..pn_offset + pn_len].to_vec();
    header[0] = first;
    let mut truncated_pn: u64 = 0;
    for i in 0..pn_len {
        let b = datagram[pn_offset + i] ^ mask[1 + i];
        header[pn_offset - packet_start + i] = b;
        truncated_pn = (truncated_pn << 8) | u64::from(b);
    }

    let packet_number = expand_packet_number(truncated_pn, pn_len * 8, largest_pn);

    let ciphertext = &datagram[pn_offset + pn_len..packet_end];
    let payload = keys.open(packet_number, &header, ciphertext)?;

    // Reserved bits must be zero once unprotected.
    let reserved = if is_long { first & 0x0c } else { first & 0x18 };
    if reserved != 0 {
        return Err(TransportError::ProtocolViolation("reserved bits set"));
    }

    Ok(PlainPacket {
        ty: parsed.header.ty,
        packet_number,
        key_phase: !is_long && (first & 0x04) != 0,
        payload,
    })
}

/// Expand a truncated packet number (RFC 9000 §A.3).
pub fn expand_packet_number(truncated: u64, bits: usize, largest: Option<u64>) -> u64 {
    let expected = match largest {
        Some(l) => l + 1,
        None => return truncated,
    };
    let win = 1u64 << bits;
    let hwin = win / 2;
    let mask = win - 1;
    let candidate = (expected & !mask) | truncated;
    if candidate + hwin <= expected && candidate + win < (1 << 62) {
        candidate + win
    } else if candidate > expected + hwin && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

/// Pick the shortest packet-number encoding that is unambiguous given the
/// largest acknowledged number (RFC 9000 §A.2).
pub fn packet_number_len(pn: u64, largest_acked: Option<u64>) -> usize {
    let unacked = match largest_acked {
        Some(l) => pn - l,
        None => pn + 1,
    };
    let range = 2 * unacked + 1;
    if range < (1 << 8) {
        1
    } else if range < (1 << 16) {
        2
    } else if range < (1 << 24) {
        3
    } else {
        4
    }
}

/// Assemble and protect a single packet.
///
/// `payload` carries the serialized frames; it is padded with PADDING so
/// that at least 4 bytes of packet number plus payload exist to sample
/// against, and the caller may request a larger `min_total` (client
/// Initials pad the datagram to 1200 bytes).
pub struct PacketBuilder<'a> {
    pub ty: PacketType,
    pub dcid: ConnectionId,
    pub scid: ConnectionId,
    pub token: &'a [u8],
    pub packet_number: u64,
    pub largest_acked: Option<u64>,
    pub key_phase: bool,
}

impl PacketBuilder<'_> {
    /// Serialize, seal, and header-protect into `out`; returns bytes written.
    pub fn finish(
        &self,
        keys: &DirectionalKeys,
        mut payload: Vec<u8>,
        min_total: usize,
        out: &mut BytesMut,
    ) -> Result<usize, TransportError> {
        let start = out.len();
        let pn_len = packet_number_len(self.packet_number, self.largest_acked);

        // The sample taken at pn_offset + 4 must be inside the ciphertext.
        let min_payload = 4 - pn_len + SAMPLE_LEN.saturating_sub(TAG_LEN);
        if payload.len() < min_payload {
            payload.resize(min_payload, 0);
        }

        match self.ty {
            PacketType::OneRtt => {
                let mut first = 0x40 | ((pn_len - 1) as u8);
                if self.key_phase {
                    first |= 0x04;
                }
                out.put_u8(first);
                out.put_slice(self.dcid.as_ref());
            }
            PacketType::Initial | PacketType::Handshake | PacketType::ZeroRtt => {
                let first =
                    0xc0 | (self.ty.long_type_bits() << 4) | ((pn_len - 1) as u8);
                out.put_u8(first);
                out.put_u32(QUIC_VERSION);
                out.put_u8(self.dcid.len() as u8);
                out.put_slice(self.dcid.as_ref());
                out.put_u8(self.scid.len() as u8);
                out.put_slice(self.scid.as_ref());
                if self.ty == PacketType::Initial {
                    VarInt::new(self.token.len() as u64)?.encode(out);
                    out.put_slice(self.token);
                }
            }
            _ => return Err(TransportError::Internal("cannot build this packet type")),
        }

        // Pad the payload so the whole packet reaches min_total.
        if self.ty != PacketType::OneRtt {
            // The Length field is always written as a 2-byte varint: packets
            // never exceed the UDP MTU, and a fixed width keeps padding math
            // exact (longer-than-minimal varints are valid per RFC 9000 §16).
            let header_len = out.len() - start;
            let total = header_len + 2 + pn_len + payload.len() + TAG_LEN;
            if total < min_total {
                payload.resize(payload.len() + (min_total - total), 0);
            }
            let length = (pn_len + payload.len() + TAG_LEN) as u64;
            if length > 0x3fff {
                return Err(TransportError::Internal("packet exceeds length prefix"));
            }
            out.put_u16(length as u16 | 0x4000);
        } else {
            let header_len = out.len() - start;
            let total = header_len + pn_len + payload.len() + TAG_LEN;
            if total < min_total {
                payload.resize(payload.len() + (min_total - total), 0);
            }
        }

        let pn_offset = out.len();
        let pn_bytes = self.packet_number.to_be_bytes();
        out.put_slice(&pn_bytes[8 - pn_len..]);

        let header: Vec<u8> = out[start..].to_vec();
        let sealed = keys.seal(self.packet_number, &header, &payload);
        out.put_slice(&sealed);

        // Header protection over the finished packet.
        let sample_start = pn_offset + 4;
        let sample: [u8; SAMPLE_LEN] = out[sample_start..sample_start + SAMPLE_LEN]
            .try_into()
            .map_err(|_| TransportError::Internal("sample out of range"))?;
        let mask = keys.hp_mask(&sample)?;
        if self.ty == PacketType::OneRtt {
            out[start] ^= mask[0] & 0x1f;
        } else {
            out[start] ^= mask[0] & 0x0f;
        }
        for i in 0..pn_len {
            out[pn_offset + i] ^= mask[1 + i];
        }

        Ok(out.len() - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PacketKeys;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::new(bytes).unwrap()
    }

    #[test]
    fn test_expand_packet_number_rfc_example() {
        // RFC 9000 A.3: expected 0xa82f9b32, truncated 0x9b32 (16 bits),
        // largest received 0xa82f30ea.
        assert_eq!(
            expand_packet_number(0x9b32, 16, Some(0xa82f_30ea)),
            0xa82f_9b32
        );
    }

    #[test]
    fn test_packet_number_len_grows_with_distance() {
        assert_eq!(packet_number_len(0, None), 1);
        assert_eq!(packet_number_len(0xff, Some(0)), 2);
        assert_eq!(packet_number_len(0xffff, Some(0)), 3);
        assert_eq!(packet_number_len(0xffffff, Some(0)), 4);
    }

    #[test]
    fn test_initial_round_trip() {
        let dcid = cid(&[0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08]);
        let scid = cid(&[1, 2, 3, 4]);
        let client_keys = PacketKeys::initial(dcid.as_ref(), true);
        let server_keys = PacketKeys::initial(dcid.as_ref(), false);

        let payload = vec![0x01, 0x00, 0x00, 0x00, 0x00, 0x00]; // PING + padding
        let builder = PacketBuilder {
            ty: PacketType::Initial,
            dcid,
            scid,
            token: &[],
            packet_number: 0,
            largest_acked: None,
            key_phase: false,
        };
        let mut out = BytesMut::new();
        let written = builder
            .finish(&client_keys.local, payload.clone(), 1200, &mut out)
            .unwrap();
        assert_eq!(written, 1200);

        let mut datagram = out.to_vec();
        let parsed = parse_header(&datagram, 0, 0).unwrap();
        assert_eq!(parsed.header.ty, PacketType::Initial);
        assert_eq!(parsed.header.dcid.as_ref(), dcid.as_ref());
        assert_eq!(parsed.packet_len, 1200);

        let plain =
            decrypt_packet(&server_keys.remote, &parsed, &datagram, 0, None).unwrap();
        assert_eq!(plain.packet_number, 0);
        assert_eq!(&plain.payload[..payload.len()], &payload[..]);
    }

    #[test]
    fn test_short_header_round_trip() {
        let dcid = cid(&[9, 9, 9, 9, 9, 9, 9, 9]);
        let keys = PacketKeys::initial(dcid.as_ref(), true);

        let builder = PacketBuilder {
            ty: PacketType::OneRtt,
            dcid,
            scid: cid(&[]),
            token: &[],
            packet_number: 42,
            largest_acked: Some(40),
            key_phase: true,
        };
        let mut out = BytesMut::new();
        builder
            .finish(&keys.local, vec![0x01; 32], 0, &mut out)
            .unwrap();

        let mut datagram = out.to_vec();
        let parsed = parse_header(&datagram, 0, dcid.len()).unwrap();
        assert_eq!(parsed.header.ty, PacketType::OneRtt);

        let server = PacketKeys::initial(dcid.as_ref(), false);
        let plain =
            decrypt_packet(&server.remote, &parsed, &datagram, 0, Some(41)).unwrap();
        assert_eq!(plain.packet_number, 42);
        assert!(plain.key_phase);
    }

    #[test]
    fn test_coalesced_packets_split_on_length() {
        let dcid = cid(&[7; 8]);
        let keys = PacketKeys::initial(dcid.as_ref(), true);
        let mut out = BytesMut::new();

        for pn in 0..2u64 {
            let builder = PacketBuilder {
                ty: PacketType::Handshake,
                dcid,
                scid: cid(&[1]),
                token: &[],
                packet_number: pn,
                largest_acked: None,
                key_phase: false,
            };
            builder.finish(&keys.local, vec![0x01], 0, &mut out).unwrap();
        }

        let datagram = out.to_vec();
        let first = parse_header(&datagram, 0, 0).unwrap();
        assert!(first.packet_len < datagram.len());
        let second = parse_header(&datagram, first.packet_len, 0).unwrap();
        assert_eq!(first.packet_len + second.packet_len, datagram.len());
    }

    #[test]
    fn test_version_negotiation_parse() {
        let mut vn = vec![0x80, 0, 0, 0, 0];
        vn.push(4);
        vn.extend_from_slice(&[1, 2, 3, 4]); // dcid
        vn.push(0); // scid len
        vn.extend_from_slice(&QUIC_VERSION.to_be_bytes());
        vn.extend_from_slice(&0xff00_001du32.to_be_bytes());

        let parsed = parse_header(&vn, 0, 0).unwrap();
        assert_eq!(parsed.header.ty, PacketType::VersionNegotiation);
        assert_eq!(parsed.header.supported_versions, vec![1, 0xff00_001d]);
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        // Fixed bit clear.
        assert!(parse_header(&[0x00; 32], 0, 8).is_err());
        // Oversized DCID length.
        let mut bad = vec![0xc3, 0, 0, 0, 1, 21];
        bad.extend_from_slice(&[0u8; 64]);
        assert!(matches!(
            parse_header(&bad, 0, 0),
            Err(TransportError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_tampered_packet_fails_aead() {
        let dcid = cid(&[5; 8]);
        let keys = PacketKeys::initial(dcid.as_ref(), true);
        let builder = PacketBuilder {
            ty: PacketType::Initial,
            dcid,
            scid: cid(&[1]),
            token: &[],
            packet_number: 3,
            largest_acked: None,
            key_phase: false,
        };
        let mut out = BytesMut::new();
        builder.finish(&keys.local, vec![0x01; 16], 0, &mut out).unwrap();
        let mut datagram = out.to_vec();
        let last = datagram.len() - 1;
        datagram[last] ^= 0xff;

        let parsed = parse_header(&datagram, 0, 0).unwrap();
        let server = PacketKeys::initial(dcid.as_ref(), false);
        assert_eq!(
            decrypt_packet(&server.remote, &parsed, &datagram, 0, None).unwrap_err(),
            TransportError::AeadFailure
        );
    }
}
