//! Transport parameter codec (RFC 9000 §18).
//!
//! Parameters travel inside the TLS `quic_transport_parameters` extension
//! as a sequence of (id, length, value) triples. Unknown ids are skipped;
//! absent parameters take the defaults below.

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;

use crate::error::TransportError;
use crate::packet::ConnectionId;
use crate::varint::{decode_len, VarInt};

mod id {
    pub const ORIGINAL_DESTINATION_CID: u64 = 0x00;
    pub const MAX_IDLE_TIMEOUT: u64 = 0x01;
    pub const STATELESS_RESET_TOKEN: u64 = 0x02;
    pub const MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
    pub const INITIAL_MAX_DATA: u64 = 0x04;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
    pub const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
    pub const INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
    pub const INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
    pub const INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
    pub const ACK_DELAY_EXPONENT: u64 = 0x0a;
    pub const MAX_ACK_DELAY: u64 = 0x0b;
    pub const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
    pub const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;
    pub const INITIAL_SOURCE_CID: u64 = 0x0f;
    pub const RETRY_SOURCE_CID: u64 = 0x10;
}

/// Transport parameters for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub max_idle_timeout_ms: u64,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub ack_delay_exponent: u64,
    pub max_ack_delay_ms: u64,
    pub active_connection_id_limit: u64,
    pub disable_active_migration: bool,
    pub initial_source_cid: Option<ConnectionId>,
    pub original_destination_cid: Option<ConnectionId>,
    pub retry_source_cid: Option<ConnectionId>,
    pub stateless_reset_token: Option<[u8; 16]>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        // RFC 9000 §18.2 defaults for absent parameters.
        TransportParameters {
            max_idle_timeout_ms: 0,
            max_udp_payload_size: 65_527,
            initial_max_data: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: 3,
            max_ack_delay_ms: 25,
            active_connection_id_limit: 2,
            disable_active_migration: false,
            initial_source_cid: None,
            original_destination_cid: None,
            retry_source_cid: None,
            stateless_reset_token: None,
        }
    }
}

impl TransportParameters {
    /// Client-side values advertised by this stack.
    pub fn client_default() -> Self {
        TransportParameters {
            max_idle_timeout_ms: 30_000,
            max_udp_payload_size: 1452,
            initial_max_data: 10 * 1024 * 1024,
            initial_max_stream_data_bidi_local: 1024 * 1024,
            initial_max_stream_data_bidi_remote: 1024 * 1024,
            initial_max_stream_data_uni: 1024 * 1024,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            ..TransportParameters::default()
        }
    }

    /// Serialize for the TLS extension, with one GREASE entry prepended
    /// so peers keep tolerating unknown ids.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(128);

        let grease_id = 0x1b * (u64::from(rand::rng().next_u32() & 0xff) + 1) + 0x1a;
        put_param_bytes(&mut buf, grease_id, &[0xda]);

        put_param_varint(&mut buf, id::MAX_IDLE_TIMEOUT, self.max_idle_timeout_ms);
        put_param_varint(&mut buf, id::MAX_UDP_PAYLOAD_SIZE, self.max_udp_payload_size);
        put_param_varint(&mut buf, id::INITIAL_MAX_DATA, self.initial_max_data);
        put_param_varint(
            &mut buf,
            id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
            self.initial_max_stream_data_bidi_local,
        );
        put_param_varint(
            &mut buf,
            id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
            self.initial_max_stream_data_bidi_remote,
        );
        put_param_varint(
            &mut buf,
            id::INITIAL_MAX_STREAM_DATA_UNI,
            self.initial_max_stream_data_uni,
        );
        put_param_varint(&mut buf, id::INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi);
        put_param_varint(&mut buf, id::INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni);
        put_param_varint(&mut buf, id::ACK_DELAY_EXPONENT, self.ack_delay_exponent);
        put_param_varint(&mut buf, id::MAX_ACK_DELAY, self.max_ack_delay_ms);
        put_param_varint(
            &mut buf,
            id::ACTIVE_CONNECTION_ID_LIMIT,
            self.active_connection_id_limit,
        );
        if self.disable_active_migration {
            put_param_bytes(&mut buf, id::DISABLE_ACTIVE_MIGRATION, &[]);
        }
        if let Some(cid) = &self.initial_source_cid {
            put_param_bytes(&mut buf, id::INITIAL_SOURCE_CID, cid.as_ref());
        }
        buf.to_vec()
    }

    /// Parse a peer's parameter block. Unknown ids are skipped.
    pub fn decode(mut data: &[u8]) -> Result<Self, TransportError> {
        let mut params = TransportParameters::default();
        while data.has_remaining() {
            let param_id = VarInt::decode(&mut data)?.value();
            let len = decode_len(&mut data)?;
            if data.remaining() < len {
                return Err(TransportError::TransportParameter("length out of bounds"));
            }
            let mut value = &data[..len];
            data = &data[len..];

            match param_id {
                id::MAX_IDLE_TIMEOUT => params.max_idle_timeout_ms = varint_value(&mut value)?,
                id::MAX_UDP_PAYLOAD_SIZE => {
                    params.max_udp_payload_size = varint_value(&mut value)?;
                    if params.max_udp_payload_size < 1200 {
                        return Err(TransportError::TransportParameter(
                            "max_udp_payload_size below 1200",
                        ));
                    }
                }
                id::INITIAL_MAX_DATA => params.initial_max_data = varint_value(&mut value)?,
                id::INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = varint_value(&mut value)?
                }
                id::INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = varint_value(&mut value)?
                }
                id::INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = varint_value(&mut value)?
                }
                id::INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = varint_value(&mut value)?
                }
                id::INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = varint_value(&mut value)?
                }
                id::ACK_DELAY_EXPONENT => {
                    params.ack_delay_exponent = varint_value(&mut value)?;
                    if params.ack_delay_exponent > 20 {
                        return Err(TransportError::TransportParameter(
                            "ack_delay_exponent above 20",
                        ));
                    }
                }
                id::MAX_ACK_DELAY => {
                    params.max_ack_delay_ms = varint_value(&mut value)?;
                    if params.max_ack_delay_ms >= 1 << 14 {
                        return Err(TransportError::TransportParameter("max_ack_delay too large"));
                    }
                }
                id::ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = varint_value(&mut value)?;
                    if params.active_connection_id_limit < 2 {
                        return Err(TransportError::TransportParameter(
                            "active_connection_id_limit below 2",
                        ));
                    }
                }
                id::DISABLE_ACTIVE_MIGRATION => params.disable_active_migration = true,
                id::INITIAL_SOURCE_CID => {
                    params.initial_source_cid = ConnectionId::new(value);
                }
                id::ORIGINAL_DESTINATION_CID => {
                    params.original_destination_cid = ConnectionId::new(value);
                }
                id::RETRY_SOURCE_CID => {
                    params.retry_source_cid = ConnectionId::new(value);
                }
                id::STATELESS_RESET_TOKEN => {
                    if value.len() != 16 {
                        return Err(TransportError::TransportParameter(
                            "stateless_reset_token length",
                        ));
                    }
                    let mut token = [0u8; 16];
                    token.copy_from_slice(value);
                    params.stateless_reset_token = Some(token);
                }
                _ => {} // unknown, including GREASE
            }
        }
        Ok(params)
    }
}

fn put_param_varint(buf: &mut BytesMut, param_id: u64, value: u64) {
    VarInt::new(param_id).unwrap_or(VarInt::MAX).encode(buf);
    let v = VarInt::new(value).unwrap_or(VarInt::MAX);
    VarInt::new(v.size() as u64).unwrap_or(VarInt::MAX).encode(buf);
    v.encode(buf);
}

fn put_param_bytes(buf: &mut BytesMut, param_id: u64, value: &[u8]) {
    VarInt::new(param_id).unwrap_or(VarInt::MAX).encode(buf);
    VarInt::new(value.len() as u64).unwrap_or(VarInt::MAX).encode(buf);
    buf.put_slice(value);
}

fn varint_value(value: &mut &[u8]) -> Result<u64, TransportError> {
    VarInt::decode(value).map(VarInt::value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut params = TransportParameters::client_default();
        params.initial_source_cid = ConnectionId::new(&[1, 2, 3, 4]);
        params.disable_active_migration = true;

        let encoded = params.encode();
        let decoded = TransportParameters::decode(&encoded).unwrap();
        assert_eq!(decoded.initial_max_data, params.initial_max_data);
        assert_eq!(decoded.initial_max_streams_bidi, params.initial_max_streams_bidi);
        assert_eq!(decoded.max_idle_timeout_ms, params.max_idle_timeout_ms);
        assert!(decoded.disable_active_migration);
        assert_eq!(
            decoded.initial_source_cid.unwrap().as_ref(),
            &[1, 2, 3, 4]
        );
    }

    #[test]
    fn test_absent_parameters_take_defaults() {
        let decoded = TransportParameters::decode(&[]).unwrap();
        assert_eq!(decoded.ack_delay_exponent, 3);
        assert_eq!(decoded.max_ack_delay_ms, 25);
        assert_eq!(decoded.active_connection_id_limit, 2);
        assert_eq!(decoded.max_udp_payload_size, 65_527);
    }

    #[test]
    fn test_unknown_parameter_skipped() {
        let mut buf = BytesMut::new();
        put_param_bytes(&mut buf, 0x7f_dead, &[1, 2, 3]);
        put_param_varint(&mut buf, id::INITIAL_MAX_DATA, 4096);
        let decoded = TransportParameters::decode(&buf).unwrap();
        assert_eq!(decoded.initial_max_data, 4096);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut buf = BytesMut::new();
        put_param_varint(&mut buf, id::ACK_DELAY_EXPONENT, 21);
        assert!(TransportParameters::decode(&buf).is_err());

        let mut buf = BytesMut::new();
        put_param_varint(&mut buf, id::MAX_UDP_PAYLOAD_SIZE, 1100);
        assert!(TransportParameters::decode(&buf).is_err());
    }

    #[test]
    fn test_truncated_value_rejected() {
        let mut buf = BytesMut::new();
        VarInt::from_u32(0x04).encode(&mut buf);
        VarInt::from_u32(8).encode(&mut buf); // claims 8 bytes
        buf.put_u8(0x01);
        assert!(TransportParameters::decode(&buf).is_err());
    }
}
