//! Transport error taxonomy.
//!
//! Splits RFC 9000 §20 error codes (what goes on the wire in
//! CONNECTION_CLOSE) from the richer local [`TransportError`] values used
//! inside the stack. Fatal errors close the connection; per-stream errors
//! reset a single stream and leave the connection intact.

use thiserror::Error;

/// RFC 9000 §20.1 transport error codes.
pub mod code {
    pub const NO_ERROR: u64 = 0x00;
    pub const INTERNAL_ERROR: u64 = 0x01;
    pub const CONNECTION_REFUSED: u64 = 0x02;
    pub const FLOW_CONTROL_ERROR: u64 = 0x03;
    pub const STREAM_LIMIT_ERROR: u64 = 0x04;
    pub const STREAM_STATE_ERROR: u64 = 0x05;
    pub const FINAL_SIZE_ERROR: u64 = 0x06;
    pub const FRAME_ENCODING_ERROR: u64 = 0x07;
    pub const TRANSPORT_PARAMETER_ERROR: u64 = 0x08;
    pub const CONNECTION_ID_LIMIT_ERROR: u64 = 0x09;
    pub const PROTOCOL_VIOLATION: u64 = 0x0a;
    pub const INVALID_TOKEN: u64 = 0x0b;
    pub const APPLICATION_ERROR: u64 = 0x0c;
    pub const CRYPTO_BUFFER_EXCEEDED: u64 = 0x0d;
    pub const KEY_UPDATE_ERROR: u64 = 0x0e;
    pub const AEAD_LIMIT_REACHED: u64 = 0x0f;
    pub const NO_VIABLE_PATH: u64 = 0x10;
    /// Base for TLS alert passthrough (CRYPTO_ERROR range 0x0100..0x01ff).
    pub const CRYPTO_ERROR: u64 = 0x0100;
}

/// Errors raised by the transport machinery.
///
/// Variants that map onto an RFC 9000 error code report it via
/// [`TransportError::wire_code`]; those are the ones that terminate the
/// connection with a CONNECTION_CLOSE frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// A decoder ran out of bytes mid-field.
    #[error("insufficient data")]
    InsufficientData,

    /// Value does not fit in a variable-length integer.
    #[error("value {0} exceeds the varint range")]
    VarIntRange(u64),

    /// Packet failed structural parsing.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    /// Header protection could not be removed.
    #[error("header protection failure")]
    HeaderProtectionFailure,

    /// AEAD open failed. Isolated occurrences are dropped silently.
    #[error("AEAD authentication failure")]
    AeadFailure,

    /// The peer answered with a Version Negotiation packet.
    #[error("peer requested version negotiation")]
    VersionNegotiation(Vec<u32>),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("frame encoding error: {0}")]
    FrameEncoding(&'static str),

    #[error("flow control violated: {0}")]
    FlowControl(&'static str),

    #[error("final stream size violated")]
    FinalSize,

    #[error("stream state error: {0}")]
    StreamState(&'static str),

    #[error("stream limit exceeded")]
    StreamLimit,

    #[error("connection id limit exceeded")]
    ConnectionIdLimit,

    #[error("transport parameter error: {0}")]
    TransportParameter(&'static str),

    /// TLS failure carrying the alert offset into the CRYPTO_ERROR range.
    #[error("crypto error, alert {0:#x}")]
    Crypto(u64),

    #[error("certificate verification failed: {0}")]
    CertificateVerification(String),

    /// Handshake retransmission budget exhausted.
    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("idle timeout")]
    IdleTimeout,

    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl TransportError {
    /// RFC 9000 error code carried in CONNECTION_CLOSE for this error.
    pub fn wire_code(&self) -> u64 {
        match self {
            TransportError::MalformedPacket(_) | TransportError::ProtocolViolation(_) => {
                code::PROTOCOL_VIOLATION
            }
            TransportError::FrameEncoding(_)
            | TransportError::InsufficientData
            | TransportError::VarIntRange(_) => code::FRAME_ENCODING_ERROR,
            TransportError::FlowControl(_) => code::FLOW_CONTROL_ERROR,
            TransportError::FinalSize => code::FINAL_SIZE_ERROR,
            TransportError::StreamState(_) => code::STREAM_STATE_ERROR,
            TransportError::StreamLimit => code::STREAM_LIMIT_ERROR,
            TransportError::ConnectionIdLimit => code::CONNECTION_ID_LIMIT_ERROR,
            TransportError::TransportParameter(_) => code::TRANSPORT_PARAMETER_ERROR,
            TransportError::Crypto(alert) => code::CRYPTO_ERROR + (alert & 0xff),
            TransportError::CertificateVerification(_) => {
                // bad_certificate(42) in the CRYPTO_ERROR range
                code::CRYPTO_ERROR + 42
            }
            _ => code::INTERNAL_ERROR,
        }
    }

    /// Whether this error tears down the whole connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::AeadFailure | TransportError::InsufficientData
        )
    }
}

/// Terminal condition of a connection, reported to every caller that still
/// has streams or pending opens on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// We closed due to a local transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The peer sent CONNECTION_CLOSE (transport frame 0x1c).
    #[error("closed by peer: code {code:#x}, reason {reason:?}")]
    PeerClosed { code: u64, reason: String },

    /// The peer sent CONNECTION_CLOSE (application frame 0x1d).
    #[error("closed by application: code {code:#x}, reason {reason:?}")]
    ApplicationClosed { code: u64, reason: String },

    /// Closed locally by the application.
    #[error("locally closed")]
    LocallyClosed,
}

impl ConnectionError {
    /// True when the close was clean (NO_ERROR or local shutdown).
    pub fn is_clean(&self) -> bool {
        match self {
            ConnectionError::LocallyClosed => true,
            ConnectionError::PeerClosed { code, .. } => *code == code::NO_ERROR,
            ConnectionError::ApplicationClosed { .. } => true,
            ConnectionError::Transport(e) => matches!(e, TransportError::IdleTimeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(
            TransportError::ProtocolViolation("x").wire_code(),
            code::PROTOCOL_VIOLATION
        );
        assert_eq!(TransportError::FinalSize.wire_code(), code::FINAL_SIZE_ERROR);
        assert_eq!(TransportError::StreamLimit.wire_code(), code::STREAM_LIMIT_ERROR);
        assert_eq!(TransportError::Crypto(0x28).wire_code(), 0x0128);
    }

    #[test]
    fn test_aead_failure_not_fatal() {
        assert!(!TransportError::AeadFailure.is_fatal());
        assert!(TransportError::FinalSize.is_fatal());
    }

    #[test]
    fn test_clean_close() {
        assert!(ConnectionError::LocallyClosed.is_clean());
        assert!(ConnectionError::PeerClosed { code: 0, reason: String::new() }.is_clean());
        assert!(!ConnectionError::PeerClosed { code: 0x0a, reason: String::new() }.is_clean());
    }
}
