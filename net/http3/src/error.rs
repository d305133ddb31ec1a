//! HTTP/3 and QPACK error codes (RFC 9114 §8.1, RFC 9204 §6).

use thiserror::Error;

/// Application error codes carried in RESET_STREAM / CONNECTION_CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum H3ErrorCode {
    NoError = 0x0100,
    GeneralProtocolError = 0x0101,
    InternalError = 0x0102,
    StreamCreationError = 0x0103,
    ClosedCriticalStream = 0x0104,
    FrameUnexpected = 0x0105,
    FrameError = 0x0106,
    ExcessiveLoad = 0x0107,
    IdError = 0x0108,
    SettingsError = 0x0109,
    MissingSettings = 0x010a,
    RequestRejected = 0x010b,
    RequestCancelled = 0x010c,
    RequestIncomplete = 0x010d,
    MessageError = 0x010e,
    ConnectError = 0x010f,
    VersionFallback = 0x0110,
    QpackDecompressionFailed = 0x0200,
    QpackEncoderStreamError = 0x0201,
    QpackDecoderStreamError = 0x0202,
}

impl H3ErrorCode {
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// HTTP/3 layer failures. Connection-fatal variants tear down every
/// request on the connection; stream-scoped ones reset a single stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum H3Error {
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("unexpected frame on this stream: {0}")]
    FrameUnexpected(&'static str),

    #[error("first control frame was not SETTINGS")]
    MissingSettings,

    #[error("critical stream closed")]
    ClosedCriticalStream,

    #[error("frame could not be parsed: {0}")]
    Frame(&'static str),

    #[error("QPACK decompression failed: {0}")]
    QpackDecompression(&'static str),

    #[error("QPACK encoder stream error: {0}")]
    QpackEncoderStream(&'static str),

    #[error("QPACK decoder stream error: {0}")]
    QpackDecoderStream(&'static str),

    #[error("header block invalid: {0}")]
    Message(&'static str),

    #[error("transport failed: {0}")]
    Transport(#[from] quantum_quic::TransportError),

    #[error("connection lost: {0}")]
    Connection(#[from] quantum_quic::ConnectionError),

    #[error("stream reset by peer with code {0:#x}")]
    StreamReset(u64),

    #[error("connection is shutting down (GOAWAY)")]
    GoingAway,
}

impl H3Error {
    /// The wire code to use when this error closes the connection or
    /// resets a stream.
    pub fn code(&self) -> H3ErrorCode {
        match self {
            H3Error::Protocol(_) => H3ErrorCode::GeneralProtocolError,
            H3Error::FrameUnexpected(_) => H3ErrorCode::FrameUnexpected,
            H3Error::MissingSettings => H3ErrorCode::MissingSettings,
            H3Error::ClosedCriticalStream => H3ErrorCode::ClosedCriticalStream,
            H3Error::Frame(_) => H3ErrorCode::FrameError,
            H3Error::QpackDecompression(_) => H3ErrorCode::QpackDecompressionFailed,
            H3Error::QpackEncoderStream(_) => H3ErrorCode::QpackEncoderStreamError,
            H3Error::QpackDecoderStream(_) => H3ErrorCode::QpackDecoderStreamError,
            H3Error::Message(_) => H3ErrorCode::MessageError,
            H3Error::GoingAway => H3ErrorCode::RequestRejected,
            H3Error::StreamReset(_) | H3Error::Transport(_) | H3Error::Connection(_) => {
                H3ErrorCode::InternalError
            }
        }
    }

    /// Whether the whole connection must be torn down.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            H3Error::Protocol(_)
                | H3Error::FrameUnexpected(_)
                | H3Error::MissingSettings
                | H3Error::ClosedCriticalStream
                | H3Error::Frame(_)
                | H3Error::QpackDecompression(_)
                | H3Error::QpackEncoderStream(_)
                | H3Error::QpackDecoderStream(_)
                | H3Error::Connection(_)
        )
    }
}
