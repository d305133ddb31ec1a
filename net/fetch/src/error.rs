//! Fetch-layer error taxonomy.
//!
//! Request-scoped failures reach only the originating caller; transport-
//! and HTTP/3-fatal failures fan out to every request on the affected
//! connection. Cache and predictor failures never surface at all.

use thiserror::Error;

/// Errors reported to fetch callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("request timed out")]
    Timeout,

    #[error("too many redirects")]
    TooManyRedirects,

    #[error("redirect without location header")]
    BadRedirect,

    #[error("certificate verification failed: {0}")]
    CertificateVerificationFailed(String),

    #[error("request was cancelled")]
    Cancelled,

    #[error("stream reset by peer, code {0:#x}")]
    StreamReset(u64),

    #[error("connection closed by peer application, code {code:#x}")]
    ConnectionClosed { code: u64 },

    #[error("response body incomplete")]
    Incomplete,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("dns resolution failed for {0}")]
    DnsFailure(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("client is shutting down")]
    ShuttingDown,
}

impl FetchError {
    /// Whether a retry on the same or a fresh connection may succeed.
    ///
    /// Only the wire codes H3_REQUEST_CANCELLED (0x010c) and
    /// H3_EXCESSIVE_LOAD (0x0107) qualify, whether they arrived as a
    /// stream reset or as an application close of the whole connection.
    /// Transport- and HTTP/3-fatal failures are terminal, never retried.
    /// Only GET/HEAD requests are retried without caller consent; the
    /// caller enforces that part.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::StreamReset(code) | FetchError::ConnectionClosed { code } => {
                matches!(*code, 0x010c | 0x0107)
            }
            _ => false,
        }
    }
}

impl From<quantum_quic::TransportError> for FetchError {
    fn from(e: quantum_quic::TransportError) -> FetchError {
        match e {
            quantum_quic::TransportError::CertificateVerification(reason) => {
                FetchError::CertificateVerificationFailed(reason)
            }
            other => FetchError::Connection(other.to_string()),
        }
    }
}

impl From<quantum_quic::ConnectionError> for FetchError {
    fn from(e: quantum_quic::ConnectionError) -> FetchError {
        match e {
            // Application closes keep their code so the retry policy can
            // distinguish load shedding from protocol failures.
            quantum_quic::ConnectionError::ApplicationClosed { code, .. } => {
                FetchError::ConnectionClosed { code }
            }
            other => FetchError::Connection(other.to_string()),
        }
    }
}

impl From<quantum_http3::H3Error> for FetchError {
    fn from(e: quantum_http3::H3Error) -> FetchError {
        match e {
            quantum_http3::H3Error::StreamReset(code) => FetchError::StreamReset(code),
            quantum_http3::H3Error::Transport(t) => t.into(),
            quantum_http3::H3Error::Connection(c) => c.into(),
            other => FetchError::Protocol(other.to_string()),
        }
    }
}
