//! HTTP/3 (RFC 9114) and QPACK (RFC 9204) for the Quantum network layer.
//!
//! Sits on top of `quantum-quic`: the [`connection::H3Connection`] task
//! owns the control stream, the QPACK encoder/decoder stream pair and the
//! dynamic population of request streams of one QUIC connection, and
//! exposes request/response exchange to the fetch layer.

pub mod connection;
pub mod error;
pub mod frame;
pub mod headers;
pub mod qpack;

pub use connection::{H3Connection, H3Event};
pub use error::{H3Error, H3ErrorCode};
pub use frame::{H3Frame, Settings, StreamType};
pub use headers::HeaderMap;
