//! QUIC v1 client transport for the Quantum browser network layer.
//!
//! Implements RFC 9000 (transport), RFC 9001 (packet protection) and
//! RFC 9002 (loss recovery and congestion control) for the client role.
//! The [`Connection`] state machine is sans-IO: it consumes datagrams via
//! [`Connection::recv`] and produces them via [`Connection::poll_send`],
//! which keeps every protocol interleaving deterministic under test. The
//! [`driver`] module owns the UDP socket and timers and runs one task per
//! connection.
//!
//! TLS 1.3 itself is an external collaborator surfaced through the
//! [`tls::TlsSession`] trait; this crate feeds it CRYPTO data and installs
//! the secrets it yields.

pub mod connection;
pub mod crypto;
pub mod driver;
pub mod early_data;
pub mod error;
pub mod frame;
pub mod packet;
pub mod params;
pub mod recovery;
pub mod stream;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tls;
pub mod varint;

pub use connection::{
    Connection, ConnectionConfig, ConnectionEvent, ConnectionState, ConnectionStats,
};
pub use driver::{ConnectionDriver, ConnectionHandle, DriverCommand, DriverEvent};
pub use early_data::{EarlyDataManager, SessionTicket};
pub use error::{ConnectionError, TransportError};
pub use frame::Frame;
pub use packet::{ConnectionId, Epoch, PacketType};
pub use params::TransportParameters;
pub use stream::{Side, StreamId, StreamPriority};
pub use tls::{TlsProfile, TlsProvider, TlsSession};
pub use varint::VarInt;

/// QUIC version 1 (RFC 9000).
pub const QUIC_VERSION: u32 = 0x0000_0001;

/// ALPN protocol identifier for HTTP/3.
pub const ALPN_H3: &[u8] = b"h3";
