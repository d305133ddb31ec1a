//! Async driver: one tokio task per connection.
//!
//! The driver owns the UDP socket, the [`Connection`] state machine and
//! every timer. Callers talk to it through a [`ConnectionHandle`] command
//! channel and receive [`DriverEvent`]s on an mpsc channel, so no
//! connection state is ever shared across tasks.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionEvent, ConnectionStats};
use crate::error::{ConnectionError, TransportError};
use crate::stream::{StreamId, StreamPriority};

/// Commands a handle may issue to the driver task.
#[derive(Debug)]
pub enum DriverCommand {
    OpenStream {
        bidi: bool,
        priority: StreamPriority,
        resp: oneshot::Sender<Result<StreamId, TransportError>>,
    },
    Send {
        id: StreamId,
        data: Bytes,
        fin: bool,
    },
    SetPriority {
        id: StreamId,
        priority: StreamPriority,
    },
    Reset {
        id: StreamId,
        error_code: u64,
    },
    StopSending {
        id: StreamId,
        error_code: u64,
    },
    Close {
        error_code: u64,
        reason: String,
    },
    Stats {
        resp: oneshot::Sender<ConnectionStats>,
    },
    PeerParams {
        resp: oneshot::Sender<Option<crate::params::TransportParameters>>,
    },
}

/// Events delivered to the layer above (HTTP/3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Connected { used_early_data: bool },
    ZeroRttRejected,
    StreamData { id: StreamId, data: Bytes, fin: bool },
    StreamReset { id: StreamId, error_code: u64 },
    StreamStopped { id: StreamId, error_code: u64 },
    NewToken(Vec<u8>),
    SessionTicket { ticket: Vec<u8>, suite: crate::crypto::CipherSuite },
    Closed(ConnectionError),
}

/// Cheap cloneable handle to a running driver.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<DriverCommand>,
}

impl ConnectionHandle {
    pub async fn open_stream(
        &self,
        bidi: bool,
        priority: StreamPriority,
    ) -> Result<StreamId, TransportError> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::OpenStream { bidi, priority, resp })
            .await
            .map_err(|_| TransportError::Internal("connection driver gone"))?;
        rx.await
            .map_err(|_| TransportError::Internal("connection driver gone"))?
    }

    pub async fn send(&self, id: StreamId, data: Bytes, fin: bool) -> Result<(), TransportError> {
        self.commands
            .send(DriverCommand::Send { id, data, fin })
            .await
            .map_err(|_| TransportError::Internal("connection driver gone"))
    }

    pub async fn set_priority(&self, id: StreamId, priority: StreamPriority) {
        let _ = self.commands.send(DriverCommand::SetPriority { id, priority }).await;
    }

    pub async fn reset(&self, id: StreamId, error_code: u64) {
        let _ = self.commands.send(DriverCommand::Reset { id, error_code }).await;
    }

    pub async fn stop_sending(&self, id: StreamId, error_code: u64) {
        let _ = self.commands.send(DriverCommand::StopSending { id, error_code }).await;
    }

    pub async fn close(&self, error_code: u64, reason: &str) {
        let _ = self
            .commands
            .send(DriverCommand::Close { error_code, reason: reason.to_string() })
            .await;
    }

    pub async fn stats(&self) -> Option<ConnectionStats> {
        let (resp, rx) = oneshot::channel();
        self.commands.send(DriverCommand::Stats { resp }).await.ok()?;
        rx.await.ok()
    }

    /// Peer transport parameters, once the handshake delivered them.
    pub async fn peer_params(&self) -> Option<crate::params::TransportParameters> {
        let (resp, rx) = oneshot::channel();
        self.commands
            .send(DriverCommand::PeerParams { resp })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Whether the driver task is still alive.
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }
}

/// Task owning socket, timers and connection state.
pub struct ConnectionDriver {
    socket: UdpSocket,
    conn: Connection,
    commands: mpsc::Receiver<DriverCommand>,
    events: mpsc::Sender<DriverEvent>,
}

impl ConnectionDriver {
    /// Bind an ephemeral socket connected to `peer`, wrap `conn`, and
    /// return the driver plus its command handle.
    pub async fn bind(
        peer: SocketAddr,
        conn: Connection,
        events: mpsc::Sender<DriverEvent>,
    ) -> io::Result<(ConnectionDriver, ConnectionHandle)> {
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|_| io::ErrorKind::InvalidInput)?
        } else {
            "[::]:0".parse().map_err(|_| io::ErrorKind::InvalidInput)?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await?;
        Ok(Self::with_socket(socket, conn, events))
    }

    /// Wrap an already-connected socket.
    pub fn with_socket(
        socket: UdpSocket,
        conn: Connection,
        events: mpsc::Sender<DriverEvent>,
    ) -> (ConnectionDriver, ConnectionHandle) {
        let (tx, rx) = mpsc::channel(64);
        (
            ConnectionDriver { socket, conn, commands: rx, events },
            ConnectionHandle { commands: tx },
        )
    }

    /// Drive the connection until it is closed.
    pub async fn run(mut self) {
        let mut buf = vec![0u8; 65_535];
        let mut commands_open = true;
        loop {
            if let Err(e) = self.flush().await {
                warn!(%e, "socket send failed");
                break;
            }
            self.forward_events().await;
            if self.conn.is_closed() {
                debug!("connection closed, driver exiting");
                break;
            }

            let deadline = self
                .conn
                .timeout()
                .map(tokio::time::Instant::from_std);

            tokio::select! {
                received = self.socket.recv(&mut buf) => match received {
                    Ok(n) => {
                        trace!(bytes = n, "datagram received");
                        let _ = self.conn.recv(&buf[..n], Instant::now());
                    }
                    Err(e) => {
                        warn!(%e, "socket receive failed");
                        self.conn.close(0, "socket error", Instant::now());
                    }
                },
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        // Every handle dropped: shut down cleanly.
                        commands_open = false;
                        self.conn.close(0, "", Instant::now());
                    }
                },
                _ = async {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.conn.on_timeout(Instant::now());
                }
            }
        }
        // Surface any terminal events queued during the last iteration.
        self.forward_events().await;
    }

    async fn flush(&mut self) -> io::Result<()> {
        while let Some(datagram) = self.conn.poll_send(Instant::now()) {
            self.socket.send(&datagram).await?;
        }
        Ok(())
    }

    fn on_command(&mut self, command: DriverCommand) {
        match command {
            DriverCommand::OpenStream { bidi, priority, resp } => {
                let result = self.conn.open_stream(bidi);
                if let Ok(id) = result {
                    self.conn.set_stream_priority(id, priority);
                }
                let _ = resp.send(result);
            }
            DriverCommand::Send { id, data, fin } => {
                if let Err(e) = self.conn.stream_send(id, data, fin) {
                    debug!(%e, ?id, "stream send rejected");
                }
            }
            DriverCommand::SetPriority { id, priority } => {
                self.conn.set_stream_priority(id, priority);
            }
            DriverCommand::Reset { id, error_code } => {
                self.conn.reset_stream(id, error_code);
            }
            DriverCommand::StopSending { id, error_code } => {
                self.conn.stop_sending(id, error_code);
            }
            DriverCommand::Close { error_code, reason } => {
                self.conn.close(error_code, &reason, Instant::now());
            }
            DriverCommand::Stats { resp } => {
                let _ = resp.send(self.conn.stats());
            }
            DriverCommand::PeerParams { resp } => {
                let _ = resp.send(self.conn.peer_params().cloned());
            }
        }
    }

    async fn forward_events(&mut self) {
        while let Some(event) = self.conn.poll_event() {
            let mapped = match event {
                ConnectionEvent::Connected { used_early_data } => {
                    DriverEvent::Connected { used_early_data }
                }
                ConnectionEvent::ZeroRttRejected => DriverEvent::ZeroRttRejected,
                ConnectionEvent::StreamReadable(id) => {
                    // Drain everything currently buffered for the stream.
                    while let Some((data, fin)) = self.conn.stream_recv(id) {
                        let done = fin;
                        let _ = self
                            .events
                            .send(DriverEvent::StreamData { id, data, fin })
                            .await;
                        if done {
                            break;
                        }
                    }
                    continue;
                }
                ConnectionEvent::StreamReset { id, error_code } => {
                    DriverEvent::StreamReset { id, error_code }
                }
                ConnectionEvent::StreamStopped { id, error_code } => {
                    DriverEvent::StreamStopped { id, error_code }
                }
                ConnectionEvent::NewToken(token) => DriverEvent::NewToken(token),
                ConnectionEvent::SessionTicket { ticket, suite } => {
                    DriverEvent::SessionTicket { ticket, suite }
                }
                ConnectionEvent::Closed(error) => DriverEvent::Closed(error),
            };
            let _ = self.events.send(mapped).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::frame::Frame;
    use crate::packet::PacketType;
    use crate::testing::TestPeer;
    use crate::tls::testing::MockTlsSession;

    /// Minimal UDP server: answers the handshake, echoes stream data.
    ///
    /// Every response is idempotent, so re-sends after client
    /// retransmissions are harmless.
    async fn run_test_server(socket: UdpSocket) {
        let mut peer = TestPeer::new();
        let mut buf = vec![0u8; 65_535];
        let mut request_bytes: std::collections::HashMap<u64, (Vec<u8>, bool)> =
            std::collections::HashMap::new();
        let mut answered: std::collections::HashSet<u64> = std::collections::HashSet::new();
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else { return };
            let received = peer.recv(&buf[..n]);
            if received.is_empty() {
                continue;
            }
            let has_crypto = |ty: PacketType| {
                received.iter().any(|(t, frames)| {
                    *t == ty && frames.iter().any(|f| matches!(f, Frame::Crypto { .. }))
                })
            };
            if has_crypto(PacketType::Initial) {
                let flight = peer.handshake_flight(false);
                let _ = socket.send_to(&flight, from).await;
            }
            if has_crypto(PacketType::Handshake) {
                let done = peer.handshake_done();
                let _ = socket.send_to(&done, from).await;
            }

            // Accumulate request-stream bytes; echo complete requests.
            for (_, frames) in &received {
                for frame in frames {
                    if let Frame::Stream { stream_id, offset, data, fin } = frame {
                        let entry = request_bytes.entry(*stream_id).or_default();
                        let offset = *offset as usize;
                        if offset + data.len() > entry.0.len() {
                            let skip = entry.0.len().saturating_sub(offset);
                            entry.0.extend_from_slice(&data[skip..]);
                        }
                        entry.1 |= fin;
                    }
                }
            }
            let finished: Vec<u64> = request_bytes
                .iter()
                .filter(|(id, (_, fin))| *fin && !answered.contains(id))
                .map(|(id, _)| *id)
                .collect();
            for id in finished {
                answered.insert(id);
                let data = request_bytes.get(&id).map(|(d, _)| d.clone()).unwrap_or_default();
                let reply = peer.build(&[(
                    PacketType::OneRtt,
                    vec![Frame::Stream {
                        stream_id: id,
                        offset: 0,
                        data: Bytes::from(data),
                        fin: true,
                    }],
                )]);
                let _ = socket.send_to(&reply, from).await;
            }
        }
    }

    #[tokio::test]
    async fn test_driver_handshake_and_echo() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        tokio::spawn(run_test_server(server_socket));

        let tls = Box::new(MockTlsSession::new(false));
        let conn = Connection::new_client(
            tls,
            ConnectionConfig::default(),
            false,
            None,
            Instant::now(),
        )
        .unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (driver, handle) = ConnectionDriver::bind(server_addr, conn, events_tx)
            .await
            .unwrap();
        tokio::spawn(driver.run());

        // Wait for the Connected event.
        let mut connected = false;
        while let Some(event) = events_rx.recv().await {
            if matches!(event, DriverEvent::Connected { .. }) {
                connected = true;
                break;
            }
        }
        assert!(connected);

        // Open a stream, send a request, expect the echo back.
        let id = handle
            .open_stream(true, StreamPriority::default())
            .await
            .unwrap();
        handle
            .send(id, Bytes::from_static(b"ping over quic"), true)
            .await
            .unwrap();

        let mut body = Vec::new();
        while let Some(event) = events_rx.recv().await {
            if let DriverEvent::StreamData { id: got, data, fin } = event {
                assert_eq!(got, id);
                body.extend_from_slice(&data);
                if fin {
                    break;
                }
            }
        }
        assert_eq!(body, b"ping over quic");

        handle.close(0, "test done").await;
    }
}
