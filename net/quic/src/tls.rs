//! TLS 1.3 collaborator interface (RFC 9001 §4).
//!
//! The transport does not implement TLS itself; it feeds CRYPTO stream
//! bytes into a [`TlsSession`] and installs the secrets the session yields
//! per epoch. Certificate chain verification happens inside the session and
//! surfaces as [`TransportError::CertificateVerification`] from
//! [`TlsSession::write_handshake_message`].

use serde::{Deserialize, Serialize};

use crate::crypto::CipherSuite;
use crate::error::TransportError;
use crate::packet::Epoch;

/// ClientHello shaping profile. Affects the hello only; the handshake
/// logic is identical across profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TlsProfile {
    #[default]
    Modern,
    Compatible,
    Chrome,
    Firefox,
    Safari,
    Random,
    Custom,
}

/// Secrets surfaced by the TLS layer for one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeSecrets {
    pub suite: CipherSuite,
    pub client_secret: Vec<u8>,
    pub server_secret: Vec<u8>,
}

/// One TLS 1.3 session bound to a connection.
///
/// The connection calls [`read_handshake_messages`] to pull CRYPTO bytes it
/// should send at a given epoch, and [`write_handshake_message`] to deliver
/// peer CRYPTO bytes. Secrets become available per epoch as the handshake
/// advances.
///
/// [`read_handshake_messages`]: TlsSession::read_handshake_messages
/// [`write_handshake_message`]: TlsSession::write_handshake_message
pub trait TlsSession: Send {
    /// Deliver peer handshake bytes received at `epoch`.
    ///
    /// Certificate validation failures and TLS alerts surface here.
    fn write_handshake_message(&mut self, epoch: Epoch, data: &[u8]) -> Result<(), TransportError>;

    /// Handshake bytes this endpoint should transmit at `epoch`. Drains.
    fn read_handshake_messages(&mut self, epoch: Epoch) -> Vec<u8>;

    /// Secrets for `epoch` once derived; `None` before that point.
    fn secrets(&self, epoch: Epoch) -> Option<HandshakeSecrets>;

    /// 0-RTT client secrets when resuming with an early-data ticket.
    fn early_secrets(&self) -> Option<HandshakeSecrets>;

    /// Embed our transport parameters into the hello.
    fn set_transport_parameters(&mut self, params: &[u8]);

    /// Peer transport parameters from the TLS extension, once seen.
    fn peer_transport_parameters(&self) -> Option<Vec<u8>>;

    /// Whether the server accepted early data (known after
    /// EncryptedExtensions).
    fn early_data_accepted(&self) -> Option<bool>;

    /// True once Finished has been exchanged in both directions.
    fn is_complete(&self) -> bool;

    /// A NewSessionTicket issued by the server, if one arrived. Drains.
    fn take_session_ticket(&mut self) -> Option<Vec<u8>>;

    /// Negotiated ALPN protocol.
    fn alpn(&self) -> Option<Vec<u8>>;
}

/// Factory for TLS sessions, injected into the client at construction.
pub trait TlsProvider: Send + Sync {
    /// Open a session for `sni`, optionally resuming from a ticket.
    fn new_session(
        &self,
        sni: &str,
        alpn: &[&[u8]],
        profile: TlsProfile,
        session_ticket: Option<&[u8]>,
    ) -> Box<dyn TlsSession>;

    /// Validate a certificate chain against `sni` (validity window and
    /// SAN/CN match included). Sessions call this during the handshake.
    fn verify_certificate_chain(&self, chain: &[Vec<u8>], sni: &str) -> Result<(), TransportError>;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! Deterministic in-process TLS stand-in for transport tests.
    //!
    //! The "handshake" is a fixed byte exchange; secrets are constants so a
    //! scripted peer can derive matching packet keys with the real key
    //! schedule and AEAD.

    use super::*;

    pub const MOCK_CLIENT_HELLO: &[u8] = b"quantum-test-client-hello";
    pub const MOCK_SERVER_HELLO: &[u8] = b"quantum-test-server-hello";
    pub const MOCK_SERVER_FLIGHT_PREFIX: &[u8] = b"quantum-test-ee-cert-cv-fin:";
    pub const MOCK_CLIENT_FINISHED: &[u8] = b"quantum-test-client-finished";

    pub fn mock_secrets(label: u8) -> HandshakeSecrets {
        HandshakeSecrets {
            suite: CipherSuite::Aes128Gcm,
            client_secret: vec![label; 32],
            server_secret: vec![label ^ 0xff; 32],
        }
    }

    /// Scriptable client-side session.
    pub struct MockTlsSession {
        pub sent_hello: bool,
        pub saw_server_hello: bool,
        pub complete: bool,
        pub finished_queued: bool,
        pub local_params: Vec<u8>,
        pub peer_params: Option<Vec<u8>>,
        pub ticket: Option<Vec<u8>>,
        pub offered_early_data: bool,
        pub early_accepted: Option<bool>,
        /// When set, certificate verification fails with this reason.
        pub reject_certificate: Option<String>,
    }

    impl MockTlsSession {
        pub fn new(offer_early_data: bool) -> Self {
            MockTlsSession {
                sent_hello: false,
                saw_server_hello: false,
                complete: false,
                finished_queued: false,
                local_params: Vec::new(),
                peer_params: None,
                ticket: None,
                offered_early_data: offer_early_data,
                early_accepted: None,
                reject_certificate: None,
            }
        }
    }

    impl TlsSession for MockTlsSession {
        fn write_handshake_message(
            &mut self,
            epoch: Epoch,
            data: &[u8],
        ) -> Result<(), TransportError> {
            match epoch {
                Epoch::Initial => {
                    if data == MOCK_SERVER_HELLO {
                        self.saw_server_hello = true;
                    }
                }
                Epoch::Handshake => {
                    if let Some(reason) = &self.reject_certificate {
                        return Err(TransportError::CertificateVerification(reason.clone()));
                    }
                    if let Some(rest) = data.strip_prefix(MOCK_SERVER_FLIGHT_PREFIX) {
                        // Server flight carries: 1 byte early-data flag,
                        // then the peer transport parameter block.
                        if let Some((&flag, params)) = rest.split_first() {
                            self.early_accepted = Some(self.offered_early_data && flag == 1);
                            self.peer_params = Some(params.to_vec());
                            self.complete = true;
                            self.finished_queued = true;
                        }
                    }
                }
                Epoch::Application => {
                    if let Some(ticket) = data.strip_prefix(b"ticket:".as_ref()) {
                        self.ticket = Some(ticket.to_vec());
                    }
                }
            }
            Ok(())
        }

        fn read_handshake_messages(&mut self, epoch: Epoch) -> Vec<u8> {
            match epoch {
                Epoch::Initial if !self.sent_hello => {
                    self.sent_hello = true;
                    let mut hello = MOCK_CLIENT_HELLO.to_vec();
                    hello.extend_from_slice(&self.local_params);
                    hello
                }
                Epoch::Handshake if self.finished_queued => {
                    self.finished_queued = false;
                    MOCK_CLIENT_FINISHED.to_vec()
                }
                _ => Vec::new(),
            }
        }

        fn secrets(&self, epoch: Epoch) -> Option<HandshakeSecrets> {
            match epoch {
                Epoch::Initial => None,
                Epoch::Handshake if self.saw_server_hello => Some(mock_secrets(0x11)),
                Epoch::Application if self.complete => Some(mock_secrets(0x22)),
                _ => None,
            }
        }

        fn early_secrets(&self) -> Option<HandshakeSecrets> {
            self.offered_early_data.then(|| mock_secrets(0x33))
        }

        fn set_transport_parameters(&mut self, params: &[u8]) {
            self.local_params = params.to_vec();
        }

        fn peer_transport_parameters(&self) -> Option<Vec<u8>> {
            self.peer_params.clone()
        }

        fn early_data_accepted(&self) -> Option<bool> {
            self.early_accepted
        }

        fn is_complete(&self) -> bool {
            self.complete
        }

        fn take_session_ticket(&mut self) -> Option<Vec<u8>> {
            self.ticket.take()
        }

        fn alpn(&self) -> Option<Vec<u8>> {
            Some(b"h3".to_vec())
        }
    }
}
