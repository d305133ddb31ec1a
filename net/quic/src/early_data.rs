//! 0-RTT session ticket store and replay policy.
//!
//! Tickets are cached per (host, port) together with the peer transport
//! parameters in force when they were issued. The manager decides whether
//! an origin may attempt early data: expired tickets are rejected, an
//! origin that rejected 0-RTT stays fallback-only for the rest of the
//! session, and attempts are rate-limited per origin.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::crypto::CipherSuite;

/// Minimum spacing between 0-RTT attempts against one origin.
const ATTEMPT_INTERVAL_S: i64 = 10;

impl Serialize for CipherSuite {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let name = match self {
            CipherSuite::Aes128Gcm => "aes128gcm",
            CipherSuite::Aes256Gcm => "aes256gcm",
            CipherSuite::ChaCha20Poly1305 => "chacha20poly1305",
        };
        s.serialize_str(name)
    }
}

impl<'de> Deserialize<'de> for CipherSuite {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let name = String::deserialize(d)?;
        match name.as_str() {
            "aes128gcm" => Ok(CipherSuite::Aes128Gcm),
            "aes256gcm" => Ok(CipherSuite::Aes256Gcm),
            "chacha20poly1305" => Ok(CipherSuite::ChaCha20Poly1305),
            other => Err(serde::de::Error::custom(format!("unknown cipher suite {other}"))),
        }
    }
}

/// A resumable TLS session for one origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTicket {
    pub host: String,
    pub port: u16,
    pub ticket: Vec<u8>,
    pub issued_at: DateTime<Utc>,
    pub lifetime_s: u64,
    pub cipher: CipherSuite,
    /// Replay-window nonce bound to this ticket.
    pub nonce: [u8; 16],
    /// Peer transport parameters cached for 0-RTT flow-control limits.
    pub transport_params: Vec<u8>,
}

impl SessionTicket {
    pub fn new(
        host: &str,
        port: u16,
        ticket: Vec<u8>,
        lifetime_s: u64,
        cipher: CipherSuite,
        transport_params: Vec<u8>,
    ) -> Self {
        let mut nonce = [0u8; 16];
        rand::rng().fill_bytes(&mut nonce);
        SessionTicket {
            host: host.to_string(),
            port,
            ticket,
            issued_at: Utc::now(),
            lifetime_s,
            cipher,
            nonce,
            transport_params,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.issued_at > ChronoDuration::seconds(self.lifetime_s as i64)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OriginStats {
    attempts: u64,
    accepts: u64,
    rejections: u64,
    #[serde(skip)]
    rejected_this_session: bool,
    #[serde(skip)]
    last_attempt: Option<DateTime<Utc>>,
}

/// Serializable view of the per-origin 0-RTT statistics.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EarlyDataSnapshot {
    origins: HashMap<String, OriginStatsSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginStatsSnapshot {
    pub attempts: u64,
    pub accepts: u64,
    pub rejections: u64,
}

/// Shared store of session tickets, address-validation tokens and 0-RTT
/// outcome statistics.
pub struct EarlyDataManager {
    enabled: bool,
    tickets: RwLock<HashMap<(String, u16), SessionTicket>>,
    tokens: RwLock<HashMap<(String, u16), Vec<u8>>>,
    origins: RwLock<HashMap<(String, u16), OriginStats>>,
}

impl EarlyDataManager {
    pub fn new(enabled: bool) -> Self {
        EarlyDataManager {
            enabled,
            tickets: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            origins: RwLock::new(HashMap::new()),
        }
    }

    pub fn store_ticket(&self, ticket: SessionTicket) {
        trace!(host = %ticket.host, port = ticket.port, "session ticket stored");
        self.tickets
            .write()
            .insert((ticket.host.clone(), ticket.port), ticket);
    }

    /// Ticket for an origin if early data is currently permitted there.
    ///
    /// Records the attempt for rate-limiting when a ticket is handed out.
    pub fn ticket_for(&self, host: &str, port: u16) -> Option<SessionTicket> {
        if !self.enabled {
            return None;
        }
        let key = (host.to_string(), port);
        let now = Utc::now();
        {
            let origins = self.origins.read();
            if let Some(stats) = origins.get(&key) {
                if stats.rejected_this_session {
                    return None;
                }
                if let Some(last) = stats.last_attempt {
                    if now - last < ChronoDuration::seconds(ATTEMPT_INTERVAL_S) {
                        return None;
                    }
                }
            }
        }
        let ticket = {
            let tickets = self.tickets.read();
            tickets.get(&key).cloned()
        }?;
        if ticket.is_expired(now) {
            debug!(host, port, "session ticket expired, dropping");
            self.tickets.write().remove(&key);
            return None;
        }
        let mut origins = self.origins.write();
        let stats = origins.entry(key).or_default();
        stats.attempts += 1;
        stats.last_attempt = Some(now);
        Some(ticket)
    }

    /// Whether the client may attach early application data for an origin.
    pub fn early_data_allowed(&self, host: &str, port: u16) -> bool {
        if !self.enabled {
            return false;
        }
        let origins = self.origins.read();
        origins
            .get(&(host.to_string(), port))
            .map(|s| !s.rejected_this_session)
            .unwrap_or(true)
    }

    pub fn record_acceptance(&self, host: &str, port: u16) {
        let mut origins = self.origins.write();
        let stats = origins.entry((host.to_string(), port)).or_default();
        stats.accepts += 1;
    }

    /// A rejection makes the origin fallback-only for this session and
    /// invalidates the ticket that was tried.
    pub fn record_rejection(&self, host: &str, port: u16) {
        let key = (host.to_string(), port);
        {
            let mut origins = self.origins.write();
            let stats = origins.entry(key.clone()).or_default();
            stats.rejections += 1;
            stats.rejected_this_session = true;
        }
        self.tickets.write().remove(&key);
        debug!(host, port, "0-RTT rejected, origin is fallback-only this session");
    }

    /// Store a NEW_TOKEN value for address validation on reconnect.
    pub fn store_token(&self, host: &str, port: u16, token: Vec<u8>) {
        self.tokens.write().insert((host.to_string(), port), token);
    }

    pub fn token_for(&self, host: &str, port: u16) -> Option<Vec<u8>> {
        self.tokens.read().get(&(host.to_string(), port)).cloned()
    }

    /// Snapshot of the per-origin statistics for persistence.
    pub fn snapshot(&self) -> EarlyDataSnapshot {
        let origins = self.origins.read();
        EarlyDataSnapshot {
            origins: origins
                .iter()
                .map(|((host, port), s)| {
                    (
                        format!("{host}:{port}"),
                        OriginStatsSnapshot {
                            attempts: s.attempts,
                            accepts: s.accepts,
                            rejections: s.rejections,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Serialize the statistics snapshot as JSON.
    pub fn snapshot_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(host: &str) -> SessionTicket {
        SessionTicket::new(
            host,
            443,
            vec![1, 2, 3],
            3600,
            CipherSuite::Aes128Gcm,
            vec![0x04, 0x01, 0x40],
        )
    }

    #[test]
    fn test_ticket_round_trip() {
        let mgr = EarlyDataManager::new(true);
        mgr.store_ticket(ticket("example.test"));
        let got = mgr.ticket_for("example.test", 443).expect("ticket expected");
        assert_eq!(got.ticket, vec![1, 2, 3]);
    }

    #[test]
    fn test_expired_ticket_rejected() {
        let mgr = EarlyDataManager::new(true);
        let mut t = ticket("example.test");
        t.issued_at = Utc::now() - ChronoDuration::seconds(7200);
        mgr.store_ticket(t);
        assert!(mgr.ticket_for("example.test", 443).is_none());
    }

    #[test]
    fn test_rejection_makes_origin_fallback_only() {
        let mgr = EarlyDataManager::new(true);
        mgr.store_ticket(ticket("example.test"));
        assert!(mgr.early_data_allowed("example.test", 443));
        mgr.record_rejection("example.test", 443);
        assert!(!mgr.early_data_allowed("example.test", 443));
        assert!(mgr.ticket_for("example.test", 443).is_none());
    }

    #[test]
    fn test_attempts_are_rate_limited() {
        let mgr = EarlyDataManager::new(true);
        mgr.store_ticket(ticket("example.test"));
        assert!(mgr.ticket_for("example.test", 443).is_some());
        // Second attempt inside the interval is refused even though the
        // ticket is still present.
        assert!(mgr.ticket_for("example.test", 443).is_none());
    }

    #[test]
    fn test_disabled_manager_never_offers() {
        let mgr = EarlyDataManager::new(false);
        mgr.store_ticket(ticket("example.test"));
        assert!(mgr.ticket_for("example.test", 443).is_none());
        assert!(!mgr.early_data_allowed("example.test", 443));
    }

    #[test]
    fn test_token_storage() {
        let mgr = EarlyDataManager::new(true);
        mgr.store_token("example.test", 443, vec![9, 9]);
        assert_eq!(mgr.token_for("example.test", 443), Some(vec![9, 9]));
        assert!(mgr.token_for("other.test", 443).is_none());
    }

    #[test]
    fn test_snapshot_counts() {
        let mgr = EarlyDataManager::new(true);
        mgr.store_ticket(ticket("example.test"));
        let _ = mgr.ticket_for("example.test", 443);
        mgr.record_rejection("example.test", 443);
        let snapshot = mgr.snapshot();
        let stats = &snapshot.origins["example.test:443"];
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.rejections, 1);
    }
}
