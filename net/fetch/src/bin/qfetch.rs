//! Command-line fetch harness for the Quantum network stack.
//!
//! Loads the fetch configuration, wires the client, performs one fetch
//! and prints the response head plus the client counters. The TLS 1.3
//! backend is an external collaborator; this harness links a stub
//! provider, so it exercises configuration, scheduling, cache and
//! statistics paths end to end while the wire path reports the missing
//! backend cleanly.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use quantum_fetch::{FetchConfig, HttpClient, Request, ResourceType};
use quantum_quic::tls::{TlsProfile, TlsProvider, TlsSession};
use quantum_quic::TransportError;

/// Placeholder for the browser's TLS collaborator.
struct StubTlsProvider;

impl TlsProvider for StubTlsProvider {
    fn new_session(
        &self,
        _sni: &str,
        _alpn: &[&[u8]],
        _profile: TlsProfile,
        _session_ticket: Option<&[u8]>,
    ) -> Box<dyn TlsSession> {
        Box::new(StubTlsSession)
    }

    fn verify_certificate_chain(
        &self,
        _chain: &[Vec<u8>],
        _sni: &str,
    ) -> Result<(), TransportError> {
        Err(TransportError::Internal("no TLS backend linked"))
    }
}

struct StubTlsSession;

impl TlsSession for StubTlsSession {
    fn write_handshake_message(
        &mut self,
        _epoch: quantum_quic::Epoch,
        _data: &[u8],
    ) -> Result<(), TransportError> {
        Err(TransportError::Internal("no TLS backend linked"))
    }

    fn read_handshake_messages(&mut self, _epoch: quantum_quic::Epoch) -> Vec<u8> {
        Vec::new()
    }

    fn secrets(
        &self,
        _epoch: quantum_quic::Epoch,
    ) -> Option<quantum_quic::tls::HandshakeSecrets> {
        None
    }

    fn early_secrets(&self) -> Option<quantum_quic::tls::HandshakeSecrets> {
        None
    }

    fn set_transport_parameters(&mut self, _params: &[u8]) {}

    fn peer_transport_parameters(&self) -> Option<Vec<u8>> {
        None
    }

    fn early_data_accepted(&self) -> Option<bool> {
        None
    }

    fn is_complete(&self) -> bool {
        false
    }

    fn take_session_ticket(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn alpn(&self) -> Option<Vec<u8>> {
        None
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let Some(url) = args.next() else {
        bail!("usage: qfetch <https-url> [config-file]");
    };
    let config_path = args.next();

    let config = FetchConfig::load(config_path.as_deref())
        .context("loading fetch configuration")?;
    info!(?config.prediction_model, cache = config.cache_enabled, "configuration loaded");

    let client = HttpClient::new(config, Arc::new(StubTlsProvider));
    let request = Request::get(&url)
        .context("parsing url")?
        .with_type(ResourceType::Document);

    match client.fetch(request).await {
        Ok(response) => {
            info!(
                status = response.status,
                bytes = response.body.len(),
                from_cache = response.from_cache,
                used_early_data = response.used_early_data,
                "fetch complete"
            );
            for (name, value) in response.headers.iter() {
                println!("{name}: {value}");
            }
        }
        Err(e) => {
            error!(%e, "fetch failed");
        }
    }

    let stats = client.stats();
    println!(
        "requests={} cache_hits={} prefetches={} failures={}",
        stats.requests, stats.cache_hits, stats.prefetches_issued, stats.failures
    );
    Ok(())
}
