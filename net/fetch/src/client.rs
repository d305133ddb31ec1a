//! The HTTP/3 fetch client.
//!
//! Request flow: normalize → cache lookup → (at-most-one populate) →
//! connection pool keyed by authority, 0-RTT when the early-data manager
//! authorizes it → prioritized request stream → redirect/retry policy →
//! cache deposit → dependency analysis and speculative prefetch.
//!
//! All QUIC state lives in per-connection tasks; the client itself only
//! holds the shared cache, scheduler, predictor and ticket store, each
//! behind short-lived locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use quantum_http3::connection::{H3Connection, H3Event};
use quantum_http3::headers::request_fields;
use quantum_http3::HeaderMap;
use quantum_quic::{
    Connection, ConnectionConfig, ConnectionDriver, EarlyDataManager, SessionTicket,
    StreamId, StreamPriority, TlsProvider,
};

use crate::analyze::{DependencyAnalyzer, RefAction};
use crate::cache::{fingerprint, Cache, CacheEntry};
use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::predict::{build_predictor, Predictor};
use crate::request::{decode_body, normalize_url, Request, ResourceType, Response};
use crate::scheduler::Scheduler;
use crate::stats::{ClientCounters, StatsSnapshot};

/// One wire exchange handed to the dispatch layer.
#[derive(Debug, Clone)]
pub(crate) struct Exchange {
    pub method: String,
    pub fields: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub priority: StreamPriority,
    pub timeout: Duration,
}

/// Raw result of one exchange, before decompression and redirects.
#[derive(Debug, Clone)]
pub(crate) struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub used_early_data: bool,
    pub ttfb: Duration,
}

/// Seam between request policy and the HTTP/3 connection pool.
#[async_trait]
pub(crate) trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        host: &str,
        port: u16,
        exchange: Exchange,
    ) -> Result<RawResponse, FetchError>;

    async fn preconnect(&self, host: &str, port: u16) -> Result<(), FetchError>;
}

struct ClientInner {
    config: FetchConfig,
    cache: Cache,
    scheduler: Arc<Scheduler>,
    predictor: Arc<dyn Predictor>,
    analyzer: DependencyAnalyzer,
    early_data: Arc<EarlyDataManager>,
    dispatcher: Arc<dyn Dispatcher>,
    counters: ClientCounters,
    default_headers: HeaderMap,
    /// At-most-one concurrent populate per fingerprint.
    inflight: DashMap<String, broadcast::Sender<Result<Response, FetchError>>>,
    /// Prefetches already issued or underway, by URL.
    prefetched: DashMap<String, ()>,
}

/// Asynchronous HTTP/3 fetch client. Cheap to clone; clones share every
/// component.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    /// Build a client with the production HTTP/3 dispatcher.
    pub fn new(config: FetchConfig, tls: Arc<dyn TlsProvider>) -> HttpClient {
        let scheduler = Arc::new(Scheduler::new(config.viewport_tracking_enabled));
        let early_data = Arc::new(EarlyDataManager::new(config.early_data_allowed));
        let dispatcher = Arc::new(H3Dispatcher::new(
            tls,
            early_data.clone(),
            scheduler.clone(),
            config.clone(),
        ));
        Self::with_dispatcher(config, dispatcher, scheduler, early_data)
    }

    pub(crate) fn with_dispatcher(
        config: FetchConfig,
        dispatcher: Arc<dyn Dispatcher>,
        scheduler: Arc<Scheduler>,
        early_data: Arc<EarlyDataManager>,
    ) -> HttpClient {
        let mut default_headers = HeaderMap::new();
        default_headers.append("user-agent", "quantum/1.0");
        default_headers.append("accept", "*/*");
        default_headers.append("accept-encoding", "gzip, deflate, br");
        HttpClient {
            inner: Arc::new(ClientInner {
                cache: Cache::new(
                    config.cache_enabled,
                    config.cache_max_entries,
                    config.cache_max_bytes,
                ),
                predictor: build_predictor(config.prediction_model),
                analyzer: DependencyAnalyzer::new(config.viewport_width),
                early_data,
                dispatcher,
                counters: ClientCounters::default(),
                default_headers,
                inflight: DashMap::new(),
                prefetched: DashMap::new(),
                scheduler,
                config,
            }),
        }
    }

    /// Fetch a resource, following the configured redirect and retry
    /// policy. Successful analyzable responses feed the prefetch
    /// pipeline in the background.
    pub async fn fetch(&self, request: Request) -> Result<Response, FetchError> {
        ClientCounters::bump(&self.inner.counters.requests);
        let resource_type = request.resource_type;
        let url = request.url.clone();

        // A user request for a previously predicted URL is a prediction
        // hit.
        self.inner.predictor.record_accuracy(url.as_str(), true);

        let response = self.fetch_coalesced(request).await;
        match &response {
            Ok(response) if response.is_success() && resource_type.is_analyzable() => {
                self.spawn_prefetch(response.clone(), resource_type);
            }
            Err(_) => ClientCounters::bump(&self.inner.counters.failures),
            _ => {}
        }
        response
    }

    /// Streaming variant: the head resolves first, body chunks follow on
    /// the channel.
    pub async fn fetch_stream(
        &self,
        request: Request,
    ) -> Result<(Response, mpsc::Receiver<Bytes>), FetchError> {
        let mut response = self.fetch(request).await?;
        let body = std::mem::take(&mut response.body);
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for chunk in body.chunks(16 * 1024) {
                if tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                    break;
                }
            }
        });
        Ok((response, rx))
    }

    /// Open (or reuse) a connection to an origin ahead of need.
    pub async fn preconnect(&self, host: &str, port: u16) {
        ClientCounters::bump(&self.inner.counters.preconnects);
        if let Err(e) = self.inner.dispatcher.preconnect(host, port).await {
            debug!(host, port, %e, "preconnect failed");
        }
    }

    /// Resolve a host ahead of need; failures are irrelevant.
    pub fn dns_prefetch(&self, host: &str) {
        ClientCounters::bump(&self.inner.counters.dns_prefetches);
        let host = format!("{host}:443");
        tokio::spawn(async move {
            let _ = tokio::net::lookup_host(host).await;
        });
    }

    /// Drop any cached response for a URL.
    pub fn invalidate(&self, url: &str) {
        if let Ok(url) = normalize_url(url) {
            self.inner.cache.invalidate(&url);
        }
    }

    pub fn invalidate_origin(&self, host: &str) {
        self.inner.cache.invalidate_origin(host);
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Per-domain and per-protocol counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.counters.snapshot(
            self.inner.predictor.stats(),
            self.inner.scheduler.snapshot(),
        )
    }

    pub fn cache(&self) -> &Cache {
        &self.inner.cache
    }

    /// Serialized early-data statistics for persistence at shutdown.
    pub fn early_data_snapshot(&self) -> String {
        self.inner.early_data.snapshot_json()
    }

    // ------------------------------------------------------------------

    /// Cache lookup plus the at-most-one-populate guarantee.
    async fn fetch_coalesced(&self, request: Request) -> Result<Response, FetchError> {
        let eligible = self.inner.config.cache_enabled
            && request.cache_eligible
            && request.is_idempotent();
        let key = fingerprint(&request.url, true);

        if eligible {
            if let Some(entry) = self.inner.cache.get(&key) {
                ClientCounters::bump(&self.inner.counters.cache_hits);
                trace!(%key, "cache hit");
                return Ok(Response {
                    status: entry.status,
                    headers: entry.headers.clone(),
                    body: entry.body.clone(),
                    url: request.url.clone(),
                    from_cache: true,
                    used_early_data: false,
                    ttfb: Duration::ZERO,
                });
            }
        }

        if !eligible {
            return self.fetch_with_redirects(request).await;
        }

        // Join an in-flight populate when one exists; otherwise become it.
        let mut receiver = None;
        let sender = {
            match self.inner.inflight.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(entry) => {
                    receiver = Some(entry.get().subscribe());
                    None
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    let (tx, _) = broadcast::channel(1);
                    entry.insert(tx.clone());
                    Some(tx)
                }
            }
        };

        if let Some(mut rx) = receiver {
            trace!(%key, "awaiting in-flight populate");
            return match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Cancelled),
            };
        }

        let result = self.fetch_with_redirects(request).await;
        if let Some(tx) = sender {
            self.inner.inflight.remove(&key);
            let _ = tx.send(result.clone());
        }
        result
    }

    async fn fetch_with_redirects(&self, request: Request) -> Result<Response, FetchError> {
        let mut request = request;
        let mut budget = self.inner.config.max_redirects;
        loop {
            let response = self.fetch_with_retries(&request).await?;
            if !(response.is_redirect() && self.inner.config.follow_redirects) {
                if request.cache_eligible && request.is_idempotent() {
                    if let Some(entry) =
                        CacheEntry::from_response(&response, self.inner.config.cache_default_ttl_s)
                    {
                        self.inner
                            .cache
                            .put(fingerprint(&request.url, true), entry);
                    }
                }
                return Ok(response);
            }

            if budget == 0 {
                return Err(FetchError::TooManyRedirects);
            }
            budget -= 1;
            ClientCounters::bump(&self.inner.counters.redirects_followed);

            let location = response
                .headers
                .get("location")
                .ok_or(FetchError::BadRedirect)?;
            let target = request
                .url
                .join(location)
                .map_err(|_| FetchError::BadRedirect)?;
            if target.scheme() != "https" {
                return Err(FetchError::UnsupportedScheme(target.scheme().to_string()));
            }
            debug!(status = response.status, %target, "following redirect");

            // 307/308 preserve method and body; everything else becomes
            // a bare GET.
            if !matches!(response.status, 307 | 308) {
                request.method = "GET".to_string();
                request.body = None;
            }
            request.url = target;
        }
    }

    async fn fetch_with_retries(&self, request: &Request) -> Result<Response, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.single_request(request).await {
                Ok(response) => return Ok(response),
                Err(error)
                    if error.is_retryable() && request.is_idempotent() && attempt < 3 =>
                {
                    attempt += 1;
                    ClientCounters::bump(&self.inner.counters.retries);
                    let backoff = Duration::from_millis(100 * (1 << attempt.min(4)));
                    debug!(%error, attempt, ?backoff, "retrying request");
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn single_request(&self, request: &Request) -> Result<Response, FetchError> {
        let (host, port) = request.authority()?;
        let mut headers = request.headers.clone();
        headers.merge_defaults(&self.inner.default_headers);

        let fields = request_fields(
            &request.method,
            "https",
            &format!(
                "{host}{}",
                if port == 443 { String::new() } else { format!(":{port}") }
            ),
            &request.path_and_query(),
            &headers,
        )
        .map_err(|e| FetchError::Protocol(e.to_string()))?;

        let prediction_factor = self.inner.predictor.prediction_factor(request.url.as_str());
        let mut priority = self.inner.scheduler.priority(
            request.resource_type,
            &host,
            request.in_viewport,
            prediction_factor,
        );
        if request.background {
            priority.class = crate::scheduler::PriorityClass::Background as u8;
        }
        let timeout = Duration::from_millis(self.inner.config.default_timeout_ms);
        let exchange = Exchange {
            method: request.method.clone(),
            fields,
            body: request.body.clone(),
            priority,
            timeout,
        };

        // The dispatcher enforces the deadline on the stream (RESET with
        // REQUEST_CANCELLED); this outer bound covers dispatch itself.
        let raw = tokio::time::timeout(
            timeout + Duration::from_millis(250),
            self.inner.dispatcher.dispatch(&host, port, exchange),
        )
        .await
        .map_err(|_| FetchError::Timeout)??;

        self.inner
            .scheduler
            .record_request(&host, (200..500).contains(&raw.status), raw.ttfb);

        let body = decode_body(raw.headers.get("content-encoding"), raw.body);
        Ok(Response {
            status: raw.status,
            headers: raw.headers,
            body,
            url: request.url.clone(),
            from_cache: false,
            used_early_data: raw.used_early_data,
            ttfb: raw.ttfb,
        })
    }

    /// Analyze a completed document and issue speculative prefetches.
    fn spawn_prefetch(&self, response: Response, resource_type: ResourceType) {
        let client = self.clone();
        tokio::spawn(async move {
            client.run_prefetch(response, resource_type).await;
        });
    }

    async fn run_prefetch(&self, response: Response, resource_type: ResourceType) {
        let refs = self
            .inner
            .analyzer
            .analyze(resource_type, &response.body, &response.url);
        if refs.is_empty() {
            return;
        }
        let origin = response.url.host_str().unwrap_or_default().to_string();

        // Connection warm-up actions first; they fetch nothing.
        for r in &refs {
            match r.action {
                RefAction::Preconnect => {
                    let (host, port) = (
                        r.url.host_str().unwrap_or_default().to_string(),
                        r.url.port_or_known_default().unwrap_or(443),
                    );
                    self.preconnect(&host, port).await;
                }
                RefAction::DnsPrefetch => {
                    if let Some(host) = r.url.host_str() {
                        self.dns_prefetch(host);
                    }
                }
                RefAction::Fetch => {}
            }
        }

        let ranked = self.inner.predictor.rank(&origin, &refs);
        let mut issued = 0usize;
        for prediction in ranked {
            if issued >= self.inner.config.prefetch_top_k {
                break;
            }
            let url_string = prediction.url.to_string();
            // Deduplicate against cache contents and prior prefetches.
            let key = fingerprint(&prediction.url, true);
            if self.inner.cache.get(&key).is_some() {
                continue;
            }
            if self.inner.prefetched.insert(url_string.clone(), ()).is_some() {
                continue;
            }
            self.inner.predictor.record_prediction(&origin, &prediction);
            ClientCounters::bump(&self.inner.counters.prefetches_issued);
            issued += 1;

            let mut request = match Request::get(&url_string) {
                Ok(request) => request.with_type(prediction.resource_type),
                Err(_) => continue,
            };
            // Prefetches never outrank user-initiated requests.
            request.in_viewport = false;
            request.background = true;
            let client = self.clone();
            trace!(url = %url_string, probability = prediction.probability, "prefetching");
            tokio::spawn(async move {
                let _ = client.prefetch_request(request).await;
            });
        }
    }

    /// A prefetch is a plain background fetch that skips re-analysis.
    async fn prefetch_request(&self, request: Request) -> Result<Response, FetchError> {
        let mut request = request;
        request.headers.append("purpose", "prefetch");
        self.fetch_coalesced(request).await
    }
}

// ----------------------------------------------------------------------
// Production dispatcher: one task per QUIC connection.
// ----------------------------------------------------------------------

struct Job {
    exchange: Exchange,
    resp: oneshot::Sender<Result<RawResponse, FetchError>>,
}

struct H3Dispatcher {
    tls: Arc<dyn TlsProvider>,
    early_data: Arc<EarlyDataManager>,
    scheduler: Arc<Scheduler>,
    config: FetchConfig,
    pool: DashMap<String, mpsc::Sender<Job>>,
}

impl H3Dispatcher {
    fn new(
        tls: Arc<dyn TlsProvider>,
        early_data: Arc<EarlyDataManager>,
        scheduler: Arc<Scheduler>,
        config: FetchConfig,
    ) -> H3Dispatcher {
        H3Dispatcher { tls, early_data, scheduler, config, pool: DashMap::new() }
    }

    fn slot(&self, host: &str, port: u16) -> mpsc::Sender<Job> {
        let key = format!("{host}:{port}");
        if let Some(slot) = self.pool.get(&key) {
            if !slot.is_closed() {
                return slot.clone();
            }
        }
        let (tx, rx) = mpsc::channel(64);
        self.pool.insert(key, tx.clone());
        let task = ConnectionTask {
            host: host.to_string(),
            port,
            tls: self.tls.clone(),
            early_data: self.early_data.clone(),
            scheduler: self.scheduler.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(task.run(rx));
        tx
    }
}

#[async_trait]
impl Dispatcher for H3Dispatcher {
    async fn dispatch(
        &self,
        host: &str,
        port: u16,
        exchange: Exchange,
    ) -> Result<RawResponse, FetchError> {
        for _ in 0..2 {
            let slot = self.slot(host, port);
            let (resp, rx) = oneshot::channel();
            if slot.send(Job { exchange: exchange.clone(), resp }).await.is_err() {
                // Stale slot; a fresh connection task replaces it.
                continue;
            }
            return rx.await.map_err(|_| {
                FetchError::Connection("connection task ended".to_string())
            })?;
        }
        Err(FetchError::Connection("no usable connection".to_string()))
    }

    async fn preconnect(&self, host: &str, port: u16) -> Result<(), FetchError> {
        let _ = self.slot(host, port);
        Ok(())
    }
}

struct PendingRequest {
    resp: oneshot::Sender<Result<RawResponse, FetchError>>,
    status: Option<u16>,
    headers: HeaderMap,
    body: bytes::BytesMut,
    deadline: tokio::time::Instant,
    started: tokio::time::Instant,
    ttfb: Option<Duration>,
    used_early_data: bool,
}

struct ConnectionTask {
    host: String,
    port: u16,
    tls: Arc<dyn TlsProvider>,
    early_data: Arc<EarlyDataManager>,
    scheduler: Arc<Scheduler>,
    config: FetchConfig,
}

impl ConnectionTask {
    async fn run(self, mut jobs: mpsc::Receiver<Job>) {
        let (mut h3, attempted_early) = match self.open().await {
            Ok(pair) => pair,
            Err(error) => {
                warn!(host = %self.host, %error, "connection setup failed");
                // Fail everything queued behind the broken connection.
                while let Some(job) = jobs.recv().await {
                    let _ = job.resp.send(Err(error.clone()));
                }
                return;
            }
        };
        self.scheduler.record_connection(&self.host);
        debug!(host = %self.host, port = self.port, attempted_early, "connection ready");

        let mut used_early_data = false;
        let mut pending: HashMap<StreamId, PendingRequest> = HashMap::new();
        'run: loop {
            // Drain queued HTTP/3 events before sleeping again.
            while let Some(event) = h3.poll_pending_event() {
                if !self
                    .on_event(&mut pending, &mut used_early_data, &mut h3, event)
                    .await
                {
                    break 'run;
                }
            }
            let next_deadline = pending.values().map(|p| p.deadline).min();
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(job) => self.submit(&mut h3, &mut pending, used_early_data, job).await,
                    None => break,
                },
                event = h3.recv_transport_event() => match event {
                    Some(event) => {
                        if let Err(error) = h3.process_transport_event(event).await {
                            let shared: FetchError = error.into();
                            for (_, request) in pending.drain() {
                                let _ = request.resp.send(Err(shared.clone()));
                            }
                            break;
                        }
                    }
                    None => break,
                },
                _ = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.expire(&mut h3, &mut pending).await;
                }
            }
        }

        for (_, request) in pending.drain() {
            let _ = request
                .resp
                .send(Err(FetchError::Connection("connection closed".to_string())));
        }
    }

    async fn open(&self) -> Result<(H3Connection, bool), FetchError> {
        let addr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|_| FetchError::DnsFailure(self.host.clone()))?
            .next()
            .ok_or_else(|| FetchError::DnsFailure(self.host.clone()))?;

        let ticket = self.early_data.ticket_for(&self.host, self.port);
        let attempted_early = ticket.is_some();
        let session = self.tls.new_session(
            &self.host,
            &[quantum_quic::ALPN_H3],
            self.config.tls_profile,
            ticket.as_ref().map(|t| t.ticket.as_slice()),
        );

        let conn_config = ConnectionConfig {
            keep_alive: Some(Duration::from_secs(self.config.keepalive_interval_s)),
            ..ConnectionConfig::default()
        };
        let conn = Connection::new_client(
            session,
            conn_config,
            attempted_early,
            ticket.as_ref().map(|t| t.transport_params.as_slice()),
            std::time::Instant::now(),
        )?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let (driver, handle) = ConnectionDriver::bind(addr, conn, events_tx)
            .await
            .map_err(|e| FetchError::Connection(e.to_string()))?;
        tokio::spawn(driver.run());

        let h3 = H3Connection::new(handle, events_rx, attempted_early).await?;
        Ok((h3, attempted_early))
    }

    async fn submit(
        &self,
        h3: &mut H3Connection,
        pending: &mut HashMap<StreamId, PendingRequest>,
        used_early_data: bool,
        job: Job,
    ) {
        let now = tokio::time::Instant::now();
        match h3
            .send_request(&job.exchange.fields, job.exchange.body.clone(), job.exchange.priority)
            .await
        {
            Ok(stream) => {
                pending.insert(
                    stream,
                    PendingRequest {
                        resp: job.resp,
                        status: None,
                        headers: HeaderMap::new(),
                        body: bytes::BytesMut::new(),
                        deadline: now + job.exchange.timeout,
                        started: now,
                        ttfb: None,
                        used_early_data,
                    },
                );
            }
            Err(error) => {
                let _ = job.resp.send(Err(error.into()));
            }
        }
    }

    /// Returns false when the connection is finished.
    async fn on_event(
        &self,
        pending: &mut HashMap<StreamId, PendingRequest>,
        used_early_data: &mut bool,
        h3: &mut H3Connection,
        event: H3Event,
    ) -> bool {
        match event {
            H3Event::Connected { used_early_data: used } => {
                *used_early_data = used;
                if used {
                    self.early_data.record_acceptance(&self.host, self.port);
                    // Requests already in flight rode the 0-RTT packets.
                    for request in pending.values_mut() {
                        request.used_early_data = true;
                    }
                }
            }
            H3Event::ZeroRttRejected => {
                self.early_data.record_rejection(&self.host, self.port);
            }
            H3Event::Headers { stream, fields, fin } => {
                let abandoned = {
                    let Some(request) = pending.get_mut(&stream) else { return true };
                    if request.resp.is_closed() {
                        true
                    } else {
                        match quantum_http3::headers::response_from_fields(&fields) {
                            Ok((status, headers)) => {
                                if request.status.is_none() {
                                    request.status = Some(status);
                                    request.headers = headers;
                                    request.ttfb = Some(request.started.elapsed());
                                }
                                // Trailer sections are dropped.
                            }
                            Err(e) => {
                                if let Some(request) = pending.remove(&stream) {
                                    let _ = request.resp.send(Err(e.into()));
                                }
                                return true;
                            }
                        }
                        false
                    }
                };
                if abandoned {
                    pending.remove(&stream);
                    h3.cancel_request(stream).await;
                    return true;
                }
                if fin {
                    Self::complete(pending, stream);
                }
            }
            H3Event::Data { stream, data, fin } => {
                let Some(request) = pending.get_mut(&stream) else { return true };
                if request.resp.is_closed() {
                    pending.remove(&stream);
                    h3.cancel_request(stream).await;
                    return true;
                }
                request.body.extend_from_slice(&data);
                if fin {
                    Self::complete(pending, stream);
                }
            }
            H3Event::Reset { stream, error_code } => {
                if let Some(request) = pending.remove(&stream) {
                    let _ = request.resp.send(Err(FetchError::StreamReset(error_code)));
                }
            }
            H3Event::GoAway { last_stream_id } => {
                debug!(host = %self.host, last_stream_id, "server going away");
            }
            H3Event::SessionTicket { ticket, suite } => {
                let params = h3.quic().peer_params().await;
                self.early_data.store_ticket(SessionTicket::new(
                    &self.host,
                    self.port,
                    ticket,
                    7200,
                    suite,
                    params.map(|p| p.encode()).unwrap_or_default(),
                ));
            }
            H3Event::NewToken(token) => {
                self.early_data.store_token(&self.host, self.port, token);
            }
            H3Event::Error(error) => {
                let shared: FetchError = error.into();
                for (_, request) in pending.drain() {
                    let _ = request.resp.send(Err(shared.clone()));
                }
                return false;
            }
            H3Event::Closed(error) => {
                let shared: FetchError = error.into();
                for (_, request) in pending.drain() {
                    let _ = request.resp.send(Err(shared.clone()));
                }
                return false;
            }
        }
        true
    }

    fn complete(pending: &mut HashMap<StreamId, PendingRequest>, stream: StreamId) {
        let Some(request) = pending.remove(&stream) else { return };
        let Some(status) = request.status else {
            let _ = request.resp.send(Err(FetchError::Incomplete));
            return;
        };
        let raw = RawResponse {
            status,
            headers: request.headers,
            body: request.body.freeze(),
            used_early_data: request.used_early_data,
            ttfb: request.ttfb.unwrap_or_default(),
        };
        let _ = request.resp.send(Ok(raw));
    }

    async fn expire(
        &self,
        h3: &mut H3Connection,
        pending: &mut HashMap<StreamId, PendingRequest>,
    ) {
        let now = tokio::time::Instant::now();
        let expired: Vec<StreamId> = pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for stream in expired {
            debug!(?stream, "request deadline reached, cancelling");
            h3.cancel_request(stream).await;
            if let Some(request) = pending.remove(&stream) {
                let _ = request.resp.send(Err(FetchError::Timeout));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PredictionModel;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone)]
    struct CallRecord {
        method: String,
        path: String,
        body: Option<Vec<u8>>,
        priority_class: u8,
    }

    type Handler =
        Box<dyn Fn(u64, &Exchange) -> Result<RawResponse, FetchError> + Send + Sync>;

    struct MockDispatcher {
        calls: Mutex<Vec<CallRecord>>,
        seq: AtomicU64,
        delay: Duration,
        handler: Handler,
    }

    impl MockDispatcher {
        fn new(delay: Duration, handler: Handler) -> Arc<MockDispatcher> {
            Arc::new(MockDispatcher {
                calls: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                delay,
                handler,
            })
        }

        fn calls(&self) -> Vec<CallRecord> {
            self.calls.lock().clone()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl Dispatcher for MockDispatcher {
        async fn dispatch(
            &self,
            _host: &str,
            _port: u16,
            exchange: Exchange,
        ) -> Result<RawResponse, FetchError> {
            let path = exchange
                .fields
                .iter()
                .find(|(n, _)| n == ":path")
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            self.calls.lock().push(CallRecord {
                method: exchange.method.clone(),
                path,
                body: exchange.body.as_ref().map(|b| b.to_vec()),
                priority_class: exchange.priority.class,
            });
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            (self.handler)(seq, &exchange)
        }

        async fn preconnect(&self, _host: &str, _port: u16) -> Result<(), FetchError> {
            Ok(())
        }
    }

    fn ok(status: u16, headers: &[(&str, &str)], body: &[u8]) -> Result<RawResponse, FetchError> {
        let mut map = HeaderMap::new();
        for (n, v) in headers {
            map.append(n, v);
        }
        Ok(RawResponse {
            status,
            headers: map,
            body: Bytes::copy_from_slice(body),
            used_early_data: false,
            ttfb: Duration::from_millis(20),
        })
    }

    fn client_with(
        config: FetchConfig,
        dispatcher: Arc<MockDispatcher>,
    ) -> HttpClient {
        let scheduler = Arc::new(Scheduler::new(config.viewport_tracking_enabled));
        let early_data = Arc::new(EarlyDataManager::new(config.early_data_allowed));
        HttpClient::with_dispatcher(config, dispatcher, scheduler, early_data)
    }

    #[tokio::test]
    async fn test_fresh_get_then_cache_hit() {
        let mock = MockDispatcher::new(
            Duration::ZERO,
            Box::new(|_, _| ok(200, &[("content-type", "text/plain")], b"OK")),
        );
        let client = client_with(FetchConfig::default(), mock.clone());

        let request = Request::get("https://example.test/index.html").unwrap();
        let response = client.fetch(request.clone()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_ref(), b"OK");
        assert!(!response.from_cache);
        assert_eq!(mock.call_count(), 1);

        // Identical fetch is served from the cache, no network activity.
        let response = client.fetch(request).await.unwrap();
        assert!(response.from_cache);
        assert_eq!(response.body.as_ref(), b"OK");
        assert_eq!(mock.call_count(), 1);
        assert_eq!(client.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_cause_one_populate() {
        let mock = MockDispatcher::new(
            Duration::from_millis(50),
            Box::new(|_, _| ok(200, &[], b"shared")),
        );
        let client = client_with(FetchConfig::default(), mock.clone());

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client
                    .fetch(Request::get("https://example.test/shared").unwrap())
                    .await
            }));
        }
        for task in tasks {
            let response = task.await.unwrap().unwrap();
            assert_eq!(response.body.as_ref(), b"shared");
        }
        assert_eq!(mock.call_count(), 1, "exactly one network request");
    }

    #[tokio::test]
    async fn test_redirect_preserves_method_for_308() {
        let mock = MockDispatcher::new(
            Duration::ZERO,
            Box::new(|seq, _| {
                if seq == 0 {
                    ok(308, &[("location", "/new")], b"")
                } else {
                    ok(200, &[], b"moved")
                }
            }),
        );
        let client = client_with(FetchConfig::default(), mock.clone());

        let request = Request::new("POST", "https://example.test/submit")
            .unwrap()
            .with_body(Bytes::from_static(b"x"));
        let response = client.fetch(request).await.unwrap();
        assert_eq!(response.status, 200);

        let calls = mock.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].method, "POST");
        assert_eq!(calls[1].path, "/new");
        assert_eq!(calls[1].body.as_deref(), Some(&b"x"[..]));
    }

    #[tokio::test]
    async fn test_redirect_converts_to_get_for_302() {
        let mock = MockDispatcher::new(
            Duration::ZERO,
            Box::new(|seq, _| {
                if seq == 0 {
                    ok(302, &[("location", "/new")], b"")
                } else {
                    ok(200, &[], b"moved")
                }
            }),
        );
        let client = client_with(FetchConfig::default(), mock.clone());

        let request = Request::new("POST", "https://example.test/submit")
            .unwrap()
            .with_body(Bytes::from_static(b"x"));
        client.fetch(request).await.unwrap();

        let calls = mock.calls();
        assert_eq!(calls[1].method, "GET");
        assert!(calls[1].body.is_none());
    }

    #[tokio::test]
    async fn test_redirect_budget_exhausted() {
        let mock = MockDispatcher::new(
            Duration::ZERO,
            Box::new(|seq, _| ok(301, &[("location", format!("/hop{seq}").leak())], b"")),
        );
        let mut config = FetchConfig::default();
        config.max_redirects = 3;
        let client = client_with(config, mock.clone());

        let result = client
            .fetch(Request::get("https://example.test/start").unwrap())
            .await;
        assert_eq!(result.unwrap_err(), FetchError::TooManyRedirects);
        // Initial request plus one per allowed redirect, nothing extra.
        assert_eq!(mock.call_count(), 4);
    }

    #[tokio::test]
    async fn test_retry_on_cancelled_then_success() {
        let mock = MockDispatcher::new(
            Duration::ZERO,
            Box::new(|seq, _| {
                if seq == 0 {
                    Err(FetchError::StreamReset(0x010c))
                } else {
                    ok(200, &[], b"second try")
                }
            }),
        );
        let client = client_with(FetchConfig::default(), mock.clone());
        let response = client
            .fetch(Request::get("https://example.test/flaky").unwrap())
            .await
            .unwrap();
        assert_eq!(response.body.as_ref(), b"second try");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(client.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_post_not_retried() {
        let mock = MockDispatcher::new(
            Duration::ZERO,
            Box::new(|_, _| Err(FetchError::StreamReset(0x010c))),
        );
        let client = client_with(FetchConfig::default(), mock.clone());
        let request = Request::new("POST", "https://example.test/once")
            .unwrap()
            .with_body(Bytes::from_static(b"payload"));
        let result = client.fetch(request).await;
        assert!(result.is_err());
        assert_eq!(mock.call_count(), 1, "non-idempotent requests never retry");
    }

    #[tokio::test]
    async fn test_timeout_surfaces() {
        let mock = MockDispatcher::new(
            Duration::from_millis(500),
            Box::new(|_, _| ok(200, &[], b"late")),
        );
        let mut config = FetchConfig::default();
        config.default_timeout_ms = 50;
        let client = client_with(config, mock);
        let result = client
            .fetch(Request::get("https://example.test/slow").unwrap())
            .await;
        assert_eq!(result.unwrap_err(), FetchError::Timeout);
    }

    #[tokio::test]
    async fn test_prefetch_pipeline() {
        const PAGE: &[u8] = br#"<html><head>
            <link rel="stylesheet" href="/s.css">
            <link rel="stylesheet" href="/s.css">
        </head><body><img src="/i.png"></body></html>"#;

        let mock = MockDispatcher::new(
            Duration::ZERO,
            Box::new(|_, exchange| {
                let path = exchange
                    .fields
                    .iter()
                    .find(|(n, _)| n == ":path")
                    .map(|(_, v)| v.as_str())
                    .unwrap_or("");
                if path == "/page.html" {
                    ok(200, &[("content-type", "text/html")], PAGE)
                } else {
                    ok(200, &[], b"asset")
                }
            }),
        );
        let client = client_with(FetchConfig::default(), mock.clone());

        let request = Request::get("https://example.test/page.html")
            .unwrap()
            .with_type(ResourceType::Document);
        client.fetch(request).await.unwrap();

        // Both dependencies are prefetched shortly after the document.
        let mut paths: Vec<String> = Vec::new();
        for _ in 0..100 {
            paths = mock.calls().iter().map(|c| c.path.clone()).collect();
            if paths.iter().any(|p| p == "/s.css") && paths.iter().any(|p| p == "/i.png") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(paths.iter().any(|p| p == "/s.css"), "stylesheet prefetched");
        assert!(paths.iter().any(|p| p == "/i.png"), "image prefetched");
        // Duplicate stylesheet reference produced a single prefetch.
        assert_eq!(paths.iter().filter(|p| *p == "/s.css").count(), 1);

        // Prefetches run below user-initiated priority.
        for call in mock.calls().iter().filter(|c| c.path != "/page.html") {
            assert!(call.priority_class >= 3, "prefetch class {}", call.priority_class);
        }

        let stats = client.stats();
        assert_eq!(stats.prefetches_issued, 2);
        assert_eq!(stats.prediction.total_predictions, 2);

        // The page later requests the stylesheet: the prediction was used.
        let request = Request::get("https://example.test/s.css")
            .unwrap()
            .with_type(ResourceType::Stylesheet);
        client.fetch(request).await.unwrap();
        let stats = client.stats();
        assert_eq!(stats.prediction.successful_predictions, 1);
        assert!(stats.prediction.successful_predictions <= stats.prediction.total_predictions);
    }

    #[tokio::test]
    async fn test_prediction_disabled_no_prefetch() {
        const PAGE: &[u8] = br#"<link rel="stylesheet" href="/s.css">"#;
        let mock = MockDispatcher::new(
            Duration::ZERO,
            Box::new(|_, _| ok(200, &[("content-type", "text/html")], PAGE)),
        );
        let mut config = FetchConfig::default();
        config.prediction_model = PredictionModel::Disabled;
        let client = client_with(config, mock.clone());

        let request = Request::get("https://example.test/page.html")
            .unwrap()
            .with_type(ResourceType::Document);
        client.fetch(request).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mock.call_count(), 1, "no prefetch with prediction disabled");
    }

    #[tokio::test]
    async fn test_gzip_body_decoded() {
        use std::io::Write;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let compressed = encoder.finish().unwrap();
        let compressed: &'static [u8] = compressed.leak();

        let mock = MockDispatcher::new(
            Duration::ZERO,
            Box::new(move |_, _| ok(200, &[("content-encoding", "gzip")], compressed)),
        );
        let client = client_with(FetchConfig::default(), mock);
        let response = client
            .fetch(Request::get("https://example.test/z").unwrap())
            .await
            .unwrap();
        assert_eq!(response.body.as_ref(), b"compressed payload");
    }

    #[tokio::test]
    async fn test_domain_stats_updated() {
        let mock =
            MockDispatcher::new(Duration::ZERO, Box::new(|_, _| ok(200, &[], b"ok")));
        let client = client_with(FetchConfig::default(), mock);
        client
            .fetch(Request::get("https://example.test/a").unwrap())
            .await
            .unwrap();
        let stats = client.stats();
        let domain = stats.domains.get("example.test").expect("domain tracked");
        assert_eq!(domain.request_count, 1);
        assert_eq!(domain.success_count, 1);
        assert!(domain.avg_ttfb_ms > 0.0);
    }

    #[tokio::test]
    async fn test_fetch_stream_delivers_head_then_body() {
        let mock =
            MockDispatcher::new(Duration::ZERO, Box::new(|_, _| ok(200, &[], b"streamed body")));
        let client = client_with(FetchConfig::default(), mock);
        let (head, mut body_rx) = client
            .fetch_stream(Request::get("https://example.test/s").unwrap())
            .await
            .unwrap();
        assert_eq!(head.status, 200);
        assert!(head.body.is_empty());
        let mut body = Vec::new();
        while let Some(chunk) = body_rx.recv().await {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, b"streamed body");
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let mock = MockDispatcher::new(Duration::ZERO, Box::new(|_, _| ok(200, &[], b"v")));
        let client = client_with(FetchConfig::default(), mock.clone());
        let request = Request::get("https://example.test/inv").unwrap();
        client.fetch(request.clone()).await.unwrap();
        client.invalidate("https://example.test/inv");
        client.fetch(request).await.unwrap();
        assert_eq!(mock.call_count(), 2);
    }
}
