//! In-memory response cache with LRU eviction under dual bounds.
//!
//! Keys are request fingerprints (scheme, host, port, path, query).
//! Expiry comes from Cache-Control max-age, then the Expires header, then
//! a configurable default. The at-most-one-populate guarantee for
//! concurrent fetches is enforced by the client, not here.

use std::num::NonZeroUsize;

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};
use url::Url;

use quantum_http3::HeaderMap;

use crate::request::Response;

/// Cache key for a request: normalized (scheme, host, port, path, query).
pub fn fingerprint(url: &Url, include_query: bool) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = url.port_or_known_default().unwrap_or(443);
    match url.query().filter(|_| include_query) {
        Some(query) => format!("{}://{}:{}{}?{}", url.scheme(), host, port, url.path(), query),
        None => format!("{}://{}:{}{}", url.scheme(), host, port, url.path()),
    }
}

/// One cached response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Build an entry from a response, or `None` when the response is
    /// not cacheable (no-store, or non-cacheable status).
    pub fn from_response(response: &Response, default_ttl_s: u64) -> Option<CacheEntry> {
        if !matches!(response.status, 200 | 203 | 204 | 301 | 308 | 404 | 410) {
            return None;
        }
        let cache_control = response.headers.get("cache-control").unwrap_or("");
        if cache_control.contains("no-store") {
            return None;
        }
        let now = Utc::now();
        let expires_at = ttl_from_headers(&response.headers, now)
            .unwrap_or_else(|| now + ChronoDuration::seconds(default_ttl_s as i64));
        Some(CacheEntry {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            content_type: response.headers.get("content-type").map(str::to_string),
            etag: response.headers.get("etag").map(str::to_string),
            last_modified: response.headers.get("last-modified").map(str::to_string),
            expires_at,
            stored_at: now,
        })
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn size(&self) -> u64 {
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|(n, v)| n.len() + v.len())
            .sum();
        (self.body.len() + header_bytes + 64) as u64
    }
}

fn ttl_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(cache_control) = headers.get("cache-control") {
        for directive in cache_control.split(',') {
            let directive = directive.trim();
            if let Some(value) = directive.strip_prefix("max-age=") {
                if let Ok(seconds) = value.parse::<i64>() {
                    return Some(now + ChronoDuration::seconds(seconds));
                }
            }
        }
        if cache_control.contains("no-cache") {
            return Some(now);
        }
    }
    let expires = headers.get("expires")?;
    let system_time = httpdate::parse_http_date(expires).ok()?;
    Some(DateTime::<Utc>::from(system_time))
}

struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    total_bytes: u64,
}

/// Shared response cache.
pub struct Cache {
    inner: Mutex<CacheInner>,
    max_bytes: u64,
    enabled: bool,
}

impl Cache {
    pub fn new(enabled: bool, max_entries: usize, max_bytes: u64) -> Cache {
        let capacity = NonZeroUsize::new(max_entries.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Cache {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(capacity),
                total_bytes: 0,
            }),
            max_bytes,
            enabled,
        }
    }

    /// Fresh entry for a fingerprint; expired entries are dropped.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }
        let mut inner = self.inner.lock();
        let fresh = match inner.entries.get(key) {
            Some(entry) => entry.is_fresh(Utc::now()),
            None => return None,
        };
        if !fresh {
            if let Some(old) = inner.entries.pop(key) {
                inner.total_bytes -= old.size();
            }
            trace!(key, "cache entry expired");
            return None;
        }
        inner.entries.get(key).cloned()
    }

    /// Insert an entry, evicting least-recently-used entries while either
    /// bound is exceeded.
    pub fn put(&self, key: String, entry: CacheEntry) {
        if !self.enabled {
            return;
        }
        let size = entry.size();
        if size > self.max_bytes {
            debug!(%key, size, "entry larger than the cache, not stored");
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(&key) {
            inner.total_bytes -= old.size();
        }
        // LruCache::push evicts by count on its own; track the displaced
        // entry's bytes.
        if let Some((_, displaced)) = inner.entries.push(key, entry) {
            inner.total_bytes -= displaced.size();
        }
        inner.total_bytes += size;
        while inner.total_bytes > self.max_bytes {
            let Some((_, evicted)) = inner.entries.pop_lru() else { break };
            inner.total_bytes -= evicted.size();
        }
    }

    /// Drop the entry for one URL (with and without its query form).
    pub fn invalidate(&self, url: &Url) {
        let mut inner = self.inner.lock();
        for key in [fingerprint(url, true), fingerprint(url, false)] {
            if let Some(old) = inner.entries.pop(&key) {
                inner.total_bytes -= old.size();
            }
        }
    }

    /// Drop every entry for an origin host.
    pub fn invalidate_origin(&self, host: &str) {
        let mut inner = self.inner.lock();
        let needle = format!("://{host}:");
        let keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.contains(&needle))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            if let Some(old) = inner.entries.pop(&key) {
                inner.total_bytes -= old.size();
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::normalize_url;
    use std::time::Duration;

    fn response(url: &str, body: &'static [u8], headers: &[(&str, &str)]) -> Response {
        let mut map = HeaderMap::new();
        for (n, v) in headers {
            map.append(n, v);
        }
        Response {
            status: 200,
            headers: map,
            body: Bytes::from_static(body),
            url: normalize_url(url).unwrap(),
            from_cache: false,
            used_early_data: false,
            ttfb: Duration::ZERO,
        }
    }

    #[test]
    fn test_fingerprint_forms() {
        let url = normalize_url("https://example.test/a?q=1").unwrap();
        assert_eq!(fingerprint(&url, true), "https://example.test:443/a?q=1");
        assert_eq!(fingerprint(&url, false), "https://example.test:443/a");
    }

    #[test]
    fn test_put_get_round_trip() {
        let cache = Cache::new(true, 16, 1 << 20);
        let response = response("https://example.test/x", b"body", &[]);
        let key = fingerprint(&response.url, true);
        let entry = CacheEntry::from_response(&response, 3600).unwrap();
        cache.put(key.clone(), entry);
        let hit = cache.get(&key).expect("cache hit");
        assert_eq!(hit.body.as_ref(), b"body");
    }

    #[test]
    fn test_no_store_not_cached() {
        let response = response(
            "https://example.test/x",
            b"body",
            &[("cache-control", "no-store")],
        );
        assert!(CacheEntry::from_response(&response, 3600).is_none());
    }

    #[test]
    fn test_max_age_overrides_default() {
        let response = response(
            "https://example.test/x",
            b"b",
            &[("cache-control", "public, max-age=60")],
        );
        let entry = CacheEntry::from_response(&response, 86_400).unwrap();
        let lifetime = entry.expires_at - entry.stored_at;
        assert!(lifetime <= ChronoDuration::seconds(61));
        assert!(lifetime >= ChronoDuration::seconds(59));
    }

    #[test]
    fn test_expires_header_used_without_max_age() {
        let response = response(
            "https://example.test/x",
            b"b",
            &[("expires", "Wed, 21 Oct 2015 07:28:00 GMT")],
        );
        let entry = CacheEntry::from_response(&response, 86_400).unwrap();
        assert!(!entry.is_fresh(Utc::now()), "2015 date is long expired");
    }

    #[test]
    fn test_entry_count_bound() {
        let cache = Cache::new(true, 2, 1 << 20);
        for i in 0..3 {
            let url = format!("https://example.test/{i}");
            let response = response(Box::leak(url.clone().into_boxed_str()), b"b", &[]);
            let entry = CacheEntry::from_response(&response, 3600).unwrap();
            cache.put(fingerprint(&response.url, true), entry);
        }
        assert_eq!(cache.len(), 2);
        // Oldest key evicted.
        assert!(cache.get("https://example.test:443/0").is_none());
        assert!(cache.get("https://example.test:443/2").is_some());
    }

    #[test]
    fn test_byte_bound_evicts_lru() {
        let cache = Cache::new(true, 100, 400);
        for i in 0..4 {
            let url = format!("https://example.test/{i}");
            let response = response(Box::leak(url.into_boxed_str()), &[0u8; 100], &[]);
            let entry = CacheEntry::from_response(&response, 3600).unwrap();
            cache.put(fingerprint(&response.url, true), entry);
        }
        assert!(cache.total_bytes() <= 400);
        assert!(cache.len() < 4);
    }

    #[test]
    fn test_invalidate_by_url_and_origin() {
        let cache = Cache::new(true, 16, 1 << 20);
        for path in ["/a", "/b"] {
            let url = format!("https://example.test{path}");
            let response = response(Box::leak(url.into_boxed_str()), b"b", &[]);
            let entry = CacheEntry::from_response(&response, 3600).unwrap();
            cache.put(fingerprint(&response.url, true), entry);
        }
        let other = response("https://other.test/c", b"b", &[]);
        cache.put(
            fingerprint(&other.url, true),
            CacheEntry::from_response(&other, 3600).unwrap(),
        );

        cache.invalidate(&normalize_url("https://example.test/a").unwrap());
        assert!(cache.get("https://example.test:443/a").is_none());
        assert!(cache.get("https://example.test:443/b").is_some());

        cache.invalidate_origin("example.test");
        assert!(cache.get("https://example.test:443/b").is_none());
        assert!(cache.get("https://other.test:443/c").is_some());

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_disabled_cache_is_inert() {
        let cache = Cache::new(false, 16, 1 << 20);
        let response = response("https://example.test/x", b"b", &[]);
        cache.put(
            fingerprint(&response.url, true),
            CacheEntry::from_response(&response, 3600).unwrap(),
        );
        assert!(cache.get("https://example.test:443/x").is_none());
    }
}
