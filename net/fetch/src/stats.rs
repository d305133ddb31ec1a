//! Client-wide counters exposed through `HttpClient::stats`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::predict::PredictionStats;
use crate::scheduler::DomainStats;

/// Monotonic counters for the whole client.
#[derive(Debug, Default)]
pub struct ClientCounters {
    pub requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub redirects_followed: AtomicU64,
    pub retries: AtomicU64,
    pub prefetches_issued: AtomicU64,
    pub preconnects: AtomicU64,
    pub dns_prefetches: AtomicU64,
    pub failures: AtomicU64,
}

impl ClientCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot handed to telemetry and the `stats()` API.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub redirects_followed: u64,
    pub retries: u64,
    pub prefetches_issued: u64,
    pub preconnects: u64,
    pub dns_prefetches: u64,
    pub failures: u64,
    pub prediction: PredictionStats,
    #[serde(skip)]
    pub domains: HashMap<String, DomainStats>,
}

impl ClientCounters {
    pub fn snapshot(
        &self,
        prediction: PredictionStats,
        domains: HashMap<String, DomainStats>,
    ) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            redirects_followed: self.redirects_followed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            prefetches_issued: self.prefetches_issued.load(Ordering::Relaxed),
            preconnects: self.preconnects.load(Ordering::Relaxed),
            dns_prefetches: self.dns_prefetches.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            prediction,
            domains,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let counters = ClientCounters::default();
        ClientCounters::bump(&counters.requests);
        ClientCounters::bump(&counters.requests);
        ClientCounters::bump(&counters.cache_hits);
        let snapshot = counters.snapshot(PredictionStats::default(), HashMap::new());
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.failures, 0);
    }
}
