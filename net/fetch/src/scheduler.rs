//! Resource scheduling: priority classes, weights and per-domain quality.
//!
//! weight = base(type) · domain_quality · viewport_factor ·
//! prediction_factor, clamped to [0.1, 10.0]. Domain quality blends a
//! TTFB factor with the observed success rate and feeds back into every
//! subsequent request against that host.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::trace;

use quantum_quic::StreamPriority;

use crate::request::ResourceType;

/// Stream priority classes, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityClass {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl PriorityClass {
    /// Priority class for a resource type.
    pub fn for_type(resource_type: ResourceType) -> PriorityClass {
        match resource_type {
            ResourceType::Document => PriorityClass::Critical,
            ResourceType::Stylesheet | ResourceType::Script | ResourceType::Font => {
                PriorityClass::High
            }
            ResourceType::Image | ResourceType::Media => PriorityClass::Normal,
            ResourceType::Fetch | ResourceType::Xhr | ResourceType::WebSocket => {
                PriorityClass::Low
            }
            ResourceType::Other => PriorityClass::Background,
        }
    }
}

/// Observed quality statistics for one host.
#[derive(Debug, Clone)]
pub struct DomainStats {
    pub connection_count: u64,
    pub request_count: u64,
    pub success_count: u64,
    /// Exponentially weighted average TTFB in milliseconds.
    pub avg_ttfb_ms: f64,
    pub last_connect: Option<DateTime<Utc>>,
}

impl Default for DomainStats {
    fn default() -> Self {
        DomainStats {
            connection_count: 0,
            request_count: 0,
            success_count: 0,
            avg_ttfb_ms: 0.0,
            last_connect: None,
        }
    }
}

impl DomainStats {
    pub fn success_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.request_count as f64
    }

    /// connection_quality ∈ [0.3, 1.0]:
    /// `ttfb_factor · success_rate` with
    /// `ttfb_factor = clamp(0.3 + 0.7·(1 − min(1, avg_ttfb_ms/1000)), 0.3, 1.0)`.
    pub fn connection_quality(&self) -> f64 {
        let ttfb_factor =
            (0.3 + 0.7 * (1.0 - (self.avg_ttfb_ms / 1000.0).min(1.0))).clamp(0.3, 1.0);
        (ttfb_factor * self.success_rate()).clamp(0.3, 1.0)
    }
}

/// Shared scheduler: weight computation plus the domain statistics map.
pub struct Scheduler {
    domains: RwLock<HashMap<String, DomainStats>>,
    viewport_tracking: bool,
}

impl Scheduler {
    pub fn new(viewport_tracking: bool) -> Scheduler {
        Scheduler { domains: RwLock::new(HashMap::new()), viewport_tracking }
    }

    /// Compute the request weight, clamped to [0.1, 10.0].
    pub fn weight(
        &self,
        resource_type: ResourceType,
        host: &str,
        in_viewport: bool,
        prediction_factor: f64,
    ) -> f64 {
        let quality = {
            let domains = self.domains.read();
            domains
                .get(host)
                .map(DomainStats::connection_quality)
                .unwrap_or(1.0)
        };
        let viewport_factor =
            if self.viewport_tracking && in_viewport { 2.0 } else { 1.0 };
        let prediction_factor = prediction_factor.clamp(0.2, 2.0);
        let weight =
            resource_type.base_weight() * quality * viewport_factor * prediction_factor;
        weight.clamp(0.1, 10.0)
    }

    /// Weight and class combined into a QUIC stream priority.
    pub fn priority(
        &self,
        resource_type: ResourceType,
        host: &str,
        in_viewport: bool,
        prediction_factor: f64,
    ) -> StreamPriority {
        StreamPriority {
            class: PriorityClass::for_type(resource_type) as u8,
            weight: self.weight(resource_type, host, in_viewport, prediction_factor),
        }
    }

    pub fn record_connection(&self, host: &str) {
        let mut domains = self.domains.write();
        let stats = domains.entry(host.to_string()).or_default();
        stats.connection_count += 1;
        stats.last_connect = Some(Utc::now());
    }

    /// Record a finished request's outcome and TTFB sample.
    pub fn record_request(&self, host: &str, success: bool, ttfb: Duration) {
        let mut domains = self.domains.write();
        let stats = domains.entry(host.to_string()).or_default();
        stats.request_count += 1;
        if success {
            stats.success_count += 1;
        }
        let sample = ttfb.as_secs_f64() * 1000.0;
        stats.avg_ttfb_ms = if stats.request_count == 1 {
            sample
        } else {
            stats.avg_ttfb_ms * 0.8 + sample * 0.2
        };
        trace!(
            host,
            success,
            ttfb_ms = sample,
            quality = stats.connection_quality(),
            "domain stats updated"
        );
    }

    pub fn domain(&self, host: &str) -> Option<DomainStats> {
        self.domains.read().get(host).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, DomainStats> {
        self.domains.read().clone()
    }
}
