//! Browser-facing HTTP/3 fetch layer for the Quantum network stack.
//!
//! Turns page-load requests into prioritized QUIC streams: cache-first
//! lookup, per-domain connection reuse with 0-RTT when authorized,
//! resource-type priorities and weights, and a prediction pipeline that
//! analyzes fetched documents and prefetches likely dependencies.

pub mod analyze;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod predict;
pub mod request;
pub mod scheduler;
pub mod stats;

pub use cache::{Cache, CacheEntry};
pub use client::HttpClient;
pub use config::{FetchConfig, PredictionModel};
pub use error::FetchError;
pub use predict::{BasicPredictor, DisabledPredictor, Predictor, UserAdaptivePredictor};
pub use request::{Request, ResourceType, Response};
pub use scheduler::{PriorityClass, Scheduler};
