//! Fetch-layer configuration.
//!
//! Plain serde-deserializable structs with sensible defaults; the loader
//! layers a config file and `QUANTUM_NET_*` environment variables on top,
//! the same way the rest of the browser's services load theirs.

use serde::{Deserialize, Serialize};

use quantum_quic::TlsProfile;

/// Predictor selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionModel {
    Disabled,
    #[default]
    Basic,
    Advanced,
    UserAdaptive,
}

/// Client configuration; every field has the documented default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub prediction_model: PredictionModel,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub default_timeout_ms: u64,
    pub cache_enabled: bool,
    pub cache_max_bytes: u64,
    pub cache_max_entries: usize,
    pub cache_default_ttl_s: u64,
    pub viewport_tracking_enabled: bool,
    pub early_data_allowed: bool,
    pub keepalive_interval_s: u64,
    pub tls_profile: TlsProfile,
    /// Prefetch candidates issued per analyzed document.
    pub prefetch_top_k: usize,
    /// Assumed viewport width for srcset selection.
    pub viewport_width: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            prediction_model: PredictionModel::Basic,
            follow_redirects: true,
            max_redirects: 5,
            default_timeout_ms: 30_000,
            cache_enabled: true,
            cache_max_bytes: 64 * 1024 * 1024,
            cache_max_entries: 4096,
            cache_default_ttl_s: 86_400,
            viewport_tracking_enabled: true,
            early_data_allowed: true,
            keepalive_interval_s: 15,
            tls_profile: TlsProfile::Modern,
            prefetch_top_k: 5,
            viewport_width: 1280,
        }
    }
}

impl FetchConfig {
    /// Load from an optional config file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<FetchConfig, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("QUANTUM_NET").separator("__"),
        );
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_defaults() {
        let cfg = FetchConfig::default();
        assert_eq!(cfg.max_redirects, 5);
        assert_eq!(cfg.default_timeout_ms, 30_000);
        assert_eq!(cfg.cache_default_ttl_s, 86_400);
        assert_eq!(cfg.keepalive_interval_s, 15);
        assert_eq!(cfg.prediction_model, PredictionModel::Basic);
        assert_eq!(cfg.prefetch_top_k, 5);
        assert!(cfg.follow_redirects);
        assert!(cfg.early_data_allowed);
    }

    #[test]
    fn test_partial_json_deserialization_fills_defaults() {
        let cfg: FetchConfig =
            serde_json::from_str(r#"{"max_redirects": 2, "cache_enabled": false}"#).unwrap();
        assert_eq!(cfg.max_redirects, 2);
        assert!(!cfg.cache_enabled);
        assert_eq!(cfg.default_timeout_ms, 30_000);
    }

    #[test]
    fn test_prediction_model_names() {
        let m: PredictionModel = serde_json::from_str(r#""user_adaptive""#).unwrap();
        assert_eq!(m, PredictionModel::UserAdaptive);
        let m: PredictionModel = serde_json::from_str(r#""disabled""#).unwrap();
        assert_eq!(m, PredictionModel::Disabled);
    }
}
