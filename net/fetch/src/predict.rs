//! Resource prediction: ranking extracted references and learning from
//! whether predictions were actually used.
//!
//! The predictor is chosen by construction, never by conditional
//! branches at call sites: `Disabled` predicts nothing, `Basic` applies
//! fixed rules, `UserAdaptive` layers feedback-adjusted type weights on
//! top of the rules and resets them when accuracy degrades. Per origin, a
//! ring buffer of the last 100 predictions backs the accuracy ledger.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};

use crate::analyze::{ExtractedRef, RefAction};
use crate::request::ResourceType;

/// Ring-buffer capacity per origin.
const ORIGIN_HISTORY: usize = 100;

/// Evaluated predictions required before adaptive weights may reset.
const RESET_MIN_EVALUATED: u64 = 50;

/// Accuracy floor below which adaptive weights reset.
const RESET_ACCURACY: f64 = 0.3;

/// A ranked prefetch candidate.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub url: url::Url,
    pub resource_type: ResourceType,
    /// Estimated probability the page requests this resource soon.
    pub probability: f64,
}

/// One remembered prediction.
#[derive(Debug, Clone)]
pub struct PredictionRecord {
    pub url: String,
    pub resource_type: ResourceType,
    pub probability: f64,
    pub timestamp: DateTime<Utc>,
    pub was_used: bool,
    pub was_evaluated: bool,
}

/// Aggregated accuracy counters for telemetry.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PredictionStats {
    pub total_predictions: u64,
    pub successful_predictions: u64,
    pub evaluated_predictions: u64,
    /// Accuracy over the recent evaluation window.
    pub recent_accuracy: f64,
}

impl PredictionStats {
    pub fn accuracy(&self) -> f64 {
        if self.evaluated_predictions == 0 {
            return 0.0;
        }
        self.successful_predictions as f64 / self.evaluated_predictions as f64
    }
}

/// Prediction interface; implementations are swapped by construction.
pub trait Predictor: Send + Sync {
    /// Rank extracted references into prefetch candidates, best first.
    fn rank(&self, origin: &str, refs: &[ExtractedRef]) -> Vec<Prediction>;

    /// Remember that a prediction was issued.
    fn record_prediction(&self, origin: &str, prediction: &Prediction);

    /// Mark a previously predicted URL as used or unused.
    fn record_accuracy(&self, url: &str, used: bool);

    /// Weight multiplier for a URL, in [0.2, 2.0].
    fn prediction_factor(&self, url: &str) -> f64;

    fn stats(&self) -> PredictionStats;
}

/// Predictor that never predicts.
#[derive(Debug, Default)]
pub struct DisabledPredictor;

impl Predictor for DisabledPredictor {
    fn rank(&self, _origin: &str, _refs: &[ExtractedRef]) -> Vec<Prediction> {
        Vec::new()
    }

    fn record_prediction(&self, _origin: &str, _prediction: &Prediction) {}

    fn record_accuracy(&self, _url: &str, _used: bool) {}

    fn prediction_factor(&self, _url: &str) -> f64 {
        1.0
    }

    fn stats(&self) -> PredictionStats {
        PredictionStats::default()
    }
}

struct Ledger {
    origins: HashMap<String, VecDeque<PredictionRecord>>,
    url_to_origin: HashMap<String, String>,
    total: u64,
    successful: u64,
    evaluated: u64,
    recent: VecDeque<bool>,
}

impl Ledger {
    fn new() -> Ledger {
        Ledger {
            origins: HashMap::new(),
            url_to_origin: HashMap::new(),
            total: 0,
            successful: 0,
            evaluated: 0,
            recent: VecDeque::with_capacity(RESET_MIN_EVALUATED as usize),
        }
    }

    fn record(&mut self, origin: &str, prediction: &Prediction) {
        let buffer = self.origins.entry(origin.to_string()).or_default();
        if buffer.len() >= ORIGIN_HISTORY {
            if let Some(old) = buffer.pop_front() {
                self.url_to_origin.remove(&old.url);
            }
        }
        let url = prediction.url.to_string();
        buffer.push_back(PredictionRecord {
            url: url.clone(),
            resource_type: prediction.resource_type,
            probability: prediction.probability,
            timestamp: Utc::now(),
            was_used: false,
            was_evaluated: false,
        });
        self.url_to_origin.insert(url, origin.to_string());
        self.total += 1;
    }

    /// Returns the record's resource type when this was the first
    /// evaluation of the URL.
    fn evaluate(&mut self, url: &str, used: bool) -> Option<ResourceType> {
        let origin = self.url_to_origin.get(url)?.clone();
        let buffer = self.origins.get_mut(&origin)?;
        let record = buffer
            .iter_mut()
            .find(|r| r.url == url && !r.was_evaluated)?;
        record.was_evaluated = true;
        record.was_used = used;
        self.evaluated += 1;
        if used {
            self.successful += 1;
        }
        if self.recent.len() >= RESET_MIN_EVALUATED as usize {
            self.recent.pop_front();
        }
        self.recent.push_back(used);
        Some(record.resource_type)
    }

    fn probability_of(&self, url: &str) -> Option<f64> {
        let origin = self.url_to_origin.get(url)?;
        let buffer = self.origins.get(origin)?;
        buffer.iter().rev().find(|r| r.url == url).map(|r| r.probability)
    }

    fn stats(&self) -> PredictionStats {
        let recent_hits = self.recent.iter().filter(|&&u| u).count();
        let recent_accuracy = if self.recent.is_empty() {
            0.0
        } else {
            recent_hits as f64 / self.recent.len() as f64
        };
        PredictionStats {
            total_predictions: self.total,
            successful_predictions: self.successful,
            evaluated_predictions: self.evaluated,
            recent_accuracy,
        }
    }
}

fn base_probability(resource_type: ResourceType) -> f64 {
    match resource_type {
        ResourceType::Stylesheet => 0.9,
        ResourceType::Script => 0.85,
        ResourceType::Font => 0.8,
        ResourceType::Document => 0.7,
        ResourceType::Fetch | ResourceType::Xhr => 0.6,
        ResourceType::Image => 0.5,
        ResourceType::Media => 0.3,
        ResourceType::WebSocket | ResourceType::Other => 0.2,
    }
}

/// Rule-based predictor: probability from resource type and document
/// position, no learning.
#[derive(Default)]
pub struct BasicPredictor {
    ledger: RwLock<Ledger>,
}

impl BasicPredictor {
    pub fn new() -> BasicPredictor {
        BasicPredictor { ledger: RwLock::new(Ledger::new()) }
    }
}

impl Predictor for BasicPredictor {
    fn rank(&self, _origin: &str, refs: &[ExtractedRef]) -> Vec<Prediction> {
        let mut predictions: Vec<Prediction> = refs
            .iter()
            .filter(|r| r.action == RefAction::Fetch)
            .filter(|r| r.resource_type != ResourceType::WebSocket)
            .map(|r| Prediction {
                url: r.url.clone(),
                resource_type: r.resource_type,
                probability: (base_probability(r.resource_type) * r.weight_hint)
                    .clamp(0.0, 1.0),
            })
            .collect();
        predictions.sort_by(|a, b| {
            b.probability
                .partial_cmp(&a.probability)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        predictions
    }

    fn record_prediction(&self, origin: &str, prediction: &Prediction) {
        self.ledger.write().record(origin, prediction);
    }

    fn record_accuracy(&self, url: &str, used: bool) {
        let _ = self.ledger.write().evaluate(url, used);
    }

    fn prediction_factor(&self, url: &str) -> f64 {
        match self.ledger.read().probability_of(url) {
            Some(probability) => (0.2 + 1.8 * probability).clamp(0.2, 2.0),
            None => 1.0,
        }
    }

    fn stats(&self) -> PredictionStats {
        self.ledger.read().stats()
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Ledger::new()
    }
}

/// Adaptive predictor: the Basic rules scaled by per-type weights that
/// learn from the accuracy feedback loop.
pub struct UserAdaptivePredictor {
    ledger: RwLock<Ledger>,
    type_weights: RwLock<HashMap<ResourceType, f64>>,
}

impl Default for UserAdaptivePredictor {
    fn default() -> Self {
        UserAdaptivePredictor::new()
    }
}

impl UserAdaptivePredictor {
    pub fn new() -> UserAdaptivePredictor {
        UserAdaptivePredictor {
            ledger: RwLock::new(Ledger::new()),
            type_weights: RwLock::new(HashMap::new()),
        }
    }

    fn type_weight(&self, resource_type: ResourceType) -> f64 {
        *self.type_weights.read().get(&resource_type).unwrap_or(&1.0)
    }

    fn maybe_reset_weights(&self) {
        let stats = self.ledger.read().stats();
        if stats.evaluated_predictions > RESET_MIN_EVALUATED
            && stats.accuracy() < RESET_ACCURACY
        {
            debug!(
                accuracy = stats.accuracy(),
                evaluated = stats.evaluated_predictions,
                "prediction accuracy degraded, resetting adaptive weights"
            );
            self.type_weights.write().clear();
        }
    }
}

impl Predictor for UserAdaptivePredictor {
    fn rank(&self, _origin: &str, refs: &[ExtractedRef]) -> Vec<Prediction> {
        let mut predictions: Vec<Prediction> = refs
            .iter()
            .filter(|r| r.action == RefAction::Fetch)
            .filter(|r| r.resource_type != ResourceType::WebSocket)
            .map(|r| Prediction {
                url: r.url.clone(),
                resource_type: r.resource_type,
                probability: (base_probability(r.resource_type)
                    * r.weight_hint
                    * self.type_weight(r.resource_type))
                .clamp(0.0, 1.0),
            })
            .collect();
        predictions.sort_by(|a, b| {
            b.probability
                .partial_cmp(&a.probability)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        predictions
    }

    fn record_prediction(&self, origin: &str, prediction: &Prediction) {
        self.ledger.write().record(origin, prediction);
    }

    fn record_accuracy(&self, url: &str, used: bool) {
        let evaluated_type = self.ledger.write().evaluate(url, used);
        if let Some(resource_type) = evaluated_type {
            let mut weights = self.type_weights.write();
            let weight = weights.entry(resource_type).or_insert(1.0);
            *weight = if used {
                (*weight * 1.05).min(2.0)
            } else {
                (*weight * 0.95).max(0.5)
            };
            trace!(?resource_type, weight = *weight, used, "adaptive weight nudged");
        }
        self.maybe_reset_weights();
    }

    fn prediction_factor(&self, url: &str) -> f64 {
        match self.ledger.read().probability_of(url) {
            Some(probability) => (0.2 + 1.8 * probability).clamp(0.2, 2.0),
            None => 1.0,
        }
    }

    fn stats(&self) -> PredictionStats {
        self.ledger.read().stats()
    }
}

/// Construct the predictor selected by configuration.
///
/// `Advanced` is specified around a loaded model file; with no model
/// present the Basic rules are authoritative, so it maps to Basic here.
pub fn build_predictor(model: crate::config::PredictionModel) -> Arc<dyn Predictor> {
    match model {
        crate::config::PredictionModel::Disabled => Arc::new(DisabledPredictor),
        crate::config::PredictionModel::Basic | crate::config::PredictionModel::Advanced => {
            Arc::new(BasicPredictor::new())
        }
        crate::config::PredictionModel::UserAdaptive => Arc::new(UserAdaptivePredictor::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn extracted(url: &str, resource_type: ResourceType, hint: f64) -> ExtractedRef {
        ExtractedRef {
            url: Url::parse(url).unwrap(),
            resource_type,
            weight_hint: hint,
            action: RefAction::Fetch,
        }
    }

    #[test]
    fn test_stylesheet_ranks_above_image() {
        let predictor = BasicPredictor::new();
        let refs = vec![
            extracted("https://a.test/i.png", ResourceType::Image, 1.0),
            extracted("https://a.test/s.css", ResourceType::Stylesheet, 1.0),
        ];
        let ranked = predictor.rank("a.test", &refs);
        assert_eq!(ranked[0].url.as_str(), "https://a.test/s.css");
        assert_eq!(ranked[1].url.as_str(), "https://a.test/i.png");
    }

    #[test]
    fn test_successful_never_exceeds_total() {
        let predictor = BasicPredictor::new();
        for i in 0..10 {
            let p = Prediction {
                url: Url::parse(&format!("https://a.test/{i}")).unwrap(),
                resource_type: ResourceType::Image,
                probability: 0.5,
            };
            predictor.record_prediction("a.test", &p);
            predictor.record_accuracy(&format!("https://a.test/{i}"), i % 2 == 0);
        }
        let stats = predictor.stats();
        assert!(stats.successful_predictions <= stats.total_predictions);
        assert_eq!(stats.total_predictions, 10);
        assert_eq!(stats.evaluated_predictions, 10);
        assert_eq!(stats.successful_predictions, 5);
    }

    #[test]
    fn test_accuracy_increments_by_exactly_one() {
        let predictor = BasicPredictor::new();
        let p = Prediction {
            url: Url::parse("https://a.test/x.css").unwrap(),
            resource_type: ResourceType::Stylesheet,
            probability: 0.9,
        };
        predictor.record_prediction("a.test", &p);
        let before = predictor.stats().successful_predictions;
        predictor.record_accuracy("https://a.test/x.css", true);
        assert_eq!(predictor.stats().successful_predictions, before + 1);
        // A second evaluation of the same URL does not double count.
        predictor.record_accuracy("https://a.test/x.css", true);
        assert_eq!(predictor.stats().successful_predictions, before + 1);
    }

    #[test]
    fn test_unknown_url_not_counted() {
        let predictor = BasicPredictor::new();
        predictor.record_accuracy("https://never.test/", true);
        assert_eq!(predictor.stats().evaluated_predictions, 0);
    }

    #[test]
    fn test_ring_buffer_capacity() {
        let predictor = BasicPredictor::new();
        for i in 0..150 {
            let p = Prediction {
                url: Url::parse(&format!("https://a.test/{i}")).unwrap(),
                resource_type: ResourceType::Image,
                probability: 0.5,
            };
            predictor.record_prediction("a.test", &p);
        }
        let ledger = predictor.ledger.read();
        assert_eq!(ledger.origins["a.test"].len(), ORIGIN_HISTORY);
        // Early predictions were evicted from the index too.
        assert!(!ledger.url_to_origin.contains_key("https://a.test/0"));
        assert!(ledger.url_to_origin.contains_key("https://a.test/149"));
    }

    #[test]
    fn test_prediction_factor_range() {
        let predictor = BasicPredictor::new();
        assert_eq!(predictor.prediction_factor("https://unseen.test/"), 1.0);
        let p = Prediction {
            url: Url::parse("https://a.test/hot.css").unwrap(),
            resource_type: ResourceType::Stylesheet,
            probability: 1.0,
        };
        predictor.record_prediction("a.test", &p);
        assert_eq!(predictor.prediction_factor("https://a.test/hot.css"), 2.0);
    }

    #[test]
    fn test_adaptive_weights_shift_ranking() {
        let predictor = UserAdaptivePredictor::new();
        // Teach it that images get used and scripts do not.
        for i in 0..20 {
            let img = Prediction {
                url: Url::parse(&format!("https://a.test/i{i}.png")).unwrap(),
                resource_type: ResourceType::Image,
                probability: 0.5,
            };
            predictor.record_prediction("a.test", &img);
            predictor.record_accuracy(&format!("https://a.test/i{i}.png"), true);

            let js = Prediction {
                url: Url::parse(&format!("https://a.test/s{i}.js")).unwrap(),
                resource_type: ResourceType::Script,
                probability: 0.5,
            };
            predictor.record_prediction("a.test", &js);
            predictor.record_accuracy(&format!("https://a.test/s{i}.js"), false);
        }
        assert!(predictor.type_weight(ResourceType::Image) > 1.0);
        assert!(predictor.type_weight(ResourceType::Script) < 1.0);
    }

    #[test]
    fn test_adaptive_reset_on_poor_accuracy() {
        let predictor = UserAdaptivePredictor::new();
        for i in 0..60 {
            let p = Prediction {
                url: Url::parse(&format!("https://a.test/{i}")).unwrap(),
                resource_type: ResourceType::Image,
                probability: 0.5,
            };
            predictor.record_prediction("a.test", &p);
            // Nothing is ever used: accuracy 0.
            predictor.record_accuracy(&format!("https://a.test/{i}"), false);
        }
        let stats = predictor.stats();
        assert!(stats.evaluated_predictions > RESET_MIN_EVALUATED);
        assert!(stats.accuracy() < RESET_ACCURACY);
        // Weights were cleared back to neutral.
        assert_eq!(predictor.type_weight(ResourceType::Image), 1.0);
    }

    #[test]
    fn test_disabled_predictor_inert() {
        let predictor = DisabledPredictor;
        let refs = vec![extracted("https://a.test/s.css", ResourceType::Stylesheet, 1.0)];
        assert!(predictor.rank("a.test", &refs).is_empty());
        assert_eq!(predictor.prediction_factor("https://a.test/s.css"), 1.0);
    }
}
