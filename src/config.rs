//! Engine configuration.
//!
//! A typed configuration record constructed once at startup and handed to
//! components as a read-only view. Unknown keys are rejected rather than
//! silently ignored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// Per-rule weights. A weight present enables the rule; `None` disables it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleWeights {
    /// High-risk country rule
    pub high_risk_country: Option<f64>,
    /// Absolute amount threshold rule
    pub amount_threshold: Option<f64>,
    /// Amount relative to customer baseline (`mean + k·std`)
    pub relative_amount: Option<f64>,
    /// Activity outside the customer's active hours
    pub off_hours: Option<f64>,
    /// High-risk merchant category rule
    pub merchant_category: Option<f64>,
}

impl Default for RuleWeights {
    fn default() -> Self {
        Self {
            high_risk_country: Some(0.4),
            amount_threshold: Some(0.3),
            relative_amount: Some(0.3),
            off_hours: Some(0.2),
            merchant_category: Some(0.3),
        }
    }
}

/// Retry policy for transient upstream failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries for a single call.
    pub max_retries: u32,
    /// Base delay used for exponential backoff.
    pub base_delay_ms: u64,
    /// Backoff multiplier applied per retry attempt.
    pub backoff_factor: f64,
}

impl RetryConfig {
    /// Delay before the given retry attempt (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt as i32);
        let millis = (self.base_delay_ms as f64 * factor).round().max(0.0) as u64;
        Duration::from_millis(millis)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 200,
            backoff_factor: 2.0,
        }
    }
}

/// Configuration for the fraud decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Scores below this finalize as APPROVE without Stage-2 (0-100)
    pub low_cutoff: f64,
    /// Scores above this finalize as BLOCK without Stage-2 (0-100)
    pub high_cutoff: f64,
    /// Stage-1 latency budget in milliseconds
    pub stage1_timeout_ms: u64,
    /// Stage-2 hard cap in milliseconds
    pub stage2_timeout_ms: u64,
    /// Maximum reasoner tool calls per Stage-2 run
    pub stage2_tool_budget: u32,
    /// Neighbors retrieved per vector query
    pub knn_k: usize,
    /// Candidate pool size for the vector index
    pub knn_candidates: usize,
    /// Per-rule weights; omission disables a rule
    pub rule_weights: RuleWeights,
    /// Relationship traversal depth cap
    pub network_max_depth: u32,
    /// Relationship traversal node cap
    pub network_max_nodes: usize,
    /// Per-thread observability event retention
    pub obs_history_limit: usize,
    /// Rule-score weight in the Stage-1 combination (α)
    pub score_alpha: f64,
    /// ML-score weight in the Stage-1 combination (β)
    pub score_beta: f64,
    /// Minimum indexed documents before vector retrieval is meaningful
    pub min_index_population: u64,
    /// Thread record lifetime in seconds
    pub thread_ttl_secs: u64,
    /// Bounded buffer size per push subscriber
    pub subscriber_buffer: usize,
    /// Retry policy for transient upstream failures
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            low_cutoff: 25.0,
            high_cutoff: 85.0,
            stage1_timeout_ms: 150,
            stage2_timeout_ms: 60_000,
            stage2_tool_budget: 8,
            knn_k: 5,
            knn_candidates: 100,
            rule_weights: RuleWeights::default(),
            network_max_depth: 2,
            network_max_nodes: 100,
            obs_history_limit: 200,
            score_alpha: 0.5,
            score_beta: 0.5,
            min_index_population: 5,
            thread_ttl_secs: 3600,
            subscriber_buffer: 64,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Set the Stage-1/Stage-2 routing band.
    pub fn with_cutoffs(mut self, low: f64, high: f64) -> Self {
        self.low_cutoff = low;
        self.high_cutoff = high;
        self
    }

    /// Set the Stage-2 hard cap.
    pub fn with_stage2_timeout_ms(mut self, timeout: u64) -> Self {
        self.stage2_timeout_ms = timeout;
        self
    }

    /// Set the combination weights; must sum to 1.
    pub fn with_score_weights(mut self, alpha: f64, beta: f64) -> Self {
        self.score_alpha = alpha;
        self.score_beta = beta;
        self
    }

    /// Set the retrieval parameters.
    pub fn with_knn(mut self, k: usize, candidates: usize) -> Self {
        self.knn_k = k;
        self.knn_candidates = candidates;
        self
    }

    /// Validate invariants: ordered cutoffs inside [0,100], α+β=1, positive budgets.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.low_cutoff) || !(0.0..=100.0).contains(&self.high_cutoff) {
            return Err(Error::Config(format!(
                "cutoffs must lie in [0,100], got {}/{}",
                self.low_cutoff, self.high_cutoff
            )));
        }
        if self.low_cutoff >= self.high_cutoff {
            return Err(Error::Config(format!(
                "LOW_CUTOFF {} must be below HIGH_CUTOFF {}",
                self.low_cutoff, self.high_cutoff
            )));
        }
        if (self.score_alpha + self.score_beta - 1.0).abs() > 1e-9 {
            return Err(Error::Config(format!(
                "score weights must sum to 1, got {} + {}",
                self.score_alpha, self.score_beta
            )));
        }
        if self.score_alpha < 0.0 || self.score_beta < 0.0 {
            return Err(Error::Config("score weights must be non-negative".to_string()));
        }
        if self.stage1_timeout_ms == 0 || self.stage2_timeout_ms == 0 {
            return Err(Error::Config("stage budgets must be positive".to_string()));
        }
        if self.knn_k == 0 || self.knn_k > 20 {
            return Err(Error::Config(format!("KNN_K must lie in 1..=20, got {}", self.knn_k)));
        }
        if !(1..=4).contains(&self.network_max_depth) {
            return Err(Error::Config(format!(
                "NETWORK_MAX_DEPTH must lie in 1..=4, got {}",
                self.network_max_depth
            )));
        }
        Ok(())
    }

    /// Build a configuration from string key-value pairs.
    ///
    /// Recognizes the deployment keys (`LOW_CUTOFF`, `HIGH_CUTOFF`,
    /// `STAGE1_TIMEOUT_MS`, ...) and rejects anything else.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        for (key, value) in map {
            match key.as_str() {
                "LOW_CUTOFF" => config.low_cutoff = parse_key(key, value)?,
                "HIGH_CUTOFF" => config.high_cutoff = parse_key(key, value)?,
                "STAGE1_TIMEOUT_MS" => config.stage1_timeout_ms = parse_key(key, value)?,
                "STAGE2_TIMEOUT_MS" => config.stage2_timeout_ms = parse_key(key, value)?,
                "STAGE2_TOOL_BUDGET" => config.stage2_tool_budget = parse_key(key, value)?,
                "KNN_K" => config.knn_k = parse_key(key, value)?,
                "KNN_CANDIDATES" => config.knn_candidates = parse_key(key, value)?,
                "RULE_WEIGHTS" => {
                    config.rule_weights = serde_json::from_str(value)
                        .map_err(|e| Error::Config(format!("RULE_WEIGHTS: {}", e)))?;
                }
                "NETWORK_MAX_DEPTH" => config.network_max_depth = parse_key(key, value)?,
                "NETWORK_MAX_NODES" => config.network_max_nodes = parse_key(key, value)?,
                "OBS_HISTORY_LIMIT" => config.obs_history_limit = parse_key(key, value)?,
                other => {
                    return Err(Error::Config(format!("unknown configuration key: {}", other)));
                }
            }
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_key<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{}: cannot parse {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.low_cutoff, 25.0);
        assert_eq!(config.high_cutoff, 85.0);
        assert_eq!(config.score_alpha, 0.5);
    }

    #[test]
    fn test_builder_methods() {
        let config = EngineConfig::default()
            .with_cutoffs(30.0, 80.0)
            .with_knn(10, 200)
            .with_stage2_timeout_ms(30_000);

        assert_eq!(config.low_cutoff, 30.0);
        assert_eq!(config.high_cutoff, 80.0);
        assert_eq!(config.knn_k, 10);
        assert_eq!(config.stage2_timeout_ms, 30_000);
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let config = EngineConfig::default().with_score_weights(0.7, 0.7);
        assert!(config.validate().is_err());

        let config = EngineConfig::default().with_score_weights(0.3, 0.7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_cutoffs_rejected() {
        let config = EngineConfig::default().with_cutoffs(85.0, 25.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_map_recognized_keys() {
        let mut map = HashMap::new();
        map.insert("LOW_CUTOFF".to_string(), "20".to_string());
        map.insert("HIGH_CUTOFF".to_string(), "90".to_string());
        map.insert("KNN_K".to_string(), "8".to_string());

        let config = EngineConfig::from_map(&map).unwrap();
        assert_eq!(config.low_cutoff, 20.0);
        assert_eq!(config.high_cutoff, 90.0);
        assert_eq!(config.knn_k, 8);
    }

    #[test]
    fn test_from_map_rejects_unknown_key() {
        let mut map = HashMap::new();
        map.insert("STAGE3_TIMEOUT_MS".to_string(), "10".to_string());

        let err = EngineConfig::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("unknown configuration key"));
    }

    #[test]
    fn test_from_map_rule_weights_json() {
        let mut map = HashMap::new();
        map.insert(
            "RULE_WEIGHTS".to_string(),
            r#"{"high_risk_country":0.5,"amount_threshold":null,"relative_amount":0.2,"off_hours":null,"merchant_category":0.1}"#.to_string(),
        );

        let config = EngineConfig::from_map(&map).unwrap();
        assert_eq!(config.rule_weights.high_risk_country, Some(0.5));
        assert_eq!(config.rule_weights.amount_threshold, None);
    }

    #[test]
    fn test_retry_backoff_delays() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(800));
    }
}
