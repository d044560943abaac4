//! Stage-1 triage: rules plus light ML over cheap history.
//!
//! Stage-1 runs on the request path under a tight latency budget. It never
//! calls the embedding provider, the vector index, or the reasoner, and it
//! never fails the caller: any internal error degrades to a conservative
//! rules-only result that routes the transaction to Stage-2.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::decision::Stage1Result;
use crate::error::Error;
use crate::history::HistoryStore;
use crate::observability::{ObservabilityEvent, ObservabilityStreamer};
use crate::rules::RuleEngine;
use crate::scoring::{AnomalyScorer, MlScore};
use crate::transaction::{CustomerProfile, Transaction};

/// The fast triage analyzer.
pub struct Stage1Analyzer {
    rules: Arc<RuleEngine>,
    scorer: Arc<dyn AnomalyScorer>,
    history: Arc<dyn HistoryStore>,
    streamer: Arc<ObservabilityStreamer>,
    config: Arc<EngineConfig>,
}

impl Stage1Analyzer {
    pub fn new(
        rules: Arc<RuleEngine>,
        scorer: Arc<dyn AnomalyScorer>,
        history: Arc<dyn HistoryStore>,
        streamer: Arc<ObservabilityStreamer>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            rules,
            scorer,
            history,
            streamer,
            config,
        }
    }

    /// Run triage for one transaction. Infallible by contract: errors are
    /// reported through observability and reflected in the result.
    pub async fn run(&self, txn: &Transaction, thread_id: &str) -> Stage1Result {
        let start = Instant::now();
        self.streamer
            .emit(ObservabilityEvent::stage_start(thread_id, 1))
            .await;

        // The profile fetch is Stage-1's only suspension point, so the
        // latency budget wraps it alone.
        let budget = Duration::from_millis(self.config.stage1_timeout_ms);
        let profile = match tokio::time::timeout(budget, self.history.get_profile(&txn.customer_id))
            .await
        {
            Ok(Ok(profile)) => profile,
            Ok(Err(err)) => {
                warn!(txn_id = %txn.txn_id, "profile fetch failed: {}", err);
                return self.conservative(txn, thread_id, start, err).await;
            }
            Err(_) => {
                let err = Error::timeout(1, self.config.stage1_timeout_ms);
                warn!(txn_id = %txn.txn_id, "profile fetch timed out");
                return self.conservative(txn, thread_id, start, err).await;
            }
        };

        let result = self.score(txn, profile.as_ref(), thread_id, start).await;
        self.streamer
            .emit(
                ObservabilityEvent::stage_end(thread_id, 1, result.elapsed_ms)
                    .with_field("combined_score", result.combined_score)
                    .with_field("needs_stage2", result.needs_stage2),
            )
            .await;
        result
    }

    async fn score(
        &self,
        txn: &Transaction,
        profile: Option<&CustomerProfile>,
        thread_id: &str,
        start: Instant,
    ) -> Stage1Result {
        let outcome = self.rules.evaluate(txn, profile).await;

        let ml_score = match self.scorer.score(txn, profile).await {
            Ok(MlScore::Score(value)) => Some(value.clamp(0.0, 1.0)),
            Ok(MlScore::Unknown) => {
                debug!(txn_id = %txn.txn_id, "anomaly scorer has no signal");
                None
            }
            Err(err) => {
                warn!(txn_id = %txn.txn_id, "anomaly scorer failed: {}", err);
                self.streamer
                    .emit(ObservabilityEvent::error(
                        thread_id,
                        format!("anomaly scorer degraded to unknown: {}", err),
                    ))
                    .await;
                None
            }
        };

        // When the scorer has nothing, the weighting shifts fully to rules.
        let (alpha, beta) = match ml_score {
            Some(_) => (self.config.score_alpha, self.config.score_beta),
            None => (1.0, 0.0),
        };
        let combined_score =
            (100.0 * (alpha * outcome.score + beta * ml_score.unwrap_or(0.0))).clamp(0.0, 100.0);

        Stage1Result {
            rule_score: outcome.score,
            rule_flags: outcome.flags,
            ml_score,
            combined_score,
            needs_stage2: self.is_ambiguous(combined_score),
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Conservative degrade: rules alone at the configured weight, routed to
    /// Stage-2 for a closer look.
    async fn conservative(
        &self,
        txn: &Transaction,
        thread_id: &str,
        start: Instant,
        err: Error,
    ) -> Stage1Result {
        self.streamer
            .emit(ObservabilityEvent::error(
                thread_id,
                format!("stage1 degraded: {}", err),
            ))
            .await;

        let outcome = self.rules.evaluate(txn, None).await;
        let combined_score = (100.0 * self.config.score_alpha * outcome.score).clamp(0.0, 100.0);
        let elapsed_ms = start.elapsed().as_millis() as u64;

        self.streamer
            .emit(
                ObservabilityEvent::stage_end(thread_id, 1, elapsed_ms)
                    .with_field("combined_score", combined_score)
                    .with_field("degraded", true),
            )
            .await;

        Stage1Result {
            rule_score: outcome.score,
            rule_flags: outcome.flags,
            ml_score: None,
            combined_score,
            needs_stage2: true,
            elapsed_ms,
        }
    }

    fn is_ambiguous(&self, score: f64) -> bool {
        score >= self.config.low_cutoff && score <= self.config.high_cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::Verdict;
    use crate::graph::{Relationship, RelationshipFilter};
    use crate::history::SqliteHistoryStore;
    use crate::observability::EventKind;
    use crate::scoring::BehavioralScorer;
    use crate::transaction::fixtures;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use crate::error::Result;

    fn analyzer_with(history: Arc<dyn HistoryStore>) -> (Stage1Analyzer, Arc<ObservabilityStreamer>) {
        let config = Arc::new(EngineConfig::default());
        let streamer = Arc::new(ObservabilityStreamer::default());
        let analyzer = Stage1Analyzer::new(
            Arc::new(RuleEngine::standard(&config.rule_weights)),
            Arc::new(BehavioralScorer::new()),
            history,
            streamer.clone(),
            config,
        );
        (analyzer, streamer)
    }

    fn seeded_store() -> Arc<SqliteHistoryStore> {
        let store = SqliteHistoryStore::in_memory().unwrap();
        store.upsert_profile(&fixtures::profile()).unwrap();
        Arc::new(store)
    }

    struct FailingStore;

    #[async_trait]
    impl HistoryStore for FailingStore {
        async fn get_profile(&self, _customer_id: &str) -> Result<Option<crate::transaction::CustomerProfile>> {
            Err(Error::Storage("connection reset".to_string()))
        }
        async fn recent_transactions(
            &self,
            _customer_id: &str,
            _window: ChronoDuration,
            _cap: usize,
        ) -> Result<Vec<Transaction>> {
            Ok(Vec::new())
        }
        async fn get_transaction(&self, _txn_id: &str) -> Result<Option<Transaction>> {
            Ok(None)
        }
        async fn get_relationships(
            &self,
            _entity_id: &str,
            _filter: &RelationshipFilter,
        ) -> Result<Vec<Relationship>> {
            Ok(Vec::new())
        }
        async fn record_decision(&self, _txn_id: &str, _verdict: Verdict, _risk_score: f64) -> Result<()> {
            Ok(())
        }
    }

    struct SlowStore;

    #[async_trait]
    impl HistoryStore for SlowStore {
        async fn get_profile(&self, _customer_id: &str) -> Result<Option<crate::transaction::CustomerProfile>> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(None)
        }
        async fn recent_transactions(
            &self,
            _customer_id: &str,
            _window: ChronoDuration,
            _cap: usize,
        ) -> Result<Vec<Transaction>> {
            Ok(Vec::new())
        }
        async fn get_transaction(&self, _txn_id: &str) -> Result<Option<Transaction>> {
            Ok(None)
        }
        async fn get_relationships(
            &self,
            _entity_id: &str,
            _filter: &RelationshipFilter,
        ) -> Result<Vec<Relationship>> {
            Ok(Vec::new())
        }
        async fn record_decision(&self, _txn_id: &str, _verdict: Verdict, _risk_score: f64) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_low_risk_scores_below_cutoff() {
        let (analyzer, _) = analyzer_with(seeded_store());
        let result = analyzer.run(&fixtures::grocery_txn(), "t1").await;

        assert!(result.combined_score < 25.0, "scored {}", result.combined_score);
        assert!(!result.needs_stage2);
        assert!(result.rule_flags.is_empty());
        assert!(result.ml_score.is_some());
    }

    #[tokio::test]
    async fn test_high_risk_scores_above_cutoff() {
        let (analyzer, _) = analyzer_with(seeded_store());
        let result = analyzer.run(&fixtures::crypto_txn(), "t1").await;

        assert!(result.combined_score > 85.0, "scored {}", result.combined_score);
        assert!(!result.needs_stage2);
        assert!(!result.rule_flags.is_empty());
    }

    #[tokio::test]
    async fn test_missing_profile_does_not_crash() {
        let store = Arc::new(SqliteHistoryStore::in_memory().unwrap());
        let (analyzer, _) = analyzer_with(store);

        let result = analyzer.run(&fixtures::crypto_txn(), "t1").await;

        // Rules alone drive the score at full weight.
        assert!(result.ml_score.is_none());
        assert!(result.combined_score > 0.0);
        assert!((result.combined_score - 100.0 * result.rule_score).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_store_failure_degrades_conservatively() {
        let (analyzer, streamer) = analyzer_with(Arc::new(FailingStore));
        let result = analyzer.run(&fixtures::grocery_txn(), "t1").await;

        assert!(result.needs_stage2);
        // Rules alone at the configured alpha.
        assert!((result.combined_score - 100.0 * 0.5 * result.rule_score).abs() < 1e-9);

        let events = streamer.history("t1", 20).await;
        assert!(events.iter().any(|e| e.kind == EventKind::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_timeout_degrades_conservatively() {
        let (analyzer, streamer) = analyzer_with(Arc::new(SlowStore));
        let result = analyzer.run(&fixtures::grocery_txn(), "t1").await;

        assert!(result.needs_stage2);
        assert!(result.ml_score.is_none());

        let events = streamer.history("t1", 20).await;
        let error = events.iter().find(|e| e.kind == EventKind::Error).unwrap();
        assert!(error
            .field("message")
            .and_then(|v| v.as_str())
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_emits_stage_lifecycle_events() {
        let (analyzer, streamer) = analyzer_with(seeded_store());
        analyzer.run(&fixtures::grocery_txn(), "t1").await;

        let events = streamer.history("t1", 20).await;
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::StageStart, EventKind::StageEnd]);
    }

    #[tokio::test]
    async fn test_zero_amount_boundary() {
        let (analyzer, _) = analyzer_with(seeded_store());
        let mut txn = fixtures::grocery_txn();
        txn.amount = 0.0;

        let result = analyzer.run(&txn, "t1").await;
        assert!(result.combined_score < 25.0);
    }
}
