//! Stage-2 deep analysis: retrieval-augmented reasoning.
//!
//! Builds context for the reasoner out of the vector index and the history
//! store, then drives a tool-using reasoner run under a tool budget and a
//! wall-clock budget. Stage-2 never fails the analysis: every error path
//! degrades to the INVESTIGATE tie-break.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::decision::{Stage1Result, Stage2Result};
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::history::HistoryStore;
use crate::index::{ensure_dimension, KnnFilter, ScoredId, VectorIndex};
use crate::observability::{ObservabilityEvent, ObservabilityStreamer};
use crate::reasoner::{
    parse_verdict, ReasonerClient, ReasonerVerdict, RunOutcome, ToolOutput, ToolRegistry,
};
use crate::transaction::{canonical_text, Transaction};

/// A retrieved neighbor with its recorded verdict annotations.
struct Neighbor {
    hit: ScoredId,
    txn: Option<Transaction>,
}

/// The deferred deep analyzer.
pub struct Stage2Analyzer {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    history: Arc<dyn HistoryStore>,
    reasoner: Arc<dyn ReasonerClient>,
    tools: ToolRegistry,
    streamer: Arc<ObservabilityStreamer>,
    config: Arc<EngineConfig>,
}

impl Stage2Analyzer {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        history: Arc<dyn HistoryStore>,
        reasoner: Arc<dyn ReasonerClient>,
        tools: ToolRegistry,
        streamer: Arc<ObservabilityStreamer>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            embedder,
            index,
            history,
            reasoner,
            tools,
            streamer,
            config,
        }
    }

    /// Run deep analysis. Infallible by contract: failures degrade to the
    /// INVESTIGATE tie-break and are reported through observability.
    pub async fn run(
        &self,
        txn: &Transaction,
        stage1: &Stage1Result,
        thread_id: &str,
    ) -> Stage2Result {
        let start = Instant::now();
        self.streamer
            .emit(ObservabilityEvent::stage_start(thread_id, 2))
            .await;

        let result = match self.run_inner(txn, stage1, thread_id, start).await {
            Ok(result) => result,
            Err(err) => {
                warn!(txn_id = %txn.txn_id, "stage2 degraded: {}", err);
                self.streamer
                    .emit(ObservabilityEvent::error(
                        thread_id,
                        format!("stage2 degraded: {}", err),
                    ))
                    .await;

                let rationale = match &err {
                    Error::Timeout { .. } => "stage2 timeout".to_string(),
                    other => format!("stage2 degraded: {}", other),
                };
                Stage2Result::degraded(
                    stage1.combined_score,
                    rationale,
                    start.elapsed().as_millis() as u64,
                )
            }
        };

        let mut end = ObservabilityEvent::stage_end(thread_id, 2, result.elapsed_ms)
            .with_field("stage2_score", result.stage2_score)
            .with_field("recommendation", result.llm_recommendation.to_string());
        if result.timed_out {
            end = end.with_field("error", result.llm_rationale.clone());
        }
        self.streamer.emit(end).await;

        result
    }

    async fn run_inner(
        &self,
        txn: &Transaction,
        stage1: &Stage1Result,
        thread_id: &str,
        start: Instant,
    ) -> Result<Stage2Result> {
        let text = canonical_text(txn);

        let vector = self
            .timed(thread_id, "embed_transaction", |v: &Vec<f32>| v.len(), async {
                self.embedder.embed(&text).await
            })
            .await?;
        ensure_dimension(self.index.as_ref(), &vector)?;

        let neighbors = self.gather_neighbors(txn, &vector, thread_id).await?;

        let prompt = build_prompt(txn, stage1, &neighbors);
        let budget = Duration::from_millis(self.config.stage2_timeout_ms);
        let verdict = tokio::time::timeout(budget, self.reason(&prompt, thread_id))
            .await
            .map_err(|_| Error::timeout(2, self.config.stage2_timeout_ms))??;

        info!(
            txn_id = %txn.txn_id,
            recommendation = %verdict.recommendation,
            stage2_score = verdict.stage2_score,
            "stage2 verdict"
        );

        Ok(Stage2Result {
            similar_txn_ids: neighbors.iter().map(|n| n.hit.doc_id.clone()).collect(),
            llm_recommendation: verdict.recommendation,
            llm_rationale: verdict.rationale,
            stage2_score: verdict.stage2_score,
            confidence: verdict.confidence,
            timed_out: false,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Retrieve up to k neighbors, preferring same-customer and then
    /// same-category matches before backfilling unfiltered.
    async fn gather_neighbors(
        &self,
        txn: &Transaction,
        vector: &[f32],
        thread_id: &str,
    ) -> Result<Vec<Neighbor>> {
        let k = self.config.knn_k.clamp(1, 20);
        let candidates = self.config.knn_candidates;

        let population = match self.index.population().await {
            Ok(n) => n,
            Err(err) => {
                warn!("index population unavailable, treating as empty: {}", err);
                0
            }
        };
        if population < self.config.min_index_population {
            debug!(population, "index population below minimum, skipping retrieval");
            return Ok(Vec::new());
        }

        let passes = [
            KnnFilter::new().customer(&txn.customer_id).exclude(&txn.txn_id),
            KnnFilter::new().category(&txn.merchant.category).exclude(&txn.txn_id),
            KnnFilter::new().exclude(&txn.txn_id),
        ];

        let mut hits: Vec<ScoredId> = Vec::new();
        for filter in &passes {
            if hits.len() >= k {
                break;
            }
            let more = self
                .timed(thread_id, "vector_search", |h: &Vec<ScoredId>| h.len(), async {
                    self.index.knn(vector, k, candidates, Some(filter)).await
                })
                .await?;
            for hit in more {
                if !hits.iter().any(|h| h.doc_id == hit.doc_id) {
                    hits.push(hit);
                }
            }
        }
        hits.truncate(k);

        let mut neighbors = Vec::with_capacity(hits.len());
        for hit in hits {
            let txn = self
                .timed(thread_id, "fetch_neighbor", |t: &Option<Transaction>| {
                    t.is_some() as usize
                }, async {
                    self.history.get_transaction(&hit.doc_id).await
                })
                .await
                .unwrap_or_default();
            neighbors.push(Neighbor { hit, txn });
        }

        Ok(neighbors)
    }

    /// Drive the reasoner loop: run, execute requested tools, resubmit,
    /// until it completes with a parsable verdict or a budget runs out.
    async fn reason(&self, prompt: &str, thread_id: &str) -> Result<ReasonerVerdict> {
        let rid = self
            .retry_transient(|| self.reasoner.create_thread())
            .await?;
        self.retry_transient(|| self.reasoner.post_message(&rid, prompt))
            .await?;

        let defs = self.tools.defs();
        let mut tool_calls_used: u32 = 0;

        loop {
            let outcome = self
                .retry_transient(|| self.reasoner.run(&rid, &defs))
                .await?;

            match outcome {
                RunOutcome::Completed { message } => {
                    return parse_verdict(&message).ok_or_else(|| {
                        Error::Reasoner("reasoner returned no structured verdict".to_string())
                    });
                }
                RunOutcome::ToolCalls(calls) => {
                    if tool_calls_used + calls.len() as u32 > self.config.stage2_tool_budget {
                        return Err(Error::timeout(2, self.config.stage2_timeout_ms));
                    }
                    tool_calls_used += calls.len() as u32;

                    let mut outputs = Vec::with_capacity(calls.len());
                    for call in calls {
                        let call_start = Instant::now();
                        self.streamer
                            .emit(ObservabilityEvent::tool_call_start(thread_id, &call.name))
                            .await;

                        // A failing tool feeds its error back to the
                        // reasoner instead of aborting the run.
                        let output = match self.tools.execute(&call.name, call.arguments).await {
                            Ok(value) => value,
                            Err(err) => serde_json::json!({ "error": err.to_string() }),
                        };

                        let size = output.to_string().len();
                        self.streamer
                            .emit(ObservabilityEvent::tool_call_end(
                                thread_id,
                                &call.name,
                                call_start.elapsed().as_millis() as u64,
                                size,
                            ))
                            .await;

                        outputs.push(ToolOutput {
                            call_id: call.call_id,
                            output,
                        });
                    }

                    self.retry_transient(|| self.reasoner.submit_tool_outputs(&rid, outputs.clone()))
                        .await?;
                }
            }
        }
    }

    /// Single bounded retry on transient reasoner failures.
    async fn retry_transient<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        match call().await {
            Ok(value) => Ok(value),
            Err(err) if err.is_transient() => {
                warn!("transient reasoner failure, retrying once: {}", err);
                tokio::time::sleep(self.config.retry.delay_for_attempt(0)).await;
                call().await
            }
            Err(err) => Err(err),
        }
    }

    /// Emit ToolCallStart/ToolCallEnd around a retrieval step.
    async fn timed<T, F>(
        &self,
        thread_id: &str,
        name: &str,
        size: impl Fn(&T) -> usize,
        fut: F,
    ) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let start = Instant::now();
        self.streamer
            .emit(ObservabilityEvent::tool_call_start(thread_id, name))
            .await;

        match fut.await {
            Ok(value) => {
                self.streamer
                    .emit(ObservabilityEvent::tool_call_end(
                        thread_id,
                        name,
                        start.elapsed().as_millis() as u64,
                        size(&value),
                    ))
                    .await;
                Ok(value)
            }
            Err(err) => {
                self.streamer
                    .emit(ObservabilityEvent::error(
                        thread_id,
                        format!("{} failed: {}", name, err),
                    ))
                    .await;
                Err(err)
            }
        }
    }
}

/// Assemble the analysis prompt: transaction, triage summary, neighbors.
fn build_prompt(txn: &Transaction, stage1: &Stage1Result, neighbors: &[Neighbor]) -> String {
    let mut prompt = String::from(
        "Assess this financial transaction for fraud and money-laundering risk.\n\n",
    );

    prompt.push_str("## Transaction\n");
    prompt.push_str(&serde_json::to_string_pretty(txn).unwrap_or_default());

    prompt.push_str("\n\n## Triage summary\n");
    prompt.push_str(&format!(
        "rule_score: {:.2}, flags: [{}], ml_score: {}, combined_score: {:.1}\n",
        stage1.rule_score,
        stage1.rule_flags.join(", "),
        stage1
            .ml_score
            .map(|m| format!("{:.2}", m))
            .unwrap_or_else(|| "unknown".to_string()),
        stage1.combined_score,
    ));

    prompt.push_str("\n## Similar historical transactions\n");
    if neighbors.is_empty() {
        prompt.push_str("(none retrieved)\n");
    }
    for neighbor in neighbors {
        let annotation = neighbor
            .txn
            .as_ref()
            .map(|t| {
                format!(
                    "amount {:.2} {}, category {}, flagged: {}",
                    t.amount,
                    t.currency,
                    t.merchant.category,
                    t.flagged.map(|f| f.to_string()).unwrap_or_else(|| "unreviewed".to_string()),
                )
            })
            .unwrap_or_else(|| "details unavailable".to_string());
        prompt.push_str(&format!(
            "- {} (similarity {:.3}): {}\n",
            neighbor.hit.doc_id, neighbor.hit.similarity, annotation
        ));
    }

    prompt.push_str(
        "\nUse the available tools if you need more context. Reply with a JSON \
         object: {\"recommendation\": \"APPROVE|BLOCK|INVESTIGATE|ESCALATE\", \
         \"rationale\": \"...\", \"stage2_score\": 0-100, \"confidence\": 0-1}\n",
    );

    prompt
}
