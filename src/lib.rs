//! # framl-core
//!
//! A two-stage progressive fraud/AML decision engine with
//! retrieval-augmented reasoning.
//!
//! ## Core Components
//!
//! - **Stage-1**: fast triage combining declarative rules and a light
//!   anomaly scorer over the transaction and cheap customer history
//! - **Stage-2**: deferred deep analysis pairing vector-similarity
//!   retrieval with a tool-using LLM reasoner
//! - **Arbitrator**: threshold routing between the stages, Decision and
//!   Thread ownership, at-most-once finalization
//! - **Observability**: typed lifecycle events per analysis thread, with
//!   push subscriptions and polling
//! - **Network traversal**: bounded BFS over the relationships store with
//!   de-duplication of bidirectional edges
//!
//! ## Example
//!
//! ```rust,ignore
//! use framl_core::{DecisionArbitrator, EngineConfig, Verdict};
//!
//! let decision = arbitrator.analyze(&txn).await?;
//! match decision.verdict {
//!     Verdict::Approve | Verdict::Block => println!("settled in stage 1"),
//!     _ => println!("deep analysis on thread {}", decision.thread_id),
//! }
//! ```

pub mod arbiter;
pub mod config;
pub mod decision;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod history;
pub mod index;
pub mod observability;
pub mod reasoner;
pub mod rules;
pub mod scoring;
pub mod stage1;
pub mod stage2;
pub mod transaction;

// Re-exports for convenience
pub use arbiter::{DecisionArbitrator, EngineStatus};
pub use config::{EngineConfig, RetryConfig, RuleWeights};
pub use decision::{
    Decision, DecisionState, RiskLevel, Stage1Result, Stage2Result, Thread, Verdict,
};
pub use embedding::{
    CachedEmbedder, EmbeddingClientConfig, EmbeddingKey, EmbeddingProvider, HttpEmbeddingClient,
    RetryingEmbedder,
};
pub use error::{Error, Result};
pub use graph::{
    EntityRef, Evidence, NetworkEdge, NetworkGraph, NetworkNode, NetworkParams, NetworkTraversal,
    Relationship, RelationshipDirection, RelationshipFilter,
};
pub use history::{HistoryStore, SqliteHistoryStore};
pub use index::{DocMeta, InMemoryVectorIndex, KnnFilter, ScoredId, VectorIndex};
pub use observability::{
    BoxedEventStream, EventKind, EventStream, ObservabilityEvent, ObservabilityStreamer,
    StreamerStats, POLLING_INTERVAL_MS,
};
pub use reasoner::{
    fraud_tools, parse_verdict, ReasonerClient, ReasonerVerdict, RunOutcome, ToolCallRequest,
    ToolDef, ToolHandler, ToolOutput, ToolRegistry,
};
pub use rules::{RuleDef, RuleEngine, RuleOutcome, RulePredicate, RuleTable};
pub use scoring::{AnomalyScorer, BehavioralScorer, MlScore};
pub use stage1::Stage1Analyzer;
pub use stage2::Stage2Analyzer;
pub use transaction::{
    canonical_text, CustomerProfile, Device, Location, Merchant, Transaction,
};
