//! Decision, verdict, and analysis-stage result types.
//!
//! A `Decision` is created when Stage-1 completes, mutated exactly once if
//! Stage-2 completes, and never mutated thereafter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Final or provisional verdict for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approve,
    Block,
    Investigate,
    Escalate,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Approve => "APPROVE",
            Self::Block => "BLOCK",
            Self::Investigate => "INVESTIGATE",
            Self::Escalate => "ESCALATE",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "APPROVE" => Ok(Self::Approve),
            "BLOCK" => Ok(Self::Block),
            "INVESTIGATE" => Ok(Self::Investigate),
            "ESCALATE" => Ok(Self::Escalate),
            other => Err(format!("unknown verdict: {}", other)),
        }
    }
}

/// Risk band derived from a 0-100 score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Map a 0-100 risk score onto a band.
    pub fn from_score(score: f64) -> Self {
        if score < 25.0 {
            Self::Low
        } else if score < 60.0 {
            Self::Medium
        } else if score < 85.0 {
            Self::High
        } else {
            Self::Critical
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

/// Output of the Stage-1 triage pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage1Result {
    /// Weighted rule score in [0,1]
    pub rule_score: f64,
    /// Names of the rules that fired
    pub rule_flags: Vec<String>,
    /// Anomaly score in [0,1]; `None` when the scorer returned unknown
    pub ml_score: Option<f64>,
    /// Combined 0-100 score driving the routing decision
    pub combined_score: f64,
    /// Whether the score fell in the ambiguous band
    pub needs_stage2: bool,
    pub elapsed_ms: u64,
}

/// Output of the Stage-2 deep analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage2Result {
    /// Ids of retrieved neighbor transactions
    pub similar_txn_ids: Vec<String>,
    pub llm_recommendation: Verdict,
    pub llm_rationale: String,
    /// Reasoner-assessed 0-100 score
    pub stage2_score: f64,
    /// Reasoner-reported confidence, 0.5 when degraded
    pub confidence: f64,
    /// Set when the run exceeded its wall-clock or tool budget
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

impl Stage2Result {
    /// The tie-break result when the reasoner failed to produce a
    /// structured verdict within budget.
    pub fn degraded(stage1_score: f64, rationale: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            similar_txn_ids: Vec::new(),
            llm_recommendation: Verdict::Investigate,
            llm_rationale: rationale.into(),
            stage2_score: stage1_score.max(50.0),
            confidence: 0.5,
            timed_out: true,
            elapsed_ms,
        }
    }
}

/// Lifecycle of a decision record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Init,
    Stage1Done,
    Stage2Pending,
    Stage2Done,
    /// Stage-2 ran past the hard cap; the decision finalizes as INVESTIGATE
    Expired,
    Final,
}

/// The verdict record for one transaction analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub txn_id: String,
    pub thread_id: String,
    pub verdict: Verdict,
    pub risk_level: RiskLevel,
    /// 0-100
    pub risk_score: f64,
    /// 0-1
    pub confidence: f64,
    /// 1 when Stage-1 was sufficient, 2 when Stage-2 finalized
    pub stage_completed: u8,
    pub reasoning: String,
    pub total_elapsed_ms: u64,
    pub stage1: Stage1Result,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage2: Option<Stage2Result>,
}

/// Ephemeral correlation context for one transaction analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub txn_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Thread {
    /// Create a thread with the given lifetime.
    pub fn new(txn_id: impl Into<String>, ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            thread_id: uuid::Uuid::new_v4().to_string(),
            txn_id: txn_id.into(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs as i64),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
