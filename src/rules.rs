//! Declarative rule engine for Stage-1 triage.
//!
//! Rules are pure weighted predicates over a transaction and its customer
//! profile. The score is the sum of fired weights clipped to 1; a predicate
//! that cannot be evaluated counts as not fired, never as a failure of the
//! whole evaluation.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::RuleWeights;
use crate::transaction::{CustomerProfile, Transaction};

/// Default country list for the high-risk country rule.
pub const DEFAULT_HIGH_RISK_COUNTRIES: &[&str] = &["IR", "KP", "LY", "MM", "SY"];

/// Default merchant categories for the high-risk category rule.
pub const DEFAULT_HIGH_RISK_CATEGORIES: &[&str] = &["crypto", "gambling", "money_transfer"];

/// Default absolute amount threshold.
pub const DEFAULT_AMOUNT_THRESHOLD: f64 = 5_000.0;

/// Default multiplier for the relative amount rule (`mean + k·std`).
pub const DEFAULT_STD_MULTIPLIER: f64 = 3.0;

/// Hours considered off-hours when the customer has no profile.
const FALLBACK_NIGHT_END: u8 = 5;

/// A typed rule predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RulePredicate {
    /// Transaction country is on the given list
    HighRiskCountry { countries: Vec<String> },
    /// Amount exceeds a fixed threshold
    AmountThreshold { threshold: f64 },
    /// Amount exceeds the customer baseline by `std_multiplier` deviations
    RelativeAmount { std_multiplier: f64 },
    /// Transaction falls outside the customer's active hours
    OffHours,
    /// Merchant category is on the given list
    HighRiskCategory { categories: Vec<String> },
}

impl RulePredicate {
    /// Evaluate against a transaction.
    ///
    /// Returns `None` when the predicate cannot be decided (e.g. a relative
    /// rule without a profile); the caller treats that as not fired.
    fn evaluate(&self, txn: &Transaction, profile: Option<&CustomerProfile>) -> Option<bool> {
        match self {
            Self::HighRiskCountry { countries } => {
                if txn.location.country.is_empty() {
                    return None;
                }
                Some(countries.iter().any(|c| c == &txn.location.country))
            }
            Self::AmountThreshold { threshold } => Some(txn.amount > *threshold),
            Self::RelativeAmount { std_multiplier } => {
                let profile = profile?;
                if profile.std_amount <= 0.0 {
                    return None;
                }
                Some(txn.amount > profile.mean_amount + std_multiplier * profile.std_amount)
            }
            Self::OffHours => {
                let hour = txn.hour();
                match profile {
                    Some(p) => Some(!p.is_active_hour(hour)),
                    // Without a baseline, only the dead of night counts.
                    None => Some(hour <= FALLBACK_NIGHT_END),
                }
            }
            Self::HighRiskCategory { categories } => {
                Some(categories.iter().any(|c| c == &txn.merchant.category))
            }
        }
    }
}

/// A named, weighted rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDef {
    pub name: String,
    pub predicate: RulePredicate,
    /// Non-negative contribution when the rule fires
    pub weight: f64,
}

impl RuleDef {
    pub fn new(name: impl Into<String>, predicate: RulePredicate, weight: f64) -> Self {
        Self {
            name: name.into(),
            predicate,
            weight: weight.max(0.0),
        }
    }
}

/// Result of evaluating the rule table against one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    /// Sum of fired weights, clipped to 1
    pub score: f64,
    /// Names of the fired rules
    pub flags: Vec<String>,
}

/// An immutable set of rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleTable {
    rules: Vec<RuleDef>,
}

impl RuleTable {
    pub fn new(rules: Vec<RuleDef>) -> Self {
        Self { rules }
    }

    /// Build the standard table from configured weights; a `None` weight
    /// leaves that rule out entirely.
    pub fn standard(weights: &RuleWeights) -> Self {
        let mut rules = Vec::new();

        if let Some(w) = weights.high_risk_country {
            rules.push(RuleDef::new(
                "high_risk_country",
                RulePredicate::HighRiskCountry {
                    countries: DEFAULT_HIGH_RISK_COUNTRIES.iter().map(|s| s.to_string()).collect(),
                },
                w,
            ));
        }
        if let Some(w) = weights.amount_threshold {
            rules.push(RuleDef::new(
                "amount_threshold",
                RulePredicate::AmountThreshold {
                    threshold: DEFAULT_AMOUNT_THRESHOLD,
                },
                w,
            ));
        }
        if let Some(w) = weights.relative_amount {
            rules.push(RuleDef::new(
                "relative_amount",
                RulePredicate::RelativeAmount {
                    std_multiplier: DEFAULT_STD_MULTIPLIER,
                },
                w,
            ));
        }
        if let Some(w) = weights.off_hours {
            rules.push(RuleDef::new("off_hours", RulePredicate::OffHours, w));
        }
        if let Some(w) = weights.merchant_category {
            rules.push(RuleDef::new(
                "high_risk_merchant_category",
                RulePredicate::HighRiskCategory {
                    categories: DEFAULT_HIGH_RISK_CATEGORIES.iter().map(|s| s.to_string()).collect(),
                },
                w,
            ));
        }

        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate all rules. Order is irrelevant; undecidable predicates are
    /// logged and skipped.
    pub fn evaluate(&self, txn: &Transaction, profile: Option<&CustomerProfile>) -> RuleOutcome {
        let mut score = 0.0;
        let mut flags = Vec::new();

        for rule in &self.rules {
            match rule.predicate.evaluate(txn, profile) {
                Some(true) => {
                    score += rule.weight;
                    flags.push(rule.name.clone());
                }
                Some(false) => {}
                None => {
                    debug!(rule = %rule.name, txn_id = %txn.txn_id, "rule undecidable, treated as not fired");
                }
            }
        }

        RuleOutcome {
            score: score.min(1.0),
            flags,
        }
    }
}

/// Thread-safe rule engine with whole-table replacement.
///
/// Readers clone an `Arc` of the current table; writers swap the table in
/// one step so no evaluation ever sees a partial update.
pub struct RuleEngine {
    table: RwLock<Arc<RuleTable>>,
}

impl RuleEngine {
    pub fn new(table: RuleTable) -> Self {
        Self {
            table: RwLock::new(Arc::new(table)),
        }
    }

    /// Build from configured weights.
    pub fn standard(weights: &RuleWeights) -> Self {
        Self::new(RuleTable::standard(weights))
    }

    /// Evaluate the current table.
    pub async fn evaluate(
        &self,
        txn: &Transaction,
        profile: Option<&CustomerProfile>,
    ) -> RuleOutcome {
        let table = self.table.read().await.clone();
        table.evaluate(txn, profile)
    }

    /// Replace the whole rule table.
    pub async fn replace_table(&self, table: RuleTable) {
        let mut guard = self.table.write().await;
        *guard = Arc::new(table);
    }

    /// Snapshot of the current table.
    pub async fn table(&self) -> Arc<RuleTable> {
        self.table.read().await.clone()
    }
}
