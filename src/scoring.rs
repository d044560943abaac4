//! Customer-conditioned anomaly scoring for Stage-1.
//!
//! The scorer is a black box to the rest of the engine: any bounded function
//! over compact features qualifies. The triage analyzer tolerates `Unknown`
//! by shifting the combination weight fully onto rules.

use async_trait::async_trait;

use crate::error::Result;
use crate::transaction::{CustomerProfile, Transaction};

/// Output of an anomaly scorer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MlScore {
    /// Anomaly score in [0,1]
    Score(f64),
    /// The scorer has no signal for this transaction
    Unknown,
}

impl MlScore {
    pub fn value(&self) -> Option<f64> {
        match self {
            Self::Score(v) => Some(*v),
            Self::Unknown => None,
        }
    }
}

/// A bounded anomaly scorer over compact transaction features.
#[async_trait]
pub trait AnomalyScorer: Send + Sync {
    /// Score a transaction against the customer baseline.
    async fn score(&self, txn: &Transaction, profile: Option<&CustomerProfile>) -> Result<MlScore>;
}

/// Behavioral baseline scorer.
///
/// Scores the amount z-score through a saturating curve, then nudges for
/// novel country, novel merchant category, and off-hours activity. Returns
/// `Unknown` when the profile gives no usable baseline.
#[derive(Debug, Clone)]
pub struct BehavioralScorer {
    /// z-score divisor controlling how fast the amount term saturates
    pub z_scale: f64,
    pub novel_country_nudge: f64,
    pub novel_category_nudge: f64,
    pub off_hours_nudge: f64,
}

impl Default for BehavioralScorer {
    fn default() -> Self {
        Self {
            z_scale: 4.0,
            novel_country_nudge: 0.15,
            novel_category_nudge: 0.10,
            off_hours_nudge: 0.10,
        }
    }
}

impl BehavioralScorer {
    pub fn new() -> Self {
        Self::default()
    }

    fn amount_term(&self, amount: f64, profile: &CustomerProfile) -> f64 {
        let std = profile.std_amount.max(f64::EPSILON);
        let z = (amount - profile.mean_amount) / std;
        // Saturates toward 1 as the amount drifts above baseline.
        1.0 - (-z.max(0.0) / self.z_scale).exp()
    }
}

#[async_trait]
impl AnomalyScorer for BehavioralScorer {
    async fn score(&self, txn: &Transaction, profile: Option<&CustomerProfile>) -> Result<MlScore> {
        let profile = match profile {
            Some(p) if p.std_amount > 0.0 || p.mean_amount > 0.0 => p,
            _ => return Ok(MlScore::Unknown),
        };

        let mut score = self.amount_term(txn.amount, profile);

        if !txn.location.country.is_empty() && !profile.knows_country(&txn.location.country) {
            score += self.novel_country_nudge;
        }
        if !profile.knows_category(&txn.merchant.category) {
            score += self.novel_category_nudge;
        }
        if !profile.is_active_hour(txn.hour()) {
            score += self.off_hours_nudge;
        }

        Ok(MlScore::Score(score.clamp(0.0, 1.0)))
    }
}
