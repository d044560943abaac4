//! Customer history store.
//!
//! Read-mostly access to customer profiles, past transactions, and entity
//! relationships. Reads never block writers and may be stale; that is
//! acceptable to every caller in the engine.

mod schema;
pub mod store;

pub use store::SqliteHistoryStore;

use async_trait::async_trait;
use chrono::Duration;

use crate::decision::Verdict;
use crate::error::Result;
use crate::graph::{Relationship, RelationshipFilter};
use crate::transaction::{CustomerProfile, Transaction};

/// On-demand reads over customer history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Baseline profile for a customer, if one exists.
    async fn get_profile(&self, customer_id: &str) -> Result<Option<CustomerProfile>>;

    /// Transactions inside the window, newest first, bounded by `cap`.
    async fn recent_transactions(
        &self,
        customer_id: &str,
        window: Duration,
        cap: usize,
    ) -> Result<Vec<Transaction>>;

    /// A single transaction by id, with any recorded verdict annotations.
    async fn get_transaction(&self, txn_id: &str) -> Result<Option<Transaction>>;

    /// Relationships touching an entity, filtered, ordered by rel_id.
    async fn get_relationships(
        &self,
        entity_id: &str,
        filter: &RelationshipFilter,
    ) -> Result<Vec<Relationship>>;

    /// Persist verdict annotations onto a stored transaction.
    async fn record_decision(&self, txn_id: &str, verdict: Verdict, risk_score: f64) -> Result<()>;
}
