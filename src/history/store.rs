//! SQLite-backed history store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::decision::Verdict;
use crate::error::{Error, Result};
use crate::graph::{EntityRef, Relationship, RelationshipDirection, RelationshipFilter};
use crate::history::schema::{initialize_schema, is_initialized};
use crate::history::HistoryStore;
use crate::transaction::{CustomerProfile, Device, Location, Merchant, Transaction};

/// SQLite-backed history store.
pub struct SqliteHistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistoryStore {
    /// Open or create a history store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::Storage(e.to_string()))?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Storage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::Storage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::Storage(e.to_string()))
    }

    // ==================== Write Operations ====================

    /// Insert or replace a customer profile.
    pub fn upsert_profile(&self, profile: &CustomerProfile) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO customers (
                    customer_id, mean_amount, std_amount, typical_categories,
                    typical_countries, active_start, active_end, status, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    profile.customer_id,
                    profile.mean_amount,
                    profile.std_amount,
                    serde_json::to_string(&profile.typical_categories).unwrap_or_default(),
                    serde_json::to_string(&profile.typical_countries).unwrap_or_default(),
                    profile.active_hours.0 as i64,
                    profile.active_hours.1 as i64,
                    profile.status,
                    profile.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    /// Insert a transaction.
    pub fn insert_transaction(&self, txn: &Transaction) -> Result<()> {
        self.with_conn(|conn| {
            let coords = txn
                .location
                .coords
                .map(|c| serde_json::to_string(&c).unwrap_or_default());
            let device = serde_json::to_string(&txn.device).ok();

            conn.execute(
                "INSERT INTO transactions (
                    txn_id, customer_id, timestamp, amount, currency,
                    merchant_id, merchant_name, merchant_category,
                    country, city, coords, device,
                    txn_type, payment_method, status, fraud_score, flagged, verdict
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    txn.txn_id,
                    txn.customer_id,
                    txn.timestamp.to_rfc3339(),
                    txn.amount,
                    txn.currency,
                    txn.merchant.id,
                    txn.merchant.name,
                    txn.merchant.category,
                    txn.location.country,
                    txn.location.city,
                    coords,
                    device,
                    txn.txn_type,
                    txn.payment_method,
                    txn.status,
                    txn.fraud_score,
                    txn.flagged.map(|f| f as i64),
                    Option::<String>::None,
                ],
            )?;
            Ok(())
        })
    }

    /// Insert a relationship.
    pub fn insert_relationship(&self, rel: &Relationship) -> Result<()> {
        self.with_conn(|conn| {
            let direction = match rel.direction {
                RelationshipDirection::Unidirectional => "unidirectional",
                RelationshipDirection::Bidirectional => "bidirectional",
                RelationshipDirection::Reverse => "reverse",
            };

            conn.execute(
                "INSERT INTO relationships (
                    rel_id, source_id, source_type, target_id, target_type,
                    rel_type, direction, strength, confidence,
                    active, verified, evidence, valid_from, valid_to
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    rel.rel_id,
                    rel.source.entity_id,
                    rel.source.entity_type,
                    rel.target.entity_id,
                    rel.target.entity_type,
                    rel.rel_type,
                    direction,
                    rel.strength,
                    rel.confidence,
                    rel.active as i64,
                    rel.verified as i64,
                    serde_json::to_string(&rel.evidence).unwrap_or_default(),
                    rel.valid_from.map(|t| t.to_rfc3339()),
                    rel.valid_to.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    // ==================== Row Mapping ====================

    fn row_to_profile(row: &rusqlite::Row) -> rusqlite::Result<CustomerProfile> {
        let categories: String = row.get(3)?;
        let countries: String = row.get(4)?;

        Ok(CustomerProfile {
            customer_id: row.get(0)?,
            mean_amount: row.get(1)?,
            std_amount: row.get(2)?,
            typical_categories: serde_json::from_str(&categories).unwrap_or_default(),
            typical_countries: serde_json::from_str(&countries).unwrap_or_default(),
            active_hours: (row.get::<_, i64>(5)? as u8, row.get::<_, i64>(6)? as u8),
            status: row.get(7)?,
            updated_at: parse_datetime(row.get::<_, String>(8)?),
        })
    }

    fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
        let coords: Option<(f64, f64)> = row
            .get::<_, Option<String>>(10)?
            .and_then(|s| serde_json::from_str(&s).ok());
        let device: Device = row
            .get::<_, Option<String>>(11)?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        Ok(Transaction {
            txn_id: row.get(0)?,
            customer_id: row.get(1)?,
            timestamp: parse_datetime(row.get::<_, String>(2)?),
            amount: row.get(3)?,
            currency: row.get(4)?,
            merchant: Merchant {
                id: row.get(5)?,
                name: row.get(6)?,
                category: row.get(7)?,
            },
            location: Location {
                country: row.get(8)?,
                city: row.get(9)?,
                coords,
            },
            device,
            txn_type: row.get(12)?,
            payment_method: row.get(13)?,
            status: row.get(14)?,
            fraud_score: row.get(15)?,
            flagged: row.get::<_, Option<i64>>(16)?.map(|f| f != 0),
        })
    }

    const TXN_COLUMNS: &'static str = "txn_id, customer_id, timestamp, amount, currency, \
         merchant_id, merchant_name, merchant_category, country, city, coords, device, \
         txn_type, payment_method, status, fraud_score, flagged";

    fn row_to_relationship(row: &rusqlite::Row) -> rusqlite::Result<Relationship> {
        let direction = match row.get::<_, String>(6)?.as_str() {
            "bidirectional" => RelationshipDirection::Bidirectional,
            "reverse" => RelationshipDirection::Reverse,
            _ => RelationshipDirection::Unidirectional,
        };
        let evidence: String = row.get(11)?;

        Ok(Relationship {
            rel_id: row.get(0)?,
            source: EntityRef {
                entity_id: row.get(1)?,
                entity_type: row.get(2)?,
            },
            target: EntityRef {
                entity_id: row.get(3)?,
                entity_type: row.get(4)?,
            },
            rel_type: row.get(5)?,
            direction,
            strength: row.get(7)?,
            confidence: row.get(8)?,
            active: row.get::<_, i64>(9)? != 0,
            verified: row.get::<_, i64>(10)? != 0,
            evidence: serde_json::from_str(&evidence).unwrap_or_default(),
            valid_from: row.get::<_, Option<String>>(12)?.map(parse_datetime),
            valid_to: row.get::<_, Option<String>>(13)?.map(parse_datetime),
        })
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn get_profile(&self, customer_id: &str) -> Result<Option<CustomerProfile>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT customer_id, mean_amount, std_amount, typical_categories,
                        typical_countries, active_start, active_end, status, updated_at
                 FROM customers WHERE customer_id = ?1",
                params![customer_id],
                Self::row_to_profile,
            )
            .optional()
        })
    }

    async fn recent_transactions(
        &self,
        customer_id: &str,
        window: Duration,
        cap: usize,
    ) -> Result<Vec<Transaction>> {
        let cutoff = (Utc::now() - window).to_rfc3339();

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM transactions
                 WHERE customer_id = ?1 AND timestamp >= ?2
                 ORDER BY timestamp DESC
                 LIMIT ?3",
                Self::TXN_COLUMNS
            ))?;

            let txns = stmt
                .query_map(params![customer_id, cutoff, cap as i64], Self::row_to_transaction)?
                .filter_map(|r| r.ok())
                .collect();

            Ok(txns)
        })
    }

    async fn get_transaction(&self, txn_id: &str) -> Result<Option<Transaction>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM transactions WHERE txn_id = ?1",
                    Self::TXN_COLUMNS
                ),
                params![txn_id],
                Self::row_to_transaction,
            )
            .optional()
        })
    }

    async fn get_relationships(
        &self,
        entity_id: &str,
        filter: &RelationshipFilter,
    ) -> Result<Vec<Relationship>> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT rel_id, source_id, source_type, target_id, target_type,
                        rel_type, direction, strength, confidence,
                        active, verified, evidence, valid_from, valid_to
                 FROM relationships
                 WHERE (source_id = ?1 OR target_id = ?1) AND confidence >= ?2",
            );
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![
                Box::new(entity_id.to_string()),
                Box::new(filter.min_confidence),
            ];

            if filter.only_active {
                sql.push_str(" AND active = 1");
            }

            if let Some(ref types) = filter.relationship_types {
                let placeholders: Vec<String> = types.iter().map(|_| "?".to_string()).collect();
                sql.push_str(&format!(" AND rel_type IN ({})", placeholders.join(",")));
                for t in types {
                    params_vec.push(Box::new(t.clone()));
                }
            }

            sql.push_str(" ORDER BY rel_id");

            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(&sql)?;
            let rels = stmt
                .query_map(params_refs.as_slice(), Self::row_to_relationship)?
                .filter_map(|r| r.ok())
                .collect();

            Ok(rels)
        })
    }

    async fn record_decision(&self, txn_id: &str, verdict: Verdict, risk_score: f64) -> Result<()> {
        let flagged = verdict != Verdict::Approve;

        self.with_conn(|conn| {
            conn.execute(
                "UPDATE transactions
                 SET verdict = ?2, flagged = ?3, fraud_score = ?4
                 WHERE txn_id = ?1",
                params![txn_id, verdict.to_string(), flagged as i64, risk_score],
            )?;
            Ok(())
        })
    }
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
