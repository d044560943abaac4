//! SQLite schema for the history store.

use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE customers (
    customer_id        TEXT PRIMARY KEY,
    mean_amount        REAL NOT NULL,
    std_amount         REAL NOT NULL,
    typical_categories TEXT NOT NULL,
    typical_countries  TEXT NOT NULL,
    active_start       INTEGER NOT NULL,
    active_end         INTEGER NOT NULL,
    status             TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);

CREATE TABLE transactions (
    txn_id            TEXT PRIMARY KEY,
    customer_id       TEXT NOT NULL,
    timestamp         TEXT NOT NULL,
    amount            REAL NOT NULL,
    currency          TEXT NOT NULL,
    merchant_id       TEXT NOT NULL,
    merchant_name     TEXT NOT NULL,
    merchant_category TEXT NOT NULL,
    country           TEXT NOT NULL,
    city              TEXT NOT NULL,
    coords            TEXT,
    device            TEXT,
    txn_type          TEXT NOT NULL,
    payment_method    TEXT NOT NULL,
    status            TEXT NOT NULL,
    fraud_score       REAL,
    flagged           INTEGER,
    verdict           TEXT
);

CREATE INDEX idx_transactions_customer
    ON transactions (customer_id, timestamp DESC);

CREATE TABLE relationships (
    rel_id      TEXT PRIMARY KEY,
    source_id   TEXT NOT NULL,
    source_type TEXT NOT NULL,
    target_id   TEXT NOT NULL,
    target_type TEXT NOT NULL,
    rel_type    TEXT NOT NULL,
    direction   TEXT NOT NULL,
    strength    REAL NOT NULL,
    confidence  REAL NOT NULL,
    active      INTEGER NOT NULL,
    verified    INTEGER NOT NULL,
    evidence    TEXT NOT NULL,
    valid_from  TEXT,
    valid_to    TEXT
);

CREATE INDEX idx_relationships_source ON relationships (source_id);
CREATE INDEX idx_relationships_target ON relationships (target_id);
"#;

/// Create all tables and indexes.
pub fn initialize_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

/// Whether the schema has already been created.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'transactions'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}
