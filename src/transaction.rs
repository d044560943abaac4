//! Transaction and customer profile types.
//!
//! Transactions are externally supplied and immutable within an analysis.
//! The canonical text representation used for embedding lives here so the
//! indexing and query paths share one definition.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Merchant details on a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
    pub id: String,
    pub name: String,
    pub category: String,
}

/// Where the transaction took place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// ISO 3166 country code; may be absent in degraded feeds
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub city: String,
    /// Latitude/longitude when the feed provides them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coords: Option<(f64, f64)>,
}

/// Device fingerprint, all fields optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// A financial transaction under analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub txn_id: String,
    pub customer_id: String,
    pub timestamp: DateTime<Utc>,
    pub amount: f64,
    /// ISO 4217 code
    pub currency: String,
    pub merchant: Merchant,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub device: Device,
    #[serde(rename = "type")]
    pub txn_type: String,
    pub payment_method: String,
    #[serde(default)]
    pub status: String,
    /// Rule score recorded by a prior analysis, present when read back
    /// from the history store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraud_score: Option<f64>,
    /// Whether a prior analysis flagged this transaction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flagged: Option<bool>,
}

impl Transaction {
    /// Check structural validity before any analysis is performed.
    pub fn validate(&self) -> Result<()> {
        if self.txn_id.is_empty() {
            return Err(Error::invalid_input("txn_id must not be empty"));
        }
        if self.customer_id.is_empty() {
            return Err(Error::invalid_input("customer_id must not be empty"));
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(Error::invalid_input(format!(
                "amount must be a non-negative number, got {}",
                self.amount
            )));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(Error::invalid_input(format!(
                "currency must be a 3-letter ISO 4217 code, got {:?}",
                self.currency
            )));
        }
        Ok(())
    }

    /// Hour-of-day (UTC) the transaction occurred.
    pub fn hour(&self) -> u8 {
        self.timestamp.hour() as u8
    }
}

/// Canonical text representation of a transaction.
///
/// This is the single encoding used both when indexing historical
/// transactions and when querying for neighbors. It must stay bit-for-bit
/// stable: any drift between the two paths skews retrieval.
pub fn canonical_text(txn: &Transaction) -> String {
    format!(
        "{:.2} {} {} {} {} {}",
        txn.amount,
        txn.currency,
        txn.location.country,
        txn.merchant.category,
        txn.payment_method,
        txn.txn_type,
    )
}

/// Baseline statistics for a customer, read-only within an analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub customer_id: String,
    /// Mean historical transaction amount
    pub mean_amount: f64,
    /// Standard deviation of historical amounts
    pub std_amount: f64,
    pub typical_categories: Vec<String>,
    pub typical_countries: Vec<String>,
    /// Inclusive local-hour band the customer is normally active in
    pub active_hours: (u8, u8),
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

impl CustomerProfile {
    /// Whether the given hour falls inside the customer's active band.
    ///
    /// Bands may wrap midnight, e.g. (22, 6).
    pub fn is_active_hour(&self, hour: u8) -> bool {
        let (start, end) = self.active_hours;
        if start <= end {
            (start..=end).contains(&hour)
        } else {
            hour >= start || hour <= end
        }
    }

    /// Whether this merchant category appears in the customer's history.
    pub fn knows_category(&self, category: &str) -> bool {
        self.typical_categories.iter().any(|c| c == category)
    }

    /// Whether this country appears in the customer's history.
    pub fn knows_country(&self, country: &str) -> bool {
        self.typical_countries.iter().any(|c| c == country)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    /// A plain grocery purchase by a known customer.
    pub fn grocery_txn() -> Transaction {
        Transaction {
            txn_id: "TXN-0001".to_string(),
            customer_id: "CUST-100".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 10, 14, 30, 0).unwrap(),
            amount: 45.99,
            currency: "USD".to_string(),
            merchant: Merchant {
                id: "M-77".to_string(),
                name: "Fresh Mart".to_string(),
                category: "grocery".to_string(),
            },
            location: Location {
                country: "US".to_string(),
                city: "Austin".to_string(),
                coords: None,
            },
            device: Device::default(),
            txn_type: "purchase".to_string(),
            payment_method: "card".to_string(),
            status: "pending".to_string(),
            fraud_score: None,
            flagged: None,
        }
    }

    /// A large crypto purchase at 02:30 from an unfamiliar country.
    pub fn crypto_txn() -> Transaction {
        Transaction {
            txn_id: "TXN-0002".to_string(),
            customer_id: "CUST-100".to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 3, 11, 2, 30, 0).unwrap(),
            amount: 15_000.0,
            currency: "USD".to_string(),
            merchant: Merchant {
                id: "M-666".to_string(),
                name: "CoinNow".to_string(),
                category: "crypto".to_string(),
            },
            location: Location {
                country: "LY".to_string(),
                city: String::new(),
                coords: None,
            },
            device: Device::default(),
            txn_type: "purchase".to_string(),
            payment_method: "card".to_string(),
            status: "pending".to_string(),
            fraud_score: None,
            flagged: None,
        }
    }

    pub fn profile() -> CustomerProfile {
        CustomerProfile {
            customer_id: "CUST-100".to_string(),
            mean_amount: 80.0,
            std_amount: 40.0,
            typical_categories: vec!["grocery".to_string(), "fuel".to_string()],
            typical_countries: vec!["US".to_string()],
            active_hours: (7, 22),
            status: "active".to_string(),
            updated_at: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
        }
    }
}
