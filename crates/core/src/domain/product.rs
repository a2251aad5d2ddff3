use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProductId(pub String);

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A research hit before the product has been tracked by the commerce
/// provider. Best-effort ranked; carries only what the search API returns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCandidate {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// A normalized product record as resolved through the commerce provider.
///
/// Immutable once fetched; a re-fetch produces a new record with a fresh
/// `fetched_at`, it never mutates an existing one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub url: String,
    pub title: String,
    pub price: Decimal,
    pub currency: String,
    pub available: bool,
    pub images: Vec<String>,
    /// Provider-specific extras (e.g. the Amazon ASIN), kept opaque.
    pub metadata: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
}
