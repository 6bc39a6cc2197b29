// Cache-side projections of database records. Secrets (encrypted key copies,
// channel credentials) are never part of a cached value.

use serde::{de, Deserialize, Serialize};
use serde_with::serde_as;
use std::sync::Arc;

use crate::database::api_key::ApiKey;
use crate::database::model::Model;

/// Represents an entry in the cache, which can either be a value (Positive)
/// or a marker indicating the value does not exist (Negative).
#[serde_as]
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub enum CacheEntry<T: Clone + Serialize + de::DeserializeOwned> {
    Positive(#[serde_as(as = "Arc<serde_with::Same>")] Arc<T>),
    Negative,
}

/// Authentication view of an API key, keyed by the key hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheApiKey {
    pub id: i64,
    pub account_id: i64,
    pub key_hash: String,
    pub is_active: bool,
    pub expires_at: Option<i64>,
    pub total_quota: Option<i64>,
    pub rate_limit: Option<i32>,
}

impl CacheApiKey {
    /// Short, non-secret handle for log lines.
    pub fn log_tag(&self) -> &str {
        let start = self.key_hash.len().saturating_sub(4);
        &self.key_hash[start..]
    }
}

/// Pricing and listing view of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheModel {
    pub id: i64,
    pub model_name: String,
    pub display_name: String,
    pub category: String,
    pub input_cost: i64,
    pub output_cost: i64,
    pub input_price: i64,
    pub output_price: i64,
    pub max_context: i32,
    pub created_at: i64,
}

impl From<ApiKey> for CacheApiKey {
    fn from(db: ApiKey) -> Self {
        Self {
            id: db.id,
            account_id: db.account_id,
            key_hash: db.key_hash,
            is_active: db.is_active,
            expires_at: db.expires_at,
            total_quota: db.total_quota,
            rate_limit: db.rate_limit,
        }
    }
}

impl From<Model> for CacheModel {
    fn from(db: Model) -> Self {
        Self {
            id: db.id,
            model_name: db.model_name,
            display_name: db.display_name,
            category: db.category,
            input_cost: db.input_cost,
            output_cost: db.output_cost,
            input_price: db.input_price,
            output_price: db.output_price,
            max_context: db.max_context,
            created_at: db.created_at,
        }
    }
}
