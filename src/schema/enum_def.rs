use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};

/// Wire protocol spoken by a channel's upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum, Default)]
#[db_enum(pg_type = "provider_type_enum")]
#[db_enum(value_style = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderType {
    #[default]
    Openai,
    Anthropic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, DbEnum, Default)]
#[db_enum(pg_type = "usage_status_enum")]
#[db_enum(value_style = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageStatus {
    #[default]
    Success,
    Cancelled,
    UpstreamError,
    UpstreamUnavailable,
    QuotaExceeded,
    InsufficientBalance,
}

impl UsageStatus {
    /// Whether a usage record with this status is charged to the caller.
    pub fn is_billable(self) -> bool {
        matches!(self, UsageStatus::Success | UsageStatus::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, DbEnum, Default)]
#[db_enum(pg_type = "transaction_type_enum")]
#[db_enum(value_style = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    #[default]
    Usage,
    Topup,
    Adjustment,
    Referral,
}
