use std::sync::Arc;
use std::time::Instant;

use cyder_tools::log::{error, warn};
use serde_json::Value;

use crate::schema::enum_def::UsageStatus;
use crate::service::app_state::AppState;
use crate::service::settlement::{settle, SettlementOutcome, SettlementRecord};
use crate::service::transform::chunk_delta_text;
use crate::utils::billing::{estimate_tokens, TokenUsage};

/// Token accounting for one response. Upstream-reported usage wins over
/// estimates.
#[derive(Debug, Default)]
pub(super) struct UsageMeter {
    prompt_estimate: i64,
    completion_text: String,
    reported: Option<TokenUsage>,
}

impl UsageMeter {
    pub fn new(prompt_estimate: i64) -> Self {
        Self {
            prompt_estimate,
            ..Default::default()
        }
    }

    pub fn observe_chunk(&mut self, chunk: &Value) {
        if let Some(usage) = chunk.get("usage").and_then(TokenUsage::from_openai_usage) {
            self.reported = Some(usage);
        }
        self.completion_text.push_str(&chunk_delta_text(chunk));
    }

    pub fn observe_text(&mut self, text: &str) {
        self.completion_text.push_str(text);
    }

    pub fn report(&mut self, usage: TokenUsage) {
        self.reported = Some(usage);
    }

    pub fn usage(&self) -> TokenUsage {
        self.reported
            .unwrap_or_else(|| TokenUsage::new(self.prompt_estimate, estimate_tokens(&self.completion_text)))
    }
}

/// Settles a request exactly once. If dropped before `finish`, the request
/// is settled in the background as cancelled with the tokens metered so far.
pub(super) struct SettlementGuard {
    app_state: Arc<AppState>,
    record: Option<SettlementRecord>,
    started: Instant,
    pub meter: UsageMeter,
}

impl SettlementGuard {
    pub fn new(app_state: Arc<AppState>, record: SettlementRecord, meter: UsageMeter) -> Self {
        Self {
            app_state,
            record: Some(record),
            started: Instant::now(),
            meter,
        }
    }

    pub fn set_channel(&mut self, channel_id: i64) {
        if let Some(record) = self.record.as_mut() {
            record.channel_id = Some(channel_id);
        }
    }

    fn take_record(&mut self, status: UsageStatus, error_message: Option<String>) -> Option<SettlementRecord> {
        let mut record = self.record.take()?;
        record.status = status;
        record.error_message = error_message;
        record.usage = self.meter.usage();
        record.duration_ms = self.started.elapsed().as_millis() as i64;
        Some(record)
    }

    /// Settles with the final status. Store failures are logged and
    /// swallowed; the caller then gets `None`.
    pub async fn finish(mut self, status: UsageStatus, error_message: Option<String>) -> Option<SettlementOutcome> {
        let record = self.take_record(status, error_message)?;
        let request_id = record.request_id;
        match settle(&self.app_state.db, record).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("settlement for request {} failed: {}", request_id, e);
                None
            }
        }
    }
}

impl Drop for SettlementGuard {
    fn drop(&mut self) {
        let Some(record) = self.take_record(UsageStatus::Cancelled, Some("client disconnected".to_string())) else {
            return;
        };
        warn!(
            "request {} was cancelled by the client after {} completion tokens",
            record.request_id, record.usage.completion_tokens
        );
        let db = self.app_state.db.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let request_id = record.request_id;
                    if let Err(e) = settle(&db, record).await {
                        error!("settlement for cancelled request {} failed: {}", request_id, e);
                    }
                });
            }
            Err(_) => error!("no runtime to settle cancelled request {}", record.request_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_meter_prefers_reported_usage() {
        let mut meter = UsageMeter::new(10);
        meter.observe_chunk(&json!({"choices": [{"delta": {"content": "12345678"}}]}));
        assert_eq!(meter.usage(), TokenUsage::new(10, 2));

        meter.observe_chunk(&json!({
            "choices": [],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }));
        assert_eq!(meter.usage(), TokenUsage::new(12, 3));
    }

    #[test]
    fn test_meter_estimates_across_chunks() {
        let mut meter = UsageMeter::new(0);
        // 5 + 5 chars round up once, not per chunk.
        meter.observe_chunk(&json!({"choices": [{"delta": {"content": "hello"}}]}));
        meter.observe_chunk(&json!({"choices": [{"delta": {"content": "world"}}]}));
        assert_eq!(meter.usage().completion_tokens, 3);
    }
}
