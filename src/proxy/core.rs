use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::response::{IntoResponse, Response};
use axum::Json;
use cyder_tools::log::{error, info, warn};
use futures::StreamExt;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use serde_json::Value;

use super::settlement::SettlementGuard;
use super::upstream::{FrameStream, UpstreamError, UpstreamReply};
use crate::database::channel::RoutableChannel;
use crate::error::GatewayError;
use crate::schema::enum_def::UsageStatus;
use crate::service::app_state::AppState;
use crate::service::settlement::SettlementOutcome;
use crate::service::transform::{content_text, is_usage_only_chunk, rewrite_identity, ChatRequest, StreamFrame};
use crate::utils::billing::TokenUsage;
use crate::utils::sse::{done_frame, SseEvent};

/// Why the failover loop gave up.
#[derive(Debug)]
pub(super) struct FailoverFailure {
    pub error: GatewayError,
    pub status: UsageStatus,
    pub last_channel: Option<i64>,
    pub detail: String,
}

/// Tries candidates in order until one answers. Retryable failures move on
/// to the next channel, at most `max_attempts` channels are tried, and a
/// non-retryable failure ends the loop at once.
pub(super) async fn dispatch_with_failover(
    app_state: &Arc<AppState>,
    candidates: Vec<RoutableChannel>,
    request: &ChatRequest,
) -> Result<(RoutableChannel, UpstreamReply), FailoverFailure> {
    let max_attempts = app_state.config.upstream.max_attempts.max(1);
    let mut tried: Vec<i64> = Vec::with_capacity(max_attempts);
    let mut last_error: Option<UpstreamError> = None;

    for candidate in candidates {
        if tried.len() >= max_attempts {
            break;
        }
        let channel_id = candidate.channel.id;
        if tried.contains(&channel_id) {
            continue;
        }
        tried.push(channel_id);

        match app_state.dispatcher.dispatch(&candidate, request).await {
            Ok(reply) => {
                if tried.len() > 1 {
                    info!("{}: channel {} answered after {} attempts", request.model, channel_id, tried.len());
                }
                return Ok((candidate, reply));
            }
            Err(e) if e.is_retryable() => {
                warn!("{}: channel {} failed, trying next: {}", request.model, channel_id, e);
                last_error = Some(e);
            }
            Err(e) => {
                warn!("{}: channel {} rejected the request: {}", request.model, channel_id, e);
                return Err(FailoverFailure {
                    error: GatewayError::upstream_rejected(e.status),
                    detail: e.message,
                    status: UsageStatus::UpstreamError,
                    last_channel: Some(channel_id),
                });
            }
        }
    }

    let detail = last_error
        .map(|e| e.message)
        .unwrap_or_else(|| "no channel could be tried".to_string());
    error!("{}: all channels failed after {} attempts: {}", request.model, tried.len(), detail);
    Err(FailoverFailure {
        error: GatewayError::UpstreamUnavailable(
            "The model is currently unavailable. Please try again later.".to_string(),
        ),
        status: UsageStatus::UpstreamUnavailable,
        last_channel: tried.last().copied(),
        detail,
    })
}

/// Text of every choice message in a buffered completion.
fn completion_text(body: &Value) -> String {
    body.get("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .filter_map(|c| c.pointer("/message/content"))
                .map(content_text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

pub(super) async fn buffered_response(
    mut guard: SettlementGuard,
    mut body: Value,
    usage: Option<TokenUsage>,
    response_id: &str,
    model: &str,
) -> Result<Response, GatewayError> {
    rewrite_identity(&mut body, response_id, model);
    match usage {
        Some(usage) => guard.meter.report(usage),
        None => guard.meter.observe_text(&completion_text(&body)),
    }

    if let Some(SettlementOutcome::Rejected { status, .. }) = guard.finish(UsageStatus::Success, None).await {
        let message = if status == UsageStatus::QuotaExceeded {
            "You exceeded the quota of this API key."
        } else {
            "You exceeded your current quota, please check your balance."
        };
        return Err(GatewayError::InsufficientQuota(message.to_string()));
    }
    Ok(Json(body).into_response())
}

fn sse_chunk(value: &Value) -> Bytes {
    SseEvent::data(value.to_string()).to_bytes()
}

/// Forwards normalized frames to the caller as SSE, metering as it goes.
/// Settlement happens before the closing `[DONE]`; if the caller goes away
/// first, the guard settles what was delivered.
pub(super) fn streaming_response(
    guard: SettlementGuard,
    frames: FrameStream,
    response_id: String,
    model: String,
    include_usage: bool,
) -> Response {
    let stream = async_stream::stream! {
        let mut guard = guard;
        let mut frames = frames;
        let mut failure: Option<String> = None;

        'frames: while let Some(frame) = frames.next().await {
            match frame {
                Ok(StreamFrame::Chunk(mut chunk)) => {
                    guard.meter.observe_chunk(&chunk);
                    if is_usage_only_chunk(&chunk) && !include_usage {
                        continue 'frames;
                    }
                    rewrite_identity(&mut chunk, &response_id, &model);
                    yield Ok::<Bytes, Infallible>(sse_chunk(&chunk));
                }
                Ok(StreamFrame::Done) => break 'frames,
                Err(e) => {
                    error!("{}: stream {} broke off: {}", model, response_id, e);
                    let body = GatewayError::UpstreamUnavailable(
                        "The upstream stream ended unexpectedly.".to_string(),
                    )
                    .to_body();
                    yield Ok(sse_chunk(&body));
                    failure = Some(e.message);
                    break 'frames;
                }
            }
        }

        let status = if failure.is_some() { UsageStatus::UpstreamError } else { UsageStatus::Success };
        guard.finish(status, failure).await;
        yield Ok(done_frame());
    };

    (
        [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
        Body::from_stream(stream),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completion_text() {
        let body = json!({
            "choices": [
                {"message": {"role": "assistant", "content": "Hello"}},
                {"message": {"role": "assistant", "content": [{"type": "text", "text": " there"}]}}
            ]
        });
        assert_eq!(completion_text(&body), "Hello there");
        assert_eq!(completion_text(&json!({})), "");
    }
}
