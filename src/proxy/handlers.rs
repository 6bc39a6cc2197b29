use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use cyder_tools::log::{debug, info, warn};
use serde_json::{json, Value};
use uuid::Uuid;

use super::auth::{admit_ip, authenticate_request, resolve_client_ip};
use super::core::{buffered_response, dispatch_with_failover, streaming_response};
use super::selector::select_candidates;
use super::settlement::{SettlementGuard, UsageMeter};
use super::upstream::UpstreamReply;
use crate::error::GatewayError;
use crate::schema::enum_def::UsageStatus;
use crate::service::app_state::AppState;
use crate::service::settlement::SettlementRecord;
use crate::service::transform::ChatRequest;
use crate::utils::billing::{PriceSheet, TokenUsage};
use crate::utils::limit::RouteFamily;
use crate::utils::{brand_for_model, ID_GENERATOR};

pub(super) async fn chat_completions_handler(
    app_state: Arc<AppState>,
    addr: SocketAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let client_ip = resolve_client_ip(&headers, addr, app_state.config.trust_forwarded_for);
    admit_ip(&app_state, RouteFamily::Completions, &client_ip).await?;

    let api_key = authenticate_request(&app_state, &headers, true).await?;
    let request = ChatRequest::parse(&body)?;

    let model = app_state
        .get_model(&request.model)
        .await?
        .ok_or_else(|| GatewayError::ModelNotFound(request.model.clone()))?;

    let whitelist = app_state.model_whitelist(api_key.id).await?;
    if !whitelist.is_empty() && !whitelist.contains(&model.model_name) {
        warn!("key {} is not allowed to use {}", api_key.id, model.model_name);
        return Err(GatewayError::PermissionDenied(format!(
            "This API key is not allowed to use the model `{}`.",
            model.model_name
        )));
    }

    app_state.check_funds(&api_key).await?;

    let candidates = select_candidates(&app_state, &model.model_name).await?;
    debug!("{}: {} candidate channels", model.model_name, candidates.len());

    let request_id = ID_GENERATOR.generate_id();
    let record = SettlementRecord {
        request_id,
        account_id: api_key.account_id,
        api_key_id: api_key.id,
        quota_bound: api_key.total_quota.is_some(),
        model_name: model.model_name.clone(),
        channel_id: None,
        usage: TokenUsage::default(),
        prices: PriceSheet::from(model.as_ref()),
        status: UsageStatus::Success,
        error_message: None,
        client_ip: Some(client_ip),
        is_stream: request.stream,
        duration_ms: 0,
    };
    let mut guard = SettlementGuard::new(
        app_state.clone(),
        record,
        UsageMeter::new(request.estimated_prompt_tokens()),
    );

    let (channel, reply) = match dispatch_with_failover(&app_state, candidates, &request).await {
        Ok(answer) => answer,
        Err(failure) => {
            if let Some(channel_id) = failure.last_channel {
                guard.set_channel(channel_id);
            }
            // Nothing was produced, so the failure is recorded without tokens.
            guard.meter.report(TokenUsage::default());
            guard.finish(failure.status, Some(failure.detail)).await;
            return Err(failure.error);
        }
    };
    guard.set_channel(channel.channel.id);

    let response_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    info!(
        "{}: request {} served by channel {} (stream={})",
        model.model_name, request_id, channel.channel.id, request.stream
    );

    match reply {
        UpstreamReply::Complete(completion) => {
            buffered_response(guard, completion.body, completion.usage, &response_id, &request.model).await
        }
        UpstreamReply::Stream(frames) => Ok(streaming_response(
            guard,
            frames,
            response_id,
            request.model.clone(),
            request.include_usage,
        )),
    }
}

pub(super) async fn list_models_handler(
    app_state: Arc<AppState>,
    addr: SocketAddr,
    headers: HeaderMap,
) -> Result<Json<Value>, GatewayError> {
    let client_ip = resolve_client_ip(&headers, addr, app_state.config.trust_forwarded_for);
    admit_ip(&app_state, RouteFamily::Models, &client_ip).await?;
    let api_key = authenticate_request(&app_state, &headers, false).await?;

    let whitelist = app_state.model_whitelist(api_key.id).await?;
    let data: Vec<Value> = app_state
        .list_models()
        .await?
        .into_iter()
        .filter(|m| whitelist.is_empty() || whitelist.contains(&m.model_name))
        .map(|m| {
            json!({
                "id": m.model_name,
                "object": "model",
                "created": m.created_at / 1000,
                "owned_by": brand_for_model(&m.model_name),
            })
        })
        .collect();

    Ok(Json(json!({
        "object": "list",
        "data": data,
    })))
}
