use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::HeaderMap,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use crate::service::app_state::{create_state_router, AppState, StateRouter};

use super::handlers::{chat_completions_handler, list_models_handler};

fn create_openai_router() -> StateRouter {
    create_state_router()
        .route(
            "/chat/completions",
            post(
                |State(app_state): State<Arc<AppState>>,
                 ConnectInfo(addr): ConnectInfo<SocketAddr>,
                 headers: HeaderMap,
                 body: Bytes| async move {
                    chat_completions_handler(app_state, addr, headers, body).await
                },
            ),
        )
        .route(
            "/models",
            get(
                |State(app_state): State<Arc<AppState>>,
                 ConnectInfo(addr): ConnectInfo<SocketAddr>,
                 headers: HeaderMap| async move {
                    list_models_handler(app_state, addr, headers).await
                },
            ),
        )
}

/// OpenAI-compatible surface. Preflight requests are answered by the CORS
/// layer before routing.
pub fn create_proxy_router() -> StateRouter {
    create_state_router()
        .nest("/v1", create_openai_router())
        .layer(CorsLayer::permissive())
}
