use std::net::SocketAddr;
use std::time::Duration;

use ai_gateway::config::CONFIG;
use ai_gateway::service::app_state::{create_app_state, create_state_router, spawn_cache_reporter};
use ai_gateway::create_proxy_router;
use cyder_tools::log::{error, info, LocalLogger};

#[tokio::main]
async fn main() {
    LocalLogger::init(&CONFIG.log_level);

    let app_state = match create_app_state().await {
        Ok(app_state) => app_state,
        Err(e) => {
            error!("failed to initialize gateway: {}", e);
            std::process::exit(1);
        }
    };
    spawn_cache_reporter(app_state.clone(), Duration::from_secs(300));

    let router = if CONFIG.base_path.is_empty() {
        create_proxy_router()
    } else {
        create_state_router().nest(&CONFIG.base_path, create_proxy_router())
    };

    let addr = format!("{}:{}", &CONFIG.host, CONFIG.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("gateway listening on {}", &addr);

    if let Err(e) = axum::serve(
        listener,
        router
            .with_state(app_state)
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!("server stopped: {}", e);
    }
}
