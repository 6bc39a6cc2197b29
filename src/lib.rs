pub mod config;
pub mod database;
pub mod error;
pub mod proxy;
pub mod schema;
pub mod service;
pub mod utils;

pub use proxy::create_proxy_router;
pub use service::app_state::{create_app_state, AppState};
