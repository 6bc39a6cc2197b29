mod auth;
mod core;
mod handlers;
mod router;
mod selector;
mod settlement;
pub mod upstream;

pub use router::create_proxy_router;
