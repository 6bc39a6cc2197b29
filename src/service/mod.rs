pub mod app_state;
pub mod cache;
pub mod key_admin;
pub mod redis;
pub mod settlement;
pub mod transform;
