pub mod agent;
pub mod config;
pub mod http;

pub use config::Config;
pub use http::{app_router, serve, AppState};
