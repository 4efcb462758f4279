pub mod adapters;
pub mod app_state;
pub mod config;
pub mod httpclient;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod queue;
pub mod ratelimit;
pub mod scheduler;
pub mod vault;
pub mod webhook_handlers;
pub mod worker;

pub use app_state::AppState;
pub use config::Config;
pub use metrics::SyncMetrics;
