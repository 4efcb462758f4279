use std::sync::Arc;

use sqlx::PgPool;

use crate::adapters::newsletter_n::DownstreamClient;
use crate::config::Config;
use crate::httpclient::RetryingHttpClient;
use crate::metrics::SyncMetrics;
use crate::ratelimit::Budgeter;
use crate::vault::Vault;

/// Shared dependencies handed to the axum router, mirroring the shape of the
/// teacher's `integration-gateway::app_state::AppState`.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub vault: Arc<Vault>,
    pub budgeter: Arc<Budgeter>,
    pub http: RetryingHttpClient,
    pub metrics: Arc<SyncMetrics>,
    pub config: Arc<Config>,
    pub downstream: Arc<DownstreamClient>,
}
