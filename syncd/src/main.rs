use std::sync::Arc;

use axum::http::Method;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use syncd::adapters::newsletter_n::{self, DownstreamClient};
use syncd::app_state::AppState;
use syncd::config::{Config, LogFormat};
use syncd::httpclient::RetryingHttpClient;
use syncd::queue::Queue;
use syncd::ratelimit::Budgeter;
use syncd::scheduler::Scheduler;
use syncd::vault::Vault;
use syncd::webhook_handlers::{handle_subscriber_webhook, list_webhooks};
use syncd::worker::WorkerRuntime;
use syncd::SyncMetrics;

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "timestamp": Utc::now() }))
}

async fn metrics_endpoint(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::response::Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(?err, "failed to render metrics");
            axum::response::Response::builder()
                .status(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
                .body(axum::body::Body::from("metrics unavailable"))
                .expect("failed to build metrics error response")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env()?);

    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(config.log_level.as_str())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(config.log_level.as_str())
                .init();
        }
    }

    let pool = PgPool::connect(&config.data_store_url).await?;
    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    let vault = Arc::new(Vault::new(
        pool.clone(),
        &config.token_encryption_key,
        http_client.clone(),
    )?);

    let budgeter = Arc::new(Budgeter::new(pool.clone()));
    budgeter.seed().await?;
    budgeter.clone().spawn_background_tasks(config.budgeter_flush_secs);

    let retrying_http = RetryingHttpClient::new(http_client.clone());
    let queue = Arc::new(Queue::new(pool.clone()));
    let metrics = Arc::new(SyncMetrics::new()?);

    let commerce_b_client = match (&config.commerce_b_api_key, &config.commerce_b_api_secret) {
        (Some(key), Some(secret)) => Some((key.clone(), secret.clone())),
        _ => None,
    };

    let worker = Arc::new(WorkerRuntime::new(
        pool.clone(),
        queue.clone(),
        vault.clone(),
        retrying_http.clone(),
        budgeter.clone(),
        config.commerce_a_api_key.clone(),
        commerce_b_client,
        config.notification_api_key.clone(),
        config.from_email.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        queue.clone(),
        budgeter.clone(),
        worker.clone(),
        config.stale_minutes,
        config.scheduler_batch_size,
    ));
    scheduler.spawn(config.scheduler_tick_secs);

    let downstream_url = config
        .downstream_newsletter_url
        .clone()
        .unwrap_or_else(|| "https://downstream.newsletter-provider.example/subscribe".to_string());
    let downstream = Arc::new(DownstreamClient::new(http_client.clone(), downstream_url));

    if let Some(tenant_id) = config
        .newsletter_owner_tenant
        .as_deref()
        .and_then(|v| uuid::Uuid::parse_str(v).ok())
    {
        newsletter_n::spawn_background_tasks(
            pool.clone(),
            vault.clone(),
            retrying_http.clone(),
            budgeter.clone(),
            downstream.clone(),
            tenant_id,
            config.newsletter_publication_id.clone(),
            config.newsletter_retry_secs,
            config.newsletter_reconcile_secs,
        );
    } else {
        tracing::warn!("NEWSLETTER_OWNER_TENANT not configured; newsletter retry/reconciliation jobs disabled");
    }

    let state = AppState {
        pool: pool.clone(),
        vault,
        budgeter,
        http: retrying_http,
        metrics,
        config: config.clone(),
        downstream,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST]);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/webhooks", get(list_webhooks))
        .route("/beehiiv-subscriber-webhook", post(handle_subscriber_webhook))
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr, "syncd listening");
    axum::serve(listener, app).await?;

    Ok(())
}
