use anyhow::{Context, Result};
use std::env;

/// Env-driven configuration, following the same `from_env` shape the rest of the
/// workspace's services use. Required keys panic-via-`Context`; everything else has
/// a documented default.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_store_url: String,
    pub token_encryption_key: String,
    pub commerce_a_api_key: Option<String>,
    pub commerce_b_api_key: Option<String>,
    pub commerce_b_api_secret: Option<String>,
    pub newsletter_api_key: Option<String>,
    pub newsletter_publication_id: Option<String>,
    pub newsletter_webhook_secret: Option<String>,
    pub downstream_newsletter_url: Option<String>,
    pub notification_api_key: Option<String>,
    pub from_email: Option<String>,
    pub newsletter_owner_tenant: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
    pub scheduler_tick_secs: u64,
    pub scheduler_batch_size: i64,
    pub stale_minutes: i64,
    pub budgeter_flush_secs: u64,
    pub newsletter_retry_secs: u64,
    pub newsletter_reconcile_secs: u64,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let data_store_url = env::var("DATA_STORE_URL").context("DATA_STORE_URL must be set")?;
        let token_encryption_key =
            env::var("TOKEN_ENCRYPTION_KEY").context("TOKEN_ENCRYPTION_KEY must be set")?;

        let log_format = match env::var("LOG_FORMAT").ok().as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let scheduler_tick_secs = env::var("SCHEDULER_TICK_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        let scheduler_batch_size = env::var("SCHEDULER_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(10);
        let stale_minutes = env::var("SCHEDULER_STALE_MINUTES")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(15);
        let budgeter_flush_secs = env::var("BUDGETER_FLUSH_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        // Defaults match spec.md §6: newsletter retry every 15 minutes, reconciliation nightly.
        let newsletter_retry_secs = env::var("NEWSLETTER_RETRY_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(900);
        let newsletter_reconcile_secs = env::var("NEWSLETTER_RECONCILE_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(86_400);
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8090);

        Ok(Self {
            data_store_url,
            token_encryption_key,
            commerce_a_api_key: env::var("COMMERCE_A_API_KEY").ok(),
            commerce_b_api_key: env::var("COMMERCE_B_API_KEY").ok(),
            commerce_b_api_secret: env::var("COMMERCE_B_API_SECRET").ok(),
            newsletter_api_key: env::var("NEWSLETTER_API_KEY").ok(),
            newsletter_publication_id: env::var("NEWSLETTER_PUBLICATION_ID").ok(),
            newsletter_webhook_secret: env::var("NEWSLETTER_WEBHOOK_SECRET").ok(),
            downstream_newsletter_url: env::var("DOWNSTREAM_NEWSLETTER_URL").ok(),
            notification_api_key: env::var("NOTIFICATION_API_KEY").ok(),
            from_email: env::var("FROM_EMAIL").ok(),
            newsletter_owner_tenant: env::var("NEWSLETTER_OWNER_TENANT").ok(),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            scheduler_tick_secs: scheduler_tick_secs.max(1),
            scheduler_batch_size: scheduler_batch_size.max(1),
            stale_minutes: stale_minutes.max(1),
            budgeter_flush_secs: budgeter_flush_secs.max(1),
            newsletter_retry_secs: newsletter_retry_secs.max(1),
            newsletter_reconcile_secs: newsletter_reconcile_secs.max(1),
            host,
            port,
        })
    }
}
