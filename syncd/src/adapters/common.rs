use reqwest::{Method, StatusCode};
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::httpclient::RetryingHttpClient;
use crate::models::{ConnectedAccount, Platform};
use crate::ratelimit::Budgeter;
use crate::vault::{PlaintextTokens, Vault, VaultError};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no connected account")]
    NoCredentials,
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
    #[error("rate limited")]
    RateLimited,
    #[error("upstream error: {status} {body}")]
    Upstream { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] crate::httpclient::HttpError),
    #[error("row-store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("response decoding failed: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<VaultError> for AdapterError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NoCredentials => AdapterError::NoCredentials,
            VaultError::RefreshFailed(msg) => AdapterError::RefreshFailed(msg),
            other => AdapterError::RefreshFailed(other.to_string()),
        }
    }
}

/// Shared dependencies + identity every per-tenant adapter call needs: the Token
/// Vault, the Retrying HTTP Client, the Budgeter, and a row-store handle. One
/// instance is built per job and used by exactly one job at a time, per §4.4.
pub struct AdapterCtx {
    pub tenant_id: Uuid,
    pub platform: Platform,
    pub pool: PgPool,
    pub vault: Arc<Vault>,
    pub http: RetryingHttpClient,
    pub budgeter: Arc<Budgeter>,
    pub commerce_a_api_key: Option<String>,
    pub commerce_b_client: Option<(String, String)>,
}

impl AdapterCtx {
    pub async fn connected_account(&self) -> Result<ConnectedAccount, AdapterError> {
        sqlx::query_as::<_, ConnectedAccount>(
            "SELECT * FROM connected_accounts WHERE tenant_id = $1 AND platform = $2",
        )
        .bind(self.tenant_id)
        .bind(self.platform)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AdapterError::NoCredentials)
    }

    async fn tokens(&self) -> Result<PlaintextTokens, AdapterError> {
        Ok(self
            .vault
            .ensure_valid(
                self.tenant_id,
                self.platform,
                self.commerce_a_api_key.as_deref(),
                self.commerce_b_client
                    .as_ref()
                    .map(|(k, s)| (k.as_str(), s.as_str())),
            )
            .await?)
    }

    /// Implements the common per-HTTP-call contract from §4.4: admission check,
    /// issue, record, one 401-triggered refresh-and-retry (never looping), raise on
    /// non-2xx.
    pub async fn call_json(
        &self,
        method: Method,
        url: &str,
        build: impl Fn(reqwest::RequestBuilder, &str) -> reqwest::RequestBuilder,
    ) -> Result<serde_json::Value, AdapterError> {
        if !self.budgeter.can_request(self.tenant_id, self.platform).await {
            return Err(AdapterError::RateLimited);
        }

        let tokens = self.tokens().await?;
        let resp = self
            .http
            .request(method.clone(), url, |b| build(b, &tokens.access_token))
            .await?;
        self.budgeter.record(self.tenant_id, self.platform, 1).await;

        let resp = if resp.status() == StatusCode::UNAUTHORIZED {
            // A 401 means upstream rejected the token outright, regardless of what
            // `expires_at` claims; `ensure_valid` would no-op here for a
            // clock-valid-but-rejected token, so force the refresh unconditionally.
            let refreshed = self
                .vault
                .force_refresh(
                    self.tenant_id,
                    self.platform,
                    self.commerce_a_api_key.as_deref(),
                    self.commerce_b_client
                        .as_ref()
                        .map(|(k, s)| (k.as_str(), s.as_str())),
                )
                .await?;
            let retried = self
                .http
                .request(method, url, |b| build(b, &refreshed.access_token))
                .await?;
            self.budgeter.record(self.tenant_id, self.platform, 1).await;
            retried
        } else {
            resp
        };

        if resp.status().is_success() {
            let body = resp.json::<serde_json::Value>().await.unwrap_or(serde_json::Value::Null);
            Ok(body)
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(AdapterError::Upstream { status, body })
        }
    }
}

/// Never persist a cursor value older than the one loaded at the start of the run.
pub fn max_cursor(previous: Option<&str>, candidate: &str) -> String {
    match previous {
        Some(prev) if prev > candidate => prev.to_string(),
        _ => candidate.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_cursor_never_regresses() {
        assert_eq!(max_cursor(Some("2026-01-05"), "2026-01-03"), "2026-01-05");
        assert_eq!(max_cursor(Some("2026-01-01"), "2026-01-03"), "2026-01-03");
        assert_eq!(max_cursor(None, "2026-01-03"), "2026-01-03");
    }
}
