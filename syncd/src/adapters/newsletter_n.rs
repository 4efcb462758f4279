use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::time::{interval, MissedTickBehavior};
use tracing::warn;
use uuid::Uuid;

use super::common::{AdapterCtx, AdapterError};
use crate::httpclient::RetryingHttpClient;
use crate::models::SubscriberStatus;
use crate::ratelimit::Budgeter;
use crate::vault::Vault;

const MIN_INTER_REQUEST_SPACING: Duration = Duration::from_secs(1);
const MAX_DOWNSTREAM_RETRIES: u32 = 2;

/// Conservative client for the downstream newsletter provider: enforces a local
/// minimum spacing between requests (the provider has no published rate limit, so
/// this is defensive pacing rather than budgeted quota), and gives up after two
/// retries rather than handing off to the shared `RetryingHttpClient`'s longer
/// backoff schedule (this path is latency-sensitive: it runs inline in the webhook
/// handler, not in a background job).
pub struct DownstreamClient {
    http: reqwest::Client,
    url: String,
    last_request: StdMutex<Option<Instant>>,
}

impl DownstreamClient {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        Self {
            http,
            url,
            last_request: StdMutex::new(None),
        }
    }

    async fn wait_for_spacing(&self) {
        let wait = {
            let last = self.last_request.lock().expect("lock poisoned");
            last.map(|t| MIN_INTER_REQUEST_SPACING.saturating_sub(t.elapsed()))
        };
        if let Some(wait) = wait {
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }

    fn mark_sent(&self) {
        *self.last_request.lock().expect("lock poisoned") = Some(Instant::now());
    }

    /// Forwards one subscriber to the downstream provider and maps the outcome to
    /// the tracked downstream status: 200 → confirmed, 429 → still pending, anything
    /// else (after exhausting retries) → failed.
    pub async fn subscribe(&self, email: &str) -> SubscriberStatus {
        for attempt in 0..=MAX_DOWNSTREAM_RETRIES {
            self.wait_for_spacing().await;
            let result = self
                .http
                .post(&self.url)
                .json(&serde_json::json!({ "email": email }))
                .send()
                .await;
            self.mark_sent();

            match result {
                Ok(resp) if resp.status().is_success() => return SubscriberStatus::ConfirmationSent,
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    return SubscriberStatus::Pending
                }
                Ok(_) if attempt < MAX_DOWNSTREAM_RETRIES => continue,
                Ok(_) => return SubscriberStatus::Failed,
                Err(_) if attempt < MAX_DOWNSTREAM_RETRIES => continue,
                Err(_) => return SubscriberStatus::Failed,
            }
        }
        SubscriberStatus::Failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriberCreated,
    SubscriberUnsubscribed,
    SubscriberDeleted,
}

impl EventKind {
    pub fn parse(event: &str) -> Option<Self> {
        match event {
            "subscriber.created" => Some(EventKind::SubscriberCreated),
            "subscriber.unsubscribed" => Some(EventKind::SubscriberUnsubscribed),
            "subscriber.deleted" => Some(EventKind::SubscriberDeleted),
            _ => None,
        }
    }
}

/// Upserts the subscriber row on `(tenant, email)` for a webhook event, forwarding
/// creates to the downstream client. Unsubscribe/delete events only update the
/// upstream status column; downstream has no unsubscribe API (§4.8), so the
/// downstream status is left untouched for those.
pub async fn handle_webhook_event(
    ctx: &AdapterCtx,
    downstream: &DownstreamClient,
    kind: EventKind,
    email: &str,
) -> Result<(), AdapterError> {
    let upstream_status = match kind {
        EventKind::SubscriberCreated => "active",
        EventKind::SubscriberUnsubscribed => "unsubscribed",
        EventKind::SubscriberDeleted => "deleted",
    };

    let downstream_status = if kind == EventKind::SubscriberCreated {
        Some(downstream.subscribe(email).await)
    } else {
        None
    };

    if let Some(status) = downstream_status {
        sqlx::query(
            "INSERT INTO newsletter_subscribers (id, tenant_id, email, upstream_status, downstream_status, last_webhook_at)
             VALUES ($1, $2, $3, $4, $5, now())
             ON CONFLICT (tenant_id, email) DO UPDATE SET
                upstream_status = EXCLUDED.upstream_status,
                downstream_status = EXCLUDED.downstream_status,
                last_webhook_at = now()",
        )
        .bind(Uuid::new_v4())
        .bind(ctx.tenant_id)
        .bind(email)
        .bind(upstream_status)
        .bind(status)
        .execute(&ctx.pool)
        .await?;
    } else {
        sqlx::query(
            "INSERT INTO newsletter_subscribers (id, tenant_id, email, upstream_status, downstream_status, last_webhook_at)
             VALUES ($1, $2, $3, $4, 'pending', now())
             ON CONFLICT (tenant_id, email) DO UPDATE SET
                upstream_status = EXCLUDED.upstream_status,
                last_webhook_at = now()",
        )
        .bind(Uuid::new_v4())
        .bind(ctx.tenant_id)
        .bind(email)
        .bind(upstream_status)
        .execute(&ctx.pool)
        .await?;
    }

    sqlx::query(
        "INSERT INTO sync_logs (id, tenant_id, platform, job_type, status, details, created_at)
         VALUES ($1, $2, 'newsletter-N', 'webhook', 'completed', $3, now())",
    )
    .bind(Uuid::new_v4())
    .bind(ctx.tenant_id)
    .bind(serde_json::json!({ "event": format!("{:?}", kind), "email": email }))
    .execute(&ctx.pool)
    .await?;

    Ok(())
}

/// Periodic retry job: re-forwards every subscriber left in `pending` or `failed`.
pub async fn retry_pending(ctx: &AdapterCtx, downstream: &DownstreamClient) -> Result<i64, AdapterError> {
    let rows: Vec<(Uuid, String)> = sqlx::query_as(
        "SELECT id, email FROM newsletter_subscribers
         WHERE tenant_id = $1 AND downstream_status IN ('pending', 'failed')",
    )
    .bind(ctx.tenant_id)
    .fetch_all(&ctx.pool)
    .await?;

    let mut retried = 0i64;
    for (id, email) in rows {
        let status = downstream.subscribe(&email).await;
        sqlx::query("UPDATE newsletter_subscribers SET downstream_status = $2, last_webhook_at = now() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&ctx.pool)
            .await?;
        retried += 1;
    }

    Ok(retried)
}

#[derive(Debug, Deserialize)]
struct UpstreamSubscriber {
    email: String,
}

#[derive(Debug, Deserialize)]
struct SubscribersPage {
    data: Vec<UpstreamSubscriber>,
}

/// Nightly reconciliation: fetches the full upstream active list, forwards any
/// local subscriber missing downstream, and flags any local active subscriber
/// absent from the upstream list as `pending_unsub` (§4.8 — provider publishes no
/// unsubscribe webhook, so absence from the active list is the only signal).
pub async fn reconcile(
    ctx: &AdapterCtx,
    downstream: &DownstreamClient,
    publication_id: &str,
) -> Result<(i64, i64), AdapterError> {
    let url = format!(
        "https://api.newsletter-n.example/v3/publications/{publication_id}/subscriptions?status=active"
    );
    let body = ctx
        .call_json(Method::GET, &url, |b, token| b.bearer_auth(token))
        .await?;
    let parsed: SubscribersPage = serde_json::from_value(body)?;
    let upstream_emails: std::collections::HashSet<String> =
        parsed.data.iter().map(|s| s.email.to_lowercase()).collect();

    let local: Vec<(Uuid, String, String)> = sqlx::query_as(
        "SELECT id, email, downstream_status FROM newsletter_subscribers WHERE tenant_id = $1",
    )
    .bind(ctx.tenant_id)
    .fetch_all(&ctx.pool)
    .await?;

    let mut forwarded = 0i64;
    let mut flagged = 0i64;

    for (id, email, downstream_status) in &local {
        let in_upstream = upstream_emails.contains(&email.to_lowercase());
        if in_upstream && downstream_status.as_str() != "confirmation_sent" {
            let status = downstream.subscribe(email).await;
            sqlx::query("UPDATE newsletter_subscribers SET downstream_status = $2 WHERE id = $1")
                .bind(id)
                .bind(status)
                .execute(&ctx.pool)
                .await?;
            forwarded += 1;
        } else if !in_upstream && downstream_status.as_str() == "confirmation_sent" {
            sqlx::query(
                "UPDATE newsletter_subscribers SET downstream_status = 'pending_unsub', last_webhook_at = $2 WHERE id = $1",
            )
            .bind(id)
            .bind(Utc::now())
            .execute(&ctx.pool)
            .await?;
            flagged += 1;
        }
    }

    Ok((forwarded, flagged))
}

/// Spawns the two periodic newsletter jobs from §4.8/§6: a retry loop for
/// `pending`/`failed` subscribers and a nightly reconciliation against the upstream
/// active list. Both build their own `AdapterCtx` per tick since the ctx borrows
/// nothing job-specific; failures are logged and the ticker keeps running.
#[allow(clippy::too_many_arguments)]
pub fn spawn_background_tasks(
    pool: PgPool,
    vault: Arc<Vault>,
    http: RetryingHttpClient,
    budgeter: Arc<Budgeter>,
    downstream: Arc<DownstreamClient>,
    tenant_id: Uuid,
    publication_id: Option<String>,
    retry_secs: u64,
    reconcile_secs: u64,
) {
    let ctx = move || AdapterCtx {
        tenant_id,
        platform: crate::models::Platform::NewsletterN,
        pool: pool.clone(),
        vault: vault.clone(),
        http: http.clone(),
        budgeter: budgeter.clone(),
        commerce_a_api_key: None,
        commerce_b_client: None,
    };

    let retry_ctx_fn = ctx.clone();
    let retry_downstream = downstream.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(retry_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let ctx = retry_ctx_fn();
            match retry_pending(&ctx, &retry_downstream).await {
                Ok(n) => tracing::info!(retried = n, "newsletter retry pass complete"),
                Err(err) => warn!(?err, "newsletter retry pass failed"),
            }
        }
    });

    if let Some(publication_id) = publication_id {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(reconcile_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let run_ctx = ctx();
                match reconcile(&run_ctx, &downstream, &publication_id).await {
                    Ok((forwarded, flagged)) => {
                        tracing::info!(forwarded, flagged, "newsletter reconciliation complete")
                    }
                    Err(err) => warn!(?err, "newsletter reconciliation failed"),
                }
            }
        });
    } else {
        warn!("NEWSLETTER_PUBLICATION_ID not set; nightly reconciliation disabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_parses_known_events() {
        assert_eq!(EventKind::parse("subscriber.created"), Some(EventKind::SubscriberCreated));
        assert_eq!(EventKind::parse("subscriber.unsubscribed"), Some(EventKind::SubscriberUnsubscribed));
        assert_eq!(EventKind::parse("subscriber.deleted"), Some(EventKind::SubscriberDeleted));
        assert_eq!(EventKind::parse("subscriber.bounced"), None);
    }
}
