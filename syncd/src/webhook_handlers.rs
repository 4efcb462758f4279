use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use bytes::Bytes;
use common_http_errors::{ApiError, ApiResult};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::warn;
use uuid::Uuid;

use crate::adapters::common::AdapterCtx;
use crate::adapters::newsletter_n::{handle_webhook_event, EventKind};
use crate::app_state::AppState;
use crate::models::Platform;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct SubscriberWebhook {
    event: String,
    data: SubscriberPayload,
}

#[derive(Debug, Deserialize)]
struct SubscriberPayload {
    email: String,
}

/// Verifies the configured HMAC-SHA256 secret against `X-Webhook-Signature`.
/// Missing secret means dev mode: accepted unconditionally (§4.8).
fn verify_signature(secret: Option<&str>, signature: Option<&str>, body: &[u8]) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    let Some(signature) = signature else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    expected == signature
}

pub async fn handle_subscriber_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let signature = headers
        .get("X-Webhook-Signature")
        .and_then(|h| h.to_str().ok());

    if !verify_signature(state.config.newsletter_webhook_secret.as_deref(), signature, &body) {
        state.metrics.webhook_signature_failures_total.inc();
        warn!("newsletter webhook signature mismatch");
        return Err(ApiError::Forbidden { trace_id: None });
    }

    let webhook = serde_json::from_slice::<SubscriberWebhook>(&body).map_err(|_| {
        ApiError::BadRequest { code: "malformed_payload", trace_id: None, message: None }
    })?;

    let Some(kind) = EventKind::parse(&webhook.event) else {
        return Ok((
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ignored", "event": webhook.event })),
        ));
    };

    let tenant_id = state
        .config
        .newsletter_owner_tenant
        .as_deref()
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(|| ApiError::internal("newsletter owner tenant not configured", None))?;

    let ctx = AdapterCtx {
        tenant_id,
        platform: Platform::NewsletterN,
        pool: state.pool.clone(),
        vault: state.vault.clone(),
        http: state.http.clone(),
        budgeter: state.budgeter.clone(),
        commerce_a_api_key: None,
        commerce_b_client: None,
    };

    handle_webhook_event(&ctx, &state.downstream, kind, &webhook.data.email)
        .await
        .map_err(|err| {
            warn!(?err, "failed to process subscriber webhook");
            ApiError::internal(err, None)
        })?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "event": webhook.event, "email": webhook.data.email })),
    ))
}

pub async fn list_webhooks() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "webhooks": [
            { "path": "/beehiiv-subscriber-webhook", "events": ["subscriber.created", "subscriber.unsubscribed", "subscriber.deleted"] }
        ]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_signature_accepts_unconfigured_secret() {
        assert!(verify_signature(None, None, b"anything"));
    }

    #[test]
    fn verify_signature_rejects_missing_header_when_configured() {
        assert!(!verify_signature(Some("secret"), None, b"body"));
    }

    #[test]
    fn verify_signature_matches_computed_hmac() {
        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"payload");
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_signature(Some("secret"), Some(&sig), b"payload"));
        assert!(!verify_signature(Some("secret"), Some("deadbeef"), b"payload"));
    }
}
