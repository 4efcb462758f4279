use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use common_crypto::{legacy, CryptoError};
use dashmap::DashMap;
use serde::Deserialize;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::models::Platform;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no connected account for tenant/platform")]
    NoCredentials,
    #[error("upstream rejected token refresh: {0}")]
    RefreshFailed(String),
    #[error("failed to decrypt stored credential")]
    DecryptFailed(#[from] CryptoError),
    #[error("row-store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("transport error talking to OAuth endpoint: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct PlaintextTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Confidentiality and refresh lifecycle for per-tenant OAuth credentials.
///
/// Encryption is AES-256-GCM keyed off a 32-byte master key; the wire format is
/// `base64(IV(12) || ciphertext-with-trailing-16-byte-tag)`. Ciphertexts produced by
/// the retired Fernet-style scheme (prefixed `F1:`) are still accepted for decrypt —
/// every new write uses the current format.
pub struct Vault {
    pool: PgPool,
    key: [u8; 32],
    http: reqwest::Client,
    refresh_locks: DashMap<(Uuid, Platform), Arc<AsyncMutex<()>>>,
}

impl Vault {
    pub fn new(pool: PgPool, key_hex_or_b64: &str, http: reqwest::Client) -> anyhow::Result<Self> {
        let key = parse_master_key(key_hex_or_b64)?;
        Ok(Self {
            pool,
            key,
            http,
            refresh_locks: DashMap::new(),
        })
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let ciphertext = common_crypto::encrypt_field(&self.key, plaintext.as_bytes())?;
        Ok(BASE64_STANDARD.encode(ciphertext))
    }

    fn decrypt(&self, stored: &str) -> Result<String, VaultError> {
        let plaintext = if legacy::is_legacy_ciphertext(stored) {
            legacy::decrypt(&self.key, stored)?
        } else {
            let blob = BASE64_STANDARD
                .decode(stored)
                .map_err(CryptoError::Base64Decode)?;
            common_crypto::decrypt_field(&self.key, &blob)?
        };
        String::from_utf8(plaintext).map_err(|_| VaultError::DecryptFailed(CryptoError::DecryptFailure))
    }

    /// Encrypts access/refresh independently and upserts the ConnectedAccount row.
    pub async fn store(
        &self,
        tenant_id: Uuid,
        platform: Platform,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), VaultError> {
        let encrypted_access = self.encrypt(access_token)?;
        let encrypted_refresh = refresh_token.map(|t| self.encrypt(t)).transpose()?;

        sqlx::query(
            "INSERT INTO connected_accounts
                (tenant_id, platform, encrypted_access_token, encrypted_refresh_token, expires_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, now())
             ON CONFLICT (tenant_id, platform) DO UPDATE SET
                encrypted_access_token = EXCLUDED.encrypted_access_token,
                encrypted_refresh_token = COALESCE(EXCLUDED.encrypted_refresh_token, connected_accounts.encrypted_refresh_token),
                expires_at = EXCLUDED.expires_at,
                updated_at = now()",
        )
        .bind(tenant_id)
        .bind(platform)
        .bind(&encrypted_access)
        .bind(&encrypted_refresh)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns plaintext tokens for a (tenant, platform), or `None` if no account exists.
    pub async fn load(
        &self,
        tenant_id: Uuid,
        platform: Platform,
    ) -> Result<Option<PlaintextTokens>, VaultError> {
        let row: Option<(String, Option<String>, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT encrypted_access_token, encrypted_refresh_token, expires_at
             FROM connected_accounts WHERE tenant_id = $1 AND platform = $2",
        )
        .bind(tenant_id)
        .bind(platform)
        .fetch_optional(&self.pool)
        .await?;

        let Some((enc_access, enc_refresh, expires_at)) = row else {
            return Ok(None);
        };

        let access_token = self.decrypt(&enc_access)?;
        let refresh_token = enc_refresh.map(|r| self.decrypt(&r)).transpose()?;

        Ok(Some(PlaintextTokens {
            access_token,
            refresh_token,
            expires_at,
        }))
    }

    /// True when `expires_at` is missing (non-expiring) or now is at/after it.
    pub fn is_expired(expires_at: Option<DateTime<Utc>>) -> bool {
        match expires_at {
            None => false,
            Some(exp) => Utc::now() >= exp,
        }
    }

    /// Returns non-expired plaintext tokens, refreshing via the platform's refresh
    /// flow if needed. Refreshes are serialized per (tenant, platform) via a
    /// single-flight guard so concurrent 401s on the same credential don't each
    /// independently hit the OAuth endpoint.
    pub async fn ensure_valid(
        &self,
        tenant_id: Uuid,
        platform: Platform,
        commerce_a_api_key: Option<&str>,
        commerce_b_client: Option<(&str, &str)>,
    ) -> Result<PlaintextTokens, VaultError> {
        let tokens = self.load(tenant_id, platform).await?.ok_or(VaultError::NoCredentials)?;

        if !Self::is_expired(tokens.expires_at) {
            return Ok(tokens);
        }

        let lock = self
            .refresh_locks
            .entry((tenant_id, platform))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock: another task may have already refreshed.
        let tokens = self.load(tenant_id, platform).await?.ok_or(VaultError::NoCredentials)?;
        if !Self::is_expired(tokens.expires_at) {
            return Ok(tokens);
        }

        match platform {
            Platform::CommerceA => self.refresh_commerce_a(tenant_id, &tokens, commerce_a_api_key).await,
            Platform::CommerceB => self.refresh_commerce_b(tenant_id, &tokens, commerce_b_client).await,
            Platform::FulfillmentF | Platform::NewsletterN => Ok(tokens),
        }
    }

    /// Refreshes unconditionally, bypassing the `is_expired` check — for a 401 from
    /// upstream even though the stored token looked unexpired (commerce-B's
    /// non-expiring tokens, or any clock-valid-but-server-rejected token). Still
    /// serialized via the same single-flight guard as `ensure_valid`.
    pub async fn force_refresh(
        &self,
        tenant_id: Uuid,
        platform: Platform,
        commerce_a_api_key: Option<&str>,
        commerce_b_client: Option<(&str, &str)>,
    ) -> Result<PlaintextTokens, VaultError> {
        let lock = self
            .refresh_locks
            .entry((tenant_id, platform))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let tokens = self.load(tenant_id, platform).await?.ok_or(VaultError::NoCredentials)?;

        match platform {
            Platform::CommerceA => self.refresh_commerce_a(tenant_id, &tokens, commerce_a_api_key).await,
            Platform::CommerceB => self.refresh_commerce_b(tenant_id, &tokens, commerce_b_client).await,
            Platform::FulfillmentF | Platform::NewsletterN => Ok(tokens),
        }
    }

    async fn refresh_commerce_a(
        &self,
        tenant_id: Uuid,
        tokens: &PlaintextTokens,
        api_key: Option<&str>,
    ) -> Result<PlaintextTokens, VaultError> {
        let Some(refresh_token) = tokens.refresh_token.as_deref() else {
            return Err(VaultError::RefreshFailed("no refresh token on file".into()));
        };
        let api_key = api_key.ok_or_else(|| VaultError::RefreshFailed("commerce-A API key not configured".into()))?;

        #[derive(Deserialize)]
        struct RefreshResponse {
            access_token: String,
            refresh_token: String,
            expires_in: i64,
        }

        let resp = self
            .http
            .post("https://api.etsy.com/v3/public/oauth/token")
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", api_key),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(VaultError::RefreshFailed(format!(
                "commerce-A refresh returned {}",
                resp.status()
            )));
        }

        let body: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| VaultError::RefreshFailed(e.to_string()))?;
        let expires_at = Utc::now() + chrono::Duration::seconds(body.expires_in);

        self.store(
            tenant_id,
            Platform::CommerceA,
            &body.access_token,
            Some(&body.refresh_token),
            Some(expires_at),
        )
        .await?;

        Ok(PlaintextTokens {
            access_token: body.access_token,
            refresh_token: Some(body.refresh_token),
            expires_at: Some(expires_at),
        })
    }

    async fn refresh_commerce_b(
        &self,
        tenant_id: Uuid,
        tokens: &PlaintextTokens,
        client: Option<(&str, &str)>,
    ) -> Result<PlaintextTokens, VaultError> {
        // Non-expiring in the common case; is_expired already returned false above
        // unless a deployment actually populated expires_at.
        let (Some(expires_at), Some(refresh_token)) = (tokens.expires_at, tokens.refresh_token.clone()) else {
            return Ok(tokens.clone());
        };
        let Some((api_key, api_secret)) = client else {
            return Err(VaultError::RefreshFailed("commerce-B client credentials not configured".into()));
        };
        let _ = expires_at;

        #[derive(Deserialize)]
        struct RefreshResponse {
            access_token: String,
            refresh_token: Option<String>,
            expires_in: Option<i64>,
        }

        let resp = self
            .http
            .post("https://shopify.com/oauth/token")
            .json(&serde_json::json!({
                "client_id": api_key,
                "client_secret": api_secret,
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(VaultError::RefreshFailed(format!(
                "commerce-B refresh returned {}",
                resp.status()
            )));
        }

        let body: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| VaultError::RefreshFailed(e.to_string()))?;
        let new_expires_at = body
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        let new_refresh = body.refresh_token.unwrap_or(refresh_token);

        self.store(
            tenant_id,
            Platform::CommerceB,
            &body.access_token,
            Some(&new_refresh),
            new_expires_at,
        )
        .await?;

        Ok(PlaintextTokens {
            access_token: body.access_token,
            refresh_token: Some(new_refresh),
            expires_at: new_expires_at,
        })
    }
}

fn parse_master_key(value: &str) -> anyhow::Result<[u8; 32]> {
    if let Ok(bytes) = hex::decode(value.trim()) {
        if bytes.len() == 32 {
            let mut out = [0u8; 32];
            out.copy_from_slice(&bytes);
            return Ok(out);
        }
    }
    let decoded = BASE64_STANDARD.decode(value.trim())?;
    anyhow::ensure!(decoded.len() == 32, "TOKEN_ENCRYPTION_KEY must decode to 32 bytes");
    let mut out = [0u8; 32];
    out.copy_from_slice(&decoded);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_expired_treats_missing_as_non_expiring() {
        assert!(!Vault::is_expired(None));
    }

    #[test]
    fn is_expired_true_when_in_the_past() {
        let past = Utc::now() - chrono::Duration::seconds(1);
        assert!(Vault::is_expired(Some(past)));
    }

    #[test]
    fn is_expired_false_when_in_the_future() {
        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(!Vault::is_expired(Some(future)));
    }

    #[test]
    fn parse_master_key_accepts_hex() {
        let hex_key = "00".repeat(32);
        let key = parse_master_key(&hex_key).expect("parse");
        assert_eq!(key, [0u8; 32]);
    }

    #[test]
    fn parse_master_key_accepts_base64() {
        let b64_key = BASE64_STANDARD.encode([7u8; 32]);
        let key = parse_master_key(&b64_key).expect("parse");
        assert_eq!(key, [7u8; 32]);
    }
}
