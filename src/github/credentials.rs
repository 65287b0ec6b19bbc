//! Credential store: OAuth authorization, encrypted token storage, and the
//! expiry-aware retrieval path the rest of the pipeline calls.
//!
//! Tokens are encrypted at rest with AES-256-GCM under a key derived as
//! SHA-256 of the configured secret, stored as `iv:tag:ciphertext` hex.
//! Refreshes are single-flight per user: the first caller performs the
//! upstream exchange, concurrent callers wait on the same gate and then
//! observe the refreshed row.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::github::api::{ApiError, GitHubApi, GitHubUser};
use crate::models::StoredToken;

const STATE_TTL_MINUTES: i64 = 15;
const GCM_TAG_LEN: usize = 16;

/// Follow-up actions carried through the OAuth round-trip.
pub mod redirect_action {
    /// Complete a subscription the user initiated before linking.
    pub const SUBSCRIBE: &str = "subscribe";
    /// Plain account connect, no follow-up.
    pub const LINK: &str = "link";
}

// ─── Cipher ───────────────────────────────────────────

/// AES-256-GCM under SHA-256(secret), fresh 96-bit IV per encryption.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    pub fn new(secret: &str) -> Result<Self, anyhow::Error> {
        let key = Sha256::digest(secret.as_bytes());
        Ok(Self {
            cipher: Aes256Gcm::new_from_slice(&key)
                .map_err(|_| anyhow::anyhow!("invalid encryption key length"))?,
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, anyhow::Error> {
        let mut iv = [0u8; 12];
        rand::rng().fill_bytes(&mut iv);
        let mut sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| anyhow::anyhow!("token encryption failed"))?;
        let tag = sealed.split_off(sealed.len() - GCM_TAG_LEN);
        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(sealed)
        ))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, anyhow::Error> {
        let parts: Vec<&str> = stored.split(':').collect();
        if parts.len() != 3 {
            anyhow::bail!("malformed token ciphertext");
        }
        let iv = hex::decode(parts[0])?;
        let tag = hex::decode(parts[1])?;
        let mut buf = hex::decode(parts[2])?;
        buf.extend_from_slice(&tag);

        if iv.len() != 12 {
            anyhow::bail!("unsupported IV length {}", iv.len());
        }
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&iv), buf.as_ref())
            .map_err(|_| anyhow::anyhow!("token decryption failed"))?;
        Ok(String::from_utf8(plain)?)
    }
}

// ─── Callback / Validation Types ──────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("unknown or already used authorization state")]
    InvalidState,
    #[error("the authorization request expired, please start over")]
    StateExpired,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What the OAuth state row carried through the round-trip, returned to the
/// callback handler so it can run the follow-up action.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub towns_user_id: String,
    pub channel_id: String,
    pub space_id: String,
    pub redirect_action: String,
    pub redirect_data: Value,
    pub github_login: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    Valid { login: String },
    Invalid,
    NotLinked,
    Unknown,
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    refresh_token_expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

struct FreshTokens {
    access_token: String,
    token_type: String,
    expires_at: Option<DateTime<Utc>>,
    refresh_token: Option<String>,
    refresh_token_expires_at: Option<DateTime<Utc>>,
}

impl FreshTokens {
    fn from_response(resp: OAuthTokenResponse) -> Result<Self, anyhow::Error> {
        if let Some(error) = resp.error {
            anyhow::bail!(
                "oauth exchange rejected: {} ({})",
                error,
                resp.error_description.unwrap_or_default()
            );
        }
        let now = Utc::now();
        Ok(Self {
            access_token: resp
                .access_token
                .ok_or_else(|| anyhow::anyhow!("oauth response missing access_token"))?,
            token_type: resp.token_type.unwrap_or_else(|| "bearer".to_string()),
            expires_at: resp.expires_in.map(|s| now + TimeDelta::seconds(s)),
            refresh_token: resp.refresh_token,
            refresh_token_expires_at: resp
                .refresh_token_expires_in
                .map(|s| now + TimeDelta::seconds(s)),
        })
    }
}

// ─── Store ────────────────────────────────────────────

pub struct CredentialStore {
    pool: PgPool,
    http: reqwest::Client,
    api: GitHubApi,
    cipher: TokenCipher,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    refresh_buffer_secs: i64,
    /// Per-user refresh gates; entries are swept by housekeeping while idle.
    refresh_gates: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CredentialStore {
    pub fn new(
        pool: PgPool,
        api: GitHubApi,
        encryption_secret: &str,
        client_id: String,
        client_secret: String,
        redirect_url: String,
        refresh_buffer_secs: i64,
    ) -> Result<Self, anyhow::Error> {
        Ok(Self {
            pool,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            api,
            cipher: TokenCipher::new(encryption_secret)?,
            client_id,
            client_secret,
            redirect_url,
            refresh_buffer_secs,
            refresh_gates: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    // ── Authorization URL ─────────────────────────────

    /// Persist an OAuthState row (15-minute TTL) and return the upstream
    /// authorization URL carrying its nonce.
    pub async fn authorize_url(
        &self,
        towns_user_id: &str,
        channel_id: &str,
        space_id: &str,
        action: &str,
        redirect_data: Value,
    ) -> Result<String, anyhow::Error> {
        let mut nonce = [0u8; 32];
        rand::rng().fill_bytes(&mut nonce);
        let state = hex::encode(nonce);

        sqlx::query(
            r#"INSERT INTO oauth_states
               (state, towns_user_id, channel_id, space_id, redirect_action, redirect_data, expires_at)
               VALUES ($1, $2, $3, $4, $5, $6, now() + make_interval(mins => $7))"#,
        )
        .bind(&state)
        .bind(towns_user_id)
        .bind(channel_id)
        .bind(space_id)
        .bind(action)
        .bind(&redirect_data)
        .bind(STATE_TTL_MINUTES as i32)
        .execute(&self.pool)
        .await?;

        let url = reqwest::Url::parse_with_params(
            "https://github.com/login/oauth/authorize",
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_url.as_str()),
                ("state", state.as_str()),
                ("scope", "repo read:user"),
            ],
        )?;
        Ok(url.to_string())
    }

    // ── Callback ──────────────────────────────────────

    /// Consume a state nonce, exchange the code, and upsert the token row.
    /// The state row is single-use: deleted on success, and on expiry.
    pub async fn complete_callback(
        &self,
        code: &str,
        state: &str,
    ) -> Result<CallbackOutcome, CallbackError> {
        let row = sqlx::query_as::<_, crate::models::OAuthState>(
            "SELECT * FROM oauth_states WHERE state = $1",
        )
        .bind(state)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CallbackError::Other(e.into()))?
        .ok_or(CallbackError::InvalidState)?;

        if row.expires_at <= Utc::now() {
            sqlx::query("DELETE FROM oauth_states WHERE state = $1")
                .bind(state)
                .execute(&self.pool)
                .await
                .map_err(|e| CallbackError::Other(e.into()))?;
            return Err(CallbackError::StateExpired);
        }

        let tokens = self.exchange_code(code).await?;
        let user = self
            .api
            .authenticated_user(&tokens.access_token)
            .await
            .map_err(|e| CallbackError::Other(anyhow::anyhow!("profile fetch failed: {}", e)))?;

        self.upsert_token(&row.towns_user_id, &user, &tokens)
            .await
            .map_err(CallbackError::Other)?;

        sqlx::query("DELETE FROM oauth_states WHERE state = $1")
            .bind(state)
            .execute(&self.pool)
            .await
            .map_err(|e| CallbackError::Other(e.into()))?;

        tracing::info!(
            towns_user_id = %row.towns_user_id,
            github_login = %user.login,
            "GitHub account linked"
        );

        Ok(CallbackOutcome {
            towns_user_id: row.towns_user_id,
            channel_id: row.channel_id,
            space_id: row.space_id,
            redirect_action: row.redirect_action,
            redirect_data: row.redirect_data,
            github_login: user.login,
        })
    }

    // ── Live Token Retrieval ──────────────────────────

    /// Decrypted access token for the user, refreshed upstream when within
    /// the expiry look-ahead. None when the user is not linked or the token
    /// cannot be made live again.
    pub async fn access_token(&self, towns_user_id: &str) -> Result<Option<String>, anyhow::Error> {
        let Some(row) = self.load(towns_user_id).await? else {
            return Ok(None);
        };
        if !self.expiring(&row) {
            return Ok(Some(self.cipher.decrypt(&row.access_token)?));
        }

        let gate = {
            let mut gates = self.refresh_gates.lock().await;
            gates.entry(towns_user_id.to_string()).or_default().clone()
        };
        let _held = gate.lock().await;

        // a concurrent caller may have refreshed while we waited on the gate
        let Some(row) = self.load(towns_user_id).await? else {
            return Ok(None);
        };
        if !self.expiring(&row) {
            return Ok(Some(self.cipher.decrypt(&row.access_token)?));
        }

        let Some(refresh_ciphertext) = row.refresh_token.as_deref() else {
            return Ok(None);
        };
        if let Some(refresh_expiry) = row.refresh_token_expires_at {
            if refresh_expiry <= Utc::now() {
                return Ok(None);
            }
        }

        let refresh_token = self.cipher.decrypt(refresh_ciphertext)?;
        match self.refresh_upstream(&refresh_token).await {
            Ok(tokens) => {
                let access_token = tokens.access_token.clone();
                self.apply_refresh(towns_user_id, &tokens).await?;
                tracing::debug!(towns_user_id = %towns_user_id, "access token refreshed");
                Ok(Some(access_token))
            }
            Err(e) => {
                // refresh failure is a logout: the user must reconnect
                tracing::warn!(towns_user_id = %towns_user_id, error = %e, "token refresh failed, unlinking");
                self.delete(towns_user_id).await?;
                Ok(None)
            }
        }
    }

    /// Authenticated Octocrab handle for user-initiated calls.
    pub async fn user_client(
        &self,
        towns_user_id: &str,
    ) -> Result<Option<octocrab::Octocrab>, anyhow::Error> {
        match self.access_token(towns_user_id).await? {
            Some(token) => Ok(Some(
                octocrab::Octocrab::builder().personal_token(token).build()?,
            )),
            None => Ok(None),
        }
    }

    pub async fn github_login(
        &self,
        towns_user_id: &str,
    ) -> Result<Option<String>, anyhow::Error> {
        let login: Option<(String,)> =
            sqlx::query_as("SELECT github_login FROM tokens WHERE towns_user_id = $1")
                .bind(towns_user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(login.map(|(l,)| l))
    }

    // ── Validation ────────────────────────────────────

    /// Check the token against the authenticated-user endpoint. A 401
    /// deletes the row (the user must reconnect); transient failures must
    /// not cause deletion.
    pub async fn validate(&self, towns_user_id: &str) -> TokenStatus {
        match self.load(towns_user_id).await {
            Ok(Some(_)) => {}
            Ok(None) => return TokenStatus::NotLinked,
            Err(e) => {
                tracing::error!(error = %e, "token load failed during validation");
                return TokenStatus::Unknown;
            }
        }

        let token = match self.access_token(towns_user_id).await {
            Ok(Some(token)) => token,
            // expired and unrefreshable (or refresh failed and unlinked)
            Ok(None) => return TokenStatus::Invalid,
            Err(_) => return TokenStatus::Unknown,
        };

        match self.api.authenticated_user(&token).await {
            Ok(GitHubUser { login, .. }) => TokenStatus::Valid { login },
            Err(ApiError::Unauthorized) => {
                if let Err(e) = self.delete(towns_user_id).await {
                    tracing::error!(error = %e, "failed to delete invalid token");
                }
                TokenStatus::Invalid
            }
            Err(e) => {
                tracing::debug!(error = %e, "token validation inconclusive");
                TokenStatus::Unknown
            }
        }
    }

    // ── Disconnect ────────────────────────────────────

    /// Best-effort upstream revocation, then row deletion. Returns whether
    /// a linked account existed.
    pub async fn disconnect(&self, towns_user_id: &str) -> Result<bool, anyhow::Error> {
        let Some(row) = self.load(towns_user_id).await? else {
            return Ok(false);
        };
        if let Ok(token) = self.cipher.decrypt(&row.access_token) {
            if let Err(e) = self.revoke_upstream(&token).await {
                tracing::debug!(error = %e, "upstream revocation failed (continuing)");
            }
        }
        self.delete(towns_user_id).await?;
        Ok(true)
    }

    // ── Housekeeping Hooks ────────────────────────────

    /// Drop refresh gates that are not currently held.
    pub async fn sweep_refresh_gates(&self) -> usize {
        let mut gates = self.refresh_gates.lock().await;
        let before = gates.len();
        gates.retain(|_, gate| gate.try_lock().is_err());
        before - gates.len()
    }

    // ── Internals ─────────────────────────────────────

    fn expiring(&self, row: &StoredToken) -> bool {
        match row.expires_at {
            Some(expires_at) => {
                expires_at <= Utc::now() + TimeDelta::seconds(self.refresh_buffer_secs)
            }
            // tokens without expiry never refresh
            None => false,
        }
    }

    async fn load(&self, towns_user_id: &str) -> Result<Option<StoredToken>, anyhow::Error> {
        Ok(
            sqlx::query_as::<_, StoredToken>("SELECT * FROM tokens WHERE towns_user_id = $1")
                .bind(towns_user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn delete(&self, towns_user_id: &str) -> Result<(), anyhow::Error> {
        sqlx::query("DELETE FROM tokens WHERE towns_user_id = $1")
            .bind(towns_user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert or update the row for this Towns user. The same GitHub account
    /// under a different Towns user moves: the old row is removed so the
    /// github_user_id uniqueness holds.
    async fn upsert_token(
        &self,
        towns_user_id: &str,
        user: &GitHubUser,
        tokens: &FreshTokens,
    ) -> Result<(), anyhow::Error> {
        let access_ciphertext = self.cipher.encrypt(&tokens.access_token)?;
        let refresh_ciphertext = tokens
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t))
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tokens WHERE github_user_id = $1 AND towns_user_id <> $2")
            .bind(user.id)
            .bind(towns_user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"INSERT INTO tokens
               (towns_user_id, github_user_id, github_login, access_token, token_type,
                expires_at, refresh_token, refresh_token_expires_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (towns_user_id) DO UPDATE SET
                github_user_id = $2,
                github_login = $3,
                access_token = $4,
                token_type = $5,
                expires_at = $6,
                refresh_token = $7,
                refresh_token_expires_at = $8,
                updated_at = now()"#,
        )
        .bind(towns_user_id)
        .bind(user.id)
        .bind(&user.login)
        .bind(&access_ciphertext)
        .bind(&tokens.token_type)
        .bind(tokens.expires_at)
        .bind(&refresh_ciphertext)
        .bind(tokens.refresh_token_expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply_refresh(
        &self,
        towns_user_id: &str,
        tokens: &FreshTokens,
    ) -> Result<(), anyhow::Error> {
        let access_ciphertext = self.cipher.encrypt(&tokens.access_token)?;
        let refresh_ciphertext = tokens
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t))
            .transpose()?;

        sqlx::query(
            r#"UPDATE tokens SET
                access_token = $2,
                token_type = $3,
                expires_at = $4,
                refresh_token = COALESCE($5, refresh_token),
                refresh_token_expires_at = COALESCE($6, refresh_token_expires_at),
                updated_at = now()
               WHERE towns_user_id = $1"#,
        )
        .bind(towns_user_id)
        .bind(&access_ciphertext)
        .bind(&tokens.token_type)
        .bind(tokens.expires_at)
        .bind(&refresh_ciphertext)
        .bind(tokens.refresh_token_expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn exchange_code(&self, code: &str) -> Result<FreshTokens, anyhow::Error> {
        self.token_endpoint(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", self.redirect_url.as_str()),
        ])
        .await
    }

    async fn refresh_upstream(&self, refresh_token: &str) -> Result<FreshTokens, anyhow::Error> {
        self.token_endpoint(&[
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn token_endpoint(&self, params: &[(&str, &str)]) -> Result<FreshTokens, anyhow::Error> {
        let resp = self
            .http
            .post("https://github.com/login/oauth/access_token")
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await?;
        if !resp.status().is_success() {
            anyhow::bail!("token endpoint responded {}", resp.status());
        }
        let body: OAuthTokenResponse = resp.json().await?;
        FreshTokens::from_response(body)
    }

    async fn revoke_upstream(&self, access_token: &str) -> Result<(), anyhow::Error> {
        let resp = self
            .http
            .delete(format!(
                "https://api.github.com/applications/{}/grant",
                self.client_id
            ))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .header("Accept", "application/vnd.github+json")
            .json(&serde_json::json!({ "access_token": access_token }))
            .send()
            .await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            anyhow::bail!("revocation responded {}", resp.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cipher_round_trips() {
        let cipher = TokenCipher::new("0123456789abcdef0123456789abcdef").unwrap();
        let stored = cipher.encrypt("gho_secret_token_value").unwrap();
        assert_eq!(cipher.decrypt(&stored).unwrap(), "gho_secret_token_value");
    }

    #[test]
    fn ciphertext_wire_format() {
        let cipher = TokenCipher::new("0123456789abcdef0123456789abcdef").unwrap();
        let stored = cipher.encrypt("tok").unwrap();
        let parts: Vec<&str> = stored.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 24); // 96-bit IV, hex
        assert_eq!(parts[1].len(), 32); // 128-bit tag, hex
        assert!(parts.iter().all(|p| hex::decode(p).is_ok()));
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let cipher = TokenCipher::new("0123456789abcdef0123456789abcdef").unwrap();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = TokenCipher::new("0123456789abcdef0123456789abcdef").unwrap();
        let stored = cipher.encrypt("tok").unwrap();
        let mut parts: Vec<String> = stored.split(':').map(String::from).collect();
        let flipped = if parts[2].ends_with('0') { "1" } else { "0" };
        parts[2].pop();
        parts[2].push_str(flipped);
        assert!(cipher.decrypt(&parts.join(":")).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let cipher = TokenCipher::new("0123456789abcdef0123456789abcdef").unwrap();
        let other = TokenCipher::new("ffffffffffffffffffffffffffffffff").unwrap();
        let stored = cipher.encrypt("tok").unwrap();
        assert!(other.decrypt(&stored).is_err());
    }

    #[test]
    fn malformed_ciphertext_is_rejected() {
        let cipher = TokenCipher::new("0123456789abcdef0123456789abcdef").unwrap();
        assert!(cipher.decrypt("nonsense").is_err());
        assert!(cipher.decrypt("aa:bb").is_err());
        assert!(cipher.decrypt("zz:zz:zz").is_err());
    }

    #[test]
    fn wrong_iv_length_is_rejected() {
        let cipher = TokenCipher::new("0123456789abcdef0123456789abcdef").unwrap();
        let stored = cipher.encrypt("tok").unwrap();
        let mut parts: Vec<String> = stored.split(':').map(String::from).collect();
        parts[0] = "00".repeat(16); // 128-bit IV, not produced by encrypt
        let err = cipher.decrypt(&parts.join(":")).unwrap_err();
        assert!(err.to_string().contains("unsupported IV length"));
    }

    #[test]
    fn oauth_error_response_is_rejected() {
        let resp = OAuthTokenResponse {
            access_token: None,
            token_type: None,
            expires_in: None,
            refresh_token: None,
            refresh_token_expires_in: None,
            error: Some("bad_verification_code".into()),
            error_description: Some("The code passed is incorrect".into()),
        };
        assert!(FreshTokens::from_response(resp).is_err());
    }

    #[test]
    fn expires_in_becomes_absolute() {
        let resp = OAuthTokenResponse {
            access_token: Some("tok".into()),
            token_type: Some("bearer".into()),
            expires_in: Some(28800),
            refresh_token: Some("refresh".into()),
            refresh_token_expires_in: Some(15897600),
            error: None,
            error_description: None,
        };
        let fresh = FreshTokens::from_response(resp).unwrap();
        let expires_at = fresh.expires_at.unwrap();
        assert!(expires_at > Utc::now() + TimeDelta::seconds(28700));
        assert!(fresh.refresh_token_expires_at.unwrap() > expires_at);
    }
}
