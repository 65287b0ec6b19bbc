use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use octocrab::Octocrab;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cached installation token with expiry
struct CachedToken {
    token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// GitHub App client with installation token caching.
///
/// Present only when the App credentials are configured; its absence means
/// webhook delivery mode is off and every subscription falls back to polling.
#[derive(Clone)]
pub struct GitHubApp {
    app_id: u64,
    private_key_pem: Arc<Vec<u8>>,
    token_cache: Arc<RwLock<HashMap<i64, CachedToken>>>,
}

#[derive(Debug, Serialize)]
struct JwtClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

/// Installation metadata from `GET /app/installations/{id}`, used when an
/// installation_repositories event arrives before its installation event.
#[derive(Debug, Clone)]
pub struct InstallationInfo {
    pub installation_id: i64,
    pub account_login: String,
    pub account_type: String,
    pub app_slug: Option<String>,
}

impl GitHubApp {
    /// Build a new client from the GitHub App's ID and PEM private key.
    pub fn new(app_id: u64, private_key_pem: Vec<u8>) -> Result<Self, anyhow::Error> {
        // Validate the key can be parsed (fail-fast at startup)
        let _ = EncodingKey::from_rsa_pem(&private_key_pem)?;

        Ok(Self {
            app_id,
            private_key_pem: Arc::new(private_key_pem),
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Return a short-lived JWT signed with the App private key.
    /// Used to authenticate as the GitHub App itself (not an installation).
    fn create_app_jwt(&self) -> Result<String, anyhow::Error> {
        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            iat: now - 60,       // 1 min in the past to account for clock drift
            exp: now + (9 * 60), // 9 min (max 10)
            iss: self.app_id.to_string(),
        };
        let header = Header::new(Algorithm::RS256);
        let key = EncodingKey::from_rsa_pem(&self.private_key_pem)?;
        let token = encode(&header, &claims, &key)?;
        Ok(token)
    }

    /// Access token scoped to a specific installation, used where webhook
    /// handling needs an authenticated repository call (private repos).
    /// Cached and re-minted when close to expiry.
    pub async fn installation_token(&self, installation_id: i64) -> Result<String, anyhow::Error> {
        {
            let cache = self.token_cache.read().await;
            if let Some(cached) = cache.get(&installation_id) {
                if cached.expires_at > chrono::Utc::now() + chrono::TimeDelta::minutes(5) {
                    return Ok(cached.token.clone());
                }
            }
        }

        // Mint a fresh installation token via the App JWT
        let app_crab = self.as_app()?;

        // POST /app/installations/{installation_id}/access_tokens
        let token_response: serde_json::Value = app_crab
            .post(
                format!("/app/installations/{}/access_tokens", installation_id),
                None::<&()>,
            )
            .await?;

        let token = token_response["token"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("No token in installation access_tokens response"))?
            .to_string();

        let expires_at = if let Some(exp_str) = token_response["expires_at"].as_str() {
            chrono::DateTime::parse_from_rfc3339(exp_str)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(|_| chrono::Utc::now() + chrono::TimeDelta::minutes(55))
        } else {
            chrono::Utc::now() + chrono::TimeDelta::minutes(55)
        };

        {
            let mut cache = self.token_cache.write().await;
            cache.insert(
                installation_id,
                CachedToken {
                    token: token.clone(),
                    expires_at,
                },
            );
        }

        Ok(token)
    }

    /// Get an `Octocrab` instance authenticated as the App (not installation-scoped).
    pub fn as_app(&self) -> Result<Octocrab, anyhow::Error> {
        let jwt = self.create_app_jwt()?;
        Octocrab::builder()
            .personal_token(jwt)
            .build()
            .map_err(Into::into)
    }

    /// Fetch installation metadata app-level. Used to recover from
    /// out-of-order lifecycle deliveries.
    pub async fn get_installation(
        &self,
        installation_id: i64,
    ) -> Result<InstallationInfo, anyhow::Error> {
        let app_crab = self.as_app()?;
        let info: serde_json::Value = app_crab
            .get(format!("/app/installations/{}", installation_id), None::<&()>)
            .await?;

        Ok(InstallationInfo {
            installation_id,
            account_login: info["account"]["login"]
                .as_str()
                .unwrap_or("unknown")
                .to_string(),
            account_type: info["account"]["type"].as_str().unwrap_or("User").to_string(),
            app_slug: info["app_slug"].as_str().map(String::from),
        })
    }
}
