use base64::{engine::general_purpose, Engine as _};

/// Service configuration, collected once at startup.
///
/// Missing required options are fatal before the listener binds; optional
/// feature groups (GitHub App, user OAuth, Towns transport) degrade to
/// disabled when their variables are absent.
#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub database_tls: bool,
    pub database_ca_cert: Option<String>,
    pub port: u16,

    /// GitHub App credentials. Both present ⇒ webhook delivery mode enabled.
    pub github_app_id: Option<u64>,
    pub github_private_key: Option<Vec<u8>>,
    pub github_app_slug: String,

    /// OAuth app credentials. Both present ⇒ user auth enabled.
    pub github_client_id: Option<String>,
    pub github_client_secret: Option<String>,

    pub webhook_secret: Option<String>,
    pub public_base_url: Option<String>,
    pub oauth_redirect_url: Option<String>,
    pub token_encryption_secret: Option<String>,

    pub token_refresh_buffer_secs: i64,
    pub pending_subscription_ttl_secs: i64,
    pub polling_interval_secs: u64,
    pub delivery_retention_days: i64,

    pub towns_api_url: Option<String>,
    pub towns_bot_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let github_app_id = match std::env::var("GITHUB_APP_ID") {
            Ok(v) => Some(
                v.parse::<u64>()
                    .map_err(|_| anyhow::anyhow!("GITHUB_APP_ID must be a number"))?,
            ),
            Err(_) => None,
        };

        let github_private_key = match std::env::var("GITHUB_APP_PRIVATE_KEY") {
            Ok(b64) => Some(general_purpose::STANDARD.decode(b64.trim()).map_err(|e| {
                anyhow::anyhow!("Failed to base64-decode GITHUB_APP_PRIVATE_KEY: {}", e)
            })?),
            Err(_) => None,
        };

        if github_app_id.is_some() != github_private_key.is_some() {
            anyhow::bail!("GITHUB_APP_ID and GITHUB_APP_PRIVATE_KEY must be set together");
        }

        let github_client_id = std::env::var("GITHUB_CLIENT_ID").ok();
        let github_client_secret = std::env::var("GITHUB_CLIENT_SECRET").ok();
        if github_client_id.is_some() != github_client_secret.is_some() {
            anyhow::bail!("GITHUB_CLIENT_ID and GITHUB_CLIENT_SECRET must be set together");
        }

        let token_encryption_secret = std::env::var("TOKEN_ENCRYPTION_SECRET").ok();
        if let Some(ref secret) = token_encryption_secret {
            if secret.len() < 32 {
                anyhow::bail!("TOKEN_ENCRYPTION_SECRET must be at least 32 bytes");
            }
        }

        let public_base_url = std::env::var("PUBLIC_BASE_URL")
            .ok()
            .map(|u| u.trim_end_matches('/').to_string());
        let oauth_redirect_url = std::env::var("OAUTH_REDIRECT_URL").ok();

        if github_client_id.is_some() {
            if token_encryption_secret.is_none() {
                anyhow::bail!("TOKEN_ENCRYPTION_SECRET is required when user auth is enabled");
            }
            if public_base_url.is_none() && oauth_redirect_url.is_none() {
                anyhow::bail!(
                    "PUBLIC_BASE_URL or OAUTH_REDIRECT_URL is required when user auth is enabled"
                );
            }
        }

        Ok(Self {
            database_url,
            database_tls: env_bool("DATABASE_TLS"),
            database_ca_cert: std::env::var("DATABASE_CA_CERT").ok(),
            port: env_parse("PORT", 4000)?,
            github_app_id,
            github_private_key,
            github_app_slug: std::env::var("GITHUB_APP_SLUG")
                .unwrap_or_else(|_| "towns-github-bot".to_string()),
            github_client_id,
            github_client_secret,
            webhook_secret: std::env::var("GITHUB_WEBHOOK_SECRET").ok(),
            public_base_url,
            oauth_redirect_url,
            token_encryption_secret,
            token_refresh_buffer_secs: env_parse("TOKEN_REFRESH_BUFFER_SECS", 300)?,
            pending_subscription_ttl_secs: env_parse("PENDING_SUBSCRIPTION_TTL_SECS", 3600)?,
            polling_interval_secs: env_parse("POLLING_INTERVAL_SECS", 300)?,
            delivery_retention_days: env_parse("DELIVERY_RETENTION_DAYS", 7)?,
            towns_api_url: std::env::var("TOWNS_API_URL").ok(),
            towns_bot_token: std::env::var("TOWNS_BOT_TOKEN").ok(),
        })
    }

    /// Webhook delivery requires both the App credentials and the signing secret.
    pub fn webhook_mode_enabled(&self) -> bool {
        self.github_app_id.is_some() && self.webhook_secret.is_some()
    }

    pub fn user_auth_enabled(&self) -> bool {
        self.github_client_id.is_some()
    }

    /// The OAuth redirect endpoint: explicit override, else derived from the base URL.
    pub fn redirect_url(&self) -> Option<String> {
        self.oauth_redirect_url.clone().or_else(|| {
            self.public_base_url
                .as_ref()
                .map(|base| format!("{}/oauth/callback", base))
        })
    }

    /// Public page for installing the GitHub App, optionally pre-targeted at
    /// the repository owner's account.
    pub fn install_url(&self, suggested_owner_id: Option<i64>) -> String {
        match suggested_owner_id {
            Some(id) => format!(
                "https://github.com/apps/{}/installations/new/permissions?suggested_target_id={}",
                self.github_app_slug, id
            ),
            None => format!(
                "https://github.com/apps/{}/installations/new",
                self.github_app_slug
            ),
        }
    }
}

fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T, anyhow::Error> {
    match std::env::var(name) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("{} must be a number", name)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_url_targets_owner() {
        let config = Config {
            database_url: "postgres://localhost/test".into(),
            database_tls: false,
            database_ca_cert: None,
            port: 4000,
            github_app_id: None,
            github_private_key: None,
            github_app_slug: "towns-github-bot".into(),
            github_client_id: None,
            github_client_secret: None,
            webhook_secret: None,
            public_base_url: Some("https://bot.example.com".into()),
            oauth_redirect_url: None,
            token_encryption_secret: None,
            token_refresh_buffer_secs: 300,
            pending_subscription_ttl_secs: 3600,
            polling_interval_secs: 300,
            delivery_retention_days: 7,
            towns_api_url: None,
            towns_bot_token: None,
        };

        assert_eq!(
            config.install_url(None),
            "https://github.com/apps/towns-github-bot/installations/new"
        );
        assert!(config.install_url(Some(42)).ends_with("suggested_target_id=42"));
        assert_eq!(
            config.redirect_url().as_deref(),
            Some("https://bot.example.com/oauth/callback")
        );
    }
}
