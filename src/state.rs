use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::github::api::GitHubApi;
use crate::github::client::GitHubApp;
use crate::github::credentials::CredentialStore;
use crate::subscriptions::tracker::PromptTracker;
use crate::towns::TownsClient;

/// Shared handles for request handlers and background workers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub api: GitHubApi,
    /// Present when the GitHub App credentials are configured.
    pub app: Option<Arc<GitHubApp>>,
    /// Present when the OAuth app + encryption secret are configured.
    pub credentials: Option<Arc<CredentialStore>>,
    /// Present when the Towns bot gateway is configured.
    pub towns: Option<Arc<TownsClient>>,
    pub prompts: Arc<PromptTracker>,
}

impl AppState {
    pub fn credentials(&self) -> Result<&CredentialStore, anyhow::Error> {
        self.credentials
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("user auth is not configured"))
    }
}
