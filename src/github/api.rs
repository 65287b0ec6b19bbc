//! Typed REST adapter for the calls the pipeline makes with user tokens or
//! anonymously: profile, repository metadata, pull requests, owner lookup,
//! and the per-repo events feed with conditional-request support.

use reqwest::header::{HeaderMap, HeaderValue, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use crate::models::events::FeedEvent;

const API_BASE: &str = "https://api.github.com";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("rate limited")]
    RateLimited,
    #[error("github request failed: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubUser {
    pub id: i64,
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    /// Canonical capitalization as GitHub reports it.
    pub full_name: String,
    pub private: bool,
    pub default_branch: String,
}

/// Result of a conditional events-feed request; 304 is first-class.
#[derive(Debug)]
pub enum EventsPage {
    NotModified,
    Events {
        etag: Option<String>,
        /// Newest first, as the API returns them.
        events: Vec<FeedEvent>,
    },
}

#[derive(Clone)]
pub struct GitHubApi {
    http: reqwest::Client,
}

impl GitHubApi {
    pub fn new() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Accept",
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        Self {
            http: reqwest::Client::builder()
                .user_agent("towns-github-bot")
                .default_headers(headers)
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
        }
    }

    /// GET /user, identifying the token holder.
    pub async fn authenticated_user(&self, token: &str) -> Result<GitHubUser, ApiError> {
        let value = self.get_json(Some(token), "/user").await?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::Other(anyhow::anyhow!("unexpected /user response: {}", e)))
    }

    /// GET /repos/{owner}/{repo}. Anonymous access works for public repos.
    pub async fn repository(
        &self,
        token: Option<&str>,
        repo_full_name: &str,
    ) -> Result<RepoInfo, ApiError> {
        let value = self
            .get_json(token, &format!("/repos/{}", repo_full_name))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::Other(anyhow::anyhow!("unexpected repo response: {}", e)))
    }

    /// GET /repos/{owner}/{repo}/pulls/{number}: fresh PR state for the
    /// polling renderer (merge flag, title updates).
    pub async fn pull_request(
        &self,
        token: Option<&str>,
        repo_full_name: &str,
        number: u64,
    ) -> Result<Value, ApiError> {
        self.get_json(token, &format!("/repos/{}/pulls/{}", repo_full_name, number))
            .await
    }

    /// Best-effort account id for the install URL's suggested target.
    pub async fn owner_id(&self, login: &str) -> Option<i64> {
        match self.get_json(None, &format!("/users/{}", login)).await {
            Ok(value) => value["id"].as_i64(),
            Err(e) => {
                tracing::debug!(login = %login, error = %e, "owner id lookup failed");
                None
            }
        }
    }

    /// GET /repos/{owner}/{repo}/events with `If-None-Match` when an ETag is
    /// known. Newest-first page of up to 100 entries.
    pub async fn repo_events(
        &self,
        repo_full_name: &str,
        etag: Option<&str>,
    ) -> Result<EventsPage, ApiError> {
        let url = format!("{}/repos/{}/events?per_page=100", API_BASE, repo_full_name);
        let mut request = self.http.get(&url);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ApiError::Other(e.into()))?;

        if resp.status() == StatusCode::NOT_MODIFIED {
            return Ok(EventsPage::NotModified);
        }
        let resp = classify_status(resp)?;

        let new_etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let events: Vec<FeedEvent> = resp
            .json()
            .await
            .map_err(|e| ApiError::Other(anyhow::anyhow!("events feed decode failed: {}", e)))?;

        Ok(EventsPage::Events {
            etag: new_etag,
            events,
        })
    }

    async fn get_json(&self, token: Option<&str>, path: &str) -> Result<Value, ApiError> {
        let mut request = self.http.get(format!("{}{}", API_BASE, path));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| ApiError::Other(e.into()))?;
        let resp = classify_status(resp)?;
        resp.json()
            .await
            .map_err(|e| ApiError::Other(anyhow::anyhow!("response decode failed: {}", e)))
    }
}

impl Default for GitHubApi {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify upstream status codes. A 403 with an exhausted rate-limit
/// header is rate limiting, not authorization.
fn classify_status(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::NOT_FOUND => Err(ApiError::NotFound),
        StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized),
        StatusCode::TOO_MANY_REQUESTS => Err(ApiError::RateLimited),
        StatusCode::FORBIDDEN => {
            let exhausted = resp
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                .map(|v| v == "0")
                .unwrap_or(false);
            if exhausted {
                Err(ApiError::RateLimited)
            } else {
                Err(ApiError::Forbidden)
            }
        }
        _ => Err(ApiError::Other(anyhow::anyhow!(
            "github responded {}",
            status
        ))),
    }
}
