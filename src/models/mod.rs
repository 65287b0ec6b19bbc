pub mod events;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ─── Delivery Modes / Statuses ────────────────────────

pub mod delivery_mode {
    pub const WEBHOOK: &str = "webhook";
    pub const POLLING: &str = "polling";
}

pub mod delivery_status {
    pub const SUCCESS: &str = "success";
    pub const FAILED: &str = "failed";
}

// ─── Subscription ─────────────────────────────────────

/// A channel's registered interest in a repository.
///
/// Unique on (space_id, channel_id, repo_full_name); repo_full_name keeps
/// the canonical capitalization reported by GitHub, comparisons are
/// case-insensitive at the query level.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub space_id: String,
    pub channel_id: String,
    pub repo_full_name: String,
    pub delivery_mode: String,
    pub is_private: bool,
    pub installation_id: Option<i64>,
    pub enabled: bool,
    pub event_types: Vec<String>,
    pub branch_filter: Option<String>,
    pub created_by_user_id: String,
    pub created_by_github_login: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Installation ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Installation {
    pub installation_id: i64,
    pub account_login: String,
    pub account_type: String,
    pub app_slug: Option<String>,
    pub installed_at: DateTime<Utc>,
    pub suspended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InstallationRepository {
    pub installation_id: i64,
    pub repo_full_name: String,
    pub added_at: DateTime<Utc>,
}

// ─── Token ────────────────────────────────────────────

/// One linked GitHub account per Towns user. github_user_id is unique across
/// the table: re-authorizing the same GitHub account under a different Towns
/// user moves the mapping instead of duplicating it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredToken {
    pub towns_user_id: String,
    pub github_user_id: i64,
    pub github_login: String,
    /// Ciphertext, iv:tag:ciphertext hex.
    pub access_token: String,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── OAuth State ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OAuthState {
    pub state: String,
    pub towns_user_id: String,
    pub channel_id: String,
    pub space_id: String,
    pub redirect_action: String,
    pub redirect_data: serde_json::Value,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ─── Pending Subscription ─────────────────────────────

/// A subscribe attempt waiting for the GitHub App installation to appear.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PendingSubscription {
    pub id: Uuid,
    pub space_id: String,
    pub channel_id: String,
    pub repo_full_name: String,
    pub towns_user_id: String,
    pub event_types: Vec<String>,
    pub branch_filter: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ─── Polling Cursor ───────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PollingCursor {
    pub repo_full_name: String,
    pub etag: Option<String>,
    pub last_event_id: Option<String>,
    pub default_branch: Option<String>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ─── Delivery Record ──────────────────────────────────

/// Idempotency marker for a webhook delivery, keyed by X-GitHub-Delivery.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeliveryRecord {
    pub delivery_id: String,
    pub installation_id: Option<i64>,
    pub event_type: String,
    pub status: String,
    pub error: Option<String>,
    pub retry_count: i32,
    pub delivered_at: DateTime<Utc>,
}
