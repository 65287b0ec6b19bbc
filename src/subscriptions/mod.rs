//! Subscription service: creation, mutation, the webhook/polling mode
//! decision, upgrade/downgrade transitions, and pending-subscription
//! completion.

pub mod tracker;

use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use crate::github::api::{ApiError, RepoInfo};
use crate::models::events::{EventKind, ALL_EVENTS};
use crate::models::{delivery_mode, PendingSubscription, Subscription};
use crate::state::AppState;

lazy_static! {
    /// "owner/repo", tolerating a pasted github.com URL or trailing ".git".
    static ref REPO_RE: Regex =
        Regex::new(r"^([A-Za-z0-9][A-Za-z0-9-]*)/([A-Za-z0-9._-]+?)(?:\.git)?$").unwrap();
}

// ─── Errors & Outcomes ────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("repository must be in owner/repo format")]
    InvalidFormat,
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("at least one event type is required")]
    NoEventTypes,
    #[error("GitHub account not linked")]
    NotLinked,
    #[error("repository not found")]
    RepoNotFound,
    #[error("{0}")]
    Forbidden(String),
    #[error("GitHub rate limit exceeded, try again in a few minutes")]
    RateLimited,
    #[error("no subscription for {0} in this channel")]
    NotSubscribed(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug)]
pub enum SubscribeOutcome {
    Created {
        repo_full_name: String,
        delivery_mode: &'static str,
        /// Set for polling results: installing the App upgrades delivery.
        install_url: Option<String>,
    },
    AlreadySubscribed {
        repo_full_name: String,
    },
    /// The repository needs the App installed before a subscription can
    /// exist (private repo, or not visible to the caller). A pending row
    /// was stored; the transition completes when the installation arrives.
    RequiresInstallation {
        install_url: String,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum RemovalOutcome {
    Deleted,
    Remaining(Vec<String>),
}

// ─── Create ───────────────────────────────────────────

pub async fn create_subscription(
    state: &AppState,
    towns_user_id: &str,
    space_id: &str,
    channel_id: &str,
    repo_identifier: &str,
    event_types: &[String],
    branch_filter: Option<String>,
) -> Result<SubscribeOutcome, SubscribeError> {
    let (owner, requested_repo) = parse_repo_identifier(repo_identifier)?;
    let requested_full_name = format!("{}/{}", owner, requested_repo);
    let event_types = normalize_event_types(event_types)?;
    let branch_filter = normalize_branch_filter(branch_filter);

    let credentials = state.credentials()?;
    let token = credentials
        .access_token(towns_user_id)
        .await?
        .ok_or(SubscribeError::NotLinked)?;
    let github_login = credentials.github_login(towns_user_id).await?;

    let installation_id = installation_for_repo(state, &requested_full_name).await?;

    let repo = match state.api.repository(Some(&token), &requested_full_name).await {
        Ok(repo) => repo,
        Err(ApiError::NotFound) if installation_id.is_none() => {
            // possibly a private repo the caller can't see yet; park it
            // until the installation shows up
            store_pending(
                state,
                towns_user_id,
                space_id,
                channel_id,
                &requested_full_name,
                &event_types,
                branch_filter.as_deref(),
            )
            .await?;
            return Ok(SubscribeOutcome::RequiresInstallation {
                install_url: install_url_for(state, &owner).await,
            });
        }
        Err(ApiError::NotFound) => return Err(SubscribeError::RepoNotFound),
        Err(ApiError::Forbidden) => {
            let own_repo = github_login
                .as_deref()
                .map(|login| login.eq_ignore_ascii_case(&owner))
                .unwrap_or(false);
            let message = if own_repo {
                format!("access to {} is forbidden", requested_full_name)
            } else {
                format!(
                    "access to {} is forbidden; if it belongs to an organization, installing the GitHub App may need an owner's approval",
                    requested_full_name
                )
            };
            return Err(SubscribeError::Forbidden(message));
        }
        Err(ApiError::RateLimited) => return Err(SubscribeError::RateLimited),
        Err(e) => return Err(SubscribeError::Internal(anyhow::anyhow!(e))),
    };

    let mode = match (repo.private, installation_id) {
        // private repos may only be delivered by webhook
        (true, Some(_)) => delivery_mode::WEBHOOK,
        (true, None) => {
            store_pending(
                state,
                towns_user_id,
                space_id,
                channel_id,
                &repo.full_name,
                &event_types,
                branch_filter.as_deref(),
            )
            .await?;
            return Ok(SubscribeOutcome::RequiresInstallation {
                install_url: install_url_for(state, &owner).await,
            });
        }
        (false, Some(_)) => delivery_mode::WEBHOOK,
        (false, None) => delivery_mode::POLLING,
    };

    if find_subscription(state, space_id, channel_id, &repo.full_name)
        .await?
        .is_some()
    {
        return Ok(SubscribeOutcome::AlreadySubscribed {
            repo_full_name: repo.full_name,
        });
    }

    let inserted = sqlx::query(
        r#"INSERT INTO subscriptions
           (space_id, channel_id, repo_full_name, delivery_mode, is_private,
            installation_id, event_types, branch_filter,
            created_by_user_id, created_by_github_login)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
           ON CONFLICT (space_id, channel_id, repo_full_name) DO NOTHING"#,
    )
    .bind(space_id)
    .bind(channel_id)
    .bind(&repo.full_name)
    .bind(mode)
    .bind(repo.private)
    .bind(if mode == delivery_mode::WEBHOOK {
        installation_id
    } else {
        None
    })
    .bind(&event_types)
    .bind(&branch_filter)
    .bind(towns_user_id)
    .bind(&github_login)
    .execute(&state.pool)
    .await
    .map_err(|e| SubscribeError::Internal(e.into()))?;

    if inserted.rows_affected() == 0 {
        return Ok(SubscribeOutcome::AlreadySubscribed {
            repo_full_name: repo.full_name,
        });
    }

    seed_default_branch(state, &repo).await;

    tracing::info!(
        repo = %repo.full_name,
        channel_id = %channel_id,
        mode = %mode,
        "subscription created"
    );

    Ok(SubscribeOutcome::Created {
        install_url: if mode == delivery_mode::POLLING {
            Some(install_url_for(state, &owner).await)
        } else {
            None
        },
        repo_full_name: repo.full_name,
        delivery_mode: mode,
    })
}

// ─── Update / Remove ──────────────────────────────────

pub async fn update_subscription(
    state: &AppState,
    towns_user_id: &str,
    space_id: &str,
    channel_id: &str,
    repo_identifier: &str,
    event_types_to_add: &[String],
    branch_filter: Option<String>,
) -> Result<Subscription, SubscribeError> {
    let (owner, repo_name) = parse_repo_identifier(repo_identifier)?;
    let full_name = format!("{}/{}", owner, repo_name);
    let additions = normalize_event_types(event_types_to_add)?;

    validate_repo_access(state, towns_user_id, &full_name).await?;

    let existing = find_subscription(state, space_id, channel_id, &full_name)
        .await?
        .ok_or_else(|| SubscribeError::NotSubscribed(full_name.clone()))?;

    let merged = merge_event_types(&existing.event_types, &additions);
    let branch_filter = match normalize_branch_filter(branch_filter) {
        Some(filter) => Some(filter),
        None => existing.branch_filter.clone(),
    };

    let updated = sqlx::query_as::<_, Subscription>(
        r#"UPDATE subscriptions
           SET event_types = $2, branch_filter = $3, updated_at = now()
           WHERE id = $1
           RETURNING *"#,
    )
    .bind(existing.id)
    .bind(&merged)
    .bind(&branch_filter)
    .fetch_one(&state.pool)
    .await
    .map_err(|e| SubscribeError::Internal(e.into()))?;

    Ok(updated)
}

pub async fn remove_event_types(
    state: &AppState,
    towns_user_id: &str,
    space_id: &str,
    channel_id: &str,
    repo_identifier: &str,
    event_types_to_remove: &[String],
) -> Result<RemovalOutcome, SubscribeError> {
    let (owner, repo_name) = parse_repo_identifier(repo_identifier)?;
    let full_name = format!("{}/{}", owner, repo_name);
    let removals = normalize_event_types(event_types_to_remove)?;

    validate_repo_access(state, towns_user_id, &full_name).await?;

    let existing = find_subscription(state, space_id, channel_id, &full_name)
        .await?
        .ok_or_else(|| SubscribeError::NotSubscribed(full_name.clone()))?;

    let remaining = subtract_event_types(&existing.event_types, &removals);
    if remaining.is_empty() {
        sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(existing.id)
            .execute(&state.pool)
            .await
            .map_err(|e| SubscribeError::Internal(e.into()))?;
        tracing::info!(repo = %existing.repo_full_name, channel_id = %channel_id, "subscription removed");
        return Ok(RemovalOutcome::Deleted);
    }

    sqlx::query("UPDATE subscriptions SET event_types = $2, updated_at = now() WHERE id = $1")
        .bind(existing.id)
        .bind(&remaining)
        .execute(&state.pool)
        .await
        .map_err(|e| SubscribeError::Internal(e.into()))?;
    Ok(RemovalOutcome::Remaining(remaining))
}

/// Unsubscribe is removal of the full event set.
pub async fn unsubscribe(
    state: &AppState,
    towns_user_id: &str,
    space_id: &str,
    channel_id: &str,
    repo_identifier: &str,
) -> Result<RemovalOutcome, SubscribeError> {
    remove_event_types(
        state,
        towns_user_id,
        space_id,
        channel_id,
        repo_identifier,
        &[ALL_EVENTS.to_string()],
    )
    .await
}

// ─── Upgrade / Downgrade ──────────────────────────────

/// Flip every polling subscription for a repo to webhook mode in one
/// statement. Consults the prompt tracker to edit provisional messages in
/// place. Returns how many rows changed.
pub async fn upgrade_to_webhook(
    state: &AppState,
    repo_full_name: &str,
    installation_id: i64,
) -> Result<u64, anyhow::Error> {
    let upgraded: Vec<(String, String)> = sqlx::query_as(
        r#"UPDATE subscriptions
           SET delivery_mode = 'webhook', installation_id = $2, updated_at = now()
           WHERE lower(repo_full_name) = lower($1) AND delivery_mode = 'polling'
           RETURNING channel_id, repo_full_name"#,
    )
    .bind(repo_full_name)
    .bind(installation_id)
    .fetch_all(&state.pool)
    .await?;

    if upgraded.is_empty() {
        return Ok(0);
    }
    tracing::info!(
        repo = %repo_full_name,
        installation_id = installation_id,
        count = upgraded.len(),
        "subscriptions upgraded to webhook delivery"
    );

    if let Some(towns) = &state.towns {
        for (channel_id, repo) in &upgraded {
            if let Some(event_id) = state.prompts.take(channel_id, repo) {
                let body = format!(
                    "✅ Subscribed to **{}** — the GitHub App is installed, events now arrive in real time.",
                    repo
                );
                if let Err(e) = towns.edit_message(channel_id, &event_id, &body).await {
                    tracing::warn!(channel_id = %channel_id, error = %e, "provisional message edit failed");
                }
            }
        }
    }

    Ok(upgraded.len() as u64)
}

/// Installation went away (entirely, or for the given repos): public
/// subscriptions fall back to polling, private ones are deleted. The split
/// update runs in one short transaction; channel notifications run after
/// commit and a failed send never rolls anything back.
pub async fn downgrade_subscriptions(
    state: &AppState,
    installation_id: i64,
    repos: Option<&[String]>,
) -> Result<(u64, u64), anyhow::Error> {
    let affected = sqlx::query_as::<_, Subscription>(
        "SELECT * FROM subscriptions WHERE installation_id = $1",
    )
    .bind(installation_id)
    .fetch_all(&state.pool)
    .await?;

    let affected: Vec<Subscription> = match repos {
        Some(repos) => affected
            .into_iter()
            .filter(|sub| {
                repos
                    .iter()
                    .any(|r| r.eq_ignore_ascii_case(&sub.repo_full_name))
            })
            .collect(),
        None => affected,
    };
    if affected.is_empty() {
        return Ok((0, 0));
    }

    let (private, public): (Vec<&Subscription>, Vec<&Subscription>) =
        affected.iter().partition(|sub| sub.is_private);
    let public_ids: Vec<Uuid> = public.iter().map(|sub| sub.id).collect();
    let private_ids: Vec<Uuid> = private.iter().map(|sub| sub.id).collect();

    let mut tx = state.pool.begin().await?;
    if !public_ids.is_empty() {
        sqlx::query(
            r#"UPDATE subscriptions
               SET delivery_mode = 'polling', installation_id = NULL, updated_at = now()
               WHERE id = ANY($1)"#,
        )
        .bind(&public_ids)
        .execute(&mut *tx)
        .await?;
    }
    if !private_ids.is_empty() {
        sqlx::query("DELETE FROM subscriptions WHERE id = ANY($1)")
            .bind(&private_ids)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    tracing::info!(
        installation_id = installation_id,
        downgraded = public_ids.len(),
        removed = private_ids.len(),
        "subscriptions downgraded after installation removal"
    );

    if let Some(towns) = &state.towns {
        let notifications = affected.iter().map(|sub| {
            let body = if sub.is_private {
                format!(
                    "⚠️ Subscription to **{}** was removed: the GitHub App was uninstalled and private repositories require it.",
                    sub.repo_full_name
                )
            } else {
                format!(
                    "ℹ️ **{}** switched to periodic polling: the GitHub App was uninstalled. Reinstall it for real-time delivery.",
                    sub.repo_full_name
                )
            };
            let channel_id = sub.channel_id.clone();
            async move {
                if let Err(e) = towns.send_message(&channel_id, &body).await {
                    tracing::warn!(channel_id = %channel_id, error = %e, "downgrade notification failed");
                }
            }
        });
        futures::future::join_all(notifications).await;
    }

    Ok((public_ids.len() as u64, private_ids.len() as u64))
}

// ─── Pending Completion ───────────────────────────────

/// Try to turn every pending subscription for a repo into a real one, then
/// delete the pending rows whether or not each attempt succeeded (they are
/// fulfilled or stale either way).
pub async fn complete_pending_subscriptions(
    state: &AppState,
    repo_full_name: &str,
) -> Result<(), anyhow::Error> {
    let pending = sqlx::query_as::<_, PendingSubscription>(
        "SELECT * FROM pending_subscriptions WHERE lower(repo_full_name) = lower($1)",
    )
    .bind(repo_full_name)
    .fetch_all(&state.pool)
    .await?;

    for row in &pending {
        if row.expires_at <= chrono::Utc::now() {
            continue;
        }
        let has_token = match state.credentials() {
            Ok(credentials) => credentials
                .access_token(&row.towns_user_id)
                .await
                .unwrap_or(None)
                .is_some(),
            Err(_) => false,
        };
        if !has_token {
            tracing::debug!(
                towns_user_id = %row.towns_user_id,
                repo = %row.repo_full_name,
                "pending subscription skipped, token no longer valid"
            );
            continue;
        }

        match create_subscription(
            state,
            &row.towns_user_id,
            &row.space_id,
            &row.channel_id,
            &row.repo_full_name,
            &row.event_types,
            row.branch_filter.clone(),
        )
        .await
        {
            Ok(SubscribeOutcome::Created {
                repo_full_name, ..
            }) => {
                if let Some(towns) = &state.towns {
                    let body = format!(
                        "✅ Subscribed to **{}** — the GitHub App is now installed.",
                        repo_full_name
                    );
                    if let Err(e) = towns.send_message(&row.channel_id, &body).await {
                        tracing::warn!(channel_id = %row.channel_id, error = %e, "pending confirmation failed");
                    }
                }
            }
            Ok(other) => {
                tracing::debug!(repo = %row.repo_full_name, outcome = ?other, "pending completion no-op");
            }
            Err(e) => {
                tracing::warn!(repo = %row.repo_full_name, error = %e, "pending completion failed");
            }
        }
    }

    sqlx::query("DELETE FROM pending_subscriptions WHERE lower(repo_full_name) = lower($1)")
        .bind(repo_full_name)
        .execute(&state.pool)
        .await?;
    Ok(())
}

// ─── Queries ──────────────────────────────────────────

pub async fn subscribers_for_repo(
    pool: &sqlx::PgPool,
    repo_full_name: &str,
    mode: &str,
) -> Result<Vec<Subscription>, anyhow::Error> {
    Ok(sqlx::query_as::<_, Subscription>(
        r#"SELECT * FROM subscriptions
           WHERE lower(repo_full_name) = lower($1) AND delivery_mode = $2 AND enabled"#,
    )
    .bind(repo_full_name)
    .bind(mode)
    .fetch_all(pool)
    .await?)
}

/// Distinct repos with at least one polling-mode subscription, deduplicated
/// case-insensitively.
pub async fn polled_repos(pool: &sqlx::PgPool) -> Result<Vec<String>, anyhow::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"SELECT min(repo_full_name) FROM subscriptions
           WHERE delivery_mode = 'polling' AND enabled
           GROUP BY lower(repo_full_name)"#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(repo,)| repo).collect())
}

pub async fn installation_for_repo(
    state: &AppState,
    repo_full_name: &str,
) -> Result<Option<i64>, anyhow::Error> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"SELECT installation_id FROM installation_repositories
           WHERE lower(repo_full_name) = lower($1) LIMIT 1"#,
    )
    .bind(repo_full_name)
    .fetch_optional(&state.pool)
    .await?;
    Ok(row.map(|(id,)| id))
}

async fn find_subscription(
    state: &AppState,
    space_id: &str,
    channel_id: &str,
    repo_full_name: &str,
) -> Result<Option<Subscription>, anyhow::Error> {
    Ok(sqlx::query_as::<_, Subscription>(
        r#"SELECT * FROM subscriptions
           WHERE space_id = $1 AND channel_id = $2 AND lower(repo_full_name) = lower($3)"#,
    )
    .bind(space_id)
    .bind(channel_id)
    .bind(repo_full_name)
    .fetch_optional(&state.pool)
    .await?)
}

async fn validate_repo_access(
    state: &AppState,
    towns_user_id: &str,
    repo_full_name: &str,
) -> Result<RepoInfo, SubscribeError> {
    let credentials = state.credentials()?;
    let token = credentials
        .access_token(towns_user_id)
        .await?
        .ok_or(SubscribeError::NotLinked)?;
    match state.api.repository(Some(&token), repo_full_name).await {
        Ok(repo) => Ok(repo),
        Err(ApiError::NotFound) => Err(SubscribeError::RepoNotFound),
        Err(ApiError::Forbidden) => Err(SubscribeError::Forbidden(format!(
            "access to {} is forbidden",
            repo_full_name
        ))),
        Err(ApiError::RateLimited) => Err(SubscribeError::RateLimited),
        Err(e) => Err(SubscribeError::Internal(anyhow::anyhow!(e))),
    }
}

async fn store_pending(
    state: &AppState,
    towns_user_id: &str,
    space_id: &str,
    channel_id: &str,
    repo_full_name: &str,
    event_types: &[String],
    branch_filter: Option<&str>,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"INSERT INTO pending_subscriptions
           (space_id, channel_id, repo_full_name, towns_user_id, event_types,
            branch_filter, expires_at)
           VALUES ($1, $2, $3, $4, $5, $6, now() + make_interval(secs => $7))
           ON CONFLICT (space_id, channel_id, repo_full_name) DO UPDATE SET
            towns_user_id = $4,
            event_types = $5,
            branch_filter = $6,
            expires_at = now() + make_interval(secs => $7)"#,
    )
    .bind(space_id)
    .bind(channel_id)
    .bind(repo_full_name)
    .bind(towns_user_id)
    .bind(event_types)
    .bind(branch_filter)
    .bind(state.config.pending_subscription_ttl_secs as f64)
    .execute(&state.pool)
    .await?;
    Ok(())
}

async fn install_url_for(state: &AppState, owner: &str) -> String {
    let owner_id = state.api.owner_id(owner).await;
    state.config.install_url(owner_id)
}

/// Cache the default branch while we have the repo metadata in hand; saves
/// the processor a lookup on the first branch-filtered event.
async fn seed_default_branch(state: &AppState, repo: &RepoInfo) {
    let result = sqlx::query(
        r#"INSERT INTO polling_cursors (repo_full_name, default_branch)
           VALUES ($1, $2)
           ON CONFLICT (repo_full_name) DO UPDATE SET
            default_branch = $2, updated_at = now()"#,
    )
    .bind(&repo.full_name)
    .bind(&repo.default_branch)
    .execute(&state.pool)
    .await;
    if let Err(e) = result {
        tracing::debug!(repo = %repo.full_name, error = %e, "default branch cache write failed");
    }
}

// ─── Pure Helpers ─────────────────────────────────────

pub fn parse_repo_identifier(input: &str) -> Result<(String, String), SubscribeError> {
    let trimmed = input
        .trim()
        .trim_start_matches("https://github.com/")
        .trim_start_matches("http://github.com/")
        .trim_end_matches('/');
    let captures = REPO_RE.captures(trimmed).ok_or(SubscribeError::InvalidFormat)?;
    Ok((captures[1].to_string(), captures[2].to_string()))
}

pub fn normalize_event_types(input: &[String]) -> Result<Vec<String>, SubscribeError> {
    let mut out: Vec<String> = Vec::new();
    for raw in input {
        let name = raw.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        if name == ALL_EVENTS || name == "*" {
            return Ok(vec![ALL_EVENTS.to_string()]);
        }
        if EventKind::from_short_name(&name).is_none() {
            return Err(SubscribeError::UnknownEventType(name));
        }
        if !out.contains(&name) {
            out.push(name);
        }
    }
    if out.is_empty() {
        return Err(SubscribeError::NoEventTypes);
    }
    Ok(out)
}

pub fn normalize_branch_filter(input: Option<String>) -> Option<String> {
    let filter = input?.trim().to_string();
    if filter.is_empty() {
        None
    } else {
        Some(filter)
    }
}

/// Set union; "all" on either side collapses to "all".
fn merge_event_types(stored: &[String], additions: &[String]) -> Vec<String> {
    if stored.iter().any(|t| t == ALL_EVENTS) || additions.iter().any(|t| t == ALL_EVENTS) {
        return vec![ALL_EVENTS.to_string()];
    }
    let mut merged = stored.to_vec();
    for addition in additions {
        if !merged.contains(addition) {
            merged.push(addition.clone());
        }
    }
    merged
}

/// Set subtraction over the expanded vocabulary; a stored "all" becomes the
/// explicit remainder.
fn subtract_event_types(stored: &[String], removals: &[String]) -> Vec<String> {
    let expand = |types: &[String]| -> Vec<String> {
        if types.iter().any(|t| t == ALL_EVENTS) {
            EventKind::ALL.iter().map(|k| k.short_name().to_string()).collect()
        } else {
            types.to_vec()
        }
    };
    let removals = expand(removals);
    expand(stored)
        .into_iter()
        .filter(|t| !removals.contains(t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_url_identifiers() {
        assert_eq!(
            parse_repo_identifier("acme/widget").unwrap(),
            ("acme".into(), "widget".into())
        );
        assert_eq!(
            parse_repo_identifier("https://github.com/acme/widget.git").unwrap(),
            ("acme".into(), "widget".into())
        );
        assert_eq!(
            parse_repo_identifier(" acme/widget.js ").unwrap(),
            ("acme".into(), "widget.js".into())
        );
        assert!(matches!(
            parse_repo_identifier("not-a-repo"),
            Err(SubscribeError::InvalidFormat)
        ));
        assert!(matches!(
            parse_repo_identifier("a/b/c"),
            Err(SubscribeError::InvalidFormat)
        ));
        assert!(matches!(
            parse_repo_identifier(""),
            Err(SubscribeError::InvalidFormat)
        ));
    }

    #[test]
    fn normalize_validates_and_dedupes() {
        let input = vec!["PR".to_string(), "issues".to_string(), "pr".to_string()];
        assert_eq!(normalize_event_types(&input).unwrap(), vec!["pr", "issues"]);

        assert!(matches!(
            normalize_event_types(&["push".to_string()]),
            Err(SubscribeError::UnknownEventType(_))
        ));
        assert!(matches!(
            normalize_event_types(&[]),
            Err(SubscribeError::NoEventTypes)
        ));
    }

    #[test]
    fn all_collapses_the_list() {
        let input = vec!["pr".to_string(), "all".to_string()];
        assert_eq!(normalize_event_types(&input).unwrap(), vec!["all"]);
        assert_eq!(
            normalize_event_types(&["*".to_string()]).unwrap(),
            vec!["all"]
        );
    }

    #[test]
    fn merge_is_a_set_union() {
        let stored = vec!["pr".to_string(), "issues".to_string()];
        let merged = merge_event_types(&stored, &["issues".to_string(), "ci".to_string()]);
        assert_eq!(merged, vec!["pr", "issues", "ci"]);

        let merged = merge_event_types(&stored, &["all".to_string()]);
        assert_eq!(merged, vec!["all"]);
    }

    #[test]
    fn subtract_expands_all_and_deletes_on_empty() {
        let remaining = subtract_event_types(
            &["pr".to_string(), "issues".to_string()],
            &["pr".to_string()],
        );
        assert_eq!(remaining, vec!["issues"]);

        let remaining = subtract_event_types(&["all".to_string()], &["pr".to_string()]);
        assert_eq!(remaining.len(), EventKind::ALL.len() - 1);
        assert!(!remaining.contains(&"pr".to_string()));

        let remaining =
            subtract_event_types(&["pr".to_string()], &["all".to_string()]);
        assert!(remaining.is_empty());
    }

    #[test]
    fn branch_filter_normalization() {
        assert_eq!(normalize_branch_filter(None), None);
        assert_eq!(normalize_branch_filter(Some("  ".into())), None);
        assert_eq!(
            normalize_branch_filter(Some(" release/* ".into())).as_deref(),
            Some("release/*")
        );
    }
}
