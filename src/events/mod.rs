//! Event processor: turns a validated event envelope into channel messages.
//!
//! Both feeds converge here; the delivery-mode filter on the subscriber
//! query is what keeps a repo covered by webhooks from also being delivered
//! by polling.

pub mod branch_filter;
pub mod render;

use crate::models::delivery_mode;
use crate::models::events::EventEnvelope;
use crate::state::AppState;
use crate::subscriptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySource {
    Webhook,
    Polling,
}

impl DeliverySource {
    fn mode(self) -> &'static str {
        match self {
            DeliverySource::Webhook => delivery_mode::WEBHOOK,
            DeliverySource::Polling => delivery_mode::POLLING,
        }
    }
}

/// Fan an event out to every interested subscriber of the matching delivery
/// mode. Per-channel send failures are logged and never abort the fan-out.
pub async fn process_event(
    state: &AppState,
    source: DeliverySource,
    envelope: &EventEnvelope,
) -> Result<(), anyhow::Error> {
    // events the renderers consider noise are dropped before any queries
    let Some(message) = render::render(envelope) else {
        return Ok(());
    };

    let subscribers =
        subscriptions::subscribers_for_repo(&state.pool, &envelope.repo_full_name, source.mode())
            .await?;
    if subscribers.is_empty() {
        return Ok(());
    }

    let mut default_branch = envelope.default_branch.clone();
    let mut channels: Vec<String> = Vec::new();
    for sub in &subscribers {
        if !kind_selected(&sub.event_types, envelope.kind.short_name()) {
            continue;
        }
        if let Some(branch) = &envelope.branch {
            if sub.branch_filter.is_none() && default_branch.is_none() {
                default_branch =
                    cached_default_branch(state, &envelope.repo_full_name, sub.installation_id)
                        .await;
            }
            if !branch_filter::branch_matches(
                sub.branch_filter.as_deref(),
                branch,
                default_branch.as_deref(),
            ) {
                continue;
            }
        }
        channels.push(sub.channel_id.clone());
    }

    if channels.is_empty() {
        return Ok(());
    }

    match &state.towns {
        Some(towns) => {
            let delivered = towns.broadcast(&channels, &message).await;
            tracing::debug!(
                repo = %envelope.repo_full_name,
                kind = envelope.kind.short_name(),
                channels = channels.len(),
                delivered = delivered,
                "event fanned out"
            );
        }
        None => {
            tracing::warn!(
                repo = %envelope.repo_full_name,
                channels = channels.len(),
                "Towns transport not configured, dropping messages"
            );
        }
    }

    Ok(())
}

fn kind_selected(event_types: &[String], short_name: &str) -> bool {
    event_types
        .iter()
        .any(|t| t == short_name || t == crate::models::events::ALL_EVENTS)
}

/// The repo's default branch, from the polling-cursor cache or fetched and
/// cached on first need. Webhook subscriptions carry an installation_id and
/// the fetch authenticates with its installation token so private repos
/// resolve; polled repos are public and go out anonymously. None when the
/// repo can't be resolved; a null branch filter then matches nothing for
/// this event.
pub async fn cached_default_branch(
    state: &AppState,
    repo_full_name: &str,
    installation_id: Option<i64>,
) -> Option<String> {
    let cached: Result<Option<(Option<String>,)>, sqlx::Error> = sqlx::query_as(
        "SELECT default_branch FROM polling_cursors WHERE lower(repo_full_name) = lower($1)",
    )
    .bind(repo_full_name)
    .fetch_optional(&state.pool)
    .await;

    match cached {
        Ok(Some((Some(branch),))) => return Some(branch),
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(repo = %repo_full_name, error = %e, "default branch cache read failed");
        }
    }

    let token = match (installation_id, &state.app) {
        (Some(id), Some(app)) => match app.installation_token(id).await {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::debug!(
                    installation_id = id,
                    error = %e,
                    "installation token unavailable, trying anonymously"
                );
                None
            }
        },
        _ => None,
    };

    let repo = match state.api.repository(token.as_deref(), repo_full_name).await {
        Ok(repo) => repo,
        Err(e) => {
            tracing::warn!(repo = %repo_full_name, error = %e, "default branch lookup failed");
            return None;
        }
    };

    let write = sqlx::query(
        r#"INSERT INTO polling_cursors (repo_full_name, default_branch)
           VALUES ($1, $2)
           ON CONFLICT (repo_full_name) DO UPDATE SET
            default_branch = $2, updated_at = now()"#,
    )
    .bind(repo_full_name)
    .bind(&repo.default_branch)
    .execute(&state.pool)
    .await;
    if let Err(e) = write {
        tracing::debug!(repo = %repo_full_name, error = %e, "default branch cache write failed");
    }

    Some(repo.default_branch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_selection_honors_all() {
        let explicit = vec!["pr".to_string(), "commits".to_string()];
        assert!(kind_selected(&explicit, "pr"));
        assert!(!kind_selected(&explicit, "issues"));

        let wildcard = vec!["all".to_string()];
        assert!(kind_selected(&wildcard, "issues"));
        assert!(kind_selected(&wildcard, "stars"));
    }
}
