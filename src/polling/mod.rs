//! Polling engine: periodic sweep of every repo that has at least one
//! polling-mode subscription, using conditional GET and last-seen-id
//! cursoring against the public events feed.
//!
//! Repos covered by an installation never show up here: their subscriptions
//! carry delivery_mode = webhook and the repo enumeration filters on the
//! polling mode, which is what makes dual coverage impossible.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use crate::events::{self, DeliverySource};
use crate::github::api::EventsPage;
use crate::models::events::{EventEnvelope, EventKind, FeedEvent};
use crate::models::PollingCursor;
use crate::state::AppState;
use crate::subscriptions;

/// One slow repo must not starve the rest of the sweep.
const PER_REPO_BUDGET: Duration = Duration::from_secs(30);

/// Run the sweep timer until shutdown. A tick that fires while the previous
/// sweep is still in flight is skipped and logged.
pub async fn run(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(state.config.polling_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // consume the immediate first tick so the first sweep waits one period
    ticker.tick().await;

    let in_flight = Arc::new(AtomicBool::new(false));
    tracing::info!(interval_secs = period.as_secs(), "polling engine started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if in_flight.swap(true, Ordering::SeqCst) {
                    tracing::warn!("polling sweep still running, skipping tick");
                    continue;
                }
                let state = state.clone();
                let in_flight = in_flight.clone();
                tokio::spawn(async move {
                    if let Err(e) = sweep(&state).await {
                        tracing::error!(error = %e, "polling sweep failed");
                    }
                    in_flight.store(false, Ordering::SeqCst);
                });
            }
            _ = shutdown.changed() => {
                tracing::info!("polling engine stopped");
                return;
            }
        }
    }
}

/// One pass over every polled repo. Per-repo failures and timeouts are
/// logged and do not abort the rest of the sweep.
pub async fn sweep(state: &AppState) -> Result<(), anyhow::Error> {
    let repos = subscriptions::polled_repos(&state.pool).await?;
    if repos.is_empty() {
        return Ok(());
    }
    tracing::debug!(repos = repos.len(), "polling sweep started");

    for repo in &repos {
        match tokio::time::timeout(PER_REPO_BUDGET, poll_repo(state, repo)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(delivered)) => {
                tracing::debug!(repo = %repo, events = delivered, "polled new events");
            }
            Ok(Err(e)) => {
                tracing::warn!(repo = %repo, error = %e, "repo poll failed");
            }
            Err(_) => {
                tracing::warn!(repo = %repo, "repo poll exceeded budget");
            }
        }
    }
    Ok(())
}

async fn poll_repo(state: &AppState, repo_full_name: &str) -> Result<usize, anyhow::Error> {
    let cursor = load_cursor(state, repo_full_name).await?;

    let page = state
        .api
        .repo_events(repo_full_name, cursor.as_ref().and_then(|c| c.etag.as_deref()))
        .await?;

    let (etag, feed_events) = match page {
        EventsPage::NotModified => {
            touch_cursor(state, repo_full_name).await?;
            return Ok(0);
        }
        EventsPage::Events { etag, events } => (etag, events),
    };

    let last_event_id = cursor.as_ref().and_then(|c| c.last_event_id.as_deref());
    let fresh = events_since(&feed_events, last_event_id);
    let newest_id = feed_events
        .first()
        .map(|e| e.id.clone())
        .or_else(|| cursor.as_ref().and_then(|c| c.last_event_id.clone()));

    if fresh.is_empty() {
        update_cursor(state, repo_full_name, etag.as_deref(), newest_id.as_deref()).await?;
        return Ok(0);
    }

    let pr_details = prefetch_pr_details(state, repo_full_name, fresh).await;

    // the page is newest-first; deliver oldest-first
    let mut delivered = 0usize;
    for event in fresh.iter().rev() {
        let Some(mut envelope) = EventEnvelope::from_feed(event) else {
            tracing::debug!(
                repo = %repo_full_name,
                event_id = %event.id,
                feed_type = %event.event_type,
                "skipping malformed or unrecognized feed event"
            );
            continue;
        };

        if envelope.kind == EventKind::Pr {
            if let Some(number) = envelope.payload["pull_request"]["number"].as_u64() {
                if let Some(details) = pr_details.get(&number) {
                    envelope.payload["pull_request"] = details.clone();
                }
            }
        }

        match events::process_event(state, DeliverySource::Polling, &envelope).await {
            Ok(()) => delivered += 1,
            Err(e) => {
                tracing::warn!(
                    repo = %repo_full_name,
                    event_id = %event.id,
                    error = %e,
                    "polled event processing failed"
                );
            }
        }
    }

    update_cursor(state, repo_full_name, etag.as_deref(), newest_id.as_deref()).await?;
    Ok(delivered)
}

/// Entries strictly newer than the cursor. An unknown cursor id means the
/// cursor was lost or more than one page elapsed; the whole page counts as
/// new and the bounded duplication risk is accepted.
fn events_since<'a>(events: &'a [FeedEvent], last_event_id: Option<&str>) -> &'a [FeedEvent] {
    match last_event_id {
        None => events,
        Some(id) => match events.iter().position(|e| e.id == id) {
            Some(index) => &events[..index],
            None => events,
        },
    }
}

/// Fresh PR state for every distinct number on the page, fetched
/// concurrently. Failures fall back to the feed's embedded copy.
async fn prefetch_pr_details(
    state: &AppState,
    repo_full_name: &str,
    fresh: &[FeedEvent],
) -> HashMap<u64, Value> {
    let numbers: HashSet<u64> = fresh
        .iter()
        .filter(|e| e.event_type == "PullRequestEvent")
        .filter_map(|e| e.payload["pull_request"]["number"].as_u64())
        .collect();
    if numbers.is_empty() {
        return HashMap::new();
    }

    let fetches = numbers.into_iter().map(|number| async move {
        match state.api.pull_request(None, repo_full_name, number).await {
            Ok(details) => Some((number, details)),
            Err(e) => {
                tracing::debug!(
                    repo = %repo_full_name,
                    pr = number,
                    error = %e,
                    "pull request pre-fetch failed"
                );
                None
            }
        }
    });

    futures::future::join_all(fetches)
        .await
        .into_iter()
        .flatten()
        .collect()
}

async fn load_cursor(
    state: &AppState,
    repo_full_name: &str,
) -> Result<Option<PollingCursor>, anyhow::Error> {
    Ok(sqlx::query_as::<_, PollingCursor>(
        "SELECT * FROM polling_cursors WHERE lower(repo_full_name) = lower($1)",
    )
    .bind(repo_full_name)
    .fetch_optional(&state.pool)
    .await?)
}

async fn touch_cursor(state: &AppState, repo_full_name: &str) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"INSERT INTO polling_cursors (repo_full_name, last_polled_at)
           VALUES ($1, now())
           ON CONFLICT (repo_full_name) DO UPDATE SET
            last_polled_at = now(), updated_at = now()"#,
    )
    .bind(repo_full_name)
    .execute(&state.pool)
    .await?;
    Ok(())
}

async fn update_cursor(
    state: &AppState,
    repo_full_name: &str,
    etag: Option<&str>,
    last_event_id: Option<&str>,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"INSERT INTO polling_cursors (repo_full_name, etag, last_event_id, last_polled_at)
           VALUES ($1, $2, $3, now())
           ON CONFLICT (repo_full_name) DO UPDATE SET
            etag = $2, last_event_id = $3, last_polled_at = now(), updated_at = now()"#,
    )
    .bind(repo_full_name)
    .bind(etag)
    .bind(last_event_id)
    .execute(&state.pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feed(ids: &[&str]) -> Vec<FeedEvent> {
        ids.iter()
            .map(|id| {
                serde_json::from_value(json!({
                    "id": id,
                    "type": "PushEvent",
                    "repo": {"name": "acme/widget"},
                    "payload": {}
                }))
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn no_cursor_takes_whole_page() {
        let events = feed(&["5", "4", "3"]);
        assert_eq!(events_since(&events, None).len(), 3);
    }

    #[test]
    fn known_cursor_truncates_to_newer() {
        let events = feed(&["5", "4", "3"]);
        let fresh = events_since(&events, Some("4"));
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id, "5");
    }

    #[test]
    fn cursor_at_head_yields_nothing() {
        let events = feed(&["5", "4", "3"]);
        assert!(events_since(&events, Some("5")).is_empty());
    }

    #[test]
    fn lost_cursor_takes_whole_page() {
        let events = feed(&["5", "4", "3"]);
        assert_eq!(events_since(&events, Some("999")).len(), 3);
    }
}
