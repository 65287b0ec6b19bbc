//! Periodic cleanup: expired OAuth states, expired pending subscriptions,
//! aged delivery records, and the in-process trackers. Every task is
//! idempotent and runs on its own schedule.

use std::time::Duration;

use tokio::sync::watch;

use crate::state::AppState;

const HOURLY: Duration = Duration::from_secs(60 * 60);
const DAILY: Duration = Duration::from_secs(24 * 60 * 60);
const TRACKER_SWEEP: Duration = Duration::from_secs(30);

pub fn spawn_all(state: AppState, shutdown: watch::Receiver<bool>) {
    tokio::spawn(run_periodic(
        "oauth_state_sweep",
        HOURLY,
        state.clone(),
        shutdown.clone(),
        |state| async move { sweep_oauth_states(&state).await },
    ));
    tokio::spawn(run_periodic(
        "pending_subscription_sweep",
        HOURLY,
        state.clone(),
        shutdown.clone(),
        |state| async move { sweep_pending_subscriptions(&state).await },
    ));
    tokio::spawn(run_periodic(
        "delivery_record_sweep",
        DAILY,
        state.clone(),
        shutdown.clone(),
        |state| async move { sweep_delivery_records(&state).await },
    ));
    tokio::spawn(run_periodic(
        "tracker_sweep",
        TRACKER_SWEEP,
        state,
        shutdown,
        |state| async move { sweep_trackers(&state).await },
    ));
}

async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
    task: F,
) where
    F: Fn(AppState) -> Fut,
    Fut: std::future::Future<Output = Result<u64, anyhow::Error>>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match task(state.clone()).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(task = name, removed = removed, "housekeeping sweep"),
                    Err(e) => tracing::error!(task = name, error = %e, "housekeeping sweep failed"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

async fn sweep_oauth_states(state: &AppState) -> Result<u64, anyhow::Error> {
    let result = sqlx::query("DELETE FROM oauth_states WHERE expires_at < now()")
        .execute(&state.pool)
        .await?;
    Ok(result.rows_affected())
}

async fn sweep_pending_subscriptions(state: &AppState) -> Result<u64, anyhow::Error> {
    let result = sqlx::query("DELETE FROM pending_subscriptions WHERE expires_at < now()")
        .execute(&state.pool)
        .await?;
    Ok(result.rows_affected())
}

async fn sweep_delivery_records(state: &AppState) -> Result<u64, anyhow::Error> {
    let result = sqlx::query(
        "DELETE FROM delivery_records WHERE delivered_at < now() - make_interval(days => $1)",
    )
    .bind(state.config.delivery_retention_days as i32)
    .execute(&state.pool)
    .await?;
    Ok(result.rows_affected())
}

async fn sweep_trackers(state: &AppState) -> Result<u64, anyhow::Error> {
    let mut removed = state.prompts.sweep() as u64;
    if let Some(credentials) = &state.credentials {
        removed += credentials.sweep_refresh_gates().await as u64;
    }
    Ok(removed)
}
