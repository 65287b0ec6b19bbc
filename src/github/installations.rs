//! Installation lifecycle: reacts to `installation` and
//! `installation_repositories` webhooks, maintains the repo → installation
//! index, and drives subscription upgrades, downgrades, and pending
//! completion.

use serde_json::Value;

use crate::state::AppState;
use crate::subscriptions;

pub async fn handle_installation_event(
    state: &AppState,
    payload: &Value,
) -> Result<(), anyhow::Error> {
    let action = payload["action"].as_str().unwrap_or("");
    let installation_id = payload["installation"]["id"]
        .as_i64()
        .ok_or_else(|| anyhow::anyhow!("missing installation.id"))?;

    match action {
        "created" | "new_permissions_accepted" => {
            upsert_installation_row(state, installation_id, &payload["installation"]).await?;

            let repos = payload["repositories"].as_array().cloned().unwrap_or_default();
            for repo in &repos {
                if let Some(full_name) = repo["full_name"].as_str() {
                    attach_repository(state, installation_id, full_name).await?;
                }
            }
            tracing::info!(
                installation_id = installation_id,
                repos = repos.len(),
                "GitHub App installed"
            );
        }
        "deleted" => {
            // downgrade first: the subscription rows reference the
            // installation_id column, not the installations table
            subscriptions::downgrade_subscriptions(state, installation_id, None).await?;

            sqlx::query("DELETE FROM installations WHERE installation_id = $1")
                .bind(installation_id)
                .execute(&state.pool)
                .await?;
            tracing::info!(installation_id = installation_id, "GitHub App uninstalled");
        }
        "suspend" => {
            sqlx::query(
                "UPDATE installations SET suspended_at = now() WHERE installation_id = $1",
            )
            .bind(installation_id)
            .execute(&state.pool)
            .await?;
            tracing::info!(installation_id = installation_id, "installation suspended");
        }
        "unsuspend" => {
            sqlx::query(
                "UPDATE installations SET suspended_at = NULL WHERE installation_id = $1",
            )
            .bind(installation_id)
            .execute(&state.pool)
            .await?;
            tracing::info!(installation_id = installation_id, "installation unsuspended");
        }
        other => {
            tracing::debug!(action = %other, "ignoring installation action");
        }
    }

    Ok(())
}

pub async fn handle_installation_repositories(
    state: &AppState,
    payload: &Value,
) -> Result<(), anyhow::Error> {
    let installation_id = payload["installation"]["id"]
        .as_i64()
        .ok_or_else(|| anyhow::anyhow!("missing installation.id"))?;

    // a repositories event can arrive before the installation-created event;
    // recover by upserting from the embedded object or the app-level API
    ensure_installation_row(state, installation_id, &payload["installation"]).await?;

    if let Some(added) = payload["repositories_added"].as_array() {
        for repo in added {
            if let Some(full_name) = repo["full_name"].as_str() {
                attach_repository(state, installation_id, full_name).await?;
            }
        }
    }

    if let Some(removed) = payload["repositories_removed"].as_array() {
        let repo_names: Vec<String> = removed
            .iter()
            .filter_map(|repo| repo["full_name"].as_str().map(String::from))
            .collect();

        for full_name in &repo_names {
            sqlx::query(
                r#"DELETE FROM installation_repositories
                   WHERE installation_id = $1 AND lower(repo_full_name) = lower($2)"#,
            )
            .bind(installation_id)
            .bind(full_name)
            .execute(&state.pool)
            .await?;
        }

        if !repo_names.is_empty() {
            subscriptions::downgrade_subscriptions(state, installation_id, Some(&repo_names))
                .await?;
        }
    }

    Ok(())
}

/// Register a repo under an installation, then settle anything waiting on
/// it: polling subscriptions upgrade to webhook mode, pending subscriptions
/// complete.
async fn attach_repository(
    state: &AppState,
    installation_id: i64,
    repo_full_name: &str,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"INSERT INTO installation_repositories (installation_id, repo_full_name)
           VALUES ($1, $2)
           ON CONFLICT (installation_id, repo_full_name) DO NOTHING"#,
    )
    .bind(installation_id)
    .bind(repo_full_name)
    .execute(&state.pool)
    .await?;

    subscriptions::upgrade_to_webhook(state, repo_full_name, installation_id).await?;

    if let Err(e) = subscriptions::complete_pending_subscriptions(state, repo_full_name).await {
        tracing::warn!(repo = %repo_full_name, error = %e, "pending subscription completion failed");
    }
    Ok(())
}

async fn upsert_installation_row(
    state: &AppState,
    installation_id: i64,
    installation: &Value,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"INSERT INTO installations (installation_id, account_login, account_type, app_slug)
           VALUES ($1, $2, $3, $4)
           ON CONFLICT (installation_id) DO UPDATE SET
            account_login = $2, account_type = $3, app_slug = $4"#,
    )
    .bind(installation_id)
    .bind(installation["account"]["login"].as_str().unwrap_or("unknown"))
    .bind(installation["account"]["type"].as_str().unwrap_or("User"))
    .bind(installation["app_slug"].as_str())
    .execute(&state.pool)
    .await?;
    Ok(())
}

async fn ensure_installation_row(
    state: &AppState,
    installation_id: i64,
    embedded: &Value,
) -> Result<(), anyhow::Error> {
    let existing = sqlx::query_as::<_, crate::models::Installation>(
        "SELECT * FROM installations WHERE installation_id = $1",
    )
    .bind(installation_id)
    .fetch_optional(&state.pool)
    .await?;
    if existing.is_some() {
        return Ok(());
    }

    if embedded["account"]["login"].is_string() {
        return upsert_installation_row(state, installation_id, embedded).await;
    }

    // thin payload: fetch the metadata app-level
    let Some(app) = &state.app else {
        anyhow::bail!(
            "installation {} unknown and GitHub App is not configured",
            installation_id
        );
    };
    let info = app.get_installation(installation_id).await?;
    sqlx::query(
        r#"INSERT INTO installations (installation_id, account_login, account_type, app_slug)
           VALUES ($1, $2, $3, $4)
           ON CONFLICT (installation_id) DO NOTHING"#,
    )
    .bind(installation_id)
    .bind(&info.account_login)
    .bind(&info.account_type)
    .bind(&info.app_slug)
    .execute(&state.pool)
    .await?;
    tracing::info!(
        installation_id = installation_id,
        account = %info.account_login,
        "installation recovered via app API"
    );
    Ok(())
}
