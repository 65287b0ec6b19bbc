//! OAuth callback endpoint. Completes the credential-store round trip, runs
//! the follow-up action the state row carried, and renders a minimal HTML
//! shell telling the user to head back to chat.

use axum::{
    extract::{Query, State},
    response::Html,
};
use serde::Deserialize;

use crate::github::credentials::{redirect_action, CallbackError, CallbackOutcome};
use crate::state::AppState;
use crate::subscriptions::{self, SubscribeOutcome};

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Html<String> {
    if let Some(error) = query.error {
        let description = query.error_description.unwrap_or_default();
        return error_page(&format!("GitHub authorization failed: {} {}", error, description));
    }
    let (Some(code), Some(state_nonce)) = (query.code, query.state) else {
        return error_page("Missing code or state parameter.");
    };
    let Ok(credentials) = state.credentials() else {
        return error_page("User authentication is not configured on this bot.");
    };

    let outcome = match credentials.complete_callback(&code, &state_nonce).await {
        Ok(outcome) => outcome,
        Err(CallbackError::InvalidState) => {
            return error_page("Unknown or already used authorization link.");
        }
        Err(CallbackError::StateExpired) => {
            return error_page("This authorization link expired. Run the command again in chat.");
        }
        Err(CallbackError::Other(e)) => {
            tracing::error!(error = %e, "oauth callback failed");
            return error_page("Something went wrong completing the authorization.");
        }
    };

    run_follow_up(&state, &outcome).await;

    success_page(&outcome.github_login)
}

/// Execute the action the user started before authorizing. Failures here
/// are chat-side; the account link itself already succeeded.
async fn run_follow_up(state: &AppState, outcome: &CallbackOutcome) {
    match outcome.redirect_action.as_str() {
        redirect_action::SUBSCRIBE => complete_subscribe(state, outcome).await,
        // LINK or anything unrecognized: plain connect confirmation
        _ => {
            if let Some(towns) = &state.towns {
                let body = format!(
                    "🔗 GitHub account **{}** connected.",
                    outcome.github_login
                );
                if let Err(e) = towns.send_message(&outcome.channel_id, &body).await {
                    tracing::warn!(channel_id = %outcome.channel_id, error = %e, "link confirmation failed");
                }
            }
        }
    }
}

async fn complete_subscribe(state: &AppState, outcome: &CallbackOutcome) {
    let data = &outcome.redirect_data;
    let Some(repo) = data["repo"].as_str() else {
        tracing::warn!("subscribe follow-up missing repo in redirect data");
        return;
    };
    let event_types: Vec<String> = data["event_types"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_else(|| vec!["all".to_string()]);
    let branch_filter = data["branch_filter"].as_str().map(String::from);
    let message_event_id = data["message_event_id"].as_str().map(String::from);

    let result = subscriptions::create_subscription(
        state,
        &outcome.towns_user_id,
        &outcome.space_id,
        &outcome.channel_id,
        repo,
        &event_types,
        branch_filter,
    )
    .await;

    let (body, track_repo) = match &result {
        Ok(SubscribeOutcome::Created {
            repo_full_name,
            delivery_mode,
            install_url,
        }) => {
            if *delivery_mode == crate::models::delivery_mode::POLLING {
                let hint = install_url
                    .as_deref()
                    .map(|url| format!(" [Install the GitHub App]({}) for real-time delivery.", url))
                    .unwrap_or_default();
                (
                    format!(
                        "✅ Subscribed to **{}** — checking for activity every few minutes.{}",
                        repo_full_name, hint
                    ),
                    Some(repo_full_name.clone()),
                )
            } else {
                (
                    format!(
                        "✅ Subscribed to **{}** — events arrive in real time.",
                        repo_full_name
                    ),
                    None,
                )
            }
        }
        Ok(SubscribeOutcome::AlreadySubscribed { repo_full_name }) => (
            format!(
                "ℹ️ This channel is already subscribed to **{}**.",
                repo_full_name
            ),
            None,
        ),
        Ok(SubscribeOutcome::RequiresInstallation { install_url }) => (
            format!(
                "⚠️ **{}** needs the GitHub App: [install it here]({}). The subscription completes automatically once it's installed.",
                repo, install_url
            ),
            None,
        ),
        Err(e) => (format!("❌ Could not subscribe to **{}**: {}", repo, e), None),
    };

    let Some(towns) = &state.towns else {
        tracing::warn!("Towns transport not configured, dropping subscribe confirmation");
        return;
    };

    // edit the two-phase prompt in place when we have its event id,
    // otherwise post a fresh message
    let delivered_event_id = match &message_event_id {
        Some(event_id) => {
            match towns
                .edit_message(&outcome.channel_id, event_id, &body)
                .await
            {
                Ok(()) => Some(event_id.clone()),
                Err(e) => {
                    tracing::warn!(channel_id = %outcome.channel_id, error = %e, "prompt edit failed");
                    towns.send_message(&outcome.channel_id, &body).await.ok()
                }
            }
        }
        None => towns.send_message(&outcome.channel_id, &body).await.ok(),
    };

    // a polling confirmation doubles as the provisional message: if the
    // installation lands within the window, the upgrade edits it in place
    if let (Some(repo_full_name), Some(event_id)) = (track_repo, delivered_event_id) {
        state
            .prompts
            .record(&outcome.channel_id, &repo_full_name, event_id);
    }
}

fn success_page(github_login: &str) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>GitHub connected</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 4rem;">
  <h1>✅ GitHub connected</h1>
  <p>Signed in as <strong>{}</strong>. You can close this tab and head back to Towns.</p>
</body>
</html>"#,
        github_login
    ))
}

fn error_page(message: &str) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>GitHub authorization failed</title></head>
<body style="font-family: sans-serif; text-align: center; padding-top: 4rem;">
  <h1>⚠️ Authorization failed</h1>
  <p>{}</p>
</body>
</html>"#,
        message
    ))
}
