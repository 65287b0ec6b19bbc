use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub mod oauth;
pub mod webhooks;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/github-webhook", post(webhooks::handle))
        .route("/oauth/callback", get(oauth::callback))
        .with_state(state)
}
