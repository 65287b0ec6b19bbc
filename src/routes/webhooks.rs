//! GitHub webhook receiver.
//!
//! Flow:
//! 1. 503 unless the GitHub App and signing secret are configured
//! 2. 400 on missing headers, 401 on signature mismatch
//! 3. delivery-id idempotency: replays are acknowledged without work
//! 4. dispatch to the installation manager or the event processor
//! 5. record the delivery outcome; handler failure records `failed` and
//!    returns 500

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::events::{self, DeliverySource};
use crate::github::installations;
use crate::models::delivery_status;
use crate::models::events::EventEnvelope;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let Some(secret) = state
        .config
        .webhook_secret
        .as_deref()
        .filter(|_| state.config.webhook_mode_enabled())
    else {
        return (StatusCode::SERVICE_UNAVAILABLE, "GitHub App not configured");
    };

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    let (Some(delivery_id), Some(signature), Some(event_name)) = (
        header("x-github-delivery"),
        header("x-hub-signature-256"),
        header("x-github-event"),
    ) else {
        return (StatusCode::BAD_REQUEST, "missing webhook headers");
    };

    if verify_signature(&body, secret, &signature).is_err() {
        tracing::warn!(delivery_id = %delivery_id, "webhook signature verification failed");
        return (StatusCode::UNAUTHORIZED, "signature mismatch");
    }

    // idempotency: the first writer for a delivery id is authoritative
    let seen = sqlx::query_as::<_, crate::models::DeliveryRecord>(
        "SELECT * FROM delivery_records WHERE delivery_id = $1",
    )
    .bind(&delivery_id)
    .fetch_optional(&state.pool)
    .await;
    match seen {
        Ok(Some(_)) => return (StatusCode::OK, "already processed"),
        Ok(None) => {}
        Err(e) => {
            tracing::error!(error = %e, "delivery record lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "storage error");
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(delivery_id = %delivery_id, error = %e, "webhook payload parse error");
            return (StatusCode::BAD_REQUEST, "invalid payload");
        }
    };
    let installation_id = payload["installation"]["id"].as_i64();

    tracing::info!(
        delivery_id = %delivery_id,
        event = %event_name,
        action = payload["action"].as_str().unwrap_or("-"),
        "received GitHub webhook"
    );

    let outcome = dispatch(&state, &event_name, &payload).await;

    match outcome {
        Ok(()) => {
            if let Err(e) = record_delivery(
                &state,
                &delivery_id,
                installation_id,
                &event_name,
                delivery_status::SUCCESS,
                None,
            )
            .await
            {
                tracing::error!(delivery_id = %delivery_id, error = %e, "delivery record insert failed");
            }
            (StatusCode::OK, "ok")
        }
        Err(e) => {
            tracing::error!(delivery_id = %delivery_id, event = %event_name, error = %e, "webhook processing failed");
            if let Err(record_err) = record_delivery(
                &state,
                &delivery_id,
                installation_id,
                &event_name,
                delivery_status::FAILED,
                Some(&e.to_string()),
            )
            .await
            {
                tracing::error!(delivery_id = %delivery_id, error = %record_err, "delivery record insert failed");
            }
            (StatusCode::INTERNAL_SERVER_ERROR, "processing error")
        }
    }
}

async fn dispatch(
    state: &AppState,
    event_name: &str,
    payload: &serde_json::Value,
) -> Result<(), anyhow::Error> {
    match event_name {
        "installation" => installations::handle_installation_event(state, payload).await,
        "installation_repositories" => {
            installations::handle_installation_repositories(state, payload).await
        }
        _ => match EventEnvelope::from_webhook(event_name, payload) {
            Some(envelope) => events::process_event(state, DeliverySource::Webhook, &envelope).await,
            None => {
                // outside the vocabulary (ping, …) or failed shape validation
                tracing::debug!(event = %event_name, "webhook acknowledged without processing");
                Ok(())
            }
        },
    }
}

async fn record_delivery(
    state: &AppState,
    delivery_id: &str,
    installation_id: Option<i64>,
    event_type: &str,
    status: &str,
    error: Option<&str>,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"INSERT INTO delivery_records (delivery_id, installation_id, event_type, status, error)
           VALUES ($1, $2, $3, $4, $5)
           ON CONFLICT (delivery_id) DO NOTHING"#,
    )
    .bind(delivery_id)
    .bind(installation_id)
    .bind(event_type)
    .bind(status)
    .bind(error)
    .execute(&state.pool)
    .await?;
    Ok(())
}

/// Verify the HMAC-SHA256 signature from GitHub, rendered as
/// `sha256=<hex>`. `Mac::verify_slice` compares in constant time.
fn verify_signature(body: &[u8], secret: &str, signature: &str) -> Result<(), ()> {
    let hex_sig = signature.strip_prefix("sha256=").ok_or(())?;
    let sig_bytes = hex::decode(hex_sig).map_err(|_| ())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| ())?;
    mac.update(body);

    mac.verify_slice(&sig_bytes).map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_is_accepted() {
        let body = br#"{"zen":"x"}"#;
        let signature = sign("s", body);
        assert!(verify_signature(body, "s", &signature).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = br#"{"zen":"x"}"#;
        let signature = sign("other", body);
        assert!(verify_signature(body, "s", &signature).is_err());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let signature = sign("s", br#"{"zen":"x"}"#);
        assert!(verify_signature(br#"{"zen":"y"}"#, "s", &signature).is_err());
    }

    #[test]
    fn malformed_signature_header_is_rejected() {
        let body = br#"{}"#;
        assert!(verify_signature(body, "s", "0000").is_err());
        assert!(verify_signature(body, "s", "sha256=zz").is_err());
        assert!(verify_signature(body, "s", &format!("sha256={}", "0".repeat(64))).is_err());
    }
}
