//! Chat transport: the Towns bot gateway.
//!
//! The slash-command surface and inbound platform webhooks live in the
//! external bot transport; this client only covers what the delivery
//! pipeline needs: send a channel message, edit one in place.

use serde_json::json;

#[derive(Clone)]
pub struct TownsClient {
    http: reqwest::Client,
    api_url: String,
    bot_token: String,
}

impl TownsClient {
    /// Returns None if TOWNS_BOT_TOKEN is not configured (graceful
    /// degradation: events are processed, messages are skipped with a log).
    pub fn from_config(api_url: Option<&str>, bot_token: Option<&str>) -> Option<Self> {
        let bot_token = bot_token?.to_string();
        let api_url = api_url
            .unwrap_or("https://gateway.towns.com")
            .trim_end_matches('/')
            .to_string();

        tracing::info!("Towns client initialized (api: {})", api_url);

        Some(Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            api_url,
            bot_token,
        })
    }

    /// Post a markdown message to a channel. Returns the message event id.
    pub async fn send_message(
        &self,
        channel_id: &str,
        body: &str,
    ) -> Result<String, anyhow::Error> {
        let url = format!("{}/bot/channels/{}/messages", self.api_url, channel_id);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.bot_token)
            .json(&json!({ "body": body }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("towns send failed: {} {}", status, text);
        }

        let value: serde_json::Value = resp.json().await?;
        value["event_id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| anyhow::anyhow!("towns send response missing event_id"))
    }

    /// Replace the body of a previously sent message.
    pub async fn edit_message(
        &self,
        channel_id: &str,
        event_id: &str,
        body: &str,
    ) -> Result<(), anyhow::Error> {
        let url = format!(
            "{}/bot/channels/{}/messages/{}",
            self.api_url, channel_id, event_id
        );
        let resp = self
            .http
            .patch(&url)
            .bearer_auth(&self.bot_token)
            .json(&json!({ "body": body }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("towns edit failed: {} {}", status, text);
        }
        Ok(())
    }

    /// Send the same message to many channels concurrently. Per-channel
    /// failures are logged and do not affect the other sends; returns the
    /// number of successful deliveries.
    pub async fn broadcast(&self, channel_ids: &[String], body: &str) -> usize {
        let sends = channel_ids.iter().map(|channel_id| async move {
            match self.send_message(channel_id, body).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(channel_id = %channel_id, error = %e, "towns.send.failed");
                    false
                }
            }
        });
        futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }
}
