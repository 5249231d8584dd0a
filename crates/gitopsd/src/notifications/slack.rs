use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::json;

use super::{Message, Provider};

const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

/// Sends chat notifications. The channel is picked per application
/// repository from the configured mapping, falling back to the default
/// channel.
pub struct SlackProvider {
    token: String,
    default_channel: String,
    channel_mapping: HashMap<String, String>,
    http: reqwest::Client,
}

impl SlackProvider {
    pub fn new(
        token: String,
        default_channel: String,
        channel_mapping: HashMap<String, String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| anyhow!("cannot build http client {}", e))?;
        Ok(Self { token, default_channel, channel_mapping, http })
    }

    fn channel_for(&self, repository: &str) -> &str {
        self.channel_mapping
            .get(repository)
            .map(String::as_str)
            .unwrap_or(&self.default_channel)
    }
}

#[async_trait]
impl Provider for SlackProvider {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        let Some(chat) = msg.as_chat_message() else {
            return Ok(());
        };
        let channel = self.channel_for(msg.repository_name());
        if channel.is_empty() {
            return Ok(());
        }

        let body = json!({
            "channel": channel,
            "text": chat.text,
            "blocks": chat.blocks,
        });
        let response: serde_json::Value = self
            .http
            .post(POST_MESSAGE_URL)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        if !response.get("ok").and_then(serde_json::Value::as_bool).unwrap_or(false) {
            bail!(
                "cannot send chat message: {}",
                response.get("error").and_then(serde_json::Value::as_str).unwrap_or("unknown")
            );
        }
        Ok(())
    }
}
