// src/notify/slack.rs
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::{NotificationChannel, NotificationMessage};

const HOOKS_BASE: &str = "https://hooks.slack.com/services/";

pub struct SlackChannel {
    client: Client,
}

impl SlackChannel {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building slack client")?;
        Ok(Self { client })
    }

    /// `slack://T000/B000/XXXX` or a full incoming-webhook URL.
    pub fn webhook_url(url: &str) -> Result<String> {
        if let Some(rest) = url.strip_prefix("slack://") {
            let parts: Vec<&str> = rest.trim_matches('/').split('/').collect();
            if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
                return Err(anyhow!("slack url needs three token parts"));
            }
            return Ok(format!("{HOOKS_BASE}{}", parts.join("/")));
        }
        if url.starts_with(HOOKS_BASE) {
            return Ok(url.to_string());
        }
        Err(anyhow!("not a slack url"))
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn accepts(&self, url: &str) -> bool {
        url.starts_with("slack://") || url.starts_with(HOOKS_BASE)
    }

    async fn send(&self, url: &str, msg: &NotificationMessage) -> Result<String> {
        let text = format!("*{}*\n{}", msg.title, msg.body);
        let body = serde_json::json!({ "text": text });

        let rsp = self
            .client
            .post(Self::webhook_url(url)?)
            .json(&body)
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(rsp.text().await.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_expands() {
        assert_eq!(
            SlackChannel::webhook_url("slack://T1/B2/xyz").unwrap(),
            "https://hooks.slack.com/services/T1/B2/xyz"
        );
        assert!(SlackChannel::webhook_url("slack://T1/B2").is_err());
    }
}
