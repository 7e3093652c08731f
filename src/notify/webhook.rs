// src/notify/webhook.rs
//! Generic JSON webhook: `json://`, `jsons://`, `http://`, `https://`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{NotificationChannel, NotificationMessage};

#[derive(Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    message: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Clone)]
pub struct WebhookChannel {
    client: Client,
}

impl WebhookChannel {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self { client })
    }

    /// `json://host/path` posts to `http://host/path`, `jsons://` to https.
    pub fn target(url: &str) -> Result<String> {
        if let Some(rest) = url.strip_prefix("jsons://") {
            Ok(format!("https://{rest}"))
        } else if let Some(rest) = url.strip_prefix("json://") {
            Ok(format!("http://{rest}"))
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Ok(url.to_string())
        } else {
            Err(anyhow!("not a webhook url"))
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn accepts(&self, url: &str) -> bool {
        Self::target(url).is_ok()
    }

    async fn send(&self, url: &str, msg: &NotificationMessage) -> Result<String> {
        let payload = WebhookPayload {
            title: &msg.title,
            message: &msg.body,
            kind: "info",
        };
        let rsp = self
            .client
            .post(Self::target(url)?)
            .json(&payload)
            .send()
            .await
            .context("webhook post")?;
        let status = rsp.status();
        let text = rsp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("webhook returned {status}: {text}"));
        }
        Ok(format!("{status} {text}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_mapping() {
        assert_eq!(WebhookChannel::target("json://h:8080/x").unwrap(), "http://h:8080/x");
        assert_eq!(WebhookChannel::target("jsons://h/x").unwrap(), "https://h/x");
        assert_eq!(WebhookChannel::target("https://h/x").unwrap(), "https://h/x");
        assert!(WebhookChannel::target("mailto:a@b.c").is_err());
    }
}
