// src/notify/discord.rs
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{NotificationChannel, NotificationMessage};

/// Discord rejects embeds above these sizes.
const TITLE_LIMIT: usize = 256;
const DESCRIPTION_LIMIT: usize = 4096;

const WEBHOOK_PREFIXES: [&str; 2] = [
    "https://discord.com/api/webhooks/",
    "https://discordapp.com/api/webhooks/",
];

pub struct DiscordChannel {
    client: Client,
}

impl DiscordChannel {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building discord client")?;
        Ok(Self { client })
    }

    /// `discord://webhook_id/token` or a full webhook URL.
    pub fn webhook_url(url: &str) -> Result<String> {
        if let Some(rest) = url.strip_prefix("discord://") {
            let Some((id, token)) = rest.trim_matches('/').split_once('/') else {
                return Err(anyhow!("discord url needs webhook id and token"));
            };
            return Ok(format!("{}{id}/{token}", WEBHOOK_PREFIXES[0]));
        }
        if WEBHOOK_PREFIXES.iter().any(|p| url.starts_with(p)) {
            return Ok(url.to_string());
        }
        Err(anyhow!("not a discord url"))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[async_trait]
impl NotificationChannel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    fn accepts(&self, url: &str) -> bool {
        url.starts_with("discord://") || WEBHOOK_PREFIXES.iter().any(|p| url.starts_with(p))
    }

    async fn send(&self, url: &str, msg: &NotificationMessage) -> Result<String> {
        let payload = DiscordWebhookPayload::embed(&msg.title, &msg.body);
        let rsp = self
            .client
            .post(Self::webhook_url(url)?)
            .json(&payload)
            .send()
            .await
            .context("discord webhook request failed")?;
        if let Err(e) = rsp.error_for_status_ref() {
            return Err(anyhow!("discord webhook HTTP error: {e}"));
        }
        Ok(rsp.status().to_string())
    }
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
}

#[derive(Serialize)]
struct DiscordWebhookPayload {
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

impl DiscordWebhookPayload {
    fn embed(title: &str, description: &str) -> Self {
        Self {
            content: None,
            embeds: vec![DiscordEmbed {
                title: truncate(title, TITLE_LIMIT),
                description: truncate(description, DESCRIPTION_LIMIT),
            }],
        }
    }
}
