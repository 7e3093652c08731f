// src/notify/mod.rs
//! Notification fan-out.
//!
//! Every recipient URL is resolved to a [`NotificationChannel`] by scheme and
//! attempted independently with bounded exponential backoff. Each recipient
//! yields exactly one [`NotificationEvent`], success or terminal failure,
//! which is also kept in a bounded in-memory [`NotificationLog`].

pub mod discord;
pub mod email;
pub mod slack;
pub mod template;
pub mod webhook;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::metrics::{NOTIFICATIONS_FAILED_TOTAL, NOTIFICATIONS_SENT_TOTAL};
use crate::process::ChangeVerdict;
use crate::watch::EffectiveWatch;
use template::{BodyFormat, TemplateVars};

/// Longest response/error text kept in an audit record.
const MAX_RESPONSE_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub title: String,
    pub body: String,
    pub format: BodyFormat,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Short name used in logs, metrics and audit records.
    fn name(&self) -> &'static str;

    fn accepts(&self, url: &str) -> bool;

    fn format_for(&self, _url: &str) -> BodyFormat {
        BodyFormat::Text
    }

    /// Deliver once. `Ok` carries the remote response text.
    async fn send(&self, url: &str, msg: &NotificationMessage) -> Result<String>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub watch_id: Uuid,
    /// Recipient URL with credentials and tokens stripped.
    pub channel: String,
    pub verdict_summary: String,
    pub attempt_count: u32,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub response: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct NotificationLog {
    inner: Mutex<VecDeque<NotificationEvent>>,
    cap: usize,
}

impl NotificationLog {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.clamp(1, 10_000);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
        }
    }

    pub fn push(&self, ev: NotificationEvent) {
        let mut v = self.inner.lock();
        v.push_back(ev);
        while v.len() > self.cap {
            v.pop_front();
        }
    }

    /// Newest last.
    pub fn last_n(&self, n: usize) -> Vec<NotificationEvent> {
        let v = self.inner.lock();
        v.iter().skip(v.len().saturating_sub(n)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strip userinfo, path tokens and query from a recipient URL.
pub fn redact(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some((s, r)) => (s, r),
        None => match url.split_once(':') {
            Some((s, r)) => return format!("{s}:{}", r.split('?').next().unwrap_or_default()),
            None => return url.to_string(),
        },
    };
    let host = rest.split(['/', '?']).next().unwrap_or_default();
    let host = host.rsplit('@').next().unwrap_or(host);
    format!("{scheme}://{host}")
}

fn clip(s: &str) -> String {
    s.chars().take(MAX_RESPONSE_CHARS).collect()
}

pub struct Notifier {
    channels: Vec<Arc<dyn NotificationChannel>>,
    policy: RetryPolicy,
    default_urls: Vec<String>,
    base_url: Option<String>,
    log: Arc<NotificationLog>,
}

impl Notifier {
    pub fn new(policy: RetryPolicy, log: Arc<NotificationLog>) -> Self {
        Self {
            channels: Vec::new(),
            policy,
            default_urls: Vec::new(),
            base_url: None,
            log,
        }
    }

    /// Channels are matched in registration order; register specific ones
    /// (Slack, Discord) before the generic webhook.
    pub fn with_channel(mut self, ch: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(ch);
        self
    }

    pub fn with_default_urls(mut self, urls: Vec<String>) -> Self {
        self.default_urls = urls;
        self
    }

    pub fn with_base_url(mut self, base: Option<String>) -> Self {
        self.base_url = base;
        self
    }

    pub fn log(&self) -> &Arc<NotificationLog> {
        &self.log
    }

    pub fn recipients(&self, eff: &EffectiveWatch<'_>) -> Vec<String> {
        let own = eff.notification_urls();
        if own.is_empty() {
            self.default_urls.clone()
        } else {
            own
        }
    }

    /// One event per recipient channel. Nothing is sent when muted.
    pub async fn notify(&self, eff: &EffectiveWatch<'_>, verdict: &ChangeVerdict) -> Vec<NotificationEvent> {
        if eff.muted() {
            return Vec::new();
        }
        let w = eff.watch;
        let vars = TemplateVars::for_change(eff, verdict, self.base_url.as_deref(), Utc::now());
        let title = w.notification_title.as_deref().unwrap_or(template::DEFAULT_TITLE);
        let body = w.notification_body.as_deref().unwrap_or(template::DEFAULT_BODY);
        self.deliver(w.uuid, &self.recipients(eff), title, body, &vars, &verdict.summary())
            .await
    }

    pub async fn notify_filter_missing(
        &self,
        eff: &EffectiveWatch<'_>,
        selectors: &[String],
        misses: u32,
    ) -> Vec<NotificationEvent> {
        if eff.muted() {
            return Vec::new();
        }
        let vars = TemplateVars::for_filter_missing(eff, selectors, misses, self.base_url.as_deref(), Utc::now());
        self.deliver(
            eff.watch.uuid,
            &self.recipients(eff),
            template::FILTER_MISSING_TITLE,
            template::FILTER_MISSING_BODY,
            &vars,
            &format!("filter not found x{misses}"),
        )
        .await
    }

    async fn deliver(
        &self,
        watch_id: Uuid,
        recipients: &[String],
        title: &str,
        body: &str,
        vars: &TemplateVars,
        summary: &str,
    ) -> Vec<NotificationEvent> {
        let sends = recipients.iter().map(|url| async move {
            let ev = match self.channels.iter().find(|c| c.accepts(url)) {
                Some(ch) => {
                    let format = ch.format_for(url);
                    let msg = NotificationMessage {
                        title: template::render(title, vars, BodyFormat::Text),
                        body: template::render(body, vars, format),
                        format,
                    };
                    self.send_with_retry(ch.as_ref(), watch_id, url, &msg, summary).await
                }
                None => {
                    tracing::warn!(watch = %watch_id, channel = %redact(url), "no channel handles this notification url");
                    counter!(NOTIFICATIONS_FAILED_TOTAL, "channel" => "unsupported").increment(1);
                    NotificationEvent {
                        watch_id,
                        channel: redact(url),
                        verdict_summary: summary.to_string(),
                        attempt_count: 0,
                        success: false,
                        timestamp: Utc::now(),
                        response: None,
                        error: Some("unsupported notification url".to_string()),
                    }
                }
            };
            self.log.push(ev.clone());
            ev
        });
        join_all(sends).await
    }

    async fn send_with_retry(
        &self,
        ch: &dyn NotificationChannel,
        watch_id: Uuid,
        url: &str,
        msg: &NotificationMessage,
        summary: &str,
    ) -> NotificationEvent {
        let max = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match ch.send(url, msg).await {
                Ok(rsp) => break Ok(rsp),
                Err(e) if attempt < max => {
                    let wait = self.policy.delay(attempt);
                    tracing::debug!(watch = %watch_id, channel = ch.name(), attempt, error = %e, ?wait, "notification attempt failed");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => break Err(e),
            }
        };
        let (success, response, error) = match outcome {
            Ok(rsp) => {
                counter!(NOTIFICATIONS_SENT_TOTAL, "channel" => ch.name()).increment(1);
                (true, Some(clip(&rsp)), None)
            }
            Err(e) => {
                counter!(NOTIFICATIONS_FAILED_TOTAL, "channel" => ch.name()).increment(1);
                tracing::warn!(watch = %watch_id, channel = ch.name(), attempts = attempt, error = %e, "notification gave up");
                (false, None, Some(clip(&format!("{e:#}"))))
            }
        };
        NotificationEvent {
            watch_id,
            channel: redact(url),
            verdict_summary: summary.to_string(),
            attempt_count: attempt,
            success,
            timestamp: Utc::now(),
            response,
            error,
        }
    }
}
