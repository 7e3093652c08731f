// tests/notify_retry.rs
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use page_sentinel::notify::{NotificationChannel, NotificationLog, NotificationMessage, Notifier, RetryPolicy};
use page_sentinel::process::ChangeVerdict;
use page_sentinel::watch::{EffectiveWatch, Tag, Watch};

/// Fails the first `fail_first` sends, then succeeds.
struct FlakyChannel {
    calls: AtomicU32,
    fail_first: u32,
}

impl FlakyChannel {
    fn new(fail_first: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first,
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationChannel for FlakyChannel {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn accepts(&self, url: &str) -> bool {
        url.starts_with("flaky://")
    }

    async fn send(&self, _url: &str, _msg: &NotificationMessage) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first {
            Err(anyhow!("503 Service Unavailable"))
        } else {
            Ok("200 OK".into())
        }
    }
}

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(4),
    }
}

fn change() -> ChangeVerdict {
    let mut v = ChangeVerdict::for_content("new price 39.99".into());
    v.changed = true;
    v.actionable = true;
    v.set_diff("old price 49.99");
    v
}

fn watch(urls: &[&str]) -> Watch {
    let mut w = Watch::new("https://shop.example/boots");
    w.notification_urls = urls.iter().map(|u| u.to_string()).collect();
    w
}

#[tokio::test(start_paused = true)]
async fn always_failing_channel_is_tried_exactly_k_times() {
    let ch = Arc::new(FlakyChannel::new(u32::MAX));
    let log = Arc::new(NotificationLog::with_capacity(10));
    let n = Notifier::new(policy(4), log.clone()).with_channel(ch.clone());
    let w = watch(&["flaky://hook/secret-token"]);
    let eff = EffectiveWatch::resolve(&w, &[], None);

    let started = tokio::time::Instant::now();
    let events = n.notify(&eff, &change()).await;

    assert_eq!(ch.calls(), 4);
    assert_eq!(events.len(), 1);
    let ev = &events[0];
    assert!(!ev.success);
    assert_eq!(ev.attempt_count, 4);
    assert_eq!(ev.channel, "flaky://hook");
    assert!(ev.error.as_deref().unwrap().contains("503"));
    // 0.5 + 1 + 2 seconds of backoff between the four attempts.
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(3500) && waited < Duration::from_millis(3600), "{waited:?}");
    assert_eq!(log.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn recovery_within_budget_is_one_success_record() {
    let ch = Arc::new(FlakyChannel::new(2));
    let log = Arc::new(NotificationLog::with_capacity(10));
    let n = Notifier::new(policy(3), log.clone()).with_channel(ch.clone());
    let w = watch(&["flaky://hook"]);
    let eff = EffectiveWatch::resolve(&w, &[], None);

    let events = n.notify(&eff, &change()).await;
    assert_eq!(ch.calls(), 3);
    assert_eq!(events.len(), 1);
    assert!(events[0].success);
    assert_eq!(events[0].attempt_count, 3);
    assert_eq!(events[0].response.as_deref(), Some("200 OK"));
    assert_eq!(log.last_n(10), events);
}

#[tokio::test(start_paused = true)]
async fn recipients_are_independent() {
    let ch = Arc::new(FlakyChannel::new(0));
    let log = Arc::new(NotificationLog::with_capacity(10));
    let n = Notifier::new(policy(2), log.clone()).with_channel(ch.clone());
    let w = watch(&["flaky://a", "gopher://nobody", "flaky://b"]);
    let eff = EffectiveWatch::resolve(&w, &[], None);

    let events = n.notify(&eff, &change()).await;
    assert_eq!(events.len(), 3);
    assert!(events[0].success && events[2].success);
    assert!(!events[1].success);
    assert_eq!(events[1].attempt_count, 0);
    assert_eq!(ch.calls(), 2);
    assert_eq!(log.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn tag_urls_and_defaults() {
    let ch = Arc::new(FlakyChannel::new(0));
    let n = Notifier::new(policy(1), Arc::new(NotificationLog::with_capacity(10)))
        .with_channel(ch.clone())
        .with_default_urls(vec!["flaky://default".into()]);

    let mut w = watch(&[]);
    let eff = EffectiveWatch::resolve(&w, &[], None);
    assert_eq!(n.recipients(&eff), vec!["flaky://default"]);

    w.tags = vec!["shoes".into()];
    let tags = vec![Tag {
        name: "shoes".into(),
        notification_urls: vec!["flaky://shoes-team".into()],
        ..Tag::default()
    }];
    let eff = EffectiveWatch::resolve(&w, &tags, None);
    assert_eq!(n.recipients(&eff), vec!["flaky://shoes-team"]);

    let muted = vec![Tag {
        notification_muted: true,
        ..tags[0].clone()
    }];
    let eff = EffectiveWatch::resolve(&w, &muted, None);
    assert!(n.notify(&eff, &change()).await.is_empty());
    assert_eq!(ch.calls(), 0);
}
