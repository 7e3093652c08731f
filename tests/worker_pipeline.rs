// tests/worker_pipeline.rs
//
// Drives Worker::run_job end to end with a scripted fetcher and a recording
// notification channel. No sockets, no background loops.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use page_sentinel::broadcast::{EventBus, RealtimeEvent};
use page_sentinel::fetch::{FetchRequest, FetchResult, Fetcher, FetcherSet};
use page_sentinel::notify::template::BodyFormat;
use page_sentinel::notify::{NotificationChannel, NotificationLog, NotificationMessage, Notifier, RetryPolicy};
use page_sentinel::process::restock::StockHeuristic;
use page_sentinel::process::ProcessorSet;
use page_sentinel::proxy::{ProxyEndpoint, ProxyTable};
use page_sentinel::registry::{WatchRegistry, WatchStatus};
use page_sentinel::store::{MemoryStore, SnapshotStore};
use page_sentinel::watch::Watch;
use page_sentinel::worker::{Worker, WorkerCfg};
use page_sentinel::FetchError;

/// Hands out scripted responses in order; optionally blocks until released.
struct ScriptedFetcher {
    responses: Mutex<VecDeque<Result<FetchResult, FetchError>>>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl ScriptedFetcher {
    fn new(responses: Vec<Result<FetchResult, FetchError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            gate: None,
        }
    }

    fn gated(mut self, started: Arc<Notify>, release: Arc<Notify>) -> Self {
        self.gate = Some((started, release));
        self
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, _req: &FetchRequest, _proxy: Option<&ProxyEndpoint>) -> Result<FetchResult, FetchError> {
        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(FetchError::Connect("script exhausted".into())))
    }
}

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<NotificationMessage>>,
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn accepts(&self, url: &str) -> bool {
        url.starts_with("test://")
    }

    async fn send(&self, _url: &str, msg: &NotificationMessage) -> Result<String> {
        self.sent.lock().push(msg.clone());
        Ok("accepted".into())
    }
}

struct Harness {
    worker: Worker,
    registry: Arc<WatchRegistry>,
    store: Arc<MemoryStore>,
    channel: Arc<RecordingChannel>,
    events: EventBus,
    id: uuid::Uuid,
}

fn harness(watch: Watch, fetcher: ScriptedFetcher) -> Harness {
    let id = watch.uuid;
    let registry = Arc::new(WatchRegistry::new(vec![watch], vec![], None, 0));
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(RecordingChannel::default());
    let events = EventBus::new(64);
    let notifier = Notifier::new(RetryPolicy::default(), Arc::new(NotificationLog::with_capacity(50)))
        .with_channel(channel.clone());
    let worker = Worker {
        registry: registry.clone(),
        proxies: Arc::new(ProxyTable::empty()),
        fetchers: Arc::new(FetcherSet::http_only(Arc::new(fetcher))),
        processors: Arc::new(ProcessorSet::new(StockHeuristic::builtin().unwrap())),
        store: store.clone(),
        notifier: Arc::new(notifier),
        events: events.clone(),
        cfg: WorkerCfg {
            filter_failure_threshold: 2,
            ..WorkerCfg::default()
        },
    };
    Harness {
        worker,
        registry,
        store,
        channel,
        events,
        id,
    }
}

fn watched(url: &str) -> Watch {
    let mut w = Watch::new(url);
    w.title = Some("Boots".into());
    w.notification_urls = vec!["test://ops".into()];
    w
}

fn job(h: &Harness) -> page_sentinel::queue::Job {
    let generation = h.registry.try_mark_queued(h.id).expect("queueable");
    page_sentinel::queue::Job {
        watch_id: h.id,
        enqueued_at: chrono::Utc::now(),
        priority: 0,
        generation,
    }
}

#[tokio::test]
async fn baseline_then_change_notifies_once() {
    let h = harness(
        watched("https://shop.example/boots"),
        ScriptedFetcher::new(vec![
            Ok(FetchResult::html("<p>49.99 EUR</p>")),
            Ok(FetchResult::html("<p>49.99 EUR</p>")),
            Ok(FetchResult::html("<p>39.99 EUR</p>")),
        ]),
    );

    let first = h.worker.run_job(job(&h)).await;
    assert!(first.verdict.as_ref().unwrap().baseline);
    assert!(first.notifications.is_empty());
    assert_eq!(h.store.history(h.id).len(), 1);

    let same = h.worker.run_job(job(&h)).await;
    assert!(!same.verdict.unwrap().changed);
    assert_eq!(h.store.history(h.id).len(), 1);
    assert!(!h.registry.state(h.id).unwrap().unviewed);

    let changed = h.worker.run_job(job(&h)).await;
    assert!(changed.verdict.unwrap().actionable);
    assert_eq!(changed.notifications.len(), 1);
    assert!(changed.notifications[0].success);
    assert_eq!(h.store.history(h.id).len(), 2);

    let sent = h.channel.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].format, BodyFormat::Text);
    assert!(sent[0].body.contains("39.99"), "{}", sent[0].body);

    let state = h.registry.state(h.id).unwrap();
    assert_eq!(state.status, WatchStatus::Idle);
    assert!(state.unviewed);
    assert!(state.last_changed_at.is_some());
}

#[tokio::test]
async fn muted_watch_changes_silently() {
    let mut w = watched("https://shop.example/boots");
    w.notification_muted = true;
    let h = harness(
        w,
        ScriptedFetcher::new(vec![
            Ok(FetchResult::html("<p>a</p>")),
            Ok(FetchResult::html("<p>b</p>")),
        ]),
    );
    h.worker.run_job(job(&h)).await;
    let r = h.worker.run_job(job(&h)).await;
    assert!(r.verdict.unwrap().actionable);
    assert!(r.notifications.is_empty());
    assert!(h.channel.sent.lock().is_empty());
}

#[tokio::test]
async fn fetch_error_marks_the_watch_and_keeps_history() {
    let h = harness(
        watched("https://shop.example/boots"),
        ScriptedFetcher::new(vec![
            Ok(FetchResult::html("<p>a</p>")),
            Err(FetchError::HttpError(503)),
        ]),
    );
    h.worker.run_job(job(&h)).await;
    let r = h.worker.run_job(job(&h)).await;
    assert_eq!(r.error.as_deref(), Some("HTTP status 503"));
    let state = h.registry.state(h.id).unwrap();
    assert_eq!(state.status, WatchStatus::Error);
    assert_eq!(state.last_error.as_deref(), Some("HTTP status 503"));
    assert_eq!(h.store.history(h.id).len(), 1);
    assert!(h.channel.sent.lock().is_empty());
}

#[tokio::test]
async fn missing_filter_notifies_once_at_threshold() {
    let mut w = watched("https://shop.example/boots");
    w.filters.include_filters = vec!["#price".into()];
    let pages = (0..3).map(|_| Ok(FetchResult::html("<p>redesigned</p>"))).collect();
    let h = harness(w, ScriptedFetcher::new(pages));

    let r1 = h.worker.run_job(job(&h)).await;
    assert!(r1.notifications.is_empty());
    let r2 = h.worker.run_job(job(&h)).await;
    assert_eq!(r2.notifications.len(), 1);
    let r3 = h.worker.run_job(job(&h)).await;
    assert!(r3.notifications.is_empty());

    assert_eq!(h.registry.state(h.id).unwrap().filter_missing_count, 3);
    assert!(h.store.history(h.id).is_empty());
    assert!(h.channel.sent.lock()[0].body.contains("#price"));
}

#[tokio::test]
async fn pause_mid_flight_discards_the_result() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let fetcher = ScriptedFetcher::new(vec![Ok(FetchResult::html("<p>first</p>"))])
        .gated(started.clone(), release.clone());
    let h = Arc::new(harness(watched("https://shop.example/boots"), fetcher));

    let j = job(&h);
    let running = {
        let h = h.clone();
        tokio::spawn(async move { h.worker.run_job(j).await })
    };
    tokio::time::timeout(Duration::from_secs(5), started.notified())
        .await
        .expect("fetch started");
    assert_eq!(h.registry.state(h.id).unwrap().status, WatchStatus::Running);

    h.registry.set_paused(h.id, true).unwrap();
    release.notify_one();
    let report = running.await.unwrap();

    assert!(report.started && report.discarded);
    assert!(h.store.latest(h.id).await.unwrap().is_none());
    let state = h.registry.state(h.id).unwrap();
    assert_eq!(state.status, WatchStatus::Idle);
    assert!(state.last_checked_at.is_none());
    assert!(h.channel.sent.lock().is_empty());
}

#[tokio::test]
async fn progress_is_broadcast() {
    let h = harness(
        watched("https://shop.example/boots"),
        ScriptedFetcher::new(vec![Ok(FetchResult::html(
            r#"<html><head><link rel="icon" href="/fav.png"></head><body>x</body></html>"#,
        ))]),
    );
    let mut rx = h.events.subscribe();
    h.worker.run_job(job(&h)).await;

    let mut seen = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        seen.push(ev);
    }
    let updates: Vec<(bool, bool)> = seen
        .iter()
        .filter_map(|e| match e {
            RealtimeEvent::WatchUpdate(u) => Some((u.checking_now, u.queued)),
            _ => None,
        })
        .collect();
    assert_eq!(updates.first(), Some(&(true, false)));
    assert_eq!(updates.last(), Some(&(false, false)));
    assert!(seen.iter().any(|e| matches!(
        e,
        RealtimeEvent::FaviconUpdated { url, .. } if url == "https://shop.example/fav.png"
    )));
    assert!(matches!(seen.last(), Some(RealtimeEvent::GeneralStats { .. })));
}
