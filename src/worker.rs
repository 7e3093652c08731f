// src/worker.rs
//! Worker pool: runs one Job at a time per executor.
//!
//! fetch → process → snapshot → (Idle) → notify → broadcast. The watch is
//! released before notification so a slow channel never holds it.

use anyhow::{Context, Result};
use chrono::Utc;
use metrics::{counter, gauge, histogram};
use once_cell::sync::Lazy;
use reqwest::Url;
use scraper::{Html, Selector};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{EventBus, RealtimeEvent, WatchUpdate};
use crate::error::FetchError;
use crate::fetch::{FetchRequest, FetchResult, FetcherSet};
use crate::metrics::{FETCH_DURATION_MS, QUEUE_DEPTH, WATCH_CHANGES_TOTAL, WATCH_CHECKS_TOTAL, WATCH_CHECK_ERRORS_TOTAL};
use crate::notify::{NotificationEvent, Notifier};
use crate::process::{ChangeVerdict, ProcessorSet};
use crate::proxy::ProxyTable;
use crate::queue::{Job, JobQueue};
use crate::registry::{CheckOutcome, FinishResult, WatchRegistry};
use crate::store::{Snapshot, SnapshotStore};
use crate::watch::{EffectiveWatch, Watch};

static FAVICON_SEL: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"link[rel~="icon"], link[rel="shortcut icon"], link[rel="apple-touch-icon"]"#).unwrap()
});

#[derive(Clone, Copy, Debug)]
pub struct WorkerCfg {
    pub workers: usize,
    /// Hard cap around a plain HTTP fetch.
    pub fetch_timeout: Duration,
    /// Hard cap around a browser fetch; above the session budget so the
    /// backend's own expiry surfaces first.
    pub browser_timeout: Duration,
    /// Consecutive filter misses before the recipients hear about it.
    pub filter_failure_threshold: u32,
}

impl Default for WorkerCfg {
    fn default() -> Self {
        Self {
            workers: 4,
            fetch_timeout: Duration::from_secs(45),
            browser_timeout: Duration::from_secs(130),
            filter_failure_threshold: 6,
        }
    }
}

/// What one Job did, for callers that drive the pipeline directly.
#[derive(Debug, Default)]
pub struct JobReport {
    pub started: bool,
    pub discarded: bool,
    pub verdict: Option<ChangeVerdict>,
    pub error: Option<String>,
    pub notifications: Vec<NotificationEvent>,
}

pub struct Worker {
    pub registry: Arc<WatchRegistry>,
    pub proxies: Arc<ProxyTable>,
    pub fetchers: Arc<FetcherSet>,
    pub processors: Arc<ProcessorSet>,
    pub store: Arc<dyn SnapshotStore>,
    pub notifier: Arc<Notifier>,
    pub events: EventBus,
    pub cfg: WorkerCfg,
}

struct Checked {
    verdict: ChangeVerdict,
    duration_ms: u64,
    favicon: Option<String>,
}

impl Worker {
    fn publish_watch(&self, id: Uuid) {
        if let Some((w, s)) = self.registry.get(id) {
            self.events
                .publish(RealtimeEvent::WatchUpdate(WatchUpdate::new(&w, &s, Utc::now())));
        }
    }

    fn publish_stats(&self) {
        self.events.publish(RealtimeEvent::stats(&self.registry.counts()));
    }

    pub async fn run_job(&self, job: Job) -> JobReport {
        let mut report = JobReport::default();
        let id = job.watch_id;
        if !self.registry.mark_running(id, job.generation) {
            tracing::debug!(watch = %id, "stale job dropped");
            return report;
        }
        report.started = true;
        self.publish_watch(id);

        let Some((watch, _)) = self.registry.get(id) else {
            report.discarded = true;
            return report;
        };

        let started = Instant::now();
        let outcome = self.check(&watch, job.generation).await;
        counter!(WATCH_CHECKS_TOTAL).increment(1);

        let (finish, checked) = match outcome {
            Ok(c) => (
                CheckOutcome::Checked {
                    changed: c.verdict.changed && !c.verdict.baseline,
                    filter_missing: c.verdict.filter_not_found.is_some(),
                    duration_ms: c.duration_ms,
                },
                Some(c),
            ),
            Err(e) => {
                counter!(WATCH_CHECK_ERRORS_TOTAL).increment(1);
                let msg = format!("{e:#}");
                tracing::warn!(watch = %id, url = %watch.url, error = %msg, "check failed");
                report.error = Some(msg.clone());
                (
                    CheckOutcome::Failed {
                        error: msg,
                        duration_ms: started.elapsed().as_millis() as u64,
                    },
                    None,
                )
            }
        };

        let state = match self.registry.finish(id, job.generation, finish) {
            FinishResult::Recorded(s) => s,
            FinishResult::Discarded => {
                tracing::info!(watch = %id, "watch paused or removed mid-check; result discarded");
                report.discarded = true;
                self.publish_watch(id);
                return report;
            }
        };
        self.publish_watch(id);

        if let Some(c) = checked {
            if let Some(url) = c.favicon.as_deref() {
                if self.registry.set_favicon(id, url) {
                    self.events.publish(RealtimeEvent::FaviconUpdated {
                        uuid: id,
                        url: url.to_string(),
                    });
                }
            }

            let tags = self.registry.tags();
            let eff = EffectiveWatch::resolve(&watch, &tags, self.registry.default_proxy());
            if c.verdict.actionable && !c.verdict.baseline {
                counter!(WATCH_CHANGES_TOTAL).increment(1);
                tracing::info!(watch = %id, summary = %c.verdict.summary(), "change detected");
                report.notifications = self.notifier.notify(&eff, &c.verdict).await;
            } else if let Some(missing) = &c.verdict.filter_not_found {
                if state.filter_missing_count == self.cfg.filter_failure_threshold {
                    report.notifications = self
                        .notifier
                        .notify_filter_missing(&eff, missing, state.filter_missing_count)
                        .await;
                }
            }
            report.verdict = Some(c.verdict);
        }
        self.publish_stats();
        report
    }

    async fn check(&self, watch: &Watch, generation: u64) -> Result<Checked> {
        let tags = self.registry.tags();
        let eff = EffectiveWatch::resolve(watch, &tags, self.registry.default_proxy());
        let proxy = eff.proxy.and_then(|k| self.proxies.get(k));
        if let (Some(key), None) = (eff.proxy, proxy) {
            tracing::warn!(watch = %watch.uuid, proxy = %key, "unknown proxy key; fetching directly");
        }

        let fetcher = self.fetchers.select(watch.fetch_backend);
        let limit = if fetcher.name() == "http" {
            self.cfg.fetch_timeout
        } else {
            self.cfg.browser_timeout
        };
        let req = FetchRequest::from_watch(watch);
        let started = Instant::now();
        let fetched = match tokio::time::timeout(limit, fetcher.fetch(&req, proxy)).await {
            Ok(r) => r,
            Err(_) => Err(FetchError::Timeout(limit.as_secs())),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        histogram!(FETCH_DURATION_MS, "backend" => fetcher.name()).record(duration_ms as f64);
        let result: FetchResult = fetched?;

        if let Some(err) = &result.extraction_error {
            tracing::warn!(watch = %watch.uuid, error = %err, "extraction script failed; continuing");
        }

        let prior = self
            .store
            .latest(watch.uuid)
            .await
            .context("reading latest snapshot")?;
        let verdict = self
            .processors
            .run(&result, prior.as_ref(), watch)
            .context("processing fetch result")?;

        // Paused or deleted while fetching: leave the history alone.
        if !self.registry.is_current(watch.uuid, generation) {
            return Ok(Checked {
                verdict,
                duration_ms,
                favicon: None,
            });
        }

        if verdict.should_write() {
            let snap = Snapshot {
                watch_id: watch.uuid,
                timestamp: Utc::now(),
                content: verdict.content.clone(),
                content_hash: verdict.content_hash.clone(),
                extracted_data: verdict.extracted_data.clone(),
            };
            self.store.append(&snap).await.context("writing snapshot")?;
        }
        if let Some(jpeg) = &result.screenshot {
            if let Err(e) = self.store.save_screenshot(watch.uuid, jpeg).await {
                tracing::warn!(watch = %watch.uuid, error = ?e, "saving screenshot failed");
            }
        }

        let favicon = if is_html(&result) {
            favicon_url(&result.content, &watch.url)
        } else {
            None
        };
        Ok(Checked {
            verdict,
            duration_ms,
            favicon,
        })
    }
}

fn is_html(r: &FetchResult) -> bool {
    r.content_type
        .as_deref()
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("html"))
}

/// Absolute URL of the page's declared icon, if any.
pub fn favicon_url(html: &str, page_url: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let href = doc.select(&FAVICON_SEL).find_map(|el| el.value().attr("href"))?;
    let base = Url::parse(page_url).ok()?;
    base.join(href.trim()).ok().map(|u| u.to_string())
}

pub struct WorkerPool {
    worker: Arc<Worker>,
    queue: Arc<JobQueue>,
}

impl WorkerPool {
    pub fn new(worker: Arc<Worker>, queue: Arc<JobQueue>) -> Self {
        Self { worker, queue }
    }

    pub fn spawn(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let n = self.worker.cfg.workers.max(1);
        (0..n)
            .map(|idx| {
                let worker = self.worker.clone();
                let queue = self.queue.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    while let Some(job) = queue.pop(&shutdown).await {
                        let len = queue.len();
                        gauge!(QUEUE_DEPTH).set(len as f64);
                        worker.events.publish(RealtimeEvent::queue_size(len));
                        worker.run_job(job).await;
                    }
                    tracing::debug!(worker = idx, "worker stopped");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn favicon_is_resolved_against_page() {
        let html = r#"<html><head><link rel="shortcut icon" href="/static/fav.ico"></head></html>"#;
        assert_eq!(
            favicon_url(html, "https://shop.example/p/1").as_deref(),
            Some("https://shop.example/static/fav.ico")
        );
        assert_eq!(favicon_url("<p>none</p>", "https://shop.example/"), None);
    }
}
