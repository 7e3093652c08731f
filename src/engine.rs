// src/engine.rs
//! # Engine
//! Wires registry, scheduler, queue, workers, fetchers, processors, store,
//! notifier, proxy health and the event bus together, and exposes the
//! operations the HTTP API calls.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{EventBus, RealtimeEvent, WatchUpdate};
use crate::cancel::CancelMap;
use crate::config::{load_registry_default, load_registry_from, AppConfig, RegistryFile};
use crate::fetch::browser::{BrowserDriver, BrowserFetcher};
use crate::fetch::disk_cache::DiskCache;
use crate::fetch::http::PlainHttpFetcher;
use crate::fetch::remote::RemoteBrowserFetcher;
use crate::fetch::FetcherSet;
use crate::notify::discord::DiscordChannel;
use crate::notify::email::EmailChannel;
use crate::notify::slack::SlackChannel;
use crate::notify::webhook::WebhookChannel;
use crate::notify::{NotificationLog, Notifier};
use crate::process::restock::StockHeuristic;
use crate::process::ProcessorSet;
use crate::proxy::{ProxyHealth, ProxyHealthChecker, ProxyTable};
use crate::queue::JobQueue;
use crate::registry::WatchRegistry;
use crate::scheduler::Scheduler;
use crate::store::{FileStore, MemoryStore, SnapshotStore};
use crate::worker::{Worker, WorkerPool};

/// Per-channel request timeout; retries sit on top of this.
const CHANNEL_TIMEOUT: Duration = Duration::from_secs(15);

/// Subresources older than this are fetched again.
const DISK_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

pub struct Engine {
    pub config: AppConfig,
    pub registry: Arc<WatchRegistry>,
    pub proxies: Arc<ProxyTable>,
    pub checker: Arc<ProxyHealthChecker>,
    pub scheduler: Arc<Scheduler>,
    pub queue: Arc<JobQueue>,
    pub worker: Arc<Worker>,
    pub notifier: Arc<Notifier>,
    pub events: EventBus,
    pub store: Arc<dyn SnapshotStore>,
    pub heuristic: Arc<StockHeuristic>,
}

impl Engine {
    /// Everything from the environment and the registry file.
    pub fn from_env() -> Result<Self> {
        let config = AppConfig::from_env()?;
        let registry = match &config.watches_path {
            Some(p) => load_registry_from(p)?,
            None => load_registry_default()?,
        };
        let fetchers = Self::default_fetchers(&config)?;
        let store = Self::default_store(&config);
        Self::build(config, registry, fetchers, store)
    }

    /// Plain HTTP always; the remote browser worker when one is configured.
    pub fn default_fetchers(cfg: &AppConfig) -> Result<FetcherSet> {
        let http = PlainHttpFetcher::new(cfg.fetch_timeout_secs)?;
        let mut set = FetcherSet::http_only(Arc::new(http));
        if let Some(url) = &cfg.browser_worker_url {
            let remote = RemoteBrowserFetcher::new(url, cfg.browser_session_max_secs)?
                .with_disk_cache_dir(cfg.disk_cache_dir.clone());
            set = set.with_browser(Arc::new(remote));
            tracing::info!(worker = %url, "remote browser backend enabled");
        }
        Ok(set)
    }

    /// In-process browser backend over `driver`, tuned from the environment
    /// (settle wait, session budget, subresource cache).
    pub fn browser_fetcher<D: BrowserDriver>(
        cfg: &AppConfig,
        driver: D,
        heuristic: Arc<StockHeuristic>,
    ) -> BrowserFetcher<D> {
        let mut fetcher = BrowserFetcher::new(driver, heuristic)
            .with_settle(Duration::from_millis(cfg.browser_settle_ms))
            .with_session_max_secs(cfg.browser_session_max_secs);
        if let Some(dir) = &cfg.disk_cache_dir {
            fetcher = fetcher.with_disk_cache(Arc::new(DiskCache::new(dir, DISK_CACHE_TTL)));
        }
        fetcher
    }

    pub fn default_store(cfg: &AppConfig) -> Arc<dyn SnapshotStore> {
        match &cfg.datastore_path {
            Some(p) => Arc::new(FileStore::new(p)),
            None => {
                tracing::warn!("DATASTORE_PATH not set; snapshot history is kept in memory only");
                Arc::new(MemoryStore::new())
            }
        }
    }

    pub fn build(
        config: AppConfig,
        file: RegistryFile,
        fetchers: FetcherSet,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self> {
        config.validate()?;
        let heuristic = Arc::new(StockHeuristic::load_default()?);
        tracing::info!(
            version = heuristic.version,
            phrases = heuristic.phrase_count(),
            "stock phrases loaded"
        );

        let proxies = Arc::new(ProxyTable::new(file.proxies, file.default_proxy));
        let registry = Arc::new(WatchRegistry::new(
            file.watches,
            file.tags,
            proxies.default_key().map(str::to_string),
            config.jitter_secs,
        ));
        let events = EventBus::new(config.event_bus_capacity);
        let queue = Arc::new(JobQueue::new());

        let checker = Arc::new(
            ProxyHealthChecker::new(
                proxies.clone(),
                config.proxy_check_url.clone(),
                Duration::from_secs(config.fetch_timeout_secs),
            )
            .with_cancel_map(Arc::new(CancelMap::new())),
        );

        let scheduler = Arc::new(
            Scheduler::new(registry.clone(), proxies.clone(), config.scheduler_cfg())
                .with_events(events.clone()),
        );

        let mut notifier = Notifier::new(
            config.retry_policy(),
            Arc::new(NotificationLog::with_capacity(config.notification_log_capacity)),
        )
        .with_default_urls(config.default_notification_urls.clone())
        .with_base_url(config.base_url.clone())
        .with_channel(Arc::new(SlackChannel::new(CHANNEL_TIMEOUT)?))
        .with_channel(Arc::new(DiscordChannel::new(CHANNEL_TIMEOUT)?));
        if let Some(smtp) = &config.smtp {
            notifier = notifier.with_channel(Arc::new(EmailChannel::new(smtp)?));
        }
        let notifier = Arc::new(notifier.with_channel(Arc::new(WebhookChannel::new(CHANNEL_TIMEOUT)?)));

        let worker = Arc::new(Worker {
            registry: registry.clone(),
            proxies: proxies.clone(),
            fetchers: Arc::new(fetchers),
            processors: Arc::new(ProcessorSet::new(heuristic.as_ref().clone())),
            store: store.clone(),
            notifier: notifier.clone(),
            events: events.clone(),
            cfg: config.worker_cfg(),
        });

        Ok(Self {
            config,
            registry,
            proxies,
            checker,
            scheduler,
            queue,
            worker,
            notifier,
            events,
            store,
            heuristic,
        })
    }

    /// Spawn the scheduler loop, the worker pool and the proxy sweep.
    pub fn start(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = WorkerPool::new(self.worker.clone(), self.queue.clone()).spawn(shutdown.clone());
        handles.push(self.scheduler.clone().spawn(
            self.queue.clone(),
            Duration::from_millis(self.config.tick_ms),
            shutdown.clone(),
        ));
        if self.config.proxy_check_interval_secs > 0 && !self.proxies.endpoints().is_empty() {
            handles.push(self.checker.clone().spawn_periodic(
                Duration::from_secs(self.config.proxy_check_interval_secs),
                shutdown.clone(),
            ));
        }
        tracing::info!(
            watches = self.registry.len(),
            workers = self.config.workers,
            proxies = self.proxies.endpoints().len(),
            "engine started"
        );
        handles
    }

    fn publish_watch(&self, id: Uuid) {
        if let Some((w, s)) = self.registry.get(id) {
            self.events
                .publish(RealtimeEvent::WatchUpdate(WatchUpdate::new(&w, &s, Utc::now())));
        }
    }

    fn report(&self, operation: &str, id: Uuid, result: &Result<()>) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(format!("{e:#}")),
        };
        self.events.publish(RealtimeEvent::operation(operation, Some(id), r));
    }

    pub fn recheck(&self, id: Uuid) -> Result<()> {
        let result = self.scheduler.recheck(id).map(|job| {
            self.scheduler.dispatch(&self.queue, vec![job]);
        });
        self.report("recheck", id, &result);
        result
    }

    pub fn set_paused(&self, id: Uuid, paused: bool) -> Result<()> {
        let result = self.registry.set_paused(id, paused).map(|_| ());
        self.publish_watch(id);
        self.report(if paused { "pause" } else { "unpause" }, id, &result);
        result
    }

    pub fn set_muted(&self, id: Uuid, muted: bool) -> Result<()> {
        let result = self.registry.set_muted(id, muted);
        self.publish_watch(id);
        self.report(if muted { "mute" } else { "unmute" }, id, &result);
        result
    }

    pub fn mark_viewed(&self, id: Uuid) -> Result<()> {
        let result = self.registry.mark_viewed(id);
        self.publish_watch(id);
        self.events.publish(RealtimeEvent::stats(&self.registry.counts()));
        result
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        if !self.registry.remove(id) {
            return Err(anyhow!("watch {id} not found"));
        }
        tracing::info!(watch = %id, "watch deleted");
        self.events.publish(RealtimeEvent::WatchDeleted { uuid: id });
        self.events.publish(RealtimeEvent::stats(&self.registry.counts()));
        Ok(())
    }

    /// `None` when a newer request superseded this one.
    pub async fn check_proxies(&self) -> Option<Vec<(String, ProxyHealth)>> {
        self.checker.check_all().await
    }
}
