// src/scheduler.rs
//! Decides which watches are due and turns them into [`Job`]s.
//!
//! A watch is due when `now >= last_checked + interval + jitter` and `now`
//! is inside its effective schedule window. Due watches are ranked by how
//! overdue they are, then admitted while the global in-flight limit and the
//! per-proxy limit allow. Anything not admitted stays Idle and is simply
//! looked at again next tick.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use metrics::gauge;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{EventBus, RealtimeEvent, WatchUpdate};
use crate::metrics::QUEUE_DEPTH;
use crate::proxy::ProxyTable;
use crate::queue::{Job, JobQueue};
use crate::registry::WatchRegistry;
use crate::schedule::overdue_secs;
use crate::watch::{EffectiveWatch, DEFAULT_INTERVAL_SECS};

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    /// Queued + Running across all watches.
    pub max_in_flight: usize,
    /// Queued + Running per effective proxy key.
    pub proxy_max_concurrent: usize,
    pub default_interval_secs: u64,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            max_in_flight: 10,
            proxy_max_concurrent: 2,
            default_interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }
}

struct Candidate {
    id: Uuid,
    overdue: i64,
    proxy: Option<String>,
}

pub struct Scheduler {
    registry: Arc<WatchRegistry>,
    proxies: Arc<ProxyTable>,
    cfg: SchedulerCfg,
    events: Option<EventBus>,
}

impl Scheduler {
    pub fn new(registry: Arc<WatchRegistry>, proxies: Arc<ProxyTable>, cfg: SchedulerCfg) -> Self {
        Self {
            registry,
            proxies,
            cfg,
            events: None,
        }
    }

    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn cfg(&self) -> SchedulerCfg {
        self.cfg
    }

    /// One scan. Every returned Job's watch has already been moved to Queued.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<Job> {
        let view = self.registry.view();
        let mut in_flight = 0usize;
        let mut per_proxy: HashMap<String, usize> = HashMap::new();
        let mut due: Vec<Candidate> = Vec::new();

        for (watch, state) in &view.watches {
            let eff = EffectiveWatch::resolve(watch, &view.tags, view.default_proxy.as_deref());
            if state.in_flight() {
                in_flight += 1;
                if let Some(p) = eff.proxy {
                    *per_proxy.entry(p.to_string()).or_default() += 1;
                }
                continue;
            }
            if watch.paused {
                continue;
            }
            let interval = watch.interval_secs.unwrap_or(self.cfg.default_interval_secs);
            match overdue_secs(now, state.last_checked_at, interval, state.jitter_secs, eff.schedule) {
                Ok(Some(overdue)) => due.push(Candidate {
                    id: watch.uuid,
                    overdue,
                    proxy: eff.proxy.map(str::to_string),
                }),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = ?e, watch = %watch.uuid, "skipping watch with bad schedule");
                }
            }
        }

        due.sort_by(|a, b| b.overdue.cmp(&a.overdue));

        let mut jobs = Vec::new();
        for c in due {
            if in_flight >= self.cfg.max_in_flight {
                tracing::debug!(deferred = true, "global in-flight limit reached");
                break;
            }
            if let Some(p) = &c.proxy {
                if self.proxies.is_unhealthy(p) {
                    tracing::debug!(watch = %c.id, proxy = %p, "proxy unhealthy, deferring");
                    continue;
                }
                if per_proxy.get(p).copied().unwrap_or(0) >= self.cfg.proxy_max_concurrent {
                    continue;
                }
            }
            let Some(generation) = self.registry.try_mark_queued(c.id) else {
                continue;
            };
            in_flight += 1;
            if let Some(p) = c.proxy {
                *per_proxy.entry(p).or_default() += 1;
            }
            jobs.push(Job {
                watch_id: c.id,
                enqueued_at: now,
                priority: c.overdue,
                generation,
            });
        }
        jobs
    }

    /// Queue a watch right away, ignoring its interval and schedule. Pause
    /// and mutual exclusion still apply.
    pub fn recheck(&self, id: Uuid) -> Result<Job> {
        let (watch, _) = self
            .registry
            .get(id)
            .ok_or_else(|| anyhow!("watch {id} not found"))?;
        if watch.paused {
            return Err(anyhow!("watch {id} is paused"));
        }
        let generation = self
            .registry
            .try_mark_queued(id)
            .ok_or_else(|| anyhow!("watch {id} is already queued or running"))?;
        Ok(Job {
            watch_id: id,
            enqueued_at: Utc::now(),
            // Manual requests jump ahead of routine checks.
            priority: i64::MAX,
            generation,
        })
    }

    /// Queue the jobs and tell the UI about them.
    pub fn dispatch(&self, queue: &JobQueue, jobs: Vec<Job>) {
        if jobs.is_empty() {
            return;
        }
        let ids: Vec<Uuid> = jobs.iter().map(|j| j.watch_id).collect();
        queue.extend(jobs);
        gauge!(QUEUE_DEPTH).set(queue.len() as f64);
        if let Some(bus) = &self.events {
            let now = Utc::now();
            for id in ids {
                if let Some((w, s)) = self.registry.get(id) {
                    bus.publish(RealtimeEvent::WatchUpdate(WatchUpdate::new(&w, &s, now)));
                }
            }
            bus.publish(RealtimeEvent::queue_size(queue.len()));
        }
    }

    pub fn spawn(self: Arc<Self>, queue: Arc<JobQueue>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let jobs = self.tick(Utc::now());
                if !jobs.is_empty() {
                    tracing::info!(queued = jobs.len(), "scheduler tick");
                }
                self.dispatch(&queue, jobs);
            }
            tracing::debug!("scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ProxyEndpoint, ProxyHealth, ProxyStatus};
    use crate::registry::CheckOutcome;
    use crate::watch::{Tag, Watch};

    fn sched(watches: Vec<Watch>, tags: Vec<Tag>, proxies: ProxyTable, cfg: SchedulerCfg) -> (Scheduler, Arc<WatchRegistry>) {
        let default = proxies.default_key().map(str::to_string);
        let reg = Arc::new(WatchRegistry::new(watches, tags, default, 0));
        (Scheduler::new(reg.clone(), Arc::new(proxies), cfg), reg)
    }

    fn proxy(key: &str) -> ProxyEndpoint {
        ProxyEndpoint {
            key: key.into(),
            url: format!("http://{key}.proxy.local:3128"),
            label: None,
        }
    }

    #[test]
    fn never_checked_watches_are_due_and_paused_ones_are_not() {
        let a = Watch::new("https://a.example");
        let mut b = Watch::new("https://b.example");
        b.paused = true;
        let a_id = a.uuid;
        let (s, _) = sched(vec![a, b], vec![], ProxyTable::empty(), SchedulerCfg::default());
        let jobs = s.tick(Utc::now());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].watch_id, a_id);
        // Already queued: second tick is empty.
        assert!(s.tick(Utc::now()).is_empty());
    }

    #[test]
    fn global_limit_defers_the_least_overdue() {
        let watches: Vec<Watch> = (0..4)
            .map(|i| Watch::new(format!("https://{i}.example")).with_interval(60 * (i + 1)))
            .collect();
        let cfg = SchedulerCfg {
            max_in_flight: 2,
            ..SchedulerCfg::default()
        };
        let (s, _) = sched(watches, vec![], ProxyTable::empty(), cfg);
        let jobs = s.tick(Utc::now());
        assert_eq!(jobs.len(), 2);
        // Never-checked watches rank by interval: longest first.
        assert!(jobs[0].priority >= jobs[1].priority);
        assert_eq!(jobs[0].priority, 240);
    }

    #[test]
    fn per_proxy_limit_and_unhealthy_proxy() {
        let table = ProxyTable::new(vec![proxy("eu"), proxy("us")], None);
        table.set_health(
            "us",
            ProxyHealth {
                status: ProxyStatus::Error,
                ..ProxyHealth::default()
            },
        );
        let mut watches = Vec::new();
        for i in 0..3 {
            let mut w = Watch::new(format!("https://eu{i}.example"));
            w.proxy = Some("eu".into());
            watches.push(w);
        }
        let mut sick = Watch::new("https://us.example");
        sick.proxy = Some("us".into());
        let sick_id = sick.uuid;
        watches.push(sick);

        let cfg = SchedulerCfg {
            max_in_flight: 10,
            proxy_max_concurrent: 2,
            ..SchedulerCfg::default()
        };
        let (s, reg) = sched(watches, vec![], table, cfg);
        let jobs = s.tick(Utc::now());
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.watch_id != sick_id));
        assert_eq!(reg.state(sick_id).unwrap().status, crate::registry::WatchStatus::Idle);
    }

    #[test]
    fn bad_timezone_is_isolated() {
        let mut bad = Watch::new("https://bad.example");
        bad.schedule = Some(crate::schedule::WeekSchedule {
            enabled: true,
            timezone: "Nowhere/Atlantis".into(),
            days: Default::default(),
        });
        let good = Watch::new("https://good.example");
        let good_id = good.uuid;
        let (s, _) = sched(vec![bad, good], vec![], ProxyTable::empty(), SchedulerCfg::default());
        let jobs = s.tick(Utc::now());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].watch_id, good_id);
    }

    #[test]
    fn recheck_honours_pause_and_exclusion() {
        let w = Watch::new("https://a.example").with_interval(3600);
        let id = w.uuid;
        let (s, reg) = sched(vec![w], vec![], ProxyTable::empty(), SchedulerCfg::default());
        let job = s.recheck(id).unwrap();
        assert!(s.recheck(id).is_err());
        reg.mark_running(id, job.generation);
        reg.finish(
            id,
            job.generation,
            CheckOutcome::Checked {
                changed: false,
                filter_missing: false,
                duration_ms: 1,
            },
        );
        // Just checked, interval not elapsed, but a manual recheck still goes.
        assert!(s.tick(Utc::now()).is_empty());
        assert!(s.recheck(id).is_ok());

        reg.release(id, reg.state(id).unwrap().generation);
        reg.set_paused(id, true).unwrap();
        assert!(s.recheck(id).is_err());
    }
}
