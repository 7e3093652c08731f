// src/registry.rs
//! Watch registry: configuration plus the runtime [`WatchState`] of every
//! watch.
//!
//! Status transitions happen under one write lock, which is what makes
//! "at most one Job per watch" hold:
//!
//! ```text
//! Idle/Error --try_mark_queued--> Queued --mark_running--> Running --finish--> Idle/Error
//! ```
//!
//! Pausing or deleting bumps the generation; a Job carrying an older
//! generation is refused at `mark_running` and its result is discarded at
//! `finish`.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::watch::{Tag, Watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    #[default]
    Idle,
    Queued,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct WatchState {
    pub status: WatchStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_changed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Consecutive checks where include filters matched nothing.
    pub filter_missing_count: u32,
    pub unviewed: bool,
    pub favicon_url: Option<String>,
    pub fetch_duration_ms: Option<u64>,
    pub generation: u64,
    pub jitter_secs: u64,
}

impl WatchState {
    pub fn in_flight(&self) -> bool {
        matches!(self.status, WatchStatus::Queued | WatchStatus::Running)
    }
}

/// What a finished Job reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Checked {
        changed: bool,
        filter_missing: bool,
        duration_ms: u64,
    },
    Failed {
        error: String,
        duration_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinishResult {
    Recorded(WatchState),
    /// Paused, deleted or re-generated while the Job ran.
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub errors: usize,
    pub unviewed: usize,
    pub paused: usize,
}

#[derive(Debug, Clone)]
struct Entry {
    watch: Arc<Watch>,
    state: WatchState,
}

#[derive(Debug, Default)]
struct Inner {
    order: Vec<Uuid>,
    entries: HashMap<Uuid, Entry>,
}

/// Read-only copy the scheduler works from.
#[derive(Debug, Clone)]
pub struct RegistryView {
    pub watches: Vec<(Arc<Watch>, WatchState)>,
    pub tags: Arc<Vec<Tag>>,
    pub default_proxy: Option<String>,
}

#[derive(Debug)]
pub struct WatchRegistry {
    inner: RwLock<Inner>,
    tags: RwLock<Arc<Vec<Tag>>>,
    default_proxy: Option<String>,
    jitter_max_secs: u64,
}

impl WatchRegistry {
    pub fn new(watches: Vec<Watch>, tags: Vec<Tag>, default_proxy: Option<String>, jitter_max_secs: u64) -> Self {
        let reg = Self {
            inner: RwLock::new(Inner::default()),
            tags: RwLock::new(Arc::new(tags)),
            default_proxy,
            jitter_max_secs,
        };
        for w in watches {
            reg.insert(w);
        }
        reg
    }

    fn roll_jitter(&self) -> u64 {
        if self.jitter_max_secs == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.jitter_max_secs)
        }
    }

    /// Add or replace a watch. Replacing keeps runtime state but bumps the
    /// generation so an in-flight Job for the old config is discarded.
    pub fn insert(&self, watch: Watch) {
        let jitter = self.roll_jitter();
        let mut g = self.inner.write();
        let id = watch.uuid;
        match g.entries.get_mut(&id) {
            Some(e) => {
                e.watch = Arc::new(watch);
                e.state.generation += 1;
            }
            None => {
                g.order.push(id);
                g.entries.insert(
                    id,
                    Entry {
                        watch: Arc::new(watch),
                        state: WatchState {
                            jitter_secs: jitter,
                            ..WatchState::default()
                        },
                    },
                );
            }
        }
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut g = self.inner.write();
        g.order.retain(|u| *u != id);
        g.entries.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: Uuid) -> Option<(Arc<Watch>, WatchState)> {
        self.inner
            .read()
            .entries
            .get(&id)
            .map(|e| (e.watch.clone(), e.state.clone()))
    }

    pub fn state(&self, id: Uuid) -> Option<WatchState> {
        self.inner.read().entries.get(&id).map(|e| e.state.clone())
    }

    pub fn tags(&self) -> Arc<Vec<Tag>> {
        self.tags.read().clone()
    }

    pub fn set_tags(&self, tags: Vec<Tag>) {
        *self.tags.write() = Arc::new(tags);
    }

    pub fn default_proxy(&self) -> Option<&str> {
        self.default_proxy.as_deref()
    }

    pub fn view(&self) -> RegistryView {
        let g = self.inner.read();
        RegistryView {
            watches: g
                .order
                .iter()
                .filter_map(|id| g.entries.get(id))
                .map(|e| (e.watch.clone(), e.state.clone()))
                .collect(),
            tags: self.tags(),
            default_proxy: self.default_proxy.clone(),
        }
    }

    /// Idle/Error → Queued. Returns the generation the Job must carry, or
    /// `None` when the watch is paused, missing or already in flight.
    pub fn try_mark_queued(&self, id: Uuid) -> Option<u64> {
        let mut g = self.inner.write();
        let e = g.entries.get_mut(&id)?;
        if e.watch.paused || e.state.in_flight() {
            return None;
        }
        e.state.status = WatchStatus::Queued;
        Some(e.state.generation)
    }

    /// Queued → Running, only for the current generation.
    pub fn mark_running(&self, id: Uuid, generation: u64) -> bool {
        let mut g = self.inner.write();
        let Some(e) = g.entries.get_mut(&id) else {
            return false;
        };
        if e.state.generation != generation || e.state.status != WatchStatus::Queued {
            return false;
        }
        e.state.status = WatchStatus::Running;
        true
    }

    /// Whether a Job of this generation may still write results.
    pub fn is_current(&self, id: Uuid, generation: u64) -> bool {
        self.inner
            .read()
            .entries
            .get(&id)
            .is_some_and(|e| e.state.generation == generation)
    }

    /// Record a finished Job. Stale generations only release the status.
    pub fn finish(&self, id: Uuid, generation: u64, outcome: CheckOutcome) -> FinishResult {
        let jitter = self.roll_jitter();
        let mut g = self.inner.write();
        let Some(e) = g.entries.get_mut(&id) else {
            return FinishResult::Discarded;
        };
        if e.state.generation != generation {
            if e.state.status == WatchStatus::Running {
                e.state.status = WatchStatus::Idle;
            }
            return FinishResult::Discarded;
        }
        let now = Utc::now();
        let s = &mut e.state;
        s.last_checked_at = Some(now);
        s.jitter_secs = jitter;
        match outcome {
            CheckOutcome::Checked {
                changed,
                filter_missing,
                duration_ms,
            } => {
                s.status = WatchStatus::Idle;
                s.last_error = None;
                s.fetch_duration_ms = Some(duration_ms);
                if changed {
                    s.last_changed_at = Some(now);
                    s.unviewed = true;
                }
                s.filter_missing_count = if filter_missing {
                    s.filter_missing_count.saturating_add(1)
                } else {
                    0
                };
            }
            CheckOutcome::Failed { error, duration_ms } => {
                s.status = WatchStatus::Error;
                s.last_error = Some(error);
                s.fetch_duration_ms = Some(duration_ms);
            }
        }
        FinishResult::Recorded(s.clone())
    }

    /// A queued-but-not-started Job is dropped by resetting to Idle.
    pub fn release(&self, id: Uuid, generation: u64) {
        let mut g = self.inner.write();
        if let Some(e) = g.entries.get_mut(&id) {
            if e.state.generation == generation && e.state.status == WatchStatus::Queued {
                e.state.status = WatchStatus::Idle;
            }
        }
    }

    pub fn set_paused(&self, id: Uuid, paused: bool) -> Result<WatchState> {
        let mut g = self.inner.write();
        let e = g
            .entries
            .get_mut(&id)
            .ok_or_else(|| anyhow!("watch {id} not found"))?;
        Arc::make_mut(&mut e.watch).paused = paused;
        if paused {
            e.state.generation += 1;
            if e.state.status == WatchStatus::Queued {
                e.state.status = WatchStatus::Idle;
            }
        }
        Ok(e.state.clone())
    }

    pub fn set_muted(&self, id: Uuid, muted: bool) -> Result<()> {
        let mut g = self.inner.write();
        let e = g
            .entries
            .get_mut(&id)
            .ok_or_else(|| anyhow!("watch {id} not found"))?;
        Arc::make_mut(&mut e.watch).notification_muted = muted;
        Ok(())
    }

    pub fn mark_viewed(&self, id: Uuid) -> Result<()> {
        let mut g = self.inner.write();
        let e = g
            .entries
            .get_mut(&id)
            .ok_or_else(|| anyhow!("watch {id} not found"))?;
        e.state.unviewed = false;
        Ok(())
    }

    /// Returns true when the URL actually changed.
    pub fn set_favicon(&self, id: Uuid, url: &str) -> bool {
        let mut g = self.inner.write();
        match g.entries.get_mut(&id) {
            Some(e) if e.state.favicon_url.as_deref() != Some(url) => {
                e.state.favicon_url = Some(url.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn counts(&self) -> Counts {
        let g = self.inner.read();
        let mut c = Counts {
            total: g.entries.len(),
            ..Counts::default()
        };
        for e in g.entries.values() {
            match e.state.status {
                WatchStatus::Queued => c.queued += 1,
                WatchStatus::Running => c.running += 1,
                WatchStatus::Error => c.errors += 1,
                WatchStatus::Idle => {}
            }
            if e.state.unviewed {
                c.unviewed += 1;
            }
            if e.watch.paused {
                c.paused += 1;
            }
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg_with(w: Watch) -> (WatchRegistry, Uuid) {
        let id = w.uuid;
        (WatchRegistry::new(vec![w], vec![], None, 0), id)
    }

    #[test]
    fn queued_or_running_watch_cannot_be_queued_again() {
        let (reg, id) = reg_with(Watch::new("https://a.example"));
        let gen = reg.try_mark_queued(id).unwrap();
        assert!(reg.try_mark_queued(id).is_none());
        assert!(reg.mark_running(id, gen));
        assert!(reg.try_mark_queued(id).is_none());
        let r = reg.finish(
            id,
            gen,
            CheckOutcome::Checked {
                changed: true,
                filter_missing: false,
                duration_ms: 5,
            },
        );
        let FinishResult::Recorded(s) = r else { panic!("discarded") };
        assert_eq!(s.status, WatchStatus::Idle);
        assert!(s.unviewed && s.last_changed_at.is_some());
        assert!(reg.try_mark_queued(id).is_some());
    }

    #[test]
    fn pause_mid_flight_discards_result() {
        let (reg, id) = reg_with(Watch::new("https://a.example"));
        let gen = reg.try_mark_queued(id).unwrap();
        assert!(reg.mark_running(id, gen));
        reg.set_paused(id, true).unwrap();
        let r = reg.finish(
            id,
            gen,
            CheckOutcome::Failed {
                error: "boom".into(),
                duration_ms: 1,
            },
        );
        assert_eq!(r, FinishResult::Discarded);
        let s = reg.state(id).unwrap();
        assert_eq!(s.status, WatchStatus::Idle);
        assert!(s.last_checked_at.is_none());
        assert!(reg.try_mark_queued(id).is_none(), "paused watch must not be queued");
    }

    #[test]
    fn stale_queue_entry_cannot_start() {
        let (reg, id) = reg_with(Watch::new("https://a.example"));
        let gen = reg.try_mark_queued(id).unwrap();
        reg.set_paused(id, true).unwrap();
        reg.set_paused(id, false).unwrap();
        assert!(!reg.mark_running(id, gen));
        assert!(reg.try_mark_queued(id).is_some());
    }

    #[test]
    fn errors_and_filter_misses_are_counted() {
        let (reg, id) = reg_with(Watch::new("https://a.example"));
        for _ in 0..2 {
            let gen = reg.try_mark_queued(id).unwrap();
            reg.mark_running(id, gen);
            reg.finish(
                id,
                gen,
                CheckOutcome::Checked {
                    changed: false,
                    filter_missing: true,
                    duration_ms: 1,
                },
            );
        }
        assert_eq!(reg.state(id).unwrap().filter_missing_count, 2);
        let gen = reg.try_mark_queued(id).unwrap();
        reg.mark_running(id, gen);
        reg.finish(
            id,
            gen,
            CheckOutcome::Failed {
                error: "timed out".into(),
                duration_ms: 1,
            },
        );
        let c = reg.counts();
        assert_eq!((c.total, c.errors), (1, 1));
        assert_eq!(reg.state(id).unwrap().last_error.as_deref(), Some("timed out"));
    }

    #[test]
    fn deleted_watch_result_is_discarded() {
        let (reg, id) = reg_with(Watch::new("https://a.example"));
        let gen = reg.try_mark_queued(id).unwrap();
        reg.mark_running(id, gen);
        assert!(reg.remove(id));
        let r = reg.finish(
            id,
            gen,
            CheckOutcome::Checked {
                changed: true,
                filter_missing: false,
                duration_ms: 1,
            },
        );
        assert_eq!(r, FinishResult::Discarded);
        assert!(reg.is_empty());
    }
}
