// src/broadcast.rs
//! Realtime UI events on a `tokio::broadcast` channel.
//!
//! Fire-and-forget: publishing never blocks and never fails. Receivers that
//! fall behind the ring buffer lose the oldest events and reconcile with a
//! `full_refresh`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::registry::{Counts, WatchState, WatchStatus};
use crate::schedule::humanize_since;
use crate::watch::Watch;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchUpdate {
    pub uuid: Uuid,
    pub checking_now: bool,
    pub queued: bool,
    pub unviewed: bool,
    pub has_error: bool,
    pub error_text: Option<String>,
    pub last_checked: Option<i64>,
    pub last_checked_text: String,
    pub last_changed: Option<i64>,
    pub paused: bool,
    pub muted: bool,
}

impl WatchUpdate {
    pub fn new(watch: &Watch, state: &WatchState, now: DateTime<Utc>) -> Self {
        Self {
            uuid: watch.uuid,
            checking_now: state.status == WatchStatus::Running,
            queued: state.status == WatchStatus::Queued,
            unviewed: state.unviewed,
            has_error: state.status == WatchStatus::Error,
            error_text: state.last_error.clone(),
            last_checked: state.last_checked_at.map(|t| t.timestamp()),
            last_checked_text: humanize_since(state.last_checked_at, now),
            last_changed: state.last_changed_at.map(|t| t.timestamp()),
            paused: watch.paused,
            muted: watch.notification_muted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RealtimeEvent {
    QueueSize {
        q_length: usize,
        event_timestamp: i64,
    },
    WatchUpdate(WatchUpdate),
    OperationResult {
        success: bool,
        operation: String,
        uuid: Option<Uuid>,
        error: Option<String>,
    },
    WatchDeleted {
        uuid: Uuid,
    },
    FaviconUpdated {
        uuid: Uuid,
        url: String,
    },
    GeneralStats {
        count_errors: usize,
        unread_changes_count: usize,
        queued: usize,
    },
}

impl RealtimeEvent {
    pub fn queue_size(len: usize) -> Self {
        Self::QueueSize {
            q_length: len,
            event_timestamp: Utc::now().timestamp(),
        }
    }

    pub fn stats(c: &Counts) -> Self {
        Self::GeneralStats {
            count_errors: c.errors,
            unread_changes_count: c.unviewed,
            queued: c.queued + c.running,
        }
    }

    pub fn operation(operation: &str, uuid: Option<Uuid>, result: Result<(), String>) -> Self {
        Self::OperationResult {
            success: result.is_ok(),
            operation: operation.to_string(),
            uuid,
            error: result.err(),
        }
    }

    /// The watch this event is about; broadcast-wide events return `None`.
    pub fn watch_id(&self) -> Option<Uuid> {
        match self {
            Self::WatchUpdate(u) => Some(u.uuid),
            Self::WatchDeleted { uuid } | Self::FaviconUpdated { uuid, .. } => Some(*uuid),
            Self::OperationResult { uuid, .. } => *uuid,
            Self::QueueSize { .. } | Self::GeneralStats { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RealtimeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of receivers reached; zero when nobody listens.
    pub fn publish(&self, event: RealtimeEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
