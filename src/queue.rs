// src/queue.rs
//! Priority job queue between the scheduler and the worker pool.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One scheduled check. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub watch_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    /// Seconds overdue; larger runs first.
    pub priority: i64,
    pub generation: u64,
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            // FIFO among equal priorities.
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| self.watch_id.cmp(&other.watch_id))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    heap: Mutex<BinaryHeap<Job>>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: Job) {
        self.heap.lock().push(job);
        self.notify.notify_one();
    }

    pub fn extend(&self, jobs: impl IntoIterator<Item = Job>) {
        let mut n = 0;
        {
            let mut heap = self.heap.lock();
            for j in jobs {
                heap.push(j);
                n += 1;
            }
        }
        for _ in 0..n {
            self.notify.notify_one();
        }
    }

    pub fn try_pop(&self) -> Option<Job> {
        self.heap.lock().pop()
    }

    /// Wait for the next job; `None` once `shutdown` fires.
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<Job> {
        loop {
            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
