// src/cancel.rs
//! Abort-previous cancellation keyed by namespace.
//!
//! `begin(ns)` cancels whatever was running under `ns` and hands back a fresh
//! ticket. Used for on-demand proxy checks where only the latest request
//! matters.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Ticket {
    id: u64,
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
pub struct CancelMap {
    tokens: DashMap<String, Ticket>,
    next_id: AtomicU64,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, namespace: &str) -> Ticket {
        let ticket = Ticket {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        if let Some(prev) = self.tokens.insert(namespace.to_string(), ticket.clone()) {
            tracing::debug!(namespace, "cancelling previous in-flight request");
            prev.token.cancel();
        }
        ticket
    }

    pub fn cancel(&self, namespace: &str) {
        if let Some((_, t)) = self.tokens.remove(namespace) {
            t.token.cancel();
        }
    }

    /// Drop the entry if it still belongs to `ticket`; a newer run keeps its own.
    pub fn finish(&self, namespace: &str, ticket: &Ticket) {
        self.tokens.remove_if(namespace, |_, current| current.id == ticket.id);
    }

    pub fn in_flight(&self) -> usize {
        self.tokens.len()
    }

    /// Run `fut` under `namespace`; `None` when superseded before completion.
    pub async fn run<F, T>(&self, namespace: &str, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let ticket = self.begin(namespace);
        let out = tokio::select! {
            _ = ticket.token.cancelled() => None,
            v = fut => Some(v),
        };
        self.finish(namespace, &ticket);
        out
    }
}
