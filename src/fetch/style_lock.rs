// src/fetch/style_lock.rs
//! Inline-style freeze before full-page capture.
//!
//! Some pages resize elements when the viewport is stretched for a full-page
//! screenshot. Freezing `width`/`height` with `!important` keeps the layout
//! that was measured. The previous inline values, with their priority, are
//! kept in a side table and restored by [`StyleLock::restore`].

use crate::dom::{NodeId, PageSnapshot};
use crate::error::FetchError;
use crate::watch::FreezeMode;

use super::browser::{BrowserSession, InlineStyle};

#[derive(Debug, Clone, PartialEq)]
struct Frozen {
    node: NodeId,
    prev_width: Option<InlineStyle>,
    prev_height: Option<InlineStyle>,
}

#[derive(Debug, Default)]
pub struct StyleLock {
    table: Vec<Frozen>,
}

impl StyleLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Nodes the given mode freezes: visible elements with a box, limited to
    /// the first viewport in `FirstViewport` mode.
    pub fn targets(snap: &PageSnapshot, mode: FreezeMode) -> Vec<NodeId> {
        if mode == FreezeMode::Off {
            return Vec::new();
        }
        snap.nodes
            .iter()
            .filter(|n| n.visible)
            .filter_map(|n| n.rect.map(|r| (n.id, r)))
            .filter(|(_, r)| r.area() > 0.0)
            .filter(|(_, r)| mode == FreezeMode::Full || r.top < snap.viewport_height)
            .map(|(id, _)| id)
            .collect()
    }

    /// Record each node's inline values, then pin the measured box. Entries
    /// are recorded before the write so a failure part-way still restores.
    pub async fn freeze(
        &mut self,
        session: &mut dyn BrowserSession,
        snap: &PageSnapshot,
        mode: FreezeMode,
    ) -> Result<(), FetchError> {
        for id in Self::targets(snap, mode) {
            let Some(rect) = snap.node(id).and_then(|n| n.rect) else {
                continue;
            };
            let prev_width = session.inline_style(id, "width").await?;
            let prev_height = session.inline_style(id, "height").await?;
            self.table.push(Frozen {
                node: id,
                prev_width,
                prev_height,
            });
            session
                .set_inline_style(id, "width", Some(&format!("{}px", rect.width)), true)
                .await?;
            session
                .set_inline_style(id, "height", Some(&format!("{}px", rect.height)), true)
                .await?;
        }
        Ok(())
    }

    /// Put back every recorded value; keeps going past individual failures.
    pub async fn restore(&mut self, session: &mut dyn BrowserSession) -> usize {
        let mut failed = 0;
        for f in self.table.drain(..).rev() {
            for (prop, prev) in [("width", &f.prev_width), ("height", &f.prev_height)] {
                let (value, important) = match prev {
                    Some(s) => (Some(s.value.as_str()), s.important),
                    None => (None, false),
                };
                if let Err(e) = session
                    .set_inline_style(f.node, prop, value, important)
                    .await
                {
                    failed += 1;
                    tracing::debug!(node = f.node, prop, error = %e, "style restore failed");
                }
            }
        }
        failed
    }
}
