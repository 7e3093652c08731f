// src/process/mod.rs
//! Content processors: fetch result + prior snapshot → [`ChangeVerdict`].

pub mod conditions;
pub mod diff;
pub mod filters;
pub mod restock;
pub mod text_diff;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::fetch::FetchResult;
use crate::store::Snapshot;
use crate::watch::{ProcessorKind, Watch};
use conditions::{ConditionContext, FIELD_PRICE, FIELD_STOCK_STATUS};
use diff::DiffLine;
use restock::{RestockProcessor, StockHeuristic, StockReading};
use text_diff::TextJsonProcessor;

/// Characters of rendered diff kept in `diff_preview`.
pub const DIFF_PREVIEW_CHARS: usize = 1000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeVerdict {
    /// Content differs from the prior snapshot.
    pub changed: bool,
    /// Changed, past every gate (trigger, blocking text, added/removed,
    /// restock mode, rule conditions). Only these notify.
    pub actionable: bool,
    /// No prior snapshot existed; content is written without alerting.
    pub baseline: bool,
    /// Include filters matched nothing. Nothing is written.
    pub filter_not_found: Option<Vec<String>>,
    pub extracted_data: BTreeMap<String, Value>,
    pub diff_preview: String,
    pub diff: Vec<DiffLine>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub triggered_text: Vec<String>,
    pub stock: Option<StockReading>,
    pub price: Option<f64>,
    /// Content that becomes the next prior snapshot.
    pub content: String,
    pub content_hash: String,
}

impl ChangeVerdict {
    pub fn for_content(content: String) -> Self {
        let content_hash = content_hash(&content);
        Self {
            content,
            content_hash,
            ..Self::default()
        }
    }

    pub fn filter_missing(selectors: Vec<String>) -> Self {
        Self {
            filter_not_found: Some(selectors),
            ..Self::default()
        }
    }

    /// Whether the worker should append `content` to the store.
    pub fn should_write(&self) -> bool {
        self.filter_not_found.is_none() && (self.changed || self.baseline)
    }

    pub fn set_diff(&mut self, prior_content: &str) {
        self.diff = diff::diff_lines(prior_content, &self.content);
        self.added = diff::added(&self.diff);
        self.removed = diff::removed(&self.diff);
        self.diff_preview = diff::render_changes(&self.diff)
            .chars()
            .take(DIFF_PREVIEW_CHARS)
            .collect();
    }

    /// One-line summary used by the notification audit log.
    pub fn summary(&self) -> String {
        if let Some(stock) = &self.stock {
            return match self.price {
                Some(p) => format!("{} @ {p:.2}", stock.describe()),
                None => stock.describe(),
            };
        }
        format!("+{} / -{} lines", self.added.len(), self.removed.len())
    }
}

pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(
        &self,
        fetch: &FetchResult,
        prior: Option<&Snapshot>,
        watch: &Watch,
    ) -> Result<ChangeVerdict>;
}

/// Both processors plus the rule-condition gate.
pub struct ProcessorSet {
    text: TextJsonProcessor,
    restock: RestockProcessor,
}

impl ProcessorSet {
    pub fn new(heuristic: StockHeuristic) -> Self {
        Self {
            text: TextJsonProcessor,
            restock: RestockProcessor::new(heuristic),
        }
    }

    pub fn for_kind(&self, kind: ProcessorKind) -> &dyn Processor {
        match kind {
            ProcessorKind::TextJsonDiff => &self.text,
            ProcessorKind::RestockDiff => &self.restock,
        }
    }

    pub fn run(
        &self,
        fetch: &FetchResult,
        prior: Option<&Snapshot>,
        watch: &Watch,
    ) -> Result<ChangeVerdict> {
        let mut verdict = self.for_kind(watch.processor).process(fetch, prior, watch)?;
        if verdict.actionable && !watch.conditions.is_empty() {
            let ctx = condition_context(&verdict);
            if !watch.conditions.passes(&ctx) {
                tracing::debug!(watch = %watch.uuid, "change suppressed by conditions");
                verdict.actionable = false;
            }
        }
        Ok(verdict)
    }
}

fn condition_context(v: &ChangeVerdict) -> ConditionContext {
    let mut ctx = ConditionContext::from_text(&v.content);
    if let Some(stock) = &v.stock {
        ctx.set(FIELD_STOCK_STATUS, Value::String(stock.label().to_string()));
    }
    if let Some(p) = v.price {
        ctx.set(FIELD_PRICE, Value::from(p));
    }
    ctx.extend(&v.extracted_data);
    ctx
}
