// src/process/text_diff.rs
//! Text/JSON diff processor.

use anyhow::Result;
use serde_json::Value;

use super::filters::{self, compile_rules, matching_lines, without_ignored, Filtered};
use super::{content_hash, ChangeVerdict, Processor};
use crate::fetch::FetchResult;
use crate::store::Snapshot;
use crate::watch::Watch;

pub const FIELD_TRIGGERED: &str = "triggered_text";

pub struct TextJsonProcessor;

impl Processor for TextJsonProcessor {
    fn name(&self) -> &'static str {
        "text_json_diff"
    }

    fn process(
        &self,
        fetch: &FetchResult,
        prior: Option<&Snapshot>,
        watch: &Watch,
    ) -> Result<ChangeVerdict> {
        let f = &watch.filters;
        let text = match filters::extract(&fetch.content, fetch.content_type.as_deref(), f) {
            Filtered::Text(t) => filters::normalize(&t, f),
            Filtered::FilterNotFound(sel) => return Ok(ChangeVerdict::filter_missing(sel)),
        };

        let ignore = compile_rules(&f.ignore_text);
        let mut verdict = ChangeVerdict::for_content(text);
        // Ignored lines are kept in the stored text but do not count.
        verdict.content_hash = content_hash(&without_ignored(&verdict.content, &ignore));

        verdict.triggered_text = matching_lines(&verdict.content, &compile_rules(&f.trigger_text));
        if !verdict.triggered_text.is_empty() {
            verdict.extracted_data.insert(
                FIELD_TRIGGERED.to_string(),
                Value::from(verdict.triggered_text.clone()),
            );
        }

        let Some(prior) = prior else {
            verdict.baseline = true;
            return Ok(verdict);
        };

        verdict.changed = verdict.content_hash != prior.content_hash;
        if !verdict.changed {
            return Ok(verdict);
        }
        verdict.set_diff(&prior.content);

        let blocked = matching_lines(&verdict.content, &compile_rules(&f.text_should_not_be_present));
        let triggered = f.trigger_text.is_empty() || !verdict.triggered_text.is_empty();
        let added = !without_ignored(&verdict.added.join("\n"), &ignore).is_empty();
        let removed = !without_ignored(&verdict.removed.join("\n"), &ignore).is_empty();
        let direction = (added && f.filter_text_added) || (removed && f.filter_text_removed);

        if !blocked.is_empty() {
            tracing::debug!(watch = %watch.uuid, lines = ?blocked, "blocking text present");
        }
        verdict.actionable = blocked.is_empty() && triggered && direction;
        Ok(verdict)
    }
}
