// src/watch.rs
//! Watch and tag configuration as loaded from the registry file.
//!
//! These are read-only to the engine; runtime state (status, timestamps)
//! lives in [`crate::registry`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::process::conditions::ConditionSet;
use crate::schedule::WeekSchedule;

pub const DEFAULT_INTERVAL_SECS: u64 = 3 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchBackend {
    #[default]
    SystemDefault,
    Http,
    Browser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    #[default]
    TextJsonDiff,
    RestockDiff,
}

/// Which inline-style freeze to apply before a full-page screenshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FreezeMode {
    Off,
    Full,
    /// Only elements in the first viewport (headers/ads shift the most).
    #[default]
    FirstViewport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Filters {
    /// CSS selectors, `xpath:` / `/`-prefixed xpaths or `json:` paths.
    pub include_filters: Vec<String>,
    /// CSS selectors removed before text extraction.
    pub subtractive_selectors: Vec<String>,
    /// Substrings (case-insensitive) or `/regex/` lines excluded from the hash.
    pub ignore_text: Vec<String>,
    /// When non-empty a change is only actionable if one of these lines is present.
    pub trigger_text: Vec<String>,
    /// Present lines suppress alerting (e.g. "Sold out").
    pub text_should_not_be_present: Vec<String>,
    /// Keep only lines matching these substrings / `/regex/`.
    pub extract_text: Vec<String>,
    pub trim_text_whitespace: bool,
    pub remove_duplicate_lines: bool,
    pub sort_text_alphabetically: bool,
    pub filter_text_added: bool,
    pub filter_text_removed: bool,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            include_filters: Vec::new(),
            subtractive_selectors: Vec::new(),
            ignore_text: Vec::new(),
            trigger_text: Vec::new(),
            text_should_not_be_present: Vec::new(),
            extract_text: Vec::new(),
            trim_text_whitespace: false,
            remove_duplicate_lines: false,
            sort_text_alphabetically: false,
            filter_text_added: true,
            filter_text_removed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrowserOptions {
    pub execute_js: Option<String>,
    pub extra_wait_ms: u64,
    /// Sub-resource URLs containing any of these are aborted.
    pub block_url_list: Vec<String>,
    /// Sub-resource URLs containing any of these bypass the disk cache.
    pub no_cache_list: Vec<String>,
    pub screenshot_quality: u8,
    pub freeze_mode: FreezeMode,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            execute_js: None,
            extra_wait_ms: 0,
            block_url_list: Vec::new(),
            no_cache_list: Vec::new(),
            screenshot_quality: 72,
            freeze_mode: FreezeMode::FirstViewport,
            viewport_width: 1280,
            viewport_height: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InStockProcessing {
    /// Alert only when a product goes from not-in-stock to in-stock.
    #[default]
    InStockOnly,
    AllChanges,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RestockSettings {
    pub in_stock_processing: InStockProcessing,
    pub follow_price_changes: bool,
    /// Minimum relative price move (percent) that counts as a change.
    pub price_change_threshold_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Watch {
    /// Left nil when absent from the registry file; loading then derives a
    /// stable id from the url.
    #[serde(default)]
    pub uuid: Uuid,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub schedule: Option<WeekSchedule>,
    #[serde(default)]
    pub fetch_backend: FetchBackend,
    #[serde(default)]
    pub processor: ProcessorKind,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub filters: Filters,
    #[serde(default)]
    pub conditions: ConditionSet,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub notification_muted: bool,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub notification_urls: Vec<String>,
    #[serde(default)]
    pub notification_title: Option<String>,
    #[serde(default)]
    pub notification_body: Option<String>,
    #[serde(default)]
    pub browser: BrowserOptions,
    #[serde(default)]
    pub restock: RestockSettings,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Watch {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            url: url.into(),
            title: None,
            interval_secs: None,
            schedule: None,
            fetch_backend: FetchBackend::default(),
            processor: ProcessorKind::default(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
            user_agent: None,
            filters: Filters::default(),
            conditions: ConditionSet::default(),
            paused: false,
            notification_muted: false,
            proxy: None,
            tags: Vec::new(),
            notification_urls: Vec::new(),
            notification_title: None,
            notification_body: None,
            browser: BrowserOptions::default(),
            restock: RestockSettings::default(),
        }
    }

    pub fn with_interval(mut self, secs: u64) -> Self {
        self.interval_secs = Some(secs);
        self
    }

    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Tag {
    pub name: String,
    #[serde(default)]
    pub schedule: Option<WeekSchedule>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub notification_urls: Vec<String>,
    #[serde(default)]
    pub notification_muted: bool,
}

/// Watch config merged with its tags. Watch-level values win; tags fill gaps.
#[derive(Debug, Clone)]
pub struct EffectiveWatch<'a> {
    pub watch: &'a Watch,
    pub tags: Vec<&'a Tag>,
    pub schedule: Option<&'a WeekSchedule>,
    pub proxy: Option<&'a str>,
}

impl<'a> EffectiveWatch<'a> {
    pub fn resolve(
        watch: &'a Watch,
        all_tags: &'a [Tag],
        default_proxy: Option<&'a str>,
    ) -> Self {
        let tags: Vec<&Tag> = all_tags
            .iter()
            .filter(|t| watch.tags.iter().any(|n| n.eq_ignore_ascii_case(&t.name)))
            .collect();
        let schedule = watch
            .schedule
            .as_ref()
            .or_else(|| tags.iter().copied().find_map(|t| t.schedule.as_ref()));
        let proxy = watch
            .proxy
            .as_deref()
            .or_else(|| tags.iter().copied().find_map(|t| t.proxy.as_deref()))
            .or(default_proxy);
        Self {
            watch,
            tags,
            schedule,
            proxy,
        }
    }

    pub fn muted(&self) -> bool {
        self.watch.notification_muted || self.tags.iter().any(|t| t.notification_muted)
    }

    /// Union of watch and tag recipients, first occurrence wins.
    pub fn notification_urls(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let all = self
            .watch
            .notification_urls
            .iter()
            .chain(self.tags.iter().flat_map(|t| t.notification_urls.iter()));
        for url in all {
            let u = url.trim();
            if !u.is_empty() && !out.iter().any(|o| o == u) {
                out.push(u.to_string());
            }
        }
        out
    }

    pub fn tag_names(&self) -> String {
        self.tags
            .iter()
            .map(|t| t.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(name: &str, proxy: Option<&str>, urls: &[&str], muted: bool) -> Tag {
        Tag {
            name: name.into(),
            schedule: None,
            proxy: proxy.map(str::to_string),
            notification_urls: urls.iter().map(|s| s.to_string()).collect(),
            notification_muted: muted,
        }
    }

    #[test]
    fn tags_fill_gaps_and_recipients_are_a_union() {
        let mut w = Watch::new("https://example.com");
        w.tags = vec!["Shoes".into()];
        w.notification_urls = vec!["json://a".into(), "json://b".into()];
        let tags = vec![
            tag("shoes", Some("eu"), &["json://b", "mailto:x@y.z"], false),
            tag("other", Some("us"), &["json://nope"], true),
        ];
        let eff = EffectiveWatch::resolve(&w, &tags, Some("default"));
        assert_eq!(eff.proxy, Some("eu"));
        assert!(!eff.muted());
        assert_eq!(
            eff.notification_urls(),
            vec!["json://a", "json://b", "mailto:x@y.z"]
        );
    }

    #[test]
    fn muted_tag_mutes_watch() {
        let mut w = Watch::new("https://example.com");
        w.tags = vec!["quiet".into()];
        let tags = vec![tag("quiet", None, &[], true)];
        let eff = EffectiveWatch::resolve(&w, &tags, None);
        assert!(eff.muted());
        assert_eq!(eff.proxy, None);
    }

    #[test]
    fn watch_deserializes_with_defaults() {
        let w: Watch = toml::from_str(r#"url = "https://example.com/p""#).unwrap();
        assert_eq!(w.method, "GET");
        assert_eq!(w.processor, ProcessorKind::TextJsonDiff);
        assert!(w.filters.filter_text_added);
        assert!(w.filters.filter_text_removed);
        assert_eq!(w.browser.freeze_mode, FreezeMode::FirstViewport);
    }
}
