// src/notify/template.rs
//! `{{token}}` substitution for notification titles and bodies.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

use crate::process::ChangeVerdict;
use crate::watch::EffectiveWatch;

pub const DEFAULT_TITLE: &str = "Change detected: {{watch_title}}";
pub const DEFAULT_BODY: &str = "{{watch_url}} had a change.\n---\n{{diff}}\n---\n{{diff_url}}";
pub const FILTER_MISSING_TITLE: &str = "Filter not found: {{watch_title}}";
pub const FILTER_MISSING_BODY: &str =
    "The include filters of {{watch_url}} matched nothing for {{filter_misses}} checks in a row: {{filters}}";

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([a-z_]+)\s*\}\}").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyFormat {
    #[default]
    Text,
    Html,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateVars(BTreeMap<&'static str, String>);

impl TemplateVars {
    pub fn set(&mut self, key: &'static str, value: impl Into<String>) {
        self.0.insert(key, value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn for_watch(eff: &EffectiveWatch<'_>, base_url: Option<&str>, now: DateTime<Utc>) -> Self {
        let w = eff.watch;
        let mut v = Self::default();
        v.set("watch_url", w.url.clone());
        v.set("watch_title", w.label());
        v.set("watch_uuid", w.uuid.to_string());
        v.set("watch_tag", eff.tag_names());
        v.set("timestamp", now.to_rfc3339());
        let base = base_url.map(|b| b.trim_end_matches('/')).unwrap_or_default();
        v.set("base_url", base);
        v.set(
            "diff_url",
            if base.is_empty() {
                String::new()
            } else {
                format!("{base}/diff/{}", w.uuid)
            },
        );
        v
    }

    pub fn for_change(
        eff: &EffectiveWatch<'_>,
        verdict: &ChangeVerdict,
        base_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut v = Self::for_watch(eff, base_url, now);
        v.set("diff", verdict.diff_preview.clone());
        v.set("diff_added", verdict.added.join("\n"));
        v.set("diff_removed", verdict.removed.join("\n"));
        v.set("current_snapshot", verdict.content.clone());
        v.set("triggered_text", verdict.triggered_text.join("\n"));
        v.set(
            "restock_status",
            verdict.stock.as_ref().map(|s| s.describe()).unwrap_or_default(),
        );
        v.set(
            "price",
            verdict.price.map(|p| format!("{p:.2}")).unwrap_or_default(),
        );
        v
    }

    pub fn for_filter_missing(
        eff: &EffectiveWatch<'_>,
        selectors: &[String],
        misses: u32,
        base_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut v = Self::for_watch(eff, base_url, now);
        v.set("filters", selectors.join(", "));
        v.set("filter_misses", misses.to_string());
        v
    }
}

/// Known tokens are replaced; unknown ones are left as written. In HTML
/// bodies the substituted values are escaped, the template itself is not.
pub fn render(template: &str, vars: &TemplateVars, format: BodyFormat) -> String {
    TOKEN_RE
        .replace_all(template, |caps: &regex::Captures<'_>| match vars.get(&caps[1]) {
            Some(val) => match format {
                BodyFormat::Text => val.to_string(),
                BodyFormat::Html => html_escape::encode_text(val).replace('\n', "<br>"),
            },
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::restock::StockReading;
    use crate::watch::{Tag, Watch};

    #[test]
    fn substitutes_tokens_and_keeps_unknown_ones() {
        let mut w = Watch::new("https://shop.example/p/1");
        w.title = Some("Boots".into());
        w.tags = vec!["shoes".into()];
        let tags = vec![Tag {
            name: "shoes".into(),
            ..Tag::default()
        }];
        let eff = EffectiveWatch::resolve(&w, &tags, None);
        let verdict = ChangeVerdict {
            stock: Some(StockReading::InStock),
            price: Some(49.5),
            added: vec!["Now 49.50".into()],
            ..ChangeVerdict::default()
        };
        let vars = TemplateVars::for_change(&eff, &verdict, Some("https://ps.local/"), Utc::now());
        let out = render(
            "{{watch_title}} [{{ watch_tag }}] {{price}} {{diff_added}} {{nope}} {{diff_url}}",
            &vars,
            BodyFormat::Text,
        );
        assert_eq!(
            out,
            format!("Boots [shoes] 49.50 Now 49.50 {{{{nope}}}} https://ps.local/diff/{}", w.uuid)
        );
    }

    #[test]
    fn html_format_escapes_values_only() {
        let mut vars = TemplateVars::default();
        vars.set("diff", "<b>x</b>\ny");
        let out = render("<p>{{diff}}</p>", &vars, BodyFormat::Html);
        assert_eq!(out, "<p>&lt;b&gt;x&lt;/b&gt;<br>y</p>");
    }
}
