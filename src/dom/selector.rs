// src/dom/selector.rs
//! Selector generation and re-query over a [`PageSnapshot`].
//!
//! Preference order when generating:
//! 1. `tag[name="value"]` if unique, otherwise positional among the
//!    same-name matches (`(//tag[@name="value"])[n]`);
//! 2. a CSS path walking up to 5 ancestors, anchored at the first one whose
//!    `id` resolves to exactly one element;
//! 3. an absolute positional XPath (`/html[1]/body[1]/div[2]`).
//!
//! [`query`] understands exactly the grammar produced here, which is what
//! the selection tooling feeds back.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{NodeId, PageSnapshot};

pub const MAX_ANCESTOR_DEPTH: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ElementSelector {
    Css(String),
    XPath(String),
}

impl ElementSelector {
    pub fn as_str(&self) -> &str {
        match self {
            ElementSelector::Css(s) | ElementSelector::XPath(s) => s,
        }
    }
}

impl fmt::Display for ElementSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static RE_IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][\w-]*$").unwrap());

fn escape(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"")
}

fn unescape(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    let mut chars = v.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(n) = chars.next() {
                out.push(n);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn id_compound(tag: &str, id: &str) -> String {
    if RE_IDENT.is_match(id) {
        format!("#{id}")
    } else {
        format!("{tag}[id=\"{}\"]", escape(id))
    }
}

/// Generate the preferred selector for `id`.
pub fn selector_for(snap: &PageSnapshot, id: NodeId) -> Option<ElementSelector> {
    let node = snap.node(id)?;

    // 1) name attribute
    if let Some(name) = node.attr("name").filter(|n| !n.trim().is_empty()) {
        let css = format!("{}[name=\"{}\"]", node.tag, escape(name));
        let matches = query(snap, &css);
        if matches.len() == 1 {
            return Some(ElementSelector::Css(css));
        }
        if let Some(pos) = matches.iter().position(|m| *m == id) {
            return Some(ElementSelector::XPath(format!(
                "(//{}[@name=\"{}\"])[{}]",
                node.tag,
                escape(name),
                pos + 1
            )));
        }
    }

    // 2) CSS path anchored at a unique id
    let mut path: Vec<String> = Vec::new();
    let mut cur = Some(id);
    for _ in 0..=MAX_ANCESTOR_DEPTH {
        let Some(cid) = cur else { break };
        let Some(n) = snap.node(cid) else { break };
        if let Some(idv) = n.attr("id").filter(|v| !v.is_empty()) {
            if snap.with_id_attr(idv).len() == 1 {
                path.push(id_compound(&n.tag, idv));
                path.reverse();
                return Some(ElementSelector::Css(path.join(" > ")));
            }
        }
        path.push(format!("{}:nth-of-type({})", n.tag, snap.position_of_type(cid)));
        cur = n.parent;
    }

    // 3) positional xpath from the root
    Some(ElementSelector::XPath(absolute_xpath(snap, id)))
}

pub fn absolute_xpath(snap: &PageSnapshot, id: NodeId) -> String {
    let mut steps = Vec::new();
    let mut cur = Some(id);
    while let Some(cid) = cur {
        let Some(n) = snap.node(cid) else { break };
        steps.push(format!("{}[{}]", n.tag, snap.position_of_type(cid)));
        cur = n.parent;
    }
    steps.reverse();
    format!("/{}", steps.join("/"))
}

static RE_COMPOUND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(?P<tag>[a-zA-Z][\w-]*|\*)?(?:#(?P<id>[A-Za-z_][\w-]*))?(?:\[(?P<attr>[\w-]+)="(?P<val>(?:[^"\\]|\\.)*)"\])?(?::nth-of-type\((?P<nth>\d+)\))?$"#,
    )
    .unwrap()
});

static RE_NAMED_XPATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\(//(?P<tag>[a-zA-Z][\w-]*)\[@(?P<attr>[\w-]+)="(?P<val>(?:[^"\\]|\\.)*)"\]\)\[(?P<n>\d+)\]$"#)
        .unwrap()
});

static RE_XPATH_STEP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<tag>[a-zA-Z][\w-]*|\*)(?:\[(?P<n>\d+)\])?$").unwrap());

#[derive(Debug, Default)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    attr: Option<(String, String)>,
    nth: Option<usize>,
}

impl Compound {
    fn parse(s: &str) -> Option<Self> {
        let caps = RE_COMPOUND.captures(s.trim())?;
        let c = Compound {
            tag: caps
                .name("tag")
                .map(|m| m.as_str().to_ascii_lowercase())
                .filter(|t| t != "*"),
            id: caps.name("id").map(|m| m.as_str().to_string()),
            attr: match (caps.name("attr"), caps.name("val")) {
                (Some(a), Some(v)) => Some((a.as_str().to_ascii_lowercase(), unescape(v.as_str()))),
                _ => None,
            },
            nth: caps.name("nth").and_then(|m| m.as_str().parse().ok()),
        };
        if c.tag.is_none() && c.id.is_none() && c.attr.is_none() && !s.trim().starts_with('*') {
            return None;
        }
        Some(c)
    }

    fn matches(&self, snap: &PageSnapshot, id: NodeId) -> bool {
        let Some(n) = snap.node(id) else { return false };
        if self.tag.as_deref().is_some_and(|t| t != n.tag) {
            return false;
        }
        if let Some(want) = &self.id {
            if n.attr("id") != Some(want.as_str()) {
                return false;
            }
        }
        if let Some((a, v)) = &self.attr {
            if n.attr(a) != Some(v.as_str()) {
                return false;
            }
        }
        if let Some(k) = self.nth {
            if snap.position_of_type(id) != k {
                return false;
            }
        }
        true
    }
}

/// Resolve a generated selector to the matching node ids, in document order.
/// Unsupported syntax yields no matches.
pub fn query(snap: &PageSnapshot, selector: &str) -> Vec<NodeId> {
    let s = selector.trim();
    if let Some(caps) = RE_NAMED_XPATH.captures(s) {
        let tag = caps["tag"].to_ascii_lowercase();
        let attr = caps["attr"].to_ascii_lowercase();
        let val = unescape(&caps["val"]);
        let n: usize = caps["n"].parse().unwrap_or(0);
        let all: Vec<NodeId> = snap
            .nodes
            .iter()
            .filter(|x| x.tag == tag && x.attr(&attr) == Some(val.as_str()))
            .map(|x| x.id)
            .collect();
        return n.checked_sub(1).and_then(|i| all.get(i).copied()).into_iter().collect();
    }
    if s.starts_with('/') {
        return query_absolute_xpath(snap, s);
    }
    query_css_path(snap, s)
}

fn query_css_path(snap: &PageSnapshot, s: &str) -> Vec<NodeId> {
    let mut parts = s.split('>').map(str::trim);
    let Some(first) = parts.next().and_then(Compound::parse) else {
        return Vec::new();
    };
    let mut current: Vec<NodeId> = snap
        .nodes
        .iter()
        .filter(|n| first.matches(snap, n.id))
        .map(|n| n.id)
        .collect();
    for part in parts {
        let Some(c) = Compound::parse(part) else {
            return Vec::new();
        };
        current = snap
            .nodes
            .iter()
            .filter(|n| n.parent.is_some_and(|p| current.contains(&p)))
            .filter(|n| c.matches(snap, n.id))
            .map(|n| n.id)
            .collect();
    }
    current
}

fn query_absolute_xpath(snap: &PageSnapshot, s: &str) -> Vec<NodeId> {
    if s.starts_with("//") {
        return Vec::new();
    }
    let mut parent: Option<Option<NodeId>> = Some(None);
    let mut found: Vec<NodeId> = Vec::new();
    for step in s.trim_start_matches('/').split('/') {
        let Some(caps) = RE_XPATH_STEP.captures(step) else {
            return Vec::new();
        };
        let tag = caps["tag"].to_ascii_lowercase();
        let idx: usize = caps.name("n").and_then(|m| m.as_str().parse().ok()).unwrap_or(1);
        let Some(p) = parent else { return Vec::new() };
        let hit = snap
            .nodes
            .iter()
            .filter(|n| n.parent == p && (tag == "*" || n.tag == tag))
            .nth(idx.saturating_sub(1));
        match hit {
            Some(n) => {
                found = vec![n.id];
                parent = Some(Some(n.id));
            }
            None => return Vec::new(),
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> PageSnapshot {
        PageSnapshot::from_html(
            r#"<html><body>
                <form><input name="q"><input name="dup"><input name="dup"></form>
                <div id="main"><ul><li>a</li><li><span>b</span></li></ul></div>
                <div><p>x</p><p>y</p></div>
                <section id="twin"></section><section id="twin"></section>
            </body></html>"#,
        )
    }

    fn find(snap: &PageSnapshot, pred: impl Fn(&super::super::DomNode) -> bool) -> NodeId {
        snap.nodes.iter().find(|n| pred(n)).map(|n| n.id).unwrap()
    }

    #[test]
    fn unique_name_gives_css() {
        let snap = page();
        let id = find(&snap, |n| n.attr("name") == Some("q"));
        let sel = selector_for(&snap, id).unwrap();
        assert_eq!(sel, ElementSelector::Css(r#"input[name="q"]"#.into()));
        assert_eq!(query(&snap, sel.as_str()), vec![id]);
    }

    #[test]
    fn duplicate_name_is_positional() {
        let snap = page();
        let second = snap
            .nodes
            .iter()
            .filter(|n| n.attr("name") == Some("dup"))
            .nth(1)
            .unwrap()
            .id;
        let sel = selector_for(&snap, second).unwrap();
        assert_eq!(sel, ElementSelector::XPath(r#"(//input[@name="dup"])[2]"#.into()));
        assert_eq!(query(&snap, sel.as_str()), vec![second]);
    }

    #[test]
    fn anchored_css_path_under_unique_id() {
        let snap = page();
        let span = find(&snap, |n| n.tag == "span");
        let sel = selector_for(&snap, span).unwrap();
        assert_eq!(
            sel.as_str(),
            "#main > ul:nth-of-type(1) > li:nth-of-type(2) > span:nth-of-type(1)"
        );
        assert_eq!(query(&snap, sel.as_str()), vec![span]);
    }

    #[test]
    fn duplicate_ids_fall_through_to_xpath() {
        let snap = page();
        let twin = snap.nodes.iter().filter(|n| n.tag == "section").nth(1).unwrap().id;
        let sel = selector_for(&snap, twin).unwrap();
        assert!(matches!(sel, ElementSelector::XPath(_)));
        assert_eq!(sel.as_str(), "/html[1]/body[1]/section[2]");
        assert_eq!(query(&snap, sel.as_str()), vec![twin]);
    }

    #[test]
    fn unsupported_syntax_matches_nothing() {
        let snap = page();
        assert!(query(&snap, "div ~ p").is_empty());
        assert!(query(&snap, "//p").is_empty());
    }
}
