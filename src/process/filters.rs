// src/process/filters.rs
//! Content filtering ahead of hashing: include/subtractive selectors,
//! HTML → text, `json:` paths and line-level text rules.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use serde_json::Value;

use crate::dom::{self, selector, PageSnapshot};
use crate::watch::Filters;

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "fieldset",
    "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header",
    "hr", "li", "main", "nav", "ol", "p", "pre", "section", "table", "td", "th", "tr", "ul",
];
const SKIP_TAGS: &[&str] = &["script", "style", "noscript", "template", "head", "svg"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterKind<'a> {
    Css(&'a str),
    XPath(&'a str),
    Json(&'a str),
}

fn classify(f: &str) -> FilterKind<'_> {
    let f = f.trim();
    if let Some(rest) = f.strip_prefix("json:") {
        FilterKind::Json(rest.trim())
    } else if let Some(rest) = f.strip_prefix("xpath:").or_else(|| f.strip_prefix("xpath1:")) {
        FilterKind::XPath(rest.trim())
    } else if f.starts_with('/') || f.starts_with("(/") {
        FilterKind::XPath(f)
    } else {
        FilterKind::Css(f)
    }
}

/// Does the body look like a JSON document?
pub fn looks_like_json(content_type: Option<&str>, body: &str) -> bool {
    let ct_json = content_type.is_some_and(|c| c.to_ascii_lowercase().contains("json"));
    let t = body.trim_start();
    (ct_json || t.starts_with('{') || t.starts_with('['))
        && serde_json::from_str::<Value>(body).is_ok()
}

/// Outcome of text extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum Filtered {
    Text(String),
    /// Include filters were configured and none matched anything.
    FilterNotFound(Vec<String>),
}

/// Apply include filters and produce the text that gets hashed and diffed.
pub fn extract(body: &str, content_type: Option<&str>, filters: &Filters) -> Filtered {
    if looks_like_json(content_type, body) {
        return extract_json(body, filters);
    }
    extract_html(body, filters)
}

fn extract_json(body: &str, filters: &Filters) -> Filtered {
    let Ok(doc) = serde_json::from_str::<Value>(body) else {
        return Filtered::Text(body.to_string());
    };
    let paths: Vec<&str> = filters
        .include_filters
        .iter()
        .filter_map(|f| match classify(f) {
            FilterKind::Json(p) => Some(p),
            _ => None,
        })
        .collect();
    if paths.is_empty() {
        return Filtered::Text(sorted_json(&doc));
    }
    let mut hits: Vec<Value> = Vec::new();
    for p in &paths {
        hits.extend(json_path(&doc, p).into_iter().cloned());
    }
    match hits.len() {
        0 => Filtered::FilterNotFound(paths.iter().map(|p| format!("json:{p}")).collect()),
        1 => Filtered::Text(sorted_json(&hits[0])),
        _ => Filtered::Text(sorted_json(&Value::Array(hits))),
    }
}

/// Pretty JSON with object keys in sorted order at every level.
pub fn sorted_json(v: &Value) -> String {
    let canon = canonical(v);
    serde_json::to_string_pretty(&canon).unwrap_or_else(|_| canon.to_string())
}

fn canonical(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), canonical(&map[k.as_str()]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

static RE_JSON_STEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?:\.(?P<key>[^.\[\]]+)|\[(?P<idx>\d+|\*)\]|\[['"](?P<qkey>[^'"]+)['"]\])"#)
        .unwrap()
});

/// Minimal JSONPath: `$`, `.key`, `['key']`, `[n]`, `[*]` and `.*`.
pub fn json_path<'v>(root: &'v Value, path: &str) -> Vec<&'v Value> {
    let mut rest = path.trim().strip_prefix('$').unwrap_or(path.trim());
    if !rest.is_empty() && !rest.starts_with(['.', '[']) {
        return json_path(root, &format!("$.{rest}"));
    }
    let mut current = vec![root];
    while !rest.is_empty() {
        let Some(caps) = RE_JSON_STEP.captures(rest) else {
            return Vec::new();
        };
        let step_len = caps.get(0).map(|m| m.end()).unwrap_or(rest.len());
        let key = caps.name("key").or(caps.name("qkey")).map(|m| m.as_str());
        let idx = caps.name("idx").map(|m| m.as_str());
        let mut next = Vec::new();
        for v in current {
            match (key, idx) {
                (Some("*"), _) | (_, Some("*")) => match v {
                    Value::Array(items) => next.extend(items.iter()),
                    Value::Object(map) => next.extend(map.values()),
                    _ => {}
                },
                (Some(k), _) => {
                    if let Some(c) = v.get(k) {
                        next.push(c);
                    }
                }
                (_, Some(i)) => {
                    if let Some(c) = i.parse::<usize>().ok().and_then(|i| v.get(i)) {
                        next.push(c);
                    }
                }
                _ => {}
            }
        }
        current = next;
        rest = &rest[step_len..];
    }
    current
}

/// Elements matched by CSS or generated-xpath selectors, document order.
fn select_elements<'a>(
    doc: &'a Html,
    all: &[ElementRef<'a>],
    snap: &PageSnapshot,
    sel: &str,
) -> Vec<ElementRef<'a>> {
    match classify(sel) {
        FilterKind::Css(css) => match Selector::parse(css) {
            Ok(s) => doc.select(&s).collect(),
            Err(e) => {
                tracing::warn!(selector = css, error = ?e, "invalid CSS filter");
                Vec::new()
            }
        },
        FilterKind::XPath(x) => selector::query(snap, x)
            .into_iter()
            .filter_map(|id| all.get(id).copied())
            .collect(),
        FilterKind::Json(_) => Vec::new(),
    }
}

fn extract_html(body: &str, filters: &Filters) -> Filtered {
    let doc = Html::parse_document(body);
    let all = dom::elements(&doc);
    let snap = PageSnapshot::from_document(&doc);

    let excluded: Vec<ElementRef<'_>> = filters
        .subtractive_selectors
        .iter()
        .flat_map(|s| select_elements(&doc, &all, &snap, s))
        .collect();

    let includes: Vec<&String> = filters
        .include_filters
        .iter()
        .filter(|f| !matches!(classify(f), FilterKind::Json(_)))
        .collect();

    let roots: Vec<ElementRef<'_>> = if includes.is_empty() {
        vec![doc.root_element()]
    } else {
        let mut roots = Vec::new();
        for f in &includes {
            for el in select_elements(&doc, &all, &snap, f) {
                if !roots.contains(&el) {
                    roots.push(el);
                }
            }
        }
        if roots.is_empty() {
            return Filtered::FilterNotFound(includes.into_iter().cloned().collect());
        }
        roots
    };

    let mut text = String::new();
    for root in roots {
        if !excluded.contains(&root) {
            collect_text(root, &excluded, &mut text);
            text.push('\n');
        }
    }
    Filtered::Text(tidy_lines(&text))
}

fn collect_text(el: ElementRef<'_>, excluded: &[ElementRef<'_>], out: &mut String) {
    let name = el.value().name();
    if SKIP_TAGS.contains(&name) {
        return;
    }
    let block = BLOCK_TAGS.contains(&name);
    if block {
        out.push('\n');
    }
    for child in el.children() {
        if let Some(c) = ElementRef::wrap(child) {
            if !excluded.contains(&c) {
                collect_text(c, excluded, out);
            }
        } else if let Node::Text(t) = child.value() {
            let s = t.split_whitespace().collect::<Vec<_>>().join(" ");
            if !s.is_empty() {
                if !out.ends_with(['\n', ' ']) && !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(&s);
            }
        }
    }
    if block {
        out.push('\n');
    }
}

/// Collapse intra-line whitespace and drop empty lines.
fn tidy_lines(s: &str) -> String {
    s.lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// HTML → plain text with no filters applied.
pub fn html_to_text(html: &str) -> String {
    match extract_html(html, &Filters::default()) {
        Filtered::Text(t) => t,
        Filtered::FilterNotFound(_) => String::new(),
    }
}

/// A user rule: `/regex/flags` or a case-insensitive substring.
#[derive(Debug, Clone)]
pub enum LineRule {
    Substring(String),
    Regex(Regex),
}

impl LineRule {
    pub fn parse(raw: &str) -> Option<Self> {
        let t = raw.trim();
        if t.is_empty() {
            return None;
        }
        if t.len() > 2 && t.starts_with('/') {
            if let Some(end) = t.rfind('/').filter(|&e| e > 0) {
                let (pat, flags) = (&t[1..end], &t[end + 1..]);
                let prefix = if flags.contains('i') { "(?i)" } else { "" };
                match Regex::new(&format!("{prefix}{pat}")) {
                    Ok(re) => return Some(LineRule::Regex(re)),
                    Err(e) => {
                        tracing::warn!(rule = t, error = %e, "invalid regex rule, using substring");
                    }
                }
            }
        }
        Some(LineRule::Substring(t.to_lowercase()))
    }

    pub fn matches(&self, line: &str) -> bool {
        match self {
            LineRule::Substring(s) => line.to_lowercase().contains(s.as_str()),
            LineRule::Regex(re) => re.is_match(line),
        }
    }
}

pub fn compile_rules(raw: &[String]) -> Vec<LineRule> {
    raw.iter().filter_map(|r| LineRule::parse(r)).collect()
}

/// Lines of `text` matched by any rule.
pub fn matching_lines(text: &str, rules: &[LineRule]) -> Vec<String> {
    if rules.is_empty() {
        return Vec::new();
    }
    text.lines()
        .filter(|l| rules.iter().any(|r| r.matches(l)))
        .map(str::to_string)
        .collect()
}

/// Normalization flags and extract rules, in that order.
pub fn normalize(text: &str, filters: &Filters) -> String {
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    if filters.trim_text_whitespace {
        lines = lines
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
    }
    if filters.remove_duplicate_lines {
        let mut seen = std::collections::HashSet::new();
        lines.retain(|l| seen.insert(l.clone()));
    }
    if filters.sort_text_alphabetically {
        lines.sort_by_key(|l| l.to_lowercase());
    }
    let extract = compile_rules(&filters.extract_text);
    if !extract.is_empty() {
        lines = lines
            .into_iter()
            .flat_map(|l| extract_from_line(&l, &extract))
            .collect();
    }
    lines.join("\n")
}

/// Regex rules keep only the matched parts; substring rules keep the line.
fn extract_from_line(line: &str, rules: &[LineRule]) -> Vec<String> {
    for r in rules {
        match r {
            LineRule::Regex(re) => {
                let parts: Vec<String> = re
                    .find_iter(line)
                    .map(|m| m.as_str().to_string())
                    .collect();
                if !parts.is_empty() {
                    return parts;
                }
            }
            LineRule::Substring(_) if r.matches(line) => return vec![line.to_string()],
            LineRule::Substring(_) => {}
        }
    }
    Vec::new()
}

/// Text with ignored lines removed; this is what gets hashed.
pub fn without_ignored(text: &str, ignore: &[LineRule]) -> String {
    if ignore.is_empty() {
        return text.to_string();
    }
    text.lines()
        .filter(|l| !ignore.iter().any(|r| r.matches(l)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> Filters {
        Filters::default()
    }

    #[test]
    fn html_to_text_breaks_blocks_and_skips_scripts() {
        let t = html_to_text(
            "<html><head><title>t</title></head><body><h1>Hello</h1><p>a <b>bold</b> move</p>\
             <script>var x = 1;</script><ul><li>one</li><li>two &amp; three</li></ul></body></html>",
        );
        assert_eq!(t, "Hello\na bold move\none\ntwo & three");
    }

    #[test]
    fn include_and_subtractive_selectors() {
        let mut f = filters();
        f.include_filters = vec!["#price".into()];
        f.subtractive_selectors = vec![".ad".into()];
        let html = r#"<body><div id="price"><span>€ 10</span><span class="ad">Buy more!</span></div><p>noise</p></body>"#;
        assert_eq!(extract(html, None, &f), Filtered::Text("€ 10".into()));
    }

    #[test]
    fn include_filter_missing_is_reported() {
        let mut f = filters();
        f.include_filters = vec![".nothing".into()];
        assert_eq!(
            extract("<p>x</p>", None, &f),
            Filtered::FilterNotFound(vec![".nothing".into()])
        );
    }

    #[test]
    fn xpath_include_uses_generated_grammar() {
        let mut f = filters();
        f.include_filters = vec!["xpath:/html[1]/body[1]/p[2]".into()];
        let html = "<html><body><p>first</p><p>second</p></body></html>";
        assert_eq!(extract(html, None, &f), Filtered::Text("second".into()));
    }

    #[test]
    fn json_is_sorted_and_path_filtered() {
        let body = r#"{"b":1,"a":{"price":12.5,"name":"x"}}"#;
        let all = extract(body, Some("application/json"), &filters());
        let Filtered::Text(t) = all else { panic!() };
        assert!(t.find("\"a\"").unwrap() < t.find("\"b\"").unwrap());

        let mut f = filters();
        f.include_filters = vec!["json:$.a.price".into()];
        assert_eq!(extract(body, None, &f), Filtered::Text("12.5".into()));

        let v: Value = serde_json::from_str(r#"{"items":[{"p":1},{"p":2}]}"#).unwrap();
        assert_eq!(json_path(&v, "$.items[*].p").len(), 2);
        assert_eq!(json_path(&v, "items[1].p"), vec![&Value::from(2)]);
    }

    #[test]
    fn normalization_flags() {
        let mut f = filters();
        f.trim_text_whitespace = true;
        f.remove_duplicate_lines = true;
        f.sort_text_alphabetically = true;
        assert_eq!(normalize("  b \na\n\nb\n", &f), "a\nb");

        let mut f = filters();
        f.extract_text = vec![r"/\d+\.\d{2}/".into()];
        assert_eq!(normalize("Price 12.99 now\nno number", &f), "12.99");
    }

    #[test]
    fn ignore_rules_support_regex_and_substring() {
        let rules = compile_rules(&["/^Updated .*/".into(), "visitors".into()]);
        let text = "Updated 10:31\nPrice 5\n123 Visitors online";
        assert_eq!(without_ignored(text, &rules), "Price 5");
        assert_eq!(matching_lines(text, &rules).len(), 2);
    }
}
