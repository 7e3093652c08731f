// src/dom/mod.rs
//! Flattened DOM snapshot shared by the element scraper, selector generator
//! and stock heuristic.
//!
//! A browser session produces one with layout boxes; [`PageSnapshot::from_html`]
//! produces one without layout for plain HTTP fetches (every node counts as
//! visible and position checks are skipped).

pub mod element_map;
pub mod selector;

use scraper::{ElementRef, Html, Node};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Rect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.left && x <= self.left + self.width && y >= self.top && y <= self.top + self.height
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomNode {
    /// Index in document (pre-)order.
    pub id: NodeId,
    pub parent: Option<NodeId>,
    /// Lower-case tag name.
    pub tag: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    /// Rendered text of the element and its descendants.
    #[serde(default)]
    pub text: String,
    /// Document-relative box; `None` when the page was not laid out.
    #[serde(default)]
    pub rect: Option<Rect>,
    #[serde(default = "yes")]
    pub visible: bool,
    #[serde(default)]
    pub font_size: Option<f64>,
    #[serde(default)]
    pub font_weight: Option<String>,
}

fn yes() -> bool {
    true
}

impl DomNode {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn is_clickable(&self) -> bool {
        matches!(self.tag.as_str(), "a" | "button" | "select" | "summary")
            || self.attrs.contains_key("onclick")
            || self.attr("role") == Some("button")
            || (self.tag == "input"
                && matches!(
                    self.attr("type").unwrap_or("text"),
                    "button" | "submit" | "checkbox" | "radio" | "reset"
                ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PageSnapshot {
    pub nodes: Vec<DomNode>,
    pub viewport_width: f64,
    pub viewport_height: f64,
    #[serde(default)]
    pub document_height: f64,
}

const SKIP_TEXT_OF: &[&str] = &["script", "style", "noscript", "template", "head", "title"];

impl PageSnapshot {
    /// Build a layout-less snapshot from static HTML.
    pub fn from_html(html: &str) -> Self {
        Self::from_document(&Html::parse_document(html))
    }

    /// Node ids follow [`elements`] order, so `elements(doc)[id]` is the
    /// element behind `nodes[id]`.
    pub fn from_document(doc: &Html) -> Self {
        let mut nodes = Vec::new();
        let mut index = HashMap::new();

        for node in doc.root_element().descendants() {
            let Some(el) = ElementRef::wrap(node) else {
                continue;
            };
            let id = nodes.len();
            index.insert(el.id(), id);
            let parent = el
                .parent()
                .and_then(|p| index.get(&p.id()).copied());
            let tag = el.value().name().to_ascii_lowercase();
            let attrs = el
                .value()
                .attrs()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect::<BTreeMap<_, _>>();
            let hidden = attrs.contains_key("hidden")
                || attrs
                    .get("style")
                    .is_some_and(|s| s.replace(' ', "").contains("display:none"));
            let visible = !hidden && !SKIP_TEXT_OF.contains(&tag.as_str());
            nodes.push(DomNode {
                id,
                parent,
                tag,
                attrs,
                text: rendered_text(el),
                rect: None,
                visible,
                font_size: None,
                font_weight: None,
            });
        }

        // A hidden ancestor hides the subtree.
        for i in 0..nodes.len() {
            if let Some(p) = nodes[i].parent {
                if !nodes[p].visible && nodes[p].tag != "html" {
                    nodes[i].visible = false;
                }
            }
        }

        Self {
            nodes,
            viewport_width: 0.0,
            viewport_height: 0.0,
            document_height: 0.0,
        }
    }

    pub fn has_layout(&self) -> bool {
        self.viewport_height > 0.0 && self.nodes.iter().any(|n| n.rect.is_some())
    }

    pub fn node(&self, id: NodeId) -> Option<&DomNode> {
        self.nodes.get(id)
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &DomNode> + '_ {
        self.nodes.iter().filter(move |n| n.parent == Some(id))
    }

    fn siblings_of(&self, node: &DomNode) -> impl Iterator<Item = &DomNode> + '_ {
        let parent = node.parent;
        self.nodes.iter().filter(move |n| n.parent == parent)
    }

    /// 1-based position among same-tag siblings (`:nth-of-type`, xpath `tag[n]`).
    pub fn position_of_type(&self, id: NodeId) -> usize {
        let Some(node) = self.node(id) else {
            return 1;
        };
        self.siblings_of(node)
            .filter(|n| n.tag == node.tag && n.id <= id)
            .count()
            .max(1)
    }

    pub fn with_id_attr(&self, value: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.attr("id") == Some(value))
            .map(|n| n.id)
            .collect()
    }

    /// Elements a human could point at: visible, non-zero area, on the canvas.
    /// Sorted by area ascending so the first hit for a point is the most
    /// specific element, not an outer wrapper.
    pub fn candidates(&self) -> Vec<&DomNode> {
        let canvas_w = if self.viewport_width > 0.0 {
            self.viewport_width
        } else {
            f64::MAX
        };
        let mut out: Vec<&DomNode> = self
            .nodes
            .iter()
            .filter(|n| n.visible)
            .filter(|n| match n.rect {
                Some(r) => {
                    r.area() > 0.0 && r.left + r.width > 0.0 && r.top + r.height > 0.0 && r.left < canvas_w
                }
                None => false,
            })
            .collect();
        out.sort_by(|a, b| {
            let aa = a.rect.map(|r| r.area()).unwrap_or(0.0);
            let bb = b.rect.map(|r| r.area()).unwrap_or(0.0);
            aa.total_cmp(&bb).then(a.id.cmp(&b.id))
        });
        out
    }

    /// Smallest candidate whose box contains the point.
    pub fn element_at(&self, x: f64, y: f64) -> Option<&DomNode> {
        self.candidates()
            .into_iter()
            .find(|n| n.rect.is_some_and(|r| r.contains(x, y)))
    }
}

/// Every element of the document in pre-order.
pub fn elements(doc: &Html) -> Vec<ElementRef<'_>> {
    doc.root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .collect()
}

/// innerText-ish: descendant text without script/style content, whitespace collapsed.
pub fn rendered_text(el: ElementRef<'_>) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in el.descendants() {
        let Node::Text(t) = node.value() else {
            continue;
        };
        let skipped = node
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|a| SKIP_TEXT_OF.contains(&a.value().name()));
        if skipped {
            continue;
        }
        let s = t.trim();
        if !s.is_empty() {
            parts.push(s);
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_html_keeps_document_order_and_parents() {
        let snap = PageSnapshot::from_html(
            r#"<html><body><div id="a"><p>one</p><p>two</p></div><script>var x;</script></body></html>"#,
        );
        let tags: Vec<&str> = snap.nodes.iter().map(|n| n.tag.as_str()).collect();
        assert_eq!(tags, vec!["html", "head", "body", "div", "p", "p", "script"]);
        let div = &snap.nodes[3];
        assert_eq!(div.parent, Some(2));
        assert_eq!(div.text, "one two");
        assert_eq!(snap.position_of_type(5), 2);
        assert!(!snap.nodes[6].visible);
        assert!(!snap.has_layout());
    }

    #[test]
    fn element_at_prefers_smallest_box() {
        let mk = |id, parent, tag: &str, r: Rect| DomNode {
            id,
            parent,
            tag: tag.into(),
            attrs: BTreeMap::new(),
            text: String::new(),
            rect: Some(r),
            visible: true,
            font_size: None,
            font_weight: None,
        };
        let snap = PageSnapshot {
            nodes: vec![
                mk(0, None, "div", Rect { left: 0.0, top: 0.0, width: 500.0, height: 500.0 }),
                mk(1, Some(0), "span", Rect { left: 10.0, top: 10.0, width: 50.0, height: 20.0 }),
                mk(2, Some(0), "img", Rect { left: 10.0, top: 10.0, width: 0.0, height: 0.0 }),
            ],
            viewport_width: 1280.0,
            viewport_height: 800.0,
            document_height: 500.0,
        };
        assert_eq!(snap.element_at(20.0, 15.0).map(|n| n.id), Some(1));
        assert_eq!(snap.element_at(300.0, 300.0).map(|n| n.id), Some(0));
        assert_eq!(snap.candidates().len(), 2);
    }
}
