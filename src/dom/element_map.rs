// src/dom/element_map.rs
//! Element map consumed by the interactive selection tooling ("xpath_data").

use serde::{Deserialize, Serialize};

use super::selector::selector_for;
use super::PageSnapshot;

/// Hard cap on entries; very large pages otherwise produce multi-MB payloads.
pub const MAX_ELEMENTS: usize = 2500;
const LABEL_MAX_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementInfo {
    pub xpath: String,
    pub width: f64,
    pub height: f64,
    pub left: f64,
    pub top: f64,
    pub tag_name: String,
    pub tag_type: String,
    pub is_clickable: bool,
    pub font_size: Option<f64>,
    pub font_weight: Option<String>,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ElementMap {
    pub size_pos: Vec<ElementInfo>,
    pub browser_width: f64,
}

impl ElementMap {
    pub fn is_empty(&self) -> bool {
        self.size_pos.is_empty()
    }
}

/// Scrape candidate elements (visible, sized, on canvas) smallest-first.
pub fn scrape(snap: &PageSnapshot) -> ElementMap {
    let mut size_pos = Vec::new();
    for node in snap.candidates().into_iter().take(MAX_ELEMENTS) {
        let Some(rect) = node.rect else { continue };
        let Some(sel) = selector_for(snap, node.id) else {
            continue;
        };
        let label = node
            .attr("aria-label")
            .or_else(|| node.attr("placeholder"))
            .or_else(|| node.attr("title"))
            .map(str::to_string)
            .unwrap_or_else(|| node.text.clone());
        size_pos.push(ElementInfo {
            xpath: sel.as_str().to_string(),
            width: rect.width.round(),
            height: rect.height.round(),
            left: rect.left.floor(),
            top: rect.top.floor(),
            tag_name: node.tag.clone(),
            tag_type: node.attr("type").unwrap_or_default().to_string(),
            is_clickable: node.is_clickable(),
            font_size: node.font_size,
            font_weight: node.font_weight.clone(),
            label: label.chars().take(LABEL_MAX_CHARS).collect(),
        });
    }
    ElementMap {
        size_pos,
        browser_width: snap.viewport_width,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{DomNode, Rect};
    use std::collections::BTreeMap;

    #[test]
    fn scrape_orders_smallest_first_and_serializes_camel_case() {
        let mut attrs = BTreeMap::new();
        attrs.insert("id".to_string(), "buy".to_string());
        let nodes = vec![
            DomNode {
                id: 0,
                parent: None,
                tag: "div".into(),
                attrs: BTreeMap::new(),
                text: "Buy now".into(),
                rect: Some(Rect { left: 0.0, top: 0.0, width: 400.0, height: 200.0 }),
                visible: true,
                font_size: None,
                font_weight: None,
            },
            DomNode {
                id: 1,
                parent: Some(0),
                tag: "button".into(),
                attrs,
                text: "Buy now".into(),
                rect: Some(Rect { left: 10.4, top: 20.7, width: 80.0, height: 30.0 }),
                visible: true,
                font_size: Some(14.0),
                font_weight: Some("700".into()),
            },
        ];
        let snap = PageSnapshot {
            nodes,
            viewport_width: 1280.0,
            viewport_height: 800.0,
            document_height: 200.0,
        };
        let map = scrape(&snap);
        assert_eq!(map.size_pos.len(), 2);
        assert_eq!(map.size_pos[0].xpath, "#buy");
        assert!(map.size_pos[0].is_clickable);
        assert_eq!(map.size_pos[0].left, 10.0);
        assert_eq!(map.browser_width, 1280.0);
        let json = serde_json::to_value(&map).unwrap();
        assert!(json["size_pos"][0].get("tagName").is_some());
        assert!(json["size_pos"][0].get("isClickable").is_some());
    }
}
