// tests/stock_heuristic.rs
use std::collections::BTreeMap;

use page_sentinel::dom::{DomNode, PageSnapshot, Rect};
use page_sentinel::process::restock::{StockHeuristic, StockReading};

fn node(id: usize, parent: Option<usize>, tag: &str, text: &str, top: f64, height: f64) -> DomNode {
    DomNode {
        id,
        parent,
        tag: tag.into(),
        attrs: BTreeMap::new(),
        text: text.into(),
        rect: Some(Rect {
            left: 0.0,
            top,
            width: 800.0,
            height,
        }),
        visible: true,
        font_size: None,
        font_weight: None,
    }
}

/// html > body > children, laid out in a 1280x1024 viewport.
fn page(children: &[(&str, &str, f64)]) -> PageSnapshot {
    let body_text = children.iter().map(|(_, t, _)| *t).collect::<Vec<_>>().join(" ");
    let mut nodes = vec![
        node(0, None, "html", &body_text, 0.0, 4000.0),
        node(1, Some(0), "body", &body_text, 0.0, 4000.0),
    ];
    for (i, (tag, text, top)) in children.iter().enumerate() {
        nodes.push(node(i + 2, Some(1), tag, text, *top, 40.0));
    }
    PageSnapshot {
        nodes,
        viewport_width: 1280.0,
        viewport_height: 1024.0,
        document_height: 4000.0,
    }
}

fn heuristic() -> StockHeuristic {
    StockHeuristic::builtin().unwrap()
}

#[test]
fn add_to_cart_in_band_beats_out_of_stock_lower_down() {
    let snap = page(&[
        ("h1", "Trail boots", 80.0),
        ("button", "Add to cart", 400.0),
        ("p", "Out of stock", 1600.0),
    ]);
    assert_eq!(heuristic().classify(&snap), StockReading::InStock);
}

#[test]
fn temporarily_out_of_stock_near_top() {
    let snap = page(&[
        ("h1", "Trail boots", 80.0),
        ("p", "Temporarily out of stock", 200.0),
    ]);
    assert_eq!(
        heuristic().classify(&snap),
        StockReading::OutOfStock("temporarily out of stock".into())
    );
}

#[test]
fn neither_signal_is_unknown() {
    let snap = page(&[("h1", "Trail boots", 80.0), ("p", "Free shipping over 50", 300.0)]);
    let r = heuristic().classify(&snap);
    assert_eq!(r, StockReading::Unknown);
    assert!(r.is_available());
}

#[test]
fn phrases_below_the_band_are_ignored() {
    // Viewport 1024 + 150 margin: 3000px down is out of reach. The footer
    // pushes the container texts past the length cap.
    let footer = "Shipping and returns policy. ".repeat(12);
    let snap = page(&[
        ("h1", "Trail boots", 80.0),
        ("p", "Sold out", 3000.0),
        ("footer", footer.as_str(), 3600.0),
    ]);
    assert_eq!(heuristic().classify(&snap), StockReading::Unknown);
}

#[test]
fn band_edge_is_inclusive() {
    let footer = "Shipping and returns policy. ".repeat(12);
    let snap = page(&[("p", "Sold out", 1174.0), ("footer", footer.as_str(), 3600.0)]);
    assert_eq!(heuristic().classify(&snap), StockReading::OutOfStock("sold out".into()));
}

#[test]
fn hidden_elements_do_not_count() {
    let mut snap = page(&[("p", "Out of stock", 200.0)]);
    for n in &mut snap.nodes {
        n.visible = false;
    }
    assert_eq!(heuristic().classify(&snap), StockReading::Unknown);
}

#[test]
fn multilingual_phrase() {
    let snap = page(&[("span", "Nicht auf Lager", 150.0)]);
    assert!(matches!(heuristic().classify(&snap), StockReading::OutOfStock(_)));
}

#[test]
fn custom_phrase_file() {
    let h = StockHeuristic::parse(
        r#"
version = 9
in_stock_patterns = ['^buy now']
out_of_stock = ["gone fishing"]
"#,
    )
    .unwrap();
    assert_eq!(h.version, 9);
    let snap = page(&[("p", "Gone fishing", 100.0)]);
    assert_eq!(h.classify(&snap), StockReading::OutOfStock("gone fishing".into()));
}
