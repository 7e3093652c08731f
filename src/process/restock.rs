// src/process/restock.rs
//! Stock availability: the multilingual text heuristic, structured-data
//! availability/price extraction and the restock processor built on them.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use super::conditions::parse_number;
use super::{ChangeVerdict, Processor};
use crate::dom::PageSnapshot;
use crate::fetch::FetchResult;
use crate::store::Snapshot;
use crate::watch::{InStockProcessing, Watch};

pub const ENV_STOCK_PHRASES_PATH: &str = "STOCK_PHRASES_PATH";

/// Elements whose top edge is below `viewport_height + BAND_MARGIN_PX` are
/// ignored ("related products" carousels further down the page).
pub const BAND_MARGIN_PX: f64 = 150.0;

/// Longer texts are containers (whole product cards, footers), not labels.
pub const MAX_TEXT_CHARS: usize = 300;

const BUILTIN_PHRASES: &str = include_str!("../../data/stock_phrases.toml");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "phrase", rename_all = "snake_case")]
pub enum StockReading {
    InStock,
    OutOfStock(String),
    /// Nothing conclusive; treated as "possibly in stock".
    Unknown,
}

impl StockReading {
    /// `Unknown` counts as available: an alert is only worth sending once
    /// an out-of-stock phrase has actually disappeared.
    pub fn is_available(&self) -> bool {
        !matches!(self, StockReading::OutOfStock(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            StockReading::InStock => "in_stock",
            StockReading::OutOfStock(_) => "out_of_stock",
            StockReading::Unknown => "unknown",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            StockReading::InStock => "In stock".to_string(),
            StockReading::OutOfStock(p) => format!("Out of stock (\"{p}\")"),
            StockReading::Unknown => "Possibly in stock".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PhraseFile {
    version: u32,
    #[serde(default)]
    in_stock_patterns: Vec<String>,
    #[serde(default)]
    out_of_stock: Vec<String>,
}

/// Compiled phrase lists.
#[derive(Debug, Clone)]
pub struct StockHeuristic {
    pub version: u32,
    in_stock: Vec<Regex>,
    /// Lower-cased, longest first so the most specific phrase is reported.
    out_of_stock: Vec<String>,
    margin_px: f64,
}

impl StockHeuristic {
    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN_PHRASES).context("parsing built-in stock phrases")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading stock phrases from {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("parsing {}", path.display()))
    }

    /// `$STOCK_PHRASES_PATH` when set, otherwise the embedded list.
    pub fn load_default() -> Result<Self> {
        match std::env::var(ENV_STOCK_PHRASES_PATH) {
            Ok(p) if !p.trim().is_empty() => Self::from_path(Path::new(p.trim())),
            _ => Self::builtin(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let file: PhraseFile = toml::from_str(s)?;
        let in_stock = file
            .in_stock_patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")).with_context(|| format!("bad pattern {p:?}")))
            .collect::<Result<Vec<_>>>()?;
        let mut out_of_stock: Vec<String> = file
            .out_of_stock
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        out_of_stock.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));
        out_of_stock.dedup();
        Ok(Self {
            version: file.version,
            in_stock,
            out_of_stock,
            margin_px: BAND_MARGIN_PX,
        })
    }

    pub fn with_margin(mut self, px: f64) -> Self {
        self.margin_px = px;
        self
    }

    pub fn phrase_count(&self) -> usize {
        self.out_of_stock.len()
    }

    /// Classify a page. Elements are visited bottom-up (reverse document
    /// order) inside the band; any in-stock pattern wins outright, otherwise
    /// the first out-of-stock phrase found is reported.
    pub fn classify(&self, snap: &PageSnapshot) -> StockReading {
        let band_bottom = snap.viewport_height + self.margin_px;
        let layout = snap.has_layout();
        let texts: Vec<String> = snap
            .nodes
            .iter()
            .rev()
            .filter(|n| n.visible)
            .filter(|n| {
                !layout
                    || n.rect
                        .is_some_and(|r| r.top >= 0.0 && r.top <= band_bottom && r.area() > 0.0)
            })
            .map(|n| normalize(&n.text))
            .filter(|t| !t.is_empty() && t.chars().count() <= MAX_TEXT_CHARS)
            .collect();

        for t in &texts {
            if self.in_stock.iter().any(|re| re.is_match(t)) {
                tracing::trace!(text = %t, "in-stock pattern matched");
                return StockReading::InStock;
            }
        }
        for t in &texts {
            if let Some(p) = self.out_of_stock.iter().find(|p| t.contains(p.as_str())) {
                tracing::trace!(text = %t, phrase = %p, "out-of-stock phrase matched");
                return StockReading::OutOfStock(p.clone());
            }
        }
        StockReading::Unknown
    }
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Product facts published as schema.org data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredOffer {
    pub availability: Option<StockReading>,
    pub price: Option<f64>,
    pub currency: Option<String>,
}

static SEL_LD_JSON: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());
static SEL_ITEMPROP_AVAIL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"[itemprop="availability"]"#).unwrap());
static SEL_ITEMPROP_PRICE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"[itemprop="price"]"#).unwrap());
static SEL_META_PRICE: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[property="product:price:amount"], meta[property="og:price:amount"]"#)
        .unwrap()
});

fn availability_from(s: &str) -> Option<StockReading> {
    let key = s.rsplit('/').next().unwrap_or(s).trim().to_ascii_lowercase();
    match key.as_str() {
        "instock" | "limitedavailability" | "instoreonly" | "onlineonly" | "preorder"
        | "presale" => Some(StockReading::InStock),
        "outofstock" | "soldout" | "discontinued" | "backorder" => {
            Some(StockReading::OutOfStock(key))
        }
        _ => None,
    }
}

fn walk_offers(v: &Value, out: &mut StructuredOffer) {
    match v {
        Value::Array(items) => items.iter().for_each(|i| walk_offers(i, out)),
        Value::Object(map) => {
            if out.availability.is_none() {
                if let Some(a) = map.get("availability").and_then(Value::as_str) {
                    out.availability = availability_from(a);
                }
            }
            if out.price.is_none() {
                let p = map.get("price").or_else(|| map.get("lowPrice"));
                out.price = match p {
                    Some(Value::Number(n)) => n.as_f64(),
                    Some(Value::String(s)) => parse_number(s),
                    _ => None,
                };
                if out.price.is_some() {
                    out.currency = map
                        .get("priceCurrency")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
            }
            for key in ["offers", "@graph", "mainEntity", "hasVariant"] {
                if let Some(child) = map.get(key) {
                    walk_offers(child, out);
                }
            }
        }
        _ => {}
    }
}

/// JSON-LD first, then microdata and price meta tags.
pub fn structured_offer(html: &str) -> StructuredOffer {
    let doc = Html::parse_document(html);
    let mut out = StructuredOffer::default();
    for script in doc.select(&SEL_LD_JSON) {
        let raw: String = script.text().collect();
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(v) => walk_offers(&v, &mut out),
            Err(e) => tracing::debug!(error = %e, "skipping malformed ld+json block"),
        }
    }
    if out.availability.is_none() {
        out.availability = doc.select(&SEL_ITEMPROP_AVAIL).find_map(|el| {
            el.value()
                .attr("href")
                .or_else(|| el.value().attr("content"))
                .and_then(availability_from)
        });
    }
    if out.price.is_none() {
        out.price = doc
            .select(&SEL_ITEMPROP_PRICE)
            .chain(doc.select(&SEL_META_PRICE))
            .find_map(|el| {
                el.value()
                    .attr("content")
                    .map(str::to_string)
                    .or_else(|| Some(el.text().collect::<String>()))
                    .and_then(|s| parse_number(&s))
            });
    }
    out
}

pub const FIELD_IN_STOCK: &str = "in_stock";
pub const FIELD_STOCK_PHRASE: &str = "stock_phrase";
pub const FIELD_PRICE: &str = "price";

/// Alerts on availability transitions and, optionally, price moves.
pub struct RestockProcessor {
    heuristic: StockHeuristic,
}

impl RestockProcessor {
    pub fn new(heuristic: StockHeuristic) -> Self {
        Self { heuristic }
    }

    /// Structured data wins over whatever the page text says.
    pub fn read(&self, fetch: &FetchResult) -> (StockReading, Option<f64>) {
        let offer = structured_offer(&fetch.content);
        let reading = offer
            .availability
            .or_else(|| fetch.stock.clone())
            .unwrap_or_else(|| self.heuristic.classify(&PageSnapshot::from_html(&fetch.content)));
        (reading, offer.price)
    }
}

fn price_moved(old: Option<f64>, new: Option<f64>, threshold_pct: Option<f64>) -> bool {
    match (old, new) {
        (Some(a), Some(b)) => {
            if (a - b).abs() < f64::EPSILON {
                return false;
            }
            match threshold_pct {
                Some(t) if a.abs() > f64::EPSILON => ((b - a) / a * 100.0).abs() >= t,
                _ => true,
            }
        }
        (None, Some(_)) | (Some(_), None) => threshold_pct.is_none(),
        (None, None) => false,
    }
}

impl Processor for RestockProcessor {
    fn name(&self) -> &'static str {
        "restock_diff"
    }

    fn process(
        &self,
        fetch: &FetchResult,
        prior: Option<&Snapshot>,
        watch: &Watch,
    ) -> Result<ChangeVerdict> {
        let (reading, price) = self.read(fetch);
        let available = reading.is_available();

        let mut extracted = BTreeMap::new();
        extracted.insert(FIELD_IN_STOCK.to_string(), Value::Bool(available));
        if let StockReading::OutOfStock(p) = &reading {
            extracted.insert(FIELD_STOCK_PHRASE.to_string(), Value::String(p.clone()));
        }
        if let Some(p) = price {
            extracted.insert(FIELD_PRICE.to_string(), Value::from(p));
        }

        let mut content = reading.describe();
        if let Some(p) = price {
            content.push_str(&format!("\nPrice: {p:.2}"));
        }
        let mut verdict = ChangeVerdict::for_content(content);
        verdict.stock = Some(reading);
        verdict.price = price;

        let Some(prior) = prior else {
            verdict.baseline = true;
            verdict.extracted_data = extracted;
            return Ok(verdict);
        };

        let was_available = prior
            .extracted_data
            .get(FIELD_IN_STOCK)
            .and_then(Value::as_bool);
        let old_price = prior.extracted_data.get(FIELD_PRICE).and_then(Value::as_f64);

        let stock_changed = was_available.is_some_and(|w| w != available);
        let settings = &watch.restock;
        let stock_actionable = stock_changed
            && match settings.in_stock_processing {
                InStockProcessing::InStockOnly => available,
                InStockProcessing::AllChanges => true,
                InStockProcessing::Off => false,
            };
        let price_changed = settings.follow_price_changes
            && price_moved(old_price, price, settings.price_change_threshold_percent);

        verdict.changed = stock_changed || price_changed || prior.content_hash != verdict.content_hash;
        verdict.actionable = stock_actionable || price_changed;
        verdict.extracted_data = extracted;
        if verdict.changed {
            verdict.set_diff(&prior.content);
        }
        Ok(verdict)
    }
}
