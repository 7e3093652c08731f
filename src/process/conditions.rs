// src/process/conditions.rs
//! Rule conditions: an independent gate on top of the diff/restock verdict.
//!
//! Each rule is `(field, operator, value)`. Rules combine with `all` (AND) or
//! `any` (OR). An empty rule list always passes. A rule that cannot be
//! evaluated (missing field, bad regex, non-numeric comparison) is false.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const FIELD_FILTERED_TEXT: &str = "page_filtered_text";
pub const FIELD_EXTRACTED_NUMBER: &str = "extracted_number";
pub const FIELD_STOCK_STATUS: &str = "stock_status";
pub const FIELD_PRICE: &str = "price";
pub const FIELD_CONTENT_LENGTH: &str = "content_length";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(alias = "==")]
    Equals,
    #[serde(alias = "!=")]
    NotEquals,
    #[serde(alias = ">")]
    GreaterThan,
    #[serde(alias = "<")]
    LessThan,
    #[serde(alias = ">=")]
    GreaterOrEqual,
    #[serde(alias = "<=")]
    LessOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    MatchesRegex,
    LengthMin,
    LengthMax,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionRule {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConditionSet {
    #[serde(default)]
    pub policy: MatchPolicy,
    #[serde(default)]
    pub rules: Vec<ConditionRule>,
}

/// Field values the rules are evaluated against.
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    fields: BTreeMap<String, Value>,
}

impl ConditionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard fields derived from the filtered page text.
    pub fn from_text(text: &str) -> Self {
        let mut ctx = Self::new();
        ctx.set(FIELD_FILTERED_TEXT, Value::String(text.to_string()));
        ctx.set(FIELD_CONTENT_LENGTH, Value::from(text.chars().count() as u64));
        if let Some(n) = first_number(text) {
            ctx.set(FIELD_EXTRACTED_NUMBER, Value::from(n));
        }
        ctx
    }

    pub fn set(&mut self, field: &str, value: Value) {
        self.fields.insert(field.to_string(), value);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn extend(&mut self, extracted: &BTreeMap<String, Value>) {
        for (k, v) in extracted {
            self.fields.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

impl ConditionSet {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn passes(&self, ctx: &ConditionContext) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let mut results = self.rules.iter().map(|r| {
            let ok = r.evaluate(ctx);
            tracing::trace!(field = %r.field, op = ?r.operator, ok, "condition rule");
            ok
        });
        match self.policy {
            MatchPolicy::All => results.all(|b| b),
            MatchPolicy::Any => results.any(|b| b),
        }
    }
}

impl ConditionRule {
    pub fn evaluate(&self, ctx: &ConditionContext) -> bool {
        let Some(actual) = ctx.get(&self.field) else {
            return false;
        };
        let text = value_text(actual);
        let expected = self.value.as_str();
        match self.operator {
            Operator::Equals => match (as_number(actual), expected.trim().parse::<f64>().ok()) {
                (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                _ => text.trim().eq_ignore_ascii_case(expected.trim()),
            },
            Operator::NotEquals => !ConditionRule {
                operator: Operator::Equals,
                ..self.clone()
            }
            .evaluate(ctx),
            Operator::GreaterThan => compare(actual, expected, |a, b| a > b),
            Operator::LessThan => compare(actual, expected, |a, b| a < b),
            Operator::GreaterOrEqual => compare(actual, expected, |a, b| a >= b),
            Operator::LessOrEqual => compare(actual, expected, |a, b| a <= b),
            Operator::Contains => text.to_lowercase().contains(&expected.to_lowercase()),
            Operator::NotContains => !text.to_lowercase().contains(&expected.to_lowercase()),
            Operator::StartsWith => text
                .trim_start()
                .to_lowercase()
                .starts_with(&expected.to_lowercase()),
            Operator::EndsWith => text
                .trim_end()
                .to_lowercase()
                .ends_with(&expected.to_lowercase()),
            Operator::MatchesRegex => match Regex::new(expected) {
                Ok(re) => re.is_match(&text),
                Err(e) => {
                    tracing::warn!(error = %e, pattern = expected, "invalid condition regex");
                    false
                }
            },
            Operator::LengthMin => expected
                .trim()
                .parse::<usize>()
                .is_ok_and(|n| text.chars().count() >= n),
            Operator::LengthMax => expected
                .trim()
                .parse::<usize>()
                .is_ok_and(|n| text.chars().count() <= n),
        }
    }
}

fn compare(actual: &Value, expected: &str, f: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(actual), expected.trim().parse::<f64>().ok()) {
        (Some(a), Some(b)) => f(a, b),
        _ => false,
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

static RE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d{1,3}(?:[,\s]\d{3})+(?:\.\d+)?|-?\d+(?:[.,]\d+)?").unwrap());

/// Parse a human number: "1,299.00" → 1299.0, "12,5" → 12.5.
pub fn parse_number(s: &str) -> Option<f64> {
    let m = RE_NUMBER.find(s.trim())?;
    let raw = m.as_str();
    let grouped = raw.contains(' ') || (raw.contains(',') && raw.contains('.'));
    let cleaned: String = if grouped {
        raw.chars().filter(|c| !matches!(c, ',' | ' ')).collect()
    } else if raw.matches(',').count() == 1 && raw.split(',').nth(1).is_some_and(|d| d.len() != 3)
    {
        raw.replace(',', ".")
    } else {
        raw.replace(',', "")
    };
    cleaned.parse().ok()
}

pub fn first_number(text: &str) -> Option<f64> {
    parse_number(text)
}
