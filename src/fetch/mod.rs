// src/fetch/mod.rs
//! Fetch layer: a pluggable [`Fetcher`] per backend, all producing a
//! normalized [`FetchResult`].

pub mod browser;
pub mod disk_cache;
pub mod http;
pub mod intercept;
pub mod remote;
pub mod style_lock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dom::element_map::ElementMap;
use crate::error::FetchError;
use crate::process::restock::StockReading;
use crate::proxy::ProxyEndpoint;
use crate::watch::{BrowserOptions, FetchBackend, Watch};

/// Everything a backend needs to load one watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub user_agent: Option<String>,
    pub include_filters: Vec<String>,
    pub browser: BrowserOptions,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            body: None,
            user_agent: None,
            include_filters: Vec::new(),
            browser: BrowserOptions::default(),
        }
    }

    pub fn from_watch(w: &Watch) -> Self {
        Self {
            url: w.url.clone(),
            method: w.method.to_ascii_uppercase(),
            headers: w.headers.clone(),
            body: w.body.clone(),
            user_agent: w.user_agent.clone(),
            include_filters: w.filters.include_filters.clone(),
            browser: w.browser.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResult {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub content: String,
    pub content_type: Option<String>,
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
    pub element_map: Option<ElementMap>,
    pub stock: Option<StockReading>,
    /// Set when an in-page routine failed; the rest of the result is valid.
    pub extraction_error: Option<String>,
    pub duration_ms: u64,
}

impl FetchResult {
    /// A plain 200 HTML response; handy for fakes.
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            content: body.into(),
            content_type: Some("text/html; charset=utf-8".to_string()),
            ..Self::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(
        &self,
        req: &FetchRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<FetchResult, FetchError>;
}

/// Backends available to the worker.
#[derive(Clone)]
pub struct FetcherSet {
    pub http: Arc<dyn Fetcher>,
    pub browser: Option<Arc<dyn Fetcher>>,
    /// What `system_default` watches use.
    pub system_default: FetchBackend,
}

impl FetcherSet {
    pub fn http_only(http: Arc<dyn Fetcher>) -> Self {
        Self {
            http,
            browser: None,
            system_default: FetchBackend::Http,
        }
    }

    pub fn with_browser(mut self, browser: Arc<dyn Fetcher>) -> Self {
        self.browser = Some(browser);
        self
    }

    /// A browser watch with no browser backend configured degrades to HTTP.
    pub fn select(&self, backend: FetchBackend) -> &Arc<dyn Fetcher> {
        let wanted = match backend {
            FetchBackend::SystemDefault => self.system_default,
            other => other,
        };
        match (wanted, &self.browser) {
            (FetchBackend::Browser, Some(b)) => b,
            (FetchBackend::Browser, None) => {
                tracing::warn!("browser backend requested but none configured; using plain HTTP");
                &self.http
            }
            _ => &self.http,
        }
    }
}
