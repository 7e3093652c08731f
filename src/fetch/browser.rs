// src/fetch/browser.rs
//! Browser-driven fetching over an explicit driver/session contract.
//!
//! The automation backend (CDP, WebDriver, a remote worker) implements
//! [`BrowserDriver`] + [`BrowserSession`]; [`BrowserFetcher`] owns the
//! orchestration: interception, settle wait, user script, element scrape,
//! stock reading, style freeze, screenshot with viewport fallback, the
//! wall-clock session budget and teardown on every path.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::disk_cache::{DiskCache, DiskCacheInterceptor};
use super::intercept::{BlockList, InterceptorChain};
use super::style_lock::StyleLock;
use super::{FetchRequest, FetchResult, Fetcher};
use crate::dom::element_map::{self, ElementMap};
use crate::dom::{NodeId, PageSnapshot};
use crate::error::FetchError;
use crate::process::restock::{StockHeuristic, StockReading};
use crate::proxy::ProxyEndpoint;

/// Budget for restore + close after the session itself is done or expired.
const CLEANUP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCredentials {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyCredentials {
    pub fn from_endpoint(p: &ProxyEndpoint) -> Result<Self, FetchError> {
        let server = p
            .server()
            .map_err(|e| FetchError::InvalidRequest(format!("{e:#}")))?;
        let (username, password) = match p.credentials() {
            Some((u, pw)) => (Some(u), Some(pw)),
            None => (None, None),
        };
        Ok(Self {
            server,
            username,
            password,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub proxy: Option<ProxyCredentials>,
    pub viewport_width: u32,
    pub viewport_height: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavigationResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
}

/// An inline declaration as the page had it, priority included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineStyle {
    pub value: String,
    pub important: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    FullPage,
    Viewport,
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open(&self, cfg: SessionConfig) -> Result<Box<dyn BrowserSession>, FetchError>;
}

#[async_trait]
pub trait BrowserSession: Send {
    /// Every request the page makes is routed through `chain`.
    async fn install_interceptor(&mut self, chain: InterceptorChain) -> Result<(), FetchError>;

    async fn navigate(&mut self, url: &str) -> Result<NavigationResponse, FetchError>;

    async fn evaluate(&mut self, script: &str) -> Result<Value, FetchError>;

    async fn content(&mut self) -> Result<String, FetchError>;

    /// Flattened DOM with layout boxes and visibility.
    async fn dom_snapshot(&mut self) -> Result<PageSnapshot, FetchError>;

    async fn inline_style(&mut self, node: NodeId, property: &str)
        -> Result<Option<InlineStyle>, FetchError>;

    /// `None` removes the inline property.
    async fn set_inline_style(
        &mut self,
        node: NodeId,
        property: &str,
        value: Option<&str>,
        important: bool,
    ) -> Result<(), FetchError>;

    /// JPEG bytes.
    async fn screenshot(&mut self, mode: CaptureMode, quality: u8) -> Result<Vec<u8>, FetchError>;

    async fn close(&mut self) -> Result<(), FetchError>;
}

pub struct BrowserFetcher<D: BrowserDriver> {
    driver: D,
    heuristic: Arc<StockHeuristic>,
    disk_cache: Option<Arc<DiskCache>>,
    settle: Duration,
    session_max_secs: u64,
}

impl<D: BrowserDriver> BrowserFetcher<D> {
    pub fn new(driver: D, heuristic: Arc<StockHeuristic>) -> Self {
        Self {
            driver,
            heuristic,
            disk_cache: None,
            settle: Duration::from_millis(1500),
            session_max_secs: 120,
        }
    }

    pub fn with_disk_cache(mut self, cache: Arc<DiskCache>) -> Self {
        self.disk_cache = Some(cache);
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_session_max_secs(mut self, secs: u64) -> Self {
        self.session_max_secs = secs;
        self
    }

    fn interceptors(&self, req: &FetchRequest) -> InterceptorChain {
        let mut chain = InterceptorChain::new();
        if !req.browser.block_url_list.is_empty() {
            chain = chain.push(Arc::new(BlockList::new(&req.browser.block_url_list)));
        }
        if let Some(cache) = &self.disk_cache {
            chain = chain.push(Arc::new(DiskCacheInterceptor::new(
                cache.clone(),
                &req.browser.no_cache_list,
            )));
        }
        chain
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        req: &FetchRequest,
        lock: &mut StyleLock,
    ) -> Result<FetchResult, FetchError> {
        let chain = self.interceptors(req);
        if !chain.is_empty() {
            session.install_interceptor(chain).await?;
        }

        let nav = session.navigate(&req.url).await?;
        match nav.status {
            407 => return Err(FetchError::ProxyAuthFailure),
            s if s >= 400 => return Err(FetchError::HttpError(s)),
            _ => {}
        }

        tokio::time::sleep(self.settle + Duration::from_millis(req.browser.extra_wait_ms)).await;

        let mut extraction_error = None;
        if let Some(js) = req.browser.execute_js.as_deref().filter(|s| !s.trim().is_empty()) {
            if let Err(e) = session.evaluate(js).await {
                tracing::warn!(url = %req.url, error = %e, "user script failed");
                extraction_error = Some(FetchError::ExtractionScriptError(e.to_string()).to_string());
            }
        }

        let content = session.content().await?;

        let (element_map, stock, snap) = match session.dom_snapshot().await {
            Ok(snap) => (
                Some(element_map::scrape(&snap)),
                Some(self.heuristic.classify(&snap)),
                Some(snap),
            ),
            Err(e) => {
                tracing::warn!(url = %req.url, error = %e, "element scrape failed");
                extraction_error
                    .get_or_insert_with(|| FetchError::ExtractionScriptError(e.to_string()).to_string());
                (None, None, None)
            }
        };

        let screenshot = capture(session, snap.as_ref(), req, lock).await;

        let content_type = nav
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.clone());
        Ok(FetchResult {
            status_code: nav.status,
            headers: nav.headers,
            content,
            content_type,
            screenshot,
            element_map,
            stock,
            extraction_error,
            duration_ms: 0,
        })
    }
}

async fn capture(
    session: &mut dyn BrowserSession,
    snap: Option<&PageSnapshot>,
    req: &FetchRequest,
    lock: &mut StyleLock,
) -> Option<Vec<u8>> {
    if let Some(snap) = snap {
        if let Err(e) = lock.freeze(session, snap, req.browser.freeze_mode).await {
            tracing::debug!(error = %e, "style freeze incomplete");
        }
    }
    let q = req.browser.screenshot_quality;
    match session.screenshot(CaptureMode::FullPage, q).await {
        Ok(bytes) if !bytes.is_empty() => return Some(bytes),
        Ok(_) => tracing::warn!(url = %req.url, "full-page screenshot empty, using viewport"),
        Err(e) => tracing::warn!(url = %req.url, error = %e, "full-page screenshot failed, using viewport"),
    }
    match session.screenshot(CaptureMode::Viewport, q).await {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(url = %req.url, error = %e, "viewport screenshot failed");
            None
        }
    }
}

#[async_trait]
impl<D: BrowserDriver> Fetcher for BrowserFetcher<D> {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn fetch(
        &self,
        req: &FetchRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<FetchResult, FetchError> {
        let started = Instant::now();
        let budget = Duration::from_secs(self.session_max_secs);
        let deadline = tokio::time::Instant::now() + budget;

        let cfg = SessionConfig {
            user_agent: req.user_agent.clone(),
            headers: req.headers.clone(),
            proxy: proxy.map(ProxyCredentials::from_endpoint).transpose()?,
            viewport_width: req.browser.viewport_width,
            viewport_height: req.browser.viewport_height,
        };
        let mut session = tokio::time::timeout_at(deadline, self.driver.open(cfg))
            .await
            .map_err(|_| FetchError::BrowserSessionExpired(self.session_max_secs))??;

        let mut lock = StyleLock::new();
        let outcome =
            tokio::time::timeout_at(deadline, self.drive(session.as_mut(), req, &mut lock)).await;

        if !lock.is_empty() {
            match tokio::time::timeout(CLEANUP_GRACE, lock.restore(session.as_mut())).await {
                Ok(0) => {}
                Ok(failed) => tracing::debug!(failed, "some frozen styles were not restored"),
                Err(_) => tracing::warn!(url = %req.url, "style restore timed out"),
            }
        }
        match tokio::time::timeout(CLEANUP_GRACE, session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(url = %req.url, error = %e, "browser session close failed"),
            Err(_) => tracing::warn!(url = %req.url, "browser session close timed out"),
        }

        match outcome {
            Err(_) => {
                tracing::warn!(url = %req.url, budget_secs = self.session_max_secs, "browser session expired");
                Err(FetchError::BrowserSessionExpired(self.session_max_secs))
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(mut r)) => {
                r.duration_ms = started.elapsed().as_millis() as u64;
                Ok(r)
            }
        }
    }
}

/// Browser-driver call contract (request side).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserRequest {
    pub url: String,
    #[serde(default)]
    pub execute_js: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub extra_wait_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub include_filters: Vec<String>,
    #[serde(default)]
    pub proxy: Option<ProxyCredentials>,
    #[serde(default = "default_quality")]
    pub screenshot_quality: u8,
    #[serde(default)]
    pub disk_cache_dir: Option<String>,
    #[serde(default)]
    pub block_url_list: Vec<String>,
    #[serde(default)]
    pub no_cache_list: Vec<String>,
}

fn default_quality() -> u8 {
    72
}

impl BrowserRequest {
    pub fn build(
        req: &FetchRequest,
        proxy: Option<&ProxyEndpoint>,
        disk_cache_dir: Option<String>,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            url: req.url.clone(),
            execute_js: req.browser.execute_js.clone(),
            user_agent: req.user_agent.clone(),
            extra_wait_ms: req.browser.extra_wait_ms,
            headers: req.headers.clone(),
            include_filters: req.include_filters.clone(),
            proxy: proxy.map(ProxyCredentials::from_endpoint).transpose()?,
            screenshot_quality: req.browser.screenshot_quality,
            disk_cache_dir,
            block_url_list: req.browser.block_url_list.clone(),
            no_cache_list: req.browser.no_cache_list.clone(),
        })
    }
}

/// Browser-driver call contract (response side).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BrowserResponse {
    pub content: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub status_code: u16,
    /// Base64 JPEG.
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub xpath_data: Option<ElementMap>,
    #[serde(default)]
    pub instock_data: Option<StockReading>,
    #[serde(default)]
    pub extraction_error: Option<String>,
}

impl BrowserResponse {
    pub fn from_result(r: &FetchResult) -> Self {
        Self {
            content: r.content.clone(),
            headers: r.headers.clone(),
            status_code: r.status_code,
            screenshot: r
                .screenshot
                .as_ref()
                .map(|b| base64::engine::general_purpose::STANDARD.encode(b)),
            xpath_data: r.element_map.clone(),
            instock_data: r.stock.clone(),
            extraction_error: r.extraction_error.clone(),
        }
    }

    pub fn into_result(self) -> Result<FetchResult, FetchError> {
        let screenshot = match self.screenshot.as_deref().filter(|s| !s.is_empty()) {
            Some(b64) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|e| FetchError::Driver(format!("screenshot is not base64: {e}")))?,
            ),
            None => None,
        };
        let content_type = self
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.clone());
        Ok(FetchResult {
            status_code: self.status_code,
            headers: self.headers,
            content: self.content,
            content_type,
            screenshot,
            element_map: self.xpath_data,
            stock: self.instock_data,
            extraction_error: self.extraction_error,
            duration_ms: 0,
        })
    }
}
