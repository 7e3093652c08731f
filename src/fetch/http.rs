// src/fetch/http.rs
//! Plain HTTP fetcher. One pooled `reqwest::Client` per proxy, reused.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, Method};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use super::{FetchRequest, FetchResult, Fetcher};
use crate::error::FetchError;
use crate::proxy::ProxyEndpoint;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) page-sentinel";

/// High-cardinality proxy pools should not grow this without bound.
const MAX_PROXY_CLIENTS: usize = 256;

pub struct PlainHttpFetcher {
    default_client: Client,
    proxy_clients: DashMap<String, Client>,
    timeout_secs: u64,
}

impl PlainHttpFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self, FetchError> {
        Ok(Self {
            default_client: Self::builder(timeout_secs)
                .build()
                .map_err(|e| FetchError::InvalidRequest(e.to_string()))?,
            proxy_clients: DashMap::new(),
            timeout_secs,
        })
    }

    fn builder(timeout_secs: u64) -> reqwest::ClientBuilder {
        Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(timeout_secs.min(10)))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(10))
    }

    fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<Client, FetchError> {
        let Some(p) = proxy else {
            return Ok(self.default_client.clone());
        };
        if let Some(c) = self.proxy_clients.get(&p.key) {
            return Ok(c.clone());
        }
        let rp = p
            .reqwest_proxy()
            .map_err(|e| FetchError::InvalidRequest(format!("{e:#}")))?;
        let client = Self::builder(self.timeout_secs)
            .proxy(rp)
            .build()
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        if self.proxy_clients.len() < MAX_PROXY_CLIENTS {
            self.proxy_clients.insert(p.key.clone(), client.clone());
        }
        Ok(client)
    }

    pub fn cached_clients(&self) -> usize {
        self.proxy_clients.len()
    }
}

#[async_trait]
impl Fetcher for PlainHttpFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(
        &self,
        req: &FetchRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<FetchResult, FetchError> {
        let client = self.client_for(proxy)?;
        let method = Method::from_str(&req.method)
            .map_err(|e| FetchError::InvalidRequest(format!("method {}: {e}", req.method)))?;
        let url = reqwest::Url::parse(&req.url)
            .map_err(|e| FetchError::InvalidRequest(format!("url {}: {e}", req.url)))?;

        let mut rb = client.request(method, url);
        for (k, v) in &req.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        let ua = req.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
        rb = rb.header(reqwest::header::USER_AGENT, ua);
        if let Some(body) = &req.body {
            rb = rb.body(body.clone());
        }

        let started = Instant::now();
        let rsp = rb
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&e, self.timeout_secs))?;
        let status = rsp.status();
        if status.as_u16() == 407 {
            return Err(FetchError::ProxyAuthFailure);
        }
        if !status.is_success() {
            return Err(FetchError::HttpError(status.as_u16()));
        }

        let headers: BTreeMap<String, String> = rsp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let content_type = headers.get("content-type").cloned();
        let content = rsp
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(&e, self.timeout_secs))?;

        Ok(FetchResult {
            status_code: status.as_u16(),
            headers,
            content,
            content_type,
            duration_ms: started.elapsed().as_millis() as u64,
            ..FetchResult::default()
        })
    }
}
