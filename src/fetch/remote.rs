// src/fetch/remote.rs
//! Browser fetching delegated to an external browser worker that speaks the
//! [`BrowserRequest`] / [`BrowserResponse`] contract over HTTP.

use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};

use super::browser::{BrowserRequest, BrowserResponse};
use super::{FetchRequest, FetchResult, Fetcher};
use crate::error::FetchError;
use crate::proxy::ProxyEndpoint;

pub struct RemoteBrowserFetcher {
    endpoint: String,
    client: Client,
    session_max_secs: u64,
    disk_cache_dir: Option<String>,
}

impl RemoteBrowserFetcher {
    /// `base_url` is the worker root; requests go to `{base_url}/fetch`.
    pub fn new(base_url: &str, session_max_secs: u64) -> Result<Self, FetchError> {
        let client = Client::builder()
            // The worker enforces its own session cap; allow a little slack
            // for the round trip so its expiry error reaches us first.
            .timeout(Duration::from_secs(session_max_secs + 10))
            .build()
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            endpoint: format!("{}/fetch", base_url.trim_end_matches('/')),
            client,
            session_max_secs,
            disk_cache_dir: None,
        })
    }

    pub fn with_disk_cache_dir(mut self, dir: Option<String>) -> Self {
        self.disk_cache_dir = dir;
        self
    }
}

#[async_trait]
impl Fetcher for RemoteBrowserFetcher {
    fn name(&self) -> &'static str {
        "remote_browser"
    }

    async fn fetch(
        &self,
        req: &FetchRequest,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<FetchResult, FetchError> {
        let started = Instant::now();
        let body = BrowserRequest::build(req, proxy, self.disk_cache_dir.clone())?;
        let rsp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| match FetchError::from_reqwest(&e, self.session_max_secs) {
                FetchError::Timeout(_) => FetchError::BrowserSessionExpired(self.session_max_secs),
                other => other,
            })?;

        let status = rsp.status().as_u16();
        match status {
            200..=299 => {}
            // Worker-side session budget exceeded.
            408 | 504 => return Err(FetchError::BrowserSessionExpired(self.session_max_secs)),
            _ => {
                let text = rsp.text().await.unwrap_or_default();
                return Err(FetchError::Driver(format!("worker returned {status}: {text}")));
            }
        }

        let decoded: BrowserResponse = rsp
            .json()
            .await
            .map_err(|e| FetchError::Driver(format!("decoding worker response: {e}")))?;

        match decoded.status_code {
            407 => return Err(FetchError::ProxyAuthFailure),
            s if s >= 400 => return Err(FetchError::HttpError(s)),
            _ => {}
        }
        let mut result = decoded.into_result()?;
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }
}
