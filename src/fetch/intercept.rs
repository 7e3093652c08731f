// src/fetch/intercept.rs
//! Request interception for browser sessions.
//!
//! The session calls [`InterceptorChain::on_request`] for every outgoing
//! request and [`InterceptorChain::on_response`] for every completed one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Document,
    Xhr,
    Fetch,
    Script,
    Stylesheet,
    Image,
    Font,
    Media,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptedRequest {
    pub url: String,
    pub method: String,
    pub kind: ResourceKind,
}

impl InterceptedRequest {
    pub fn new(url: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterceptedResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptDecision {
    Continue,
    Abort,
    /// Fulfil locally without touching the network.
    Respond(InterceptedResponse),
}

#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn on_request(&self, req: &InterceptedRequest) -> InterceptDecision;

    async fn on_response(&self, _req: &InterceptedRequest, _rsp: &InterceptedResponse) {}
}

/// Aborts requests whose URL contains any configured substring.
pub struct BlockList {
    patterns: Vec<String>,
}

impl BlockList {
    pub fn new(patterns: &[String]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn blocks(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| url.contains(p.as_str()))
    }
}

#[async_trait]
impl RequestInterceptor for BlockList {
    async fn on_request(&self, req: &InterceptedRequest) -> InterceptDecision {
        if self.blocks(&req.url) {
            tracing::trace!(url = %req.url, "blocked by block list");
            InterceptDecision::Abort
        } else {
            InterceptDecision::Continue
        }
    }
}

/// Ordered interceptors; the first non-`Continue` decision wins.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    links: Vec<Arc<dyn RequestInterceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, i: Arc<dyn RequestInterceptor>) -> Self {
        self.links.push(i);
        self
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub async fn on_request(&self, req: &InterceptedRequest) -> InterceptDecision {
        for link in &self.links {
            match link.on_request(req).await {
                InterceptDecision::Continue => continue,
                other => return other,
            }
        }
        InterceptDecision::Continue
    }

    pub async fn on_response(&self, req: &InterceptedRequest, rsp: &InterceptedResponse) {
        for link in &self.links {
            link.on_response(req, rsp).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn block_list_aborts_matching_urls() {
        let chain = InterceptorChain::new().push(Arc::new(BlockList::new(&[
            "doubleclick.net".into(),
            " ".into(),
        ])));
        let ad = InterceptedRequest::new("https://ad.doubleclick.net/x.js", ResourceKind::Script);
        let ok = InterceptedRequest::new("https://shop.example/app.js", ResourceKind::Script);
        assert_eq!(chain.on_request(&ad).await, InterceptDecision::Abort);
        assert_eq!(chain.on_request(&ok).await, InterceptDecision::Continue);
    }
}
