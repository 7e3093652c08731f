// src/error.rs
//! Fetch error taxonomy.
//!
//! Callers branch on the variant (transient vs. session expiry vs. non-fatal
//! extraction failure), so this one is a proper enum. Everything else in the
//! crate propagates `anyhow::Error`.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("proxy authentication failed")]
    ProxyAuthFailure,

    #[error("DNS lookup failed: {0}")]
    DnsError(String),

    #[error("HTTP status {0}")]
    HttpError(u16),

    /// The browser session outlived its wall-clock budget and was torn down.
    #[error("browser session expired after {0}s")]
    BrowserSessionExpired(u64),

    /// Non-fatal: the page was fetched but an in-page routine failed.
    #[error("extraction script failed: {0}")]
    ExtractionScriptError(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("browser driver error: {0}")]
    Driver(String),
}

impl FetchError {
    /// Transient errors are retried at the next natural schedule tick only.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout(_)
                | FetchError::ProxyAuthFailure
                | FetchError::DnsError(_)
                | FetchError::Connect(_)
        )
    }

    /// Interactive UIs invalidate their session on this one instead of retrying.
    pub fn is_session_expiry(&self) -> bool {
        matches!(self, FetchError::BrowserSessionExpired(_))
    }

    pub fn from_reqwest(e: &reqwest::Error, timeout_secs: u64) -> Self {
        if e.is_timeout() {
            return FetchError::Timeout(timeout_secs);
        }
        if let Some(status) = e.status() {
            if status.as_u16() == 407 {
                return FetchError::ProxyAuthFailure;
            }
            return FetchError::HttpError(status.as_u16());
        }
        if e.is_builder() || e.is_request() && e.url().is_none() {
            return FetchError::InvalidRequest(e.to_string());
        }
        // reqwest does not expose resolver failures as a kind; walk the chain.
        let chain = error_chain_text(e);
        if looks_like_dns_failure(&chain) {
            return FetchError::DnsError(chain);
        }
        if chain.contains("407") || chain.to_ascii_lowercase().contains("proxy auth") {
            return FetchError::ProxyAuthFailure;
        }
        FetchError::Connect(chain)
    }
}

fn error_chain_text(e: &(dyn std::error::Error + 'static)) -> String {
    let mut out = e.to_string();
    let mut cur = e.source();
    while let Some(src) = cur {
        out.push_str(": ");
        out.push_str(&src.to_string());
        cur = src.source();
    }
    out
}

pub(crate) fn looks_like_dns_failure(text: &str) -> bool {
    let t = text.to_ascii_lowercase();
    t.contains("dns error")
        || t.contains("failed to lookup address")
        || t.contains("name or service not known")
        || t.contains("no such host")
        || t.contains("nodename nor servname")
}
