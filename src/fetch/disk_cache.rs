// src/fetch/disk_cache.rs
//! Content-addressed sub-resource cache shared by all browser sessions.
//!
//! Entries are keyed by sha256 of the URL: `<key>.bin` holds the body and
//! `<key>.json` the metadata. Both are written to a temp file and renamed,
//! so concurrent writers never leave a torn entry (last write wins).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

use super::intercept::{
    InterceptDecision, InterceptedRequest, InterceptedResponse, RequestInterceptor, ResourceKind,
};
use crate::process::content_hash;

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    status: u16,
    content_type: Option<String>,
    stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
    ttl: Duration,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key(url: &str) -> String {
        content_hash(url)
    }

    /// Non-GET, XHR/fetch and document requests, data URIs and anything
    /// on the watch's no-cache list always go to the network.
    pub fn is_cacheable(req: &InterceptedRequest, no_cache: &[String]) -> bool {
        req.method.eq_ignore_ascii_case("GET")
            && !matches!(
                req.kind,
                ResourceKind::Document | ResourceKind::Xhr | ResourceKind::Fetch
            )
            && !req.url.starts_with("data:")
            && !no_cache
                .iter()
                .any(|p| !p.is_empty() && req.url.contains(p.as_str()))
    }

    fn paths(&self, url: &str) -> (PathBuf, PathBuf) {
        let key = Self::key(url);
        (
            self.dir.join(format!("{key}.bin")),
            self.dir.join(format!("{key}.json")),
        )
    }

    /// A fresh entry, or `None` (missing, stale or unreadable).
    pub async fn load(&self, url: &str) -> Option<InterceptedResponse> {
        let (body_p, meta_p) = self.paths(url);
        let meta: EntryMeta = serde_json::from_slice(&fs::read(&meta_p).await.ok()?).ok()?;
        let age = Utc::now().signed_duration_since(meta.stored_at);
        if age.to_std().map(|a| a > self.ttl).unwrap_or(false) || meta.url != url {
            return None;
        }
        let body = fs::read(&body_p).await.ok()?;
        let mut headers = std::collections::BTreeMap::new();
        if let Some(ct) = meta.content_type {
            headers.insert("content-type".to_string(), ct);
        }
        Some(InterceptedResponse {
            status: meta.status,
            headers,
            body,
        })
    }

    pub async fn store(&self, url: &str, rsp: &InterceptedResponse) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating cache dir {}", self.dir.display()))?;
        let (body_p, meta_p) = self.paths(url);
        let meta = EntryMeta {
            url: url.to_string(),
            status: rsp.status,
            content_type: rsp
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .map(|(_, v)| v.clone()),
            stored_at: Utc::now(),
        };
        write_atomic(&body_p, &rsp.body).await?;
        write_atomic(&meta_p, &serde_json::to_vec(&meta)?).await?;
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("renaming into {}", path.display()));
    }
    Ok(())
}

/// Per-session view of the shared cache carrying the watch's no-cache list.
pub struct DiskCacheInterceptor {
    cache: Arc<DiskCache>,
    no_cache: Vec<String>,
}

impl DiskCacheInterceptor {
    pub fn new(cache: Arc<DiskCache>, no_cache: &[String]) -> Self {
        Self {
            cache,
            no_cache: no_cache.to_vec(),
        }
    }
}

#[async_trait]
impl RequestInterceptor for DiskCacheInterceptor {
    async fn on_request(&self, req: &InterceptedRequest) -> InterceptDecision {
        if !DiskCache::is_cacheable(req, &self.no_cache) {
            return InterceptDecision::Continue;
        }
        match self.cache.load(&req.url).await {
            Some(hit) => InterceptDecision::Respond(hit),
            None => InterceptDecision::Continue,
        }
    }

    async fn on_response(&self, req: &InterceptedRequest, rsp: &InterceptedResponse) {
        if rsp.status != 200 || rsp.body.is_empty() || !DiskCache::is_cacheable(req, &self.no_cache) {
            return;
        }
        if let Err(e) = self.cache.store(&req.url, rsp).await {
            tracing::warn!(error = ?e, url = %req.url, "disk cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cacheability_rules() {
        let img = InterceptedRequest::new("https://cdn.example/a.png", ResourceKind::Image);
        assert!(DiskCache::is_cacheable(&img, &[]));
        assert!(!DiskCache::is_cacheable(&img, &["cdn.example".into()]));
        let doc = InterceptedRequest::new("https://example.com/", ResourceKind::Document);
        assert!(!DiskCache::is_cacheable(&doc, &[]));
        let xhr = InterceptedRequest::new("https://example.com/api", ResourceKind::Xhr);
        assert!(!DiskCache::is_cacheable(&xhr, &[]));
        let data = InterceptedRequest::new("data:image/png;base64,AAAA", ResourceKind::Image);
        assert!(!DiskCache::is_cacheable(&data, &[]));
        let mut post = img.clone();
        post.method = "POST".into();
        assert!(!DiskCache::is_cacheable(&post, &[]));
    }
}
