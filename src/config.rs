// src/config.rs
//! Runtime configuration.
//!
//! `AppConfig` comes from environment variables (`.env` is loaded by the
//! binary). Watches, tags and proxies come from a registry file, TOML or
//! JSON, found via `$WATCHES_PATH` or the fallback paths below.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::notify::email::SmtpSettings;
use crate::notify::RetryPolicy;
use crate::proxy::ProxyEndpoint;
use crate::scheduler::SchedulerCfg;
use crate::watch::{Tag, Watch, DEFAULT_INTERVAL_SECS};
use crate::worker::WorkerCfg;
use uuid::Uuid;

pub const ENV_WATCHES_PATH: &str = "WATCHES_PATH";
const FALLBACK_TOML: &str = "config/watches.toml";
const FALLBACK_JSON: &str = "config/watches.json";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub watches_path: Option<PathBuf>,
    /// Snapshot directory; in-memory history when unset.
    pub datastore_path: Option<PathBuf>,
    pub workers: usize,
    pub max_in_flight: usize,
    pub proxy_max_concurrent: usize,
    pub default_interval_secs: u64,
    pub jitter_secs: u64,
    pub tick_ms: u64,
    pub fetch_timeout_secs: u64,
    pub browser_session_max_secs: u64,
    pub browser_settle_ms: u64,
    pub browser_worker_url: Option<String>,
    pub disk_cache_dir: Option<String>,
    pub notify_max_attempts: u32,
    pub notify_base_delay_ms: u64,
    pub notify_max_delay_ms: u64,
    pub notification_log_capacity: usize,
    pub default_notification_urls: Vec<String>,
    pub base_url: Option<String>,
    pub proxy_check_url: String,
    /// Zero disables the periodic sweep; on-demand checks still work.
    pub proxy_check_interval_secs: u64,
    pub event_bus_capacity: usize,
    pub filter_failure_threshold: u32,
    pub smtp: Option<SmtpSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            watches_path: None,
            datastore_path: None,
            workers: 4,
            max_in_flight: 10,
            proxy_max_concurrent: 2,
            default_interval_secs: DEFAULT_INTERVAL_SECS,
            jitter_secs: 0,
            tick_ms: 1000,
            fetch_timeout_secs: 45,
            browser_session_max_secs: 120,
            browser_settle_ms: 1500,
            browser_worker_url: None,
            disk_cache_dir: None,
            notify_max_attempts: 3,
            notify_base_delay_ms: 500,
            notify_max_delay_ms: 30_000,
            notification_log_capacity: 500,
            default_notification_urls: Vec::new(),
            base_url: None,
            proxy_check_url: "https://example.com/".to_string(),
            proxy_check_interval_secs: 0,
            event_bus_capacity: crate::broadcast::DEFAULT_CAPACITY,
            filter_failure_threshold: 6,
            smtp: None,
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        Some(v) => v
            .parse::<T>()
            .map_err(|e| anyhow!("{key}={v:?} is invalid: {e}")),
        None => Ok(default),
    }
}

fn env_list(key: &str) -> Vec<String> {
    env_opt(key)
        .map(|v| {
            v.split([',', '\n', ' '])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let smtp = match env_opt("SMTP_HOST") {
            Some(host) => Some(SmtpSettings {
                host,
                port: env_opt("SMTP_PORT")
                    .map(|p| p.parse::<u16>())
                    .transpose()
                    .context("SMTP_PORT is invalid")?,
                user: env_opt("SMTP_USER"),
                pass: env_opt("SMTP_PASS"),
                from: env_opt("SMTP_FROM").ok_or_else(|| anyhow!("SMTP_FROM is required when SMTP_HOST is set"))?,
            }),
            None => None,
        };
        let cfg = Self {
            watches_path: env_opt(ENV_WATCHES_PATH).map(PathBuf::from),
            datastore_path: env_opt("DATASTORE_PATH").map(PathBuf::from),
            workers: env_or("WORKERS", d.workers)?,
            max_in_flight: env_or("MAX_IN_FLIGHT", d.max_in_flight)?,
            proxy_max_concurrent: env_or("PROXY_MAX_CONCURRENT", d.proxy_max_concurrent)?,
            default_interval_secs: env_or("DEFAULT_INTERVAL_SECS", d.default_interval_secs)?,
            jitter_secs: env_or("JITTER_SECS", d.jitter_secs)?,
            tick_ms: env_or("TICK_MS", d.tick_ms)?,
            fetch_timeout_secs: env_or("FETCH_TIMEOUT_SECS", d.fetch_timeout_secs)?,
            browser_session_max_secs: env_or("BROWSER_SESSION_MAX_SECS", d.browser_session_max_secs)?,
            browser_settle_ms: env_or("BROWSER_SETTLE_MS", d.browser_settle_ms)?,
            browser_worker_url: env_opt("BROWSER_WORKER_URL"),
            disk_cache_dir: env_opt("DISK_CACHE_DIR"),
            notify_max_attempts: env_or("NOTIFY_MAX_ATTEMPTS", d.notify_max_attempts)?,
            notify_base_delay_ms: env_or("NOTIFY_BASE_DELAY_MS", d.notify_base_delay_ms)?,
            notify_max_delay_ms: env_or("NOTIFY_MAX_DELAY_MS", d.notify_max_delay_ms)?,
            notification_log_capacity: env_or("NOTIFICATION_LOG_CAPACITY", d.notification_log_capacity)?,
            default_notification_urls: env_list("DEFAULT_NOTIFICATION_URLS"),
            base_url: env_opt("BASE_URL"),
            proxy_check_url: env_opt("PROXY_CHECK_URL").unwrap_or(d.proxy_check_url),
            proxy_check_interval_secs: env_or("PROXY_CHECK_INTERVAL_SECS", d.proxy_check_interval_secs)?,
            event_bus_capacity: env_or("EVENT_BUS_CAPACITY", d.event_bus_capacity)?,
            filter_failure_threshold: env_or("FILTER_FAILURE_THRESHOLD", d.filter_failure_threshold)?,
            smtp,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_interval_secs == 0 {
            return Err(anyhow!("DEFAULT_INTERVAL_SECS must be positive"));
        }
        if self.tick_ms == 0 {
            return Err(anyhow!("TICK_MS must be positive"));
        }
        if self.max_in_flight == 0 || self.proxy_max_concurrent == 0 {
            return Err(anyhow!("concurrency limits must be positive"));
        }
        Ok(())
    }

    pub fn scheduler_cfg(&self) -> SchedulerCfg {
        SchedulerCfg {
            max_in_flight: self.max_in_flight,
            proxy_max_concurrent: self.proxy_max_concurrent,
            default_interval_secs: self.default_interval_secs,
        }
    }

    pub fn worker_cfg(&self) -> WorkerCfg {
        WorkerCfg {
            workers: self.workers,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            browser_timeout: Duration::from_secs(self.browser_session_max_secs + 15),
            filter_failure_threshold: self.filter_failure_threshold,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.notify_max_attempts.max(1),
            base_delay: Duration::from_millis(self.notify_base_delay_ms),
            max_delay: Duration::from_millis(self.notify_max_delay_ms),
        }
    }
}

/// Contents of the registry file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub default_proxy: Option<String>,
    #[serde(default, rename = "watch")]
    pub watches: Vec<Watch>,
    #[serde(default, rename = "tag")]
    pub tags: Vec<Tag>,
    #[serde(default, rename = "proxy")]
    pub proxies: Vec<ProxyEndpoint>,
}

impl RegistryFile {
    fn check(mut self) -> Result<Self> {
        for p in &self.proxies {
            p.parsed()?;
        }
        if let Some(key) = &self.default_proxy {
            if !self.proxies.iter().any(|p| &p.key == key) {
                return Err(anyhow!("default_proxy '{key}' is not a configured proxy"));
            }
        }
        assign_stable_ids(&mut self.watches);
        let mut seen = std::collections::HashSet::new();
        for w in &self.watches {
            if !seen.insert(w.uuid) {
                return Err(anyhow!("duplicate watch uuid {}", w.uuid));
            }
        }
        Ok(self)
    }
}

/// Entries without a uuid get one derived from their url, so history and
/// per-watch state survive a restart. Repeats of a url are numbered in file
/// order.
fn assign_stable_ids(watches: &mut [Watch]) {
    let mut repeats: HashMap<String, u32> = HashMap::new();
    for w in watches.iter_mut().filter(|w| w.uuid.is_nil()) {
        let n = repeats.entry(w.url.clone()).or_insert(0);
        let name = match *n {
            0 => w.url.clone(),
            k => format!("{}#{k}", w.url),
        };
        *n += 1;
        w.uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes());
    }
}

/// Load the registry from an explicit path. TOML or JSON.
pub fn load_registry_from(path: &Path) -> Result<RegistryFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading registry from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_registry(&content, &ext).with_context(|| format!("parsing {}", path.display()))
}

/// Registry via env var + fallbacks:
/// 1) $WATCHES_PATH
/// 2) config/watches.toml
/// 3) config/watches.json
///
/// No file at all means an empty registry.
pub fn load_registry_default() -> Result<RegistryFile> {
    if let Some(p) = env_opt(ENV_WATCHES_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_registry_from(&pb);
        }
        return Err(anyhow!("{ENV_WATCHES_PATH} points to non-existent path"));
    }
    for fallback in [FALLBACK_TOML, FALLBACK_JSON] {
        let p = PathBuf::from(fallback);
        if p.exists() {
            return load_registry_from(&p);
        }
    }
    Ok(RegistryFile::default())
}

pub fn parse_registry(s: &str, hint_ext: &str) -> Result<RegistryFile> {
    let parsed: RegistryFile = if hint_ext == "json" || s.trim_start().starts_with('{') {
        serde_json::from_str(s).context("invalid JSON registry")?
    } else {
        toml::from_str(s).context("invalid TOML registry")?
    };
    parsed.check()
}
