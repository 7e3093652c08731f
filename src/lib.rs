// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod broadcast;
pub mod cancel;
pub mod config;
pub mod dom;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod notify;
pub mod process;
pub mod proxy;
pub mod queue;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod watch;
pub mod worker;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ---- Re-exports for stable public API ----
pub use crate::api::router;
pub use crate::engine::Engine;
pub use crate::error::FetchError;

/// Install the global subscriber. `RUST_LOG` filters (default
/// `page_sentinel=info,warn`); `LOG_FORMAT=json` switches to JSON lines.
/// Safe to call more than once.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("page_sentinel=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json().with_current_span(false)).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Build the full in-process app from the environment, without starting the
/// background loops. Tests drive the engine through the returned router.
pub async fn app() -> anyhow::Result<Router> {
    let engine = Arc::new(Engine::from_env()?);
    let metrics = crate::metrics::Metrics::init()?;
    Ok(router(engine, Some(&metrics)))
}
