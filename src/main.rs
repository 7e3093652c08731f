//! page-sentinel: Binary Entrypoint
//! Boots the engine loops (scheduler, workers, proxy sweep) and serves the
//! Axum API through Shuttle.

use std::sync::Arc;

use page_sentinel::metrics::Metrics;
use page_sentinel::{init_tracing, router, Engine};
use shuttle_axum::ShuttleAxum;
use tokio_util::sync::CancellationToken;

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    init_tracing();

    let engine = Arc::new(Engine::from_env()?);

    let metrics = match Metrics::init() {
        Ok(m) => Some(m),
        Err(e) => {
            tracing::warn!(error = ?e, "metrics recorder unavailable; /metrics disabled");
            None
        }
    };

    // Loops run for the lifetime of the process.
    let shutdown = CancellationToken::new();
    let _handles = engine.start(&shutdown);

    Ok(router(engine, metrics.as_ref()).into())
}
