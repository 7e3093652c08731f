// tests/metrics.rs
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use tower::ServiceExt;

use page_sentinel::config::{parse_registry, AppConfig};
use page_sentinel::fetch::http::PlainHttpFetcher;
use page_sentinel::fetch::FetcherSet;
use page_sentinel::metrics::Metrics;
use page_sentinel::store::MemoryStore;
use page_sentinel::{router, Engine};

#[tokio::test]
async fn metrics_endpoint_contains_expected_series() {
    // Recorder first, so the check below lands in it.
    let metrics = Metrics::init().expect("recorder");

    // Port 1 refuses connections: the check fails fast and still counts.
    let file = parse_registry(
        r#"
[[watch]]
url = "http://127.0.0.1:1/"
"#,
        "toml",
    )
    .unwrap();
    let engine = Arc::new(
        Engine::build(
            AppConfig::default(),
            file,
            FetcherSet::http_only(Arc::new(PlainHttpFetcher::new(2).unwrap())),
            Arc::new(MemoryStore::new()),
        )
        .unwrap(),
    );
    let id = engine.registry.view().watches[0].0.uuid;
    let job = engine.scheduler.recheck(id).unwrap();
    let report = engine.worker.run_job(job).await;
    assert!(report.error.is_some());

    let app = router(engine, Some(&metrics));
    let resp = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    // axum::body::to_bytes requires an explicit limit
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap(); // 1 MiB
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "watch_checks_total",
        "watch_check_errors_total",
        "fetch_duration_ms",
    ] {
        assert!(
            text.contains(needle),
            "metrics exposition missing '{needle}'\n{text}"
        );
    }
}

#[tokio::test]
async fn init_is_idempotent() {
    let _a = Metrics::init().expect("first init");
    let b = Metrics::init().expect("second init");
    metrics::counter!("watch_checks_total").increment(0);
    assert!(b.handle.render().contains("watch_checks_total"));
}
