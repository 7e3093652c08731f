// src/api.rs
use std::sync::Arc;

use shuttle_axum::axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::engine::Engine;
use crate::metrics::Metrics;
use crate::notify::NotificationEvent;
use crate::proxy::{ProxyHealth, ProxyView};
use crate::registry::{Counts, WatchState};
use crate::watch::{FetchBackend, ProcessorKind};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/stats", get(stats))
        .route("/api/watches", get(list_watches))
        .route("/api/watches/{uuid}", get(get_watch).delete(delete_watch))
        .route("/api/watches/{uuid}/recheck", post(recheck))
        .route("/api/watches/{uuid}/pause", post(pause))
        .route("/api/watches/{uuid}/unpause", post(unpause))
        .route("/api/watches/{uuid}/mute", post(mute))
        .route("/api/watches/{uuid}/unmute", post(unmute))
        .route("/api/watches/{uuid}/viewed", post(viewed))
        .route("/api/proxies", get(list_proxies))
        .route("/api/proxies/check", post(check_proxies))
        .route("/api/notifications", get(notifications))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Full application router, `/metrics` included when a recorder is installed.
pub fn router(engine: Arc<Engine>, metrics: Option<&Metrics>) -> Router {
    let app = create_router(AppState { engine });
    match metrics {
        Some(m) => app.merge(m.router()),
        None => app,
    }
}

#[derive(serde::Serialize)]
struct ApiError {
    error: String,
}

fn err(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError { error: msg.into() })).into_response()
}

#[derive(serde::Serialize)]
struct WatchOut {
    uuid: Uuid,
    url: String,
    title: Option<String>,
    processor: ProcessorKind,
    fetch_backend: FetchBackend,
    paused: bool,
    muted: bool,
    tags: Vec<String>,
    proxy: Option<String>,
    state: WatchState,
}

fn watch_out(engine: &Engine, id: Uuid) -> Option<WatchOut> {
    let (w, state) = engine.registry.get(id)?;
    let tags = engine.registry.tags();
    let eff = crate::watch::EffectiveWatch::resolve(&w, &tags, engine.registry.default_proxy());
    Some(WatchOut {
        uuid: w.uuid,
        url: w.url.clone(),
        title: w.title.clone(),
        processor: w.processor,
        fetch_backend: w.fetch_backend,
        paused: w.paused,
        muted: eff.muted(),
        tags: w.tags.clone(),
        proxy: eff.proxy.map(str::to_string),
        state,
    })
}

async fn list_watches(State(state): State<AppState>) -> Json<Vec<WatchOut>> {
    let view = state.engine.registry.view();
    Json(
        view.watches
            .iter()
            .filter_map(|(w, _)| watch_out(&state.engine, w.uuid))
            .collect(),
    )
}

async fn get_watch(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match watch_out(&state.engine, id) {
        Some(w) => Json(w).into_response(),
        None => err(StatusCode::NOT_FOUND, format!("watch {id} not found")),
    }
}

async fn stats(State(state): State<AppState>) -> Json<Counts> {
    Json(state.engine.registry.counts())
}

fn op_result(state: &AppState, id: Uuid, r: anyhow::Result<()>, ok: StatusCode) -> Response {
    match r {
        Ok(()) => match watch_out(&state.engine, id) {
            Some(w) => (ok, Json(w)).into_response(),
            None => ok.into_response(),
        },
        Err(_) if state.engine.registry.get(id).is_none() => {
            err(StatusCode::NOT_FOUND, format!("watch {id} not found"))
        }
        Err(e) => err(StatusCode::CONFLICT, format!("{e:#}")),
    }
}

async fn recheck(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let r = state.engine.recheck(id);
    op_result(&state, id, r, StatusCode::ACCEPTED)
}

async fn pause(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let r = state.engine.set_paused(id, true);
    op_result(&state, id, r, StatusCode::OK)
}

async fn unpause(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let r = state.engine.set_paused(id, false);
    op_result(&state, id, r, StatusCode::OK)
}

async fn mute(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let r = state.engine.set_muted(id, true);
    op_result(&state, id, r, StatusCode::OK)
}

async fn unmute(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let r = state.engine.set_muted(id, false);
    op_result(&state, id, r, StatusCode::OK)
}

async fn viewed(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    let r = state.engine.mark_viewed(id);
    op_result(&state, id, r, StatusCode::OK)
}

async fn delete_watch(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.engine.delete(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => err(StatusCode::NOT_FOUND, format!("{e:#}")),
    }
}

async fn list_proxies(State(state): State<AppState>) -> Json<Vec<ProxyView>> {
    Json(state.engine.proxies.views())
}

#[derive(serde::Serialize)]
struct CheckOut {
    key: String,
    #[serde(flatten)]
    health: ProxyHealth,
}

async fn check_proxies(State(state): State<AppState>) -> Response {
    match state.engine.check_proxies().await {
        Some(rs) => Json(
            rs.into_iter()
                .map(|(key, health)| CheckOut { key, health })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        None => err(StatusCode::CONFLICT, "superseded by a newer check"),
    }
}

#[derive(serde::Deserialize)]
struct NotificationsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn notifications(
    State(state): State<AppState>,
    Query(q): Query<NotificationsQuery>,
) -> Json<Vec<NotificationEvent>> {
    Json(state.engine.notifier.log().last_n(q.limit))
}
