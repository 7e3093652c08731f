// src/ws.rs
//! `GET /ws`: realtime events for UI clients.
//!
//! Clients start subscribed to everything. Commands (JSON text frames):
//!
//! ```text
//! {"command": "subscribe",   "uuids": ["*"] | ["<uuid>", ...]}
//! {"command": "unsubscribe", "uuids": ["<uuid>", ...]}
//! {"command": "full_refresh"}
//! ```
//!
//! Unsubscribing while subscribed to `"*"` excludes those ids until the next
//! `"*"` subscribe.
//!
//! `full_refresh` replays current state, which is how a client that lagged
//! behind the event bus reconciles.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::api::AppState;
use crate::broadcast::{RealtimeEvent, WatchUpdate};
use crate::engine::Engine;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    all: bool,
    ids: HashSet<Uuid>,
    /// Ids unsubscribed while subscribed to everything.
    excluded: HashSet<Uuid>,
}

impl Default for Subscription {
    fn default() -> Self {
        Self {
            all: true,
            ids: HashSet::new(),
            excluded: HashSet::new(),
        }
    }
}

impl Subscription {
    /// A `"*"` entry subscribes to everything; otherwise only listed ids.
    pub fn subscribe(&mut self, uuids: &[String]) {
        if uuids.iter().any(|u| u == "*") {
            self.all = true;
            self.ids.clear();
            self.excluded.clear();
            return;
        }
        if self.all {
            self.all = false;
            self.ids.clear();
            self.excluded.clear();
        }
        self.ids.extend(uuids.iter().filter_map(|u| u.parse::<Uuid>().ok()));
    }

    pub fn unsubscribe(&mut self, uuids: &[String]) {
        for u in uuids.iter().filter_map(|u| u.parse::<Uuid>().ok()) {
            if self.all {
                self.excluded.insert(u);
            } else {
                self.ids.remove(&u);
            }
        }
    }

    /// Broadcast-wide events always pass.
    pub fn matches(&self, ev: &RealtimeEvent) -> bool {
        match ev.watch_id() {
            None => true,
            Some(id) => self.wants(id),
        }
    }

    fn wants(&self, id: Uuid) -> bool {
        if self.all {
            !self.excluded.contains(&id)
        } else {
            self.ids.contains(&id)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ClientCommand {
    Subscribe {
        #[serde(default)]
        uuids: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        uuids: Vec<String>,
    },
    FullRefresh,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.engine.events.subscribe();
    ws.on_upgrade(move |socket| run_connection(socket, rx, state))
}

/// Current state as a burst of events, filtered by the subscription.
pub fn snapshot_events(engine: &Engine, subs: &Subscription) -> Vec<RealtimeEvent> {
    let now = Utc::now();
    let view = engine.registry.view();
    let mut out = vec![
        RealtimeEvent::stats(&engine.registry.counts()),
        RealtimeEvent::queue_size(engine.queue.len()),
    ];
    out.extend(
        view.watches
            .iter()
            .filter(|(w, _)| subs.wants(w.uuid))
            .map(|(w, s)| RealtimeEvent::WatchUpdate(WatchUpdate::new(w, s, now))),
    );
    out
}

fn encode(ev: &RealtimeEvent) -> Option<Message> {
    serde_json::to_string(ev).ok().map(Message::text)
}

async fn run_connection(socket: WebSocket, mut rx: broadcast::Receiver<RealtimeEvent>, state: AppState) {
    let (mut tx, mut incoming) = socket.split();
    let mut subs = Subscription::default();

    loop {
        tokio::select! {
            msg = incoming.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => continue,
                };
                let replies = match serde_json::from_str::<ClientCommand>(text.as_str()) {
                    Ok(ClientCommand::Subscribe { uuids }) => {
                        subs.subscribe(&uuids);
                        Vec::new()
                    }
                    Ok(ClientCommand::Unsubscribe { uuids }) => {
                        subs.unsubscribe(&uuids);
                        Vec::new()
                    }
                    Ok(ClientCommand::FullRefresh) => snapshot_events(&state.engine, &subs),
                    Err(e) => vec![RealtimeEvent::operation("ws_command", None, Err(e.to_string()))],
                };
                let mut failed = false;
                for ev in &replies {
                    if let Some(m) = encode(ev) {
                        if tx.send(m).await.is_err() {
                            failed = true;
                            break;
                        }
                    }
                }
                if failed {
                    break;
                }
            }
            ev = rx.recv() => {
                match ev {
                    Ok(ev) if subs.matches(&ev) => {
                        if let Some(m) = encode(&ev) {
                            if tx.send(m).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, "ws client lagged behind event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    tracing::debug!("ws connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_filters_watch_events_only() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut s = Subscription::default();
        assert!(s.matches(&RealtimeEvent::WatchDeleted { uuid: b }));

        s.subscribe(&[a.to_string()]);
        assert!(s.matches(&RealtimeEvent::WatchDeleted { uuid: a }));
        assert!(!s.matches(&RealtimeEvent::WatchDeleted { uuid: b }));
        assert!(s.matches(&RealtimeEvent::queue_size(1)));

        s.unsubscribe(&[a.to_string()]);
        assert!(!s.matches(&RealtimeEvent::WatchDeleted { uuid: a }));
        s.subscribe(&["*".to_string()]);
        assert!(s.matches(&RealtimeEvent::WatchDeleted { uuid: b }));
    }

    #[test]
    fn unsubscribe_carves_out_of_everything() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut s = Subscription::default();
        s.unsubscribe(&[a.to_string()]);
        assert!(!s.matches(&RealtimeEvent::WatchDeleted { uuid: a }));
        assert!(s.matches(&RealtimeEvent::WatchDeleted { uuid: b }));
        assert!(s.matches(&RealtimeEvent::queue_size(3)));

        s.subscribe(&["*".to_string()]);
        assert!(s.matches(&RealtimeEvent::WatchDeleted { uuid: a }));
    }

    #[test]
    fn commands_parse() {
        let c: ClientCommand = serde_json::from_str(r#"{"command":"full_refresh"}"#).unwrap();
        assert!(matches!(c, ClientCommand::FullRefresh));
        let c: ClientCommand =
            serde_json::from_str(r#"{"command":"subscribe","uuids":["*"]}"#).unwrap();
        assert!(matches!(c, ClientCommand::Subscribe { uuids } if uuids == ["*"]));
    }
}
