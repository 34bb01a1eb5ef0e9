/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use chapel_protocol::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod rooms;

use rooms::{ConnId, Outbox, Rooms};

#[derive(Clone, Debug)]
pub struct RendezvousConfig {
    pub bind: SocketAddr,
    pub max_pending_per_room: usize,
    pub disconnect_grace_secs: u64,
    pub ping_secs: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8790)),
            max_pending_per_room: 64,
            disconnect_grace_secs: 5,
            ping_secs: 15,
        }
    }
}

pub fn load_config() -> anyhow::Result<RendezvousConfig> {
    let defaults = RendezvousConfig::default();
    let bind = match std::env::var("CHAPEL_RENDEZVOUS_BIND") {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("CHAPEL_RENDEZVOUS_BIND invalid: {e}"))?,
        Err(_) => defaults.bind,
    };
    let env_u64 = |key: &str, default: u64| {
        std::env::var(key)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(default)
    };
    Ok(RendezvousConfig {
        bind,
        max_pending_per_room: env_u64(
            "CHAPEL_RENDEZVOUS_MAX_PENDING",
            defaults.max_pending_per_room as u64,
        )
        .clamp(1, 4096) as usize,
        disconnect_grace_secs: env_u64("CHAPEL_RENDEZVOUS_GRACE_SECS", defaults.disconnect_grace_secs)
            .min(300),
        ping_secs: env_u64("CHAPEL_RENDEZVOUS_PING_SECS", defaults.ping_secs).clamp(1, 300),
    })
}

#[derive(Clone)]
pub struct AppState {
    cfg: RendezvousConfig,
    rooms: Arc<Mutex<Rooms>>,
    conns: Arc<RwLock<HashMap<ConnId, mpsc::Sender<ServerMessage>>>>,
    next_conn: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(cfg: RendezvousConfig) -> Self {
        let rooms = Rooms::new(cfg.max_pending_per_room);
        Self {
            cfg,
            rooms: Arc::new(Mutex::new(rooms)),
            conns: Arc::new(RwLock::new(HashMap::new())),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    async fn dispatch(&self, outbox: Outbox) {
        if outbox.is_empty() {
            return;
        }
        let conns = self.conns.read().await;
        for (conn, msg) in outbox {
            let Some(tx) = conns.get(&conn) else {
                debug!(conn, "dropping frame for closed connection");
                continue;
            };
            if tx.try_send(msg).is_err() {
                warn!(conn, "connection outbox full or closed, frame dropped");
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(rendezvous_ws))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serves until `shutdown` is cancelled.
pub async fn serve(
    listener: tokio::net::TcpListener,
    cfg: RendezvousConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(AppState::new(cfg));
    info!("rendezvous listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn rendezvous_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(64);
    state.conns.write().await.insert(conn, tx);
    info!(conn, "participant connected");

    let cancel = CancellationToken::new();
    let cancel_writer = cancel.clone();
    let ping_secs = state.cfg.ping_secs;
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(Duration::from_secs(ping_secs));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel_writer.cancelled() => break,
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let json = match serde_json::to_string(&msg) {
                        Ok(v) => v,
                        Err(e) => {
                            error!(conn, "serialize frame failed: {e}");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        let msg: ClientMessage = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                warn!(conn, "bad frame: {e}");
                state
                    .dispatch(vec![(
                        conn,
                        ServerMessage::Error {
                            message: format!("bad frame: {e}"),
                        },
                    )])
                    .await;
                continue;
            }
        };
        let outbox = state.rooms.lock().await.handle(conn, msg);
        state.dispatch(outbox).await;
    }

    cancel.cancel();
    let _ = writer.await;
    state.conns.write().await.remove(&conn);

    let detached = state.rooms.lock().await.detach(conn);
    for d in detached {
        let state = state.clone();
        let grace = Duration::from_secs(state.cfg.disconnect_grace_secs);
        info!(room=%d.room_id, user=%d.user, "participant detached, waiting {}s", grace.as_secs());
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let outbox = state.rooms.lock().await.expire(&d);
            state.dispatch(outbox).await;
        });
    }
    info!(conn, "participant disconnected");
}
