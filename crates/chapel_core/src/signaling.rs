/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Rendezvous channel: one WebSocket per call, relaying join/offer/answer/candidates.

use async_trait::async_trait;
use chapel_protocol::{
    ClientMessage, IceCandidate, ParticipantId, RoomId, ServerMessage, SessionDescription,
};
use futures_util::{Sink, SinkExt, StreamExt};
use rand::{thread_rng, Rng};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SignalingConfig;
use crate::error::SignalingError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Offer/answer/candidate payloads exchanged through the rendezvous.
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationMessage {
    Offer {
        room_id: RoomId,
        sdp: SessionDescription,
    },
    Answer {
        room_id: RoomId,
        sdp: SessionDescription,
    },
    IceCandidate {
        room_id: RoomId,
        candidate: IceCandidate,
    },
}

impl NegotiationMessage {
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Offer { room_id, .. }
            | Self::Answer { room_id, .. }
            | Self::IceCandidate { room_id, .. } => room_id,
        }
    }
}

impl From<NegotiationMessage> for ClientMessage {
    fn from(m: NegotiationMessage) -> Self {
        match m {
            NegotiationMessage::Offer { room_id, sdp } => ClientMessage::Offer { room_id, sdp },
            NegotiationMessage::Answer { room_id, sdp } => ClientMessage::Answer { room_id, sdp },
            NegotiationMessage::IceCandidate { room_id, candidate } => {
                ClientMessage::IceCandidate { room_id, candidate }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// We are the first member: the initiator.
    RoomCreated { room_id: RoomId },
    /// We are the second member: the responder.
    RoomJoined { room_id: RoomId },
    RoomFull { room_id: RoomId },
    Negotiation(NegotiationMessage),
    PeerDisconnected { room_id: RoomId },
    /// Transport came back after a drop; the last join was replayed.
    Reconnected,
    /// Transport lost and every reconnect attempt failed.
    ConnectionError(String),
}

impl SignalingEvent {
    /// `None` for server-side error frames, which are only logged.
    pub fn from_server(msg: ServerMessage) -> Option<Self> {
        Some(match msg {
            ServerMessage::RoomCreated { room_id } => Self::RoomCreated { room_id },
            ServerMessage::RoomJoined { room_id } => Self::RoomJoined { room_id },
            ServerMessage::RoomFull { room_id } => Self::RoomFull { room_id },
            ServerMessage::Offer { room_id, sdp } => {
                Self::Negotiation(NegotiationMessage::Offer { room_id, sdp })
            }
            ServerMessage::Answer { room_id, sdp } => {
                Self::Negotiation(NegotiationMessage::Answer { room_id, sdp })
            }
            ServerMessage::IceCandidate { room_id, candidate } => {
                Self::Negotiation(NegotiationMessage::IceCandidate { room_id, candidate })
            }
            ServerMessage::UserDisconnected { room_id } => Self::PeerDisconnected { room_id },
            ServerMessage::Error { message } => {
                warn!("rendezvous error: {message}");
                return None;
            }
        })
    }
}

pub type SignalingEvents = mpsc::UnboundedReceiver<SignalingEvent>;

/// Outbound half of a connected signaling channel.
///
/// All methods queue and return immediately; delivery is best-effort.
pub trait SignalingLink: Send + Sync {
    fn join_room(&self, room_id: RoomId, participant: ParticipantId) -> Result<(), SignalingError>;
    fn send(&self, msg: NegotiationMessage) -> Result<(), SignalingError>;
    /// No-op when not joined.
    fn leave_room(&self) -> Result<(), SignalingError>;
    /// Idempotent.
    fn disconnect(&self);
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<(Box<dyn SignalingLink>, SignalingEvents), SignalingError>;
}

/// WebSocket connector for the rendezvous server.
pub struct WsSignaling {
    cfg: SignalingConfig,
}

impl WsSignaling {
    pub fn new(cfg: SignalingConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl SignalingConnector for WsSignaling {
    async fn connect(&self) -> Result<(Box<dyn SignalingLink>, SignalingEvents), SignalingError> {
        let stop = CancellationToken::new();
        info!(url=%self.cfg.url, "connecting signaling");
        let ws = dial(&self.cfg, &stop).await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_channel(self.cfg.clone(), ws, cmd_rx, ev_tx, stop.clone()));
        let link = WsLink {
            cmds: cmd_tx,
            stop,
            joined: Mutex::new(None),
        };
        Ok((Box::new(link), ev_rx))
    }
}

enum Command {
    Send(ClientMessage),
    Close,
}

struct WsLink {
    cmds: mpsc::UnboundedSender<Command>,
    stop: CancellationToken,
    joined: Mutex<Option<(RoomId, ParticipantId)>>,
}

impl WsLink {
    fn queue(&self, msg: ClientMessage) -> Result<(), SignalingError> {
        self.cmds
            .send(Command::Send(msg))
            .map_err(|_| SignalingError::Closed)
    }
}

impl SignalingLink for WsLink {
    fn join_room(&self, room_id: RoomId, participant: ParticipantId) -> Result<(), SignalingError> {
        *self.joined.lock().unwrap_or_else(|e| e.into_inner()) = Some((room_id.clone(), participant));
        self.queue(ClientMessage::JoinRoom {
            room_id,
            user_id: participant,
        })
    }

    fn send(&self, msg: NegotiationMessage) -> Result<(), SignalingError> {
        self.queue(msg.into())
    }

    fn leave_room(&self) -> Result<(), SignalingError> {
        let joined = self.joined.lock().unwrap_or_else(|e| e.into_inner()).take();
        match joined {
            Some((room_id, user_id)) => self.queue(ClientMessage::LeaveRoom { room_id, user_id }),
            None => Ok(()),
        }
    }

    fn disconnect(&self) {
        let _ = self.cmds.send(Command::Close);
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Exponential backoff with additive jitter, capped.
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        let jitter_ms: u64 = thread_rng().gen_range(0..=200);
        base + Duration::from_millis(jitter_ms)
    }
}

async fn dial(cfg: &SignalingConfig, stop: &CancellationToken) -> Result<WsStream, SignalingError> {
    let mut backoff = Backoff::new(cfg.initial_backoff, cfg.max_backoff);
    let mut last_err = String::from("no attempt made");
    for attempt in 0..cfg.reconnect_attempts {
        if attempt > 0 {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = stop.cancelled() => return Err(SignalingError::Closed),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let res = tokio::select! {
            _ = stop.cancelled() => return Err(SignalingError::Closed),
            res = tokio_tungstenite::connect_async(cfg.url.as_str()) => res,
        };
        match res {
            Ok((ws, _)) => return Ok(ws),
            Err(e) => {
                warn!(attempt, url=%cfg.url, "signaling connect failed: {e}");
                last_err = e.to_string();
            }
        }
    }
    Err(SignalingError::Connect(last_err))
}

async fn run_channel(
    cfg: SignalingConfig,
    mut ws: WsStream,
    mut cmds: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    stop: CancellationToken,
) {
    let mut last_join: Option<ClientMessage> = None;
    let mut reconnected = false;
    loop {
        let (mut ws_tx, mut ws_rx) = ws.split();
        if reconnected {
            if let Some(join) = &last_join {
                if let Err(e) = send_json(&mut ws_tx, join).await {
                    warn!("replaying join failed: {e}");
                }
            }
            let _ = events.send(SignalingEvent::Reconnected);
        }

        let mut ping = tokio::time::interval(cfg.ping_every);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let lost = loop {
            tokio::select! {
                biased;
                cmd = cmds.recv() => match cmd {
                    Some(Command::Send(msg)) => {
                        match &msg {
                            ClientMessage::JoinRoom { .. } => last_join = Some(msg.clone()),
                            ClientMessage::LeaveRoom { .. } => last_join = None,
                            _ => {}
                        }
                        if let Err(e) = send_json(&mut ws_tx, &msg).await {
                            break e;
                        }
                    }
                    Some(Command::Close) | None => {
                        let _ = ws_tx.close().await;
                        debug!("signaling closed");
                        return;
                    }
                },
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => {
                                if let Some(ev) = SignalingEvent::from_server(msg) {
                                    let _ = events.send(ev);
                                }
                            }
                            Err(e) => warn!("bad signaling frame: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(p))) => {
                        let _ = ws_tx.send(Message::Pong(p)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                },
                _ = ping.tick() => {
                    if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                        break e.to_string();
                    }
                }
                _ = stop.cancelled() => {
                    let _ = ws_tx.close().await;
                    return;
                }
            }
        };

        warn!("signaling connection lost: {lost}");
        match dial(&cfg, &stop).await {
            Ok(next) => {
                info!("signaling reconnected");
                ws = next;
                reconnected = true;
            }
            Err(SignalingError::Closed) => return,
            Err(e) => {
                let _ = events.send(SignalingEvent::ConnectionError(e.to_string()));
                return;
            }
        }
    }
}

async fn send_json<S>(ws_tx: &mut S, msg: &ClientMessage) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    ws_tx.send(Message::Text(json)).await.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut b = Backoff::new(Duration::from_millis(250), Duration::from_millis(800));
        let d: Vec<_> = (0..4).map(|_| b.next_delay()).collect();
        let jitter = Duration::from_millis(200);
        assert!(d[0] >= Duration::from_millis(250) && d[0] <= Duration::from_millis(250) + jitter);
        assert!(d[1] >= Duration::from_millis(500) && d[1] <= Duration::from_millis(500) + jitter);
        assert!(d[2] >= Duration::from_millis(800) && d[2] <= Duration::from_millis(800) + jitter);
        assert!(d[3] >= Duration::from_millis(800) && d[3] <= Duration::from_millis(800) + jitter);
    }

    #[test]
    fn server_frames_map_to_events() {
        let room = RoomId::new("42");
        assert_eq!(
            SignalingEvent::from_server(ServerMessage::RoomCreated {
                room_id: room.clone()
            }),
            Some(SignalingEvent::RoomCreated {
                room_id: room.clone()
            })
        );
        assert_eq!(
            SignalingEvent::from_server(ServerMessage::UserDisconnected {
                room_id: room.clone()
            }),
            Some(SignalingEvent::PeerDisconnected {
                room_id: room.clone()
            })
        );
        let offer = SessionDescription::offer("v=0");
        assert_eq!(
            SignalingEvent::from_server(ServerMessage::Offer {
                room_id: room.clone(),
                sdp: offer.clone()
            }),
            Some(SignalingEvent::Negotiation(NegotiationMessage::Offer {
                room_id: room,
                sdp: offer
            }))
        );
        assert_eq!(
            SignalingEvent::from_server(ServerMessage::Error {
                message: "nope".into()
            }),
            None
        );
    }

    #[tokio::test]
    async fn connect_gives_up_after_bounded_attempts() {
        let cfg = SignalingConfig {
            url: "ws://127.0.0.1:1/ws".to_string(),
            reconnect_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
            ping_every: Duration::from_secs(10),
        };
        let err = WsSignaling::new(cfg).connect().await.err().unwrap();
        assert!(matches!(err, SignalingError::Connect(_)));
    }
}
