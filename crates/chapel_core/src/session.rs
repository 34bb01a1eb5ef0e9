/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! The call state machine.
//!
//! One actor task per call owns the media source, the signaling link and the
//! peer connection; a cloneable [`CallSession`] handle sends it commands and
//! the caller observes progress through [`CallEvent`]s.

use chapel_protocol::{ParticipantId, RoomId};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::CallConfig;
use crate::error::{AcquisitionError, CallError, SignalingError};
use crate::media::{open_stream, CaptureBackend, LocalMediaStream, MediaSource, TrackKind};
use crate::peer::{
    BackendEvent, ConnectionState, PeerBackendFactory, PeerConnectionManager, PeerEvent,
    RemoteMediaStream, Role,
};
use crate::signaling::{
    NegotiationMessage, SignalingConnector, SignalingEvent, SignalingEvents, SignalingLink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    AcquiringMedia,
    JoiningRoom,
    AwaitingOffer,
    AwaitingAnswer,
    /// Descriptions exchanged, waiting for connectivity.
    Connecting,
    Connected,
    Disconnected,
    Closed,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Closed | CallState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    PeerLeft,
    LocalHangup,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    StateChanged {
        state: CallState,
    },
    LocalStreamReady {
        stream_id: String,
        audio: bool,
        video: bool,
    },
    RemoteStreamReady {
        stream: RemoteMediaStream,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    Error {
        error: CallError,
    },
}

pub struct CallDeps {
    pub capture: Arc<dyn CaptureBackend>,
    pub signaling: Arc<dyn SignalingConnector>,
    pub peers: Arc<dyn PeerBackendFactory>,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// From start until the server tells us our role.
    pub join: Duration,
    /// From peer connection creation until the remote description is applied.
    pub negotiation: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            join: Duration::from_secs(15),
            negotiation: Duration::from_secs(30),
        }
    }
}

impl From<&CallConfig> for SessionTimeouts {
    fn from(cfg: &CallConfig) -> Self {
        Self {
            join: cfg.join_timeout(),
            negotiation: cfg.negotiation_timeout(),
        }
    }
}

enum Command {
    Start {
        room_id: RoomId,
        participant: ParticipantId,
        want_video: bool,
    },
    End {
        done: oneshot::Sender<()>,
    },
    ToggleAudio {
        reply: oneshot::Sender<bool>,
    },
    ToggleVideo {
        reply: oneshot::Sender<bool>,
    },
    SwitchCamera {
        reply: oneshot::Sender<bool>,
    },
}

/// Handle to one call attempt. Dropping every clone tears the call down.
#[derive(Clone)]
pub struct CallSession {
    cmds: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<CallState>,
}

impl CallSession {
    /// Spawns the session actor on the current runtime.
    pub fn spawn(
        deps: CallDeps,
        timeouts: SessionTimeouts,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let actor = CallActor {
            media: MediaSource::new(deps.capture.clone()),
            deps,
            timeouts,
            events: ev_tx,
            state_tx,
            state: CallState::Idle,
            room_id: None,
            participant: None,
            role: None,
            acquiring: None,
            connecting: None,
            link: None,
            signals: None,
            peer: None,
            peer_events: None,
            early: Vec::new(),
            join_deadline: None,
            negotiation_deadline: None,
            torn_down: false,
        };
        tokio::spawn(actor.run(cmd_rx));
        (
            Self {
                cmds: cmd_tx,
                state: state_rx,
            },
            ev_rx,
        )
    }

    /// Begins the attempt. Ignored unless the session is still idle.
    pub fn start(&self, room_id: RoomId, participant: ParticipantId, want_video: bool) {
        let _ = self.cmds.send(Command::Start {
            room_id,
            participant,
            want_video,
        });
    }

    /// Hangs up and waits until teardown has run. Repeated calls are no-ops.
    pub async fn end(&self) {
        let (done, wait) = oneshot::channel();
        if self.cmds.send(Command::End { done }).is_ok() {
            let _ = wait.await;
        }
    }

    /// Returns whether audio is now enabled.
    pub async fn toggle_audio(&self) -> bool {
        self.ask(|reply| Command::ToggleAudio { reply }).await
    }

    pub async fn toggle_video(&self) -> bool {
        self.ask(|reply| Command::ToggleVideo { reply }).await
    }

    /// Returns whether the camera actually changed.
    pub async fn switch_camera(&self) -> bool {
        self.ask(|reply| Command::SwitchCamera { reply }).await
    }

    async fn ask(&self, cmd: impl FnOnce(oneshot::Sender<bool>) -> Command) -> bool {
        let (reply, wait) = oneshot::channel();
        if self.cmds.send(cmd(reply)).is_err() {
            return false;
        }
        wait.await.unwrap_or(false)
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }
}

type Connected = Result<(Box<dyn SignalingLink>, SignalingEvents), SignalingError>;

struct CallActor {
    deps: CallDeps,
    timeouts: SessionTimeouts,
    events: mpsc::UnboundedSender<CallEvent>,
    state_tx: watch::Sender<CallState>,
    state: CallState,
    room_id: Option<RoomId>,
    participant: Option<ParticipantId>,
    role: Option<Role>,
    media: MediaSource,
    acquiring: Option<JoinHandle<Result<LocalMediaStream, AcquisitionError>>>,
    connecting: Option<JoinHandle<Connected>>,
    link: Option<Box<dyn SignalingLink>>,
    signals: Option<SignalingEvents>,
    peer: Option<PeerConnectionManager>,
    peer_events: Option<mpsc::UnboundedReceiver<BackendEvent>>,
    /// Negotiation frames that beat the peer connection.
    early: Vec<NegotiationMessage>,
    join_deadline: Option<Instant>,
    negotiation_deadline: Option<Instant>,
    torn_down: bool,
}

async fn join_opt<T>(handle: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match handle {
        Some(h) => h.await,
        None => std::future::pending().await,
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl CallActor {
    async fn run(mut self, mut cmds: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = cmds.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => {
                        self.teardown(DisconnectReason::LocalHangup).await;
                        break;
                    }
                },
                res = join_opt(&mut self.acquiring) => {
                    self.acquiring = None;
                    self.on_media(res).await;
                }
                res = join_opt(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_signaling_connected(res).await;
                }
                ev = recv_opt(&mut self.signals) => match ev {
                    Some(ev) => self.on_signal(ev).await,
                    None => self.signals = None,
                },
                ev = recv_opt(&mut self.peer_events) => match ev {
                    Some(ev) => self.on_peer_event(ev).await,
                    None => self.peer_events = None,
                },
                _ = sleep_opt(deadline) => self.on_deadline(),
            }
        }
        debug!("call session actor stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.join_deadline, self.negotiation_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn set_state(&mut self, next: CallState) {
        if self.state == next {
            return;
        }
        info!(from=?self.state, to=?next, "call state");
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(CallEvent::StateChanged { state: next });
    }

    fn emit(&self, ev: CallEvent) {
        let _ = self.events.send(ev);
    }

    /// Terminal failure. Held resources stay until `end()` or drop.
    fn fail(&mut self, err: CallError) {
        if self.state.is_terminal() {
            debug!(error=%err, "failure after terminal state ignored");
            return;
        }
        error!(error=%err, "call failed");
        if let Some(h) = self.acquiring.take() {
            h.abort();
        }
        if let Some(h) = self.connecting.take() {
            h.abort();
        }
        self.join_deadline = None;
        self.negotiation_deadline = None;
        self.set_state(CallState::Failed);
        self.emit(CallEvent::Error { error: err });
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start {
                room_id,
                participant,
                want_video,
            } => self.start(room_id, participant, want_video),
            Command::End { done } => {
                self.teardown(DisconnectReason::LocalHangup).await;
                let _ = done.send(());
            }
            Command::ToggleAudio { reply } => {
                let _ = reply.send(self.media.toggle_audio());
            }
            Command::ToggleVideo { reply } => {
                let _ = reply.send(self.media.toggle_video());
            }
            Command::SwitchCamera { reply } => {
                let _ = reply.send(self.media.switch_camera().await);
            }
        }
    }

    fn start(&mut self, room_id: RoomId, participant: ParticipantId, want_video: bool) {
        if self.state != CallState::Idle || self.torn_down {
            warn!(state=?self.state, "start ignored, session already used");
            return;
        }
        info!(room=%room_id, %participant, want_video, "call starting");
        self.room_id = Some(room_id);
        self.participant = Some(participant);
        self.set_state(CallState::AcquiringMedia);

        self.acquiring = Some(tokio::spawn(open_stream(self.media.backend(), want_video)));
        let connector = self.deps.signaling.clone();
        self.connecting = Some(tokio::spawn(async move { connector.connect().await }));
        self.join_deadline = Some(Instant::now() + self.timeouts.join);
    }

    async fn on_media(&mut self, res: Result<Result<LocalMediaStream, AcquisitionError>, JoinError>) {
        let stream = match res {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.fail(e.into());
                return;
            }
            Err(e) => {
                error!("media acquisition task failed: {e}");
                self.fail(CallError::DeviceUnavailable {
                    device: TrackKind::Audio,
                });
                return;
            }
        };
        if self.torn_down || self.state.is_terminal() {
            // Dropping the stream releases the devices.
            return;
        }
        let ready = {
            let stream = self.media.install(stream);
            CallEvent::LocalStreamReady {
                stream_id: stream.stream_id().to_string(),
                audio: stream.audio().is_some(),
                video: stream.video().is_some(),
            }
        };
        self.emit(ready);
        if self.role.is_some() {
            self.begin_negotiation().await;
        } else {
            self.set_state(CallState::JoiningRoom);
        }
    }

    async fn on_signaling_connected(&mut self, res: Result<Connected, JoinError>) {
        let (link, signals) = match res {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                self.fail(e.into());
                return;
            }
            Err(e) => {
                self.fail(CallError::SignalingConnectionError {
                    reason: e.to_string(),
                });
                return;
            }
        };
        if self.torn_down || self.state.is_terminal() {
            link.disconnect();
            return;
        }
        let (Some(room_id), Some(participant)) = (self.room_id.clone(), self.participant) else {
            link.disconnect();
            return;
        };
        if let Err(e) = link.join_room(room_id, participant) {
            self.fail(e.into());
            return;
        }
        self.link = Some(link);
        self.signals = Some(signals);
    }

    fn same_room(&self, room_id: &RoomId) -> bool {
        if self.room_id.as_ref() == Some(room_id) {
            return true;
        }
        warn!(room=%room_id, "frame for another room ignored");
        false
    }

    async fn on_signal(&mut self, ev: SignalingEvent) {
        if self.state.is_terminal() {
            debug!(?ev, "signal after terminal state ignored");
            return;
        }
        match ev {
            SignalingEvent::RoomCreated { room_id } => {
                if self.same_room(&room_id) {
                    self.on_role(Role::Initiator).await;
                }
            }
            SignalingEvent::RoomJoined { room_id } => {
                if self.same_room(&room_id) {
                    self.on_role(Role::Responder).await;
                }
            }
            SignalingEvent::RoomFull { room_id } => {
                if self.same_room(&room_id) {
                    self.fail(CallError::RoomFull {
                        room_id: room_id.to_string(),
                    });
                }
            }
            SignalingEvent::Negotiation(msg) => {
                if !self.same_room(msg.room_id()) {
                    return;
                }
                if self.peer.is_none() {
                    debug!("negotiation frame buffered until the peer connection exists");
                    self.early.push(msg);
                    return;
                }
                self.on_negotiation(msg).await;
            }
            SignalingEvent::PeerDisconnected { room_id } => {
                if self.same_room(&room_id) {
                    info!("remote participant left");
                    self.teardown(DisconnectReason::PeerLeft).await;
                }
            }
            SignalingEvent::Reconnected => {
                warn!("signaling reconnected, frames sent during the gap may be lost");
            }
            SignalingEvent::ConnectionError(reason) => {
                self.link = None;
                self.signals = None;
                match self.state {
                    CallState::Connected | CallState::Disconnected => {
                        warn!("signaling lost mid-call, media path unaffected: {reason}");
                    }
                    _ => self.fail(CallError::SignalingConnectionError { reason }),
                }
            }
        }
    }

    async fn on_role(&mut self, role: Role) {
        match self.role {
            Some(current) if current == role => {
                debug!(?role, "role confirmed again after rejoin");
                return;
            }
            Some(current) => {
                warn!(?current, ?role, "conflicting role from server ignored");
                return;
            }
            None => {}
        }
        info!(?role, "role assigned");
        self.role = Some(role);
        self.join_deadline = None;
        if self.media.stream().is_some() {
            self.begin_negotiation().await;
        }
    }

    async fn begin_negotiation(&mut self) {
        if self.peer.is_some() {
            return;
        }
        let (Some(role), Some(room_id)) = (self.role, self.room_id.clone()) else {
            return;
        };
        let Some(local) = self.media.stream() else {
            return;
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let created =
            PeerConnectionManager::create_connection(&*self.deps.peers, role, local, tx).await;
        let peer = match created {
            Ok(p) => p,
            Err(e) => {
                self.fail(e.into());
                return;
            }
        };
        self.peer = Some(peer);
        self.peer_events = Some(rx);
        // Media may have waited on a permission prompt; the clock starts here.
        self.negotiation_deadline = Some(Instant::now() + self.timeouts.negotiation);

        match role {
            Role::Initiator => {
                let offer = match self.peer.as_mut() {
                    Some(peer) => peer.create_offer().await,
                    None => return,
                };
                match offer {
                    Ok(sdp) => {
                        self.send(NegotiationMessage::Offer { room_id, sdp });
                        self.set_state(CallState::AwaitingAnswer);
                    }
                    Err(e) => {
                        self.fail(e.into());
                        return;
                    }
                }
            }
            Role::Responder => self.set_state(CallState::AwaitingOffer),
        }

        for msg in std::mem::take(&mut self.early) {
            if self.state.is_terminal() {
                break;
            }
            self.on_negotiation(msg).await;
        }
    }

    async fn on_negotiation(&mut self, msg: NegotiationMessage) {
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        match msg {
            NegotiationMessage::Offer { room_id, sdp } => {
                if self.state != CallState::AwaitingOffer {
                    warn!(state=?self.state, "unexpected offer ignored");
                    return;
                }
                let applied = peer.apply_offer(sdp).await;
                match applied {
                    Ok(answer) => {
                        self.send(NegotiationMessage::Answer {
                            room_id,
                            sdp: answer,
                        });
                        self.negotiation_deadline = None;
                        self.set_state(CallState::Connecting);
                    }
                    Err(e) => self.fail(e.into()),
                }
            }
            NegotiationMessage::Answer { sdp, .. } => {
                if self.state != CallState::AwaitingAnswer {
                    warn!(state=?self.state, "unexpected answer ignored");
                    return;
                }
                let applied = peer.apply_answer(sdp).await;
                match applied {
                    Ok(()) => {
                        self.negotiation_deadline = None;
                        self.set_state(CallState::Connecting);
                    }
                    Err(e) => self.fail(e.into()),
                }
            }
            NegotiationMessage::IceCandidate { candidate, .. } => {
                let applied = peer.apply_remote_ice_candidate(candidate).await;
                if let Err(e) = applied {
                    warn!("remote candidate rejected: {e}");
                }
            }
        }
    }

    async fn on_peer_event(&mut self, ev: BackendEvent) {
        if self.state.is_terminal() {
            debug!(?ev, "peer event after terminal state ignored");
            return;
        }
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        let Some(ev) = peer.on_backend_event(ev) else {
            return;
        };
        match ev {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(room_id) = self.room_id.clone() {
                    self.send(NegotiationMessage::IceCandidate { room_id, candidate });
                }
            }
            PeerEvent::RemoteStreamReady(stream) => {
                info!(stream=%stream.stream_id, "remote stream ready");
                self.emit(CallEvent::RemoteStreamReady { stream });
            }
            PeerEvent::StateChanged(state) => self.on_connection_state(state),
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        if self.state.is_terminal() {
            return;
        }
        match state {
            ConnectionState::Connected => {
                self.negotiation_deadline = None;
                self.set_state(CallState::Connected);
            }
            ConnectionState::Disconnected => {
                if self.state == CallState::Connected {
                    self.set_state(CallState::Disconnected);
                }
            }
            ConnectionState::Failed => self.fail(CallError::IceFailure),
            ConnectionState::New | ConnectionState::Connecting | ConnectionState::Closed => {}
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        if self.join_deadline.is_some_and(|at| at <= now) {
            self.join_deadline = None;
            self.fail(CallError::SignalingTimeout {
                stage: "room join".to_string(),
            });
        } else if self.negotiation_deadline.is_some_and(|at| at <= now) {
            self.negotiation_deadline = None;
            self.fail(CallError::SignalingTimeout {
                stage: "offer/answer".to_string(),
            });
        }
    }

    fn send(&self, msg: NegotiationMessage) {
        match &self.link {
            Some(link) => {
                if let Err(e) = link.send(msg) {
                    warn!("signaling send failed: {e}");
                }
            }
            None => warn!("no signaling link, frame dropped"),
        }
    }

    /// Closes the peer connection, releases media, leaves the room and
    /// disconnects signaling, in that order. Runs at most once.
    async fn teardown(&mut self, reason: DisconnectReason) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if let Some(h) = self.acquiring.take() {
            h.abort();
        }
        if let Some(h) = self.connecting.take() {
            h.abort();
        }
        if let Some(mut peer) = self.peer.take() {
            peer.close().await;
        }
        self.peer_events = None;
        self.media.release();
        if let Some(link) = self.link.take() {
            if let Err(e) = link.leave_room() {
                debug!("leave room failed: {e}");
            }
            link.disconnect();
        }
        self.signals = None;
        self.early.clear();
        self.join_deadline = None;
        self.negotiation_deadline = None;

        if !self.state.is_terminal() {
            self.set_state(CallState::Closed);
            self.emit(CallEvent::Disconnected { reason });
        }
        info!("call torn down");
    }
}
