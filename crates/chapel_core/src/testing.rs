/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-memory signaling and peer backends for tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chapel_protocol::{ClientMessage, IceCandidate, ParticipantId, RoomId, SdpKind, SessionDescription};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::SignalingError;
use crate::media::TrackKind;
use crate::peer::{BackendEvent, ConnectionState, PeerBackend, PeerBackendFactory};
use crate::signaling::{
    NegotiationMessage, SignalingConnector, SignalingEvent, SignalingEvents, SignalingLink,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct SignalingState {
    sent: Vec<ClientMessage>,
    events: Option<mpsc::UnboundedSender<SignalingEvent>>,
    fail_connect: Option<String>,
    connects: u32,
    disconnected: bool,
    joined: Option<(RoomId, ParticipantId)>,
}

/// Records outbound frames; tests inject inbound events with [`FakeSignaling::push`].
#[derive(Clone, Default)]
pub struct FakeSignaling {
    state: Arc<Mutex<SignalingState>>,
    gate: Option<Arc<Notify>>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: &str) -> Self {
        let s = Self::default();
        lock(&s.state).fail_connect = Some(reason.to_string());
        s
    }

    /// `connect()` blocks until the returned notify is signalled.
    pub fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let s = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (s, gate)
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        lock(&self.state).sent.clone()
    }

    pub fn connects(&self) -> u32 {
        lock(&self.state).connects
    }

    pub fn is_disconnected(&self) -> bool {
        lock(&self.state).disconnected
    }

    /// Delivers an inbound event; false when nothing is connected.
    pub fn push(&self, ev: SignalingEvent) -> bool {
        match &lock(&self.state).events {
            Some(tx) => tx.send(ev).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SignalingConnector for FakeSignaling {
    async fn connect(&self) -> Result<(Box<dyn SignalingLink>, SignalingEvents), SignalingError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let mut st = lock(&self.state);
        st.connects += 1;
        if let Some(reason) = &st.fail_connect {
            return Err(SignalingError::Connect(reason.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        st.events = Some(tx);
        st.disconnected = false;
        Ok((
            Box::new(FakeLink {
                state: self.state.clone(),
            }),
            rx,
        ))
    }
}

struct FakeLink {
    state: Arc<Mutex<SignalingState>>,
}

impl SignalingLink for FakeLink {
    fn join_room(&self, room_id: RoomId, participant: ParticipantId) -> Result<(), SignalingError> {
        let mut st = lock(&self.state);
        if st.disconnected {
            return Err(SignalingError::Closed);
        }
        st.joined = Some((room_id.clone(), participant));
        st.sent.push(ClientMessage::JoinRoom {
            room_id,
            user_id: participant,
        });
        Ok(())
    }

    fn send(&self, msg: NegotiationMessage) -> Result<(), SignalingError> {
        let mut st = lock(&self.state);
        if st.disconnected {
            return Err(SignalingError::Closed);
        }
        st.sent.push(msg.into());
        Ok(())
    }

    fn leave_room(&self) -> Result<(), SignalingError> {
        let mut st = lock(&self.state);
        if let Some((room_id, user_id)) = st.joined.take() {
            st.sent.push(ClientMessage::LeaveRoom { room_id, user_id });
        }
        Ok(())
    }

    fn disconnect(&self) {
        let mut st = lock(&self.state);
        st.disconnected = true;
        st.events = None;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    AddTrack(TrackKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddIce(String),
    Close,
}

#[derive(Default)]
struct PeerState {
    calls: Vec<PeerCall>,
    events: Option<mpsc::UnboundedSender<BackendEvent>>,
    fail_remote_description: bool,
    candidates: u32,
}

/// Scriptable peer backend. Every local description yields one host candidate.
#[derive(Clone, Default)]
pub struct FakePeerFactory {
    state: Arc<Mutex<PeerState>>,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_remote_description() -> Self {
        let f = Self::default();
        lock(&f.state).fail_remote_description = true;
        f
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        lock(&self.state).calls.clone()
    }

    /// Injects a backend event as if the platform produced it.
    pub fn emit(&self, ev: BackendEvent) -> bool {
        match &lock(&self.state).events {
            Some(tx) => tx.send(ev).is_ok(),
            None => false,
        }
    }

    pub fn set_state(&self, state: ConnectionState) -> bool {
        self.emit(BackendEvent::State(state))
    }
}

#[async_trait]
impl PeerBackendFactory for FakePeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<Box<dyn PeerBackend>> {
        lock(&self.state).events = Some(events);
        Ok(Box::new(FakePeer {
            state: self.state.clone(),
        }))
    }
}

struct FakePeer {
    state: Arc<Mutex<PeerState>>,
}

impl FakePeer {
    fn record(&self, call: PeerCall) {
        lock(&self.state).calls.push(call);
    }
}

#[async_trait]
impl PeerBackend for FakePeer {
    async fn add_track(&self, track: Arc<TrackLocalStaticSample>) -> Result<()> {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            _ => TrackKind::Audio,
        };
        self.record(PeerCall::AddTrack(kind));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(PeerCall::CreateOffer);
        Ok(SessionDescription::offer("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=fake-offer\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer("v=0\r\no=- 2 1 IN IP4 0.0.0.0\r\ns=fake-answer\r\n"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut st = lock(&self.state);
        st.calls.push(PeerCall::SetLocal(desc.kind));
        st.candidates += 1;
        let n = st.candidates;
        if let Some(tx) = &st.events {
            let _ = tx.send(BackendEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:{n} 1 udp 2122260223 192.0.2.{n} 5000 typ host"),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut st = lock(&self.state);
        if st.fail_remote_description {
            return Err(anyhow!("remote description rejected"));
        }
        st.calls.push(PeerCall::SetRemote(desc.kind));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(PeerCall::AddIce(candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut st = lock(&self.state);
        st.calls.push(PeerCall::Close);
        st.events = None;
        Ok(())
    }
}
