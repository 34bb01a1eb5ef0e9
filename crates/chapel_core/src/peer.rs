/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! One peer connection per call: role-checked negotiation, candidate
//! queueing, and connection-state bookkeeping over a pluggable backend.

use async_trait::async_trait;
use chapel_protocol::{IceCandidate, SdpKind, SessionDescription};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::PeerError;
use crate::media::{LocalMediaStream, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// First into the room; creates the offer.
    Initiator,
    /// Second into the room; answers.
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    /// Initiator: offer created and set locally, answer pending.
    HaveLocalOffer,
    /// Responder: remote offer applied, answer pending.
    HaveRemoteOffer,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub mime_type: String,
}

/// Tracks received from the other participant, grouped as one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteMediaStream {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

/// Receives depacketized payloads of remote tracks (the host's renderer).
pub trait RemoteMediaSink: Send + Sync {
    fn on_rtp(&self, track: &RemoteTrack, payload: &[u8]);
}

/// Raw notifications from a backend, before the manager filters them.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack {
        stream_id: String,
        track: RemoteTrack,
    },
    State(ConnectionState),
}

/// What the session needs to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteStreamReady(RemoteMediaStream),
    StateChanged(ConnectionState),
}

#[async_trait]
pub trait PeerBackend: Send + Sync {
    async fn add_track(&self, track: Arc<TrackLocalStaticSample>) -> anyhow::Result<()>;
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PeerBackendFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> anyhow::Result<Box<dyn PeerBackend>>;
}

pub struct PeerConnectionManager {
    backend: Box<dyn PeerBackend>,
    role: Role,
    negotiation: NegotiationState,
    state: ConnectionState,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    remote_stream: Option<RemoteMediaStream>,
}

impl PeerConnectionManager {
    /// Builds the connection and attaches every local track before any
    /// description exists, so the first offer/answer carries them.
    pub async fn create_connection(
        factory: &dyn PeerBackendFactory,
        role: Role,
        local: &LocalMediaStream,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<Self, PeerError> {
        let backend = factory.create(events).await.map_err(PeerError::backend)?;
        for track in local.tracks() {
            backend
                .add_track(track.rtp_track())
                .await
                .map_err(PeerError::backend)?;
        }
        info!(?role, stream=%local.stream_id(), "peer connection created");
        Ok(Self {
            backend,
            role,
            negotiation: NegotiationState::Stable,
            state: ConnectionState::New,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            remote_stream: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.state == ConnectionState::Closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    fn begin_connecting(&mut self) {
        if self.state == ConnectionState::New {
            self.state = ConnectionState::Connecting;
        }
    }

    pub async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.role != Role::Initiator || self.negotiation != NegotiationState::Stable {
            return Err(PeerError::InvalidNegotiationState(format!(
                "create_offer as {:?} in {:?}",
                self.role, self.negotiation
            )));
        }
        let offer = self.backend.create_offer().await.map_err(PeerError::backend)?;
        self.backend
            .set_local_description(offer.clone())
            .await
            .map_err(PeerError::backend)?;
        self.negotiation = NegotiationState::HaveLocalOffer;
        self.begin_connecting();
        Ok(offer)
    }

    /// Responder side: applies the remote offer and returns the answer to send.
    pub async fn apply_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        if self.role != Role::Responder
            || self.negotiation != NegotiationState::Stable
            || offer.kind != SdpKind::Offer
        {
            return Err(PeerError::InvalidNegotiationState(format!(
                "apply_offer as {:?} in {:?}",
                self.role, self.negotiation
            )));
        }
        self.backend
            .set_remote_description(offer)
            .await
            .map_err(PeerError::backend)?;
        self.negotiation = NegotiationState::HaveRemoteOffer;
        self.on_remote_description_set().await;
        self.begin_connecting();

        let answer = self.backend.create_answer().await.map_err(PeerError::backend)?;
        self.backend
            .set_local_description(answer.clone())
            .await
            .map_err(PeerError::backend)?;
        self.negotiation = NegotiationState::Complete;
        Ok(answer)
    }

    pub async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), PeerError> {
        self.ensure_open()?;
        if self.role != Role::Initiator
            || self.negotiation != NegotiationState::HaveLocalOffer
            || answer.kind != SdpKind::Answer
        {
            return Err(PeerError::InvalidNegotiationState(format!(
                "apply_answer as {:?} in {:?}",
                self.role, self.negotiation
            )));
        }
        self.backend
            .set_remote_description(answer)
            .await
            .map_err(PeerError::backend)?;
        self.negotiation = NegotiationState::Complete;
        self.on_remote_description_set().await;
        Ok(())
    }

    /// Candidates that arrive before the remote description are held and
    /// applied, in arrival order, right after it is set.
    pub async fn apply_remote_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), PeerError> {
        self.ensure_open()?;
        if !self.remote_description_set {
            debug!("queueing early remote candidate");
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        self.backend
            .add_ice_candidate(candidate)
            .await
            .map_err(PeerError::backend)
    }

    async fn on_remote_description_set(&mut self) {
        self.remote_description_set = true;
        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(count = pending.len(), "flushing queued remote candidates");
        }
        for c in pending {
            // One bad candidate must not stop the rest.
            if let Err(e) = self.backend.add_ice_candidate(c).await {
                warn!("queued candidate rejected: {e:#}");
            }
        }
    }

    /// Filters a backend notification; `None` means nothing for the session.
    pub fn on_backend_event(&mut self, ev: BackendEvent) -> Option<PeerEvent> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        match ev {
            BackendEvent::LocalCandidate(c) => Some(PeerEvent::LocalCandidate(c)),
            BackendEvent::RemoteTrack { stream_id, track } => match &mut self.remote_stream {
                Some(stream) => {
                    debug!(kind=%track.kind, "additional remote track");
                    stream.tracks.push(track);
                    None
                }
                None => {
                    let stream = RemoteMediaStream {
                        stream_id,
                        tracks: vec![track],
                    };
                    self.remote_stream = Some(stream.clone());
                    Some(PeerEvent::RemoteStreamReady(stream))
                }
            },
            BackendEvent::State(next) => {
                if !self.accepts(next) {
                    debug!(from=?self.state, to=?next, "ignoring connection state");
                    return None;
                }
                self.state = next;
                Some(PeerEvent::StateChanged(next))
            }
        }
    }

    fn accepts(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if next == self.state {
            return false;
        }
        match (self.state, next) {
            (Failed, _) => false,
            // Only close() produces Closed.
            (_, Closed) => false,
            (_, New) => false,
            (Connected | Disconnected, Connecting) => false,
            _ => true,
        }
    }

    /// Releases the connection. Later events and calls are ignored.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if let Err(e) = self.backend.close().await {
            warn!("peer close failed: {e:#}");
        }
        self.state = ConnectionState::Closed;
        self.pending_candidates.clear();
        info!("peer connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TestPatternCapture;
    use crate::media::open_stream;
    use crate::testing::{FakePeerFactory, PeerCall};

    fn cand(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    async fn manager(role: Role, factory: &FakePeerFactory) -> PeerConnectionManager {
        let local = open_stream(Arc::new(TestPatternCapture::new()), true)
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerConnectionManager::create_connection(factory, role, &local, tx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn tracks_are_attached_before_the_offer() {
        let factory = FakePeerFactory::new();
        let mut pcm = manager(Role::Initiator, &factory).await;
        let offer = pcm.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert_eq!(pcm.state(), ConnectionState::Connecting);
        let calls = factory.calls();
        assert_eq!(
            &calls[..4],
            &[
                PeerCall::AddTrack(TrackKind::Audio),
                PeerCall::AddTrack(TrackKind::Video),
                PeerCall::CreateOffer,
                PeerCall::SetLocal(SdpKind::Offer),
            ]
        );
    }

    #[tokio::test]
    async fn role_violations_are_rejected() {
        let factory = FakePeerFactory::new();
        let mut responder = manager(Role::Responder, &factory).await;
        assert!(matches!(
            responder.create_offer().await,
            Err(PeerError::InvalidNegotiationState(_))
        ));

        let mut initiator = manager(Role::Initiator, &factory).await;
        assert!(matches!(
            initiator.apply_offer(SessionDescription::offer("v=0")).await,
            Err(PeerError::InvalidNegotiationState(_))
        ));
        // No answer before our own offer.
        assert!(matches!(
            initiator.apply_answer(SessionDescription::answer("v=0")).await,
            Err(PeerError::InvalidNegotiationState(_))
        ));
    }

    #[tokio::test]
    async fn early_candidates_flush_in_order_after_remote_description() {
        let factory = FakePeerFactory::new();
        let mut pcm = manager(Role::Responder, &factory).await;
        pcm.apply_remote_ice_candidate(cand(1)).await.unwrap();
        pcm.apply_remote_ice_candidate(cand(2)).await.unwrap();
        assert_eq!(pcm.pending_candidates(), 2);
        assert!(!factory.calls().iter().any(|c| matches!(c, PeerCall::AddIce(_))));

        let answer = pcm.apply_offer(SessionDescription::offer("v=0")).await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        assert_eq!(pcm.pending_candidates(), 0);
        pcm.apply_remote_ice_candidate(cand(3)).await.unwrap();

        let calls = factory.calls();
        let set_remote = calls
            .iter()
            .position(|c| *c == PeerCall::SetRemote(SdpKind::Offer))
            .unwrap();
        let added: Vec<_> = calls
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c {
                PeerCall::AddIce(c) => Some((i, c.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(added.len(), 3);
        assert!(added.iter().all(|(i, _)| *i > set_remote));
        assert_eq!(
            added.into_iter().map(|(_, c)| c).collect::<Vec<_>>(),
            vec![cand(1).candidate, cand(2).candidate, cand(3).candidate]
        );
    }

    #[tokio::test]
    async fn remote_stream_is_announced_once() {
        let factory = FakePeerFactory::new();
        let mut pcm = manager(Role::Initiator, &factory).await;
        let track = |kind| RemoteTrack {
            id: format!("{kind}"),
            kind,
            mime_type: "audio/opus".into(),
        };
        let first = pcm.on_backend_event(BackendEvent::RemoteTrack {
            stream_id: "s".into(),
            track: track(TrackKind::Audio),
        });
        assert!(matches!(first, Some(PeerEvent::RemoteStreamReady(_))));
        let second = pcm.on_backend_event(BackendEvent::RemoteTrack {
            stream_id: "s".into(),
            track: track(TrackKind::Video),
        });
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn failed_is_sticky_and_close_gates_everything() {
        let factory = FakePeerFactory::new();
        let mut pcm = manager(Role::Initiator, &factory).await;
        pcm.create_offer().await.unwrap();
        assert_eq!(
            pcm.on_backend_event(BackendEvent::State(ConnectionState::Failed)),
            Some(PeerEvent::StateChanged(ConnectionState::Failed))
        );
        assert_eq!(
            pcm.on_backend_event(BackendEvent::State(ConnectionState::Connected)),
            None
        );

        pcm.close().await;
        pcm.close().await;
        assert_eq!(pcm.state(), ConnectionState::Closed);
        assert_eq!(
            factory
                .calls()
                .iter()
                .filter(|c| **c == PeerCall::Close)
                .count(),
            1
        );
        assert_eq!(pcm.on_backend_event(BackendEvent::LocalCandidate(cand(1))), None);
        assert!(matches!(
            pcm.apply_remote_ice_candidate(cand(1)).await,
            Err(PeerError::Closed)
        ));
    }
}
