/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chapel_protocol::{IceCandidate, SdpKind, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceServerConfig;
use crate::media::TrackKind;
use crate::peer::{
    BackendEvent, ConnectionState, PeerBackend, PeerBackendFactory, RemoteMediaSink, RemoteTrack,
};

/// Builds webrtc-rs peer connections with default codecs and interceptors.
pub struct WebrtcPeerFactory {
    ice_servers: Vec<IceServerConfig>,
    sink: Option<Arc<dyn RemoteMediaSink>>,
}

impl WebrtcPeerFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            ice_servers,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn RemoteMediaSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .filter(|s| !s.urls.is_empty())
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect()
    }
}

#[async_trait]
impl PeerBackendFactory for WebrtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<Box<dyn PeerBackend>> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .context("register codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .context("register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: self.rtc_ice_servers(),
                ..Default::default()
            })
            .await
            .context("new peer connection")?;
        let pc = Arc::new(pc);
        install_callbacks(&pc, events, self.sink.clone());
        Ok(Box::new(WebrtcPeer { pc }))
    }
}

fn install_callbacks(
    pc: &Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<BackendEvent>,
    sink: Option<Arc<dyn RemoteMediaSink>>,
) {
    {
        let events = events.clone();
        pc.on_ice_candidate(Box::new(move |cand| {
            let events = events.clone();
            Box::pin(async move {
                let Some(cand) = cand else { return };
                match cand.to_json() {
                    Ok(init) => {
                        let _ = events.send(BackendEvent::LocalCandidate(from_rtc_candidate(init)));
                    }
                    Err(e) => warn!("candidate to_json failed: {e}"),
                }
            })
        }));
    }

    {
        let events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!(state=%st, "peer connection state");
            let mapped = match st {
                RTCPeerConnectionState::New => Some(ConnectionState::New),
                RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                _ => None,
            };
            if let Some(state) = mapped {
                let _ = events.send(BackendEvent::State(state));
            }
            Box::pin(async {})
        }));
    }

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let events = events.clone();
            let sink = sink.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    _ => return,
                };
                let remote = RemoteTrack {
                    id: track.id(),
                    kind,
                    mime_type: track.codec().capability.mime_type,
                };
                info!(kind=%remote.kind, mime=%remote.mime_type, "remote track");
                let _ = events.send(BackendEvent::RemoteTrack {
                    stream_id: track.stream_id(),
                    track: remote.clone(),
                });
                tokio::spawn(read_remote(track, remote, sink));
            })
        },
    ));
}

/// Drains a remote track until it ends, forwarding payloads to the sink.
async fn read_remote(
    track: Arc<TrackRemote>,
    remote: RemoteTrack,
    sink: Option<Arc<dyn RemoteMediaSink>>,
) {
    loop {
        match track.read_rtp().await {
            Ok((pkt, _)) => {
                if let Some(sink) = &sink {
                    if !pkt.payload.is_empty() {
                        sink.on_rtp(&remote, &pkt.payload);
                    }
                }
            }
            Err(e) => {
                debug!(id=%remote.id, "remote track ended: {e}");
                break;
            }
        }
    }
}

struct WebrtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerBackend for WebrtcPeer {
    async fn add_track(&self, track: Arc<TrackLocalStaticSample>) -> Result<()> {
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("add track")?;
        // RTCP must be read for interceptors (NACK, reports) to work.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.context("create offer")?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.context("create answer")?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .context("set local description")
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .context("set remote description")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .context("add ice candidate")
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.context("close peer connection")
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    rtc.context("parse session description")
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(anyhow!("unsupported sdp type {other}")),
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ice_entries_are_skipped() {
        let factory = WebrtcPeerFactory::new(vec![
            IceServerConfig::default(),
            IceServerConfig {
                urls: vec!["turn:turn.example:3478".into()],
                username: Some("u".into()),
                credential: Some("p".into()),
            },
        ]);
        let servers = factory.rtc_ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].username, "u");
    }

    #[tokio::test]
    async fn offer_round_trips_through_a_real_peer_connection() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let backend = WebrtcPeerFactory::new(Vec::new()).create(tx).await.unwrap();
        let track = Arc::new(TrackLocalStaticSample::new(
            webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability {
                mime_type: webrtc::api::media_engine::MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio".into(),
            "s".into(),
        ));
        backend.add_track(track).await.unwrap();
        let offer = backend.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        backend.set_local_description(offer).await.unwrap();
        backend.close().await.unwrap();
    }
}
