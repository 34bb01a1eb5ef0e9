/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Local capture: device feeds, outgoing RTP tracks, mute and camera switching.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::AcquisitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    Front,
    Back,
}

/// An open capture device producing encoded samples.
///
/// The device stays open while the feed (or whatever took its `release`
/// guard) is alive; dropping the guard tells the backend to stop.
pub struct CaptureFeed {
    pub device_id: String,
    pub samples: mpsc::Receiver<Sample>,
    pub release: DropGuard,
}

impl CaptureFeed {
    /// Builds a feed plus the sender/token pair the backend drives it with.
    pub fn channel(
        device_id: impl Into<String>,
        buffer: usize,
    ) -> (Self, mpsc::Sender<Sample>, CancellationToken) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let token = CancellationToken::new();
        let feed = Self {
            device_id: device_id.into(),
            samples: rx,
            release: token.clone().drop_guard(),
        };
        (feed, tx, token)
    }
}

/// Platform capture. Implementations may block while a permission prompt is up.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open_microphone(&self) -> Result<CaptureFeed, AcquisitionError>;
    async fn open_camera(&self, facing: CameraFacing) -> Result<CaptureFeed, AcquisitionError>;
    /// Cameras available for switching, in switch order.
    fn camera_facings(&self) -> Vec<CameraFacing>;
}

pub struct LocalTrack {
    kind: TrackKind,
    rtp: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    device_id: String,
    facing: Option<CameraFacing>,
    release: Option<DropGuard>,
    pump: JoinHandle<()>,
}

impl LocalTrack {
    fn new(
        kind: TrackKind,
        stream_id: &str,
        feed: CaptureFeed,
        facing: Option<CameraFacing>,
    ) -> Self {
        let codec = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec,
            kind.to_string(),
            stream_id.to_string(),
        ));
        let enabled = Arc::new(AtomicBool::new(true));
        let CaptureFeed {
            device_id,
            samples,
            release,
        } = feed;
        let pump = spawn_pump(rtp.clone(), samples, enabled.clone());
        Self {
            kind,
            rtp,
            enabled,
            device_id,
            facing,
            release: Some(release),
            pump,
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtp.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn facing(&self) -> Option<CameraFacing> {
        self.facing
    }

    fn toggle(&self) -> bool {
        let now = !self.enabled.load(Ordering::SeqCst);
        self.enabled.store(now, Ordering::SeqCst);
        now
    }

    /// Moves the outgoing track onto a new device without renegotiating.
    fn replace_feed(&mut self, feed: CaptureFeed, facing: Option<CameraFacing>) {
        self.pump.abort();
        let CaptureFeed {
            device_id,
            samples,
            release,
        } = feed;
        self.pump = spawn_pump(self.rtp.clone(), samples, self.enabled.clone());
        // Old device is released only after the new pump is running.
        self.release = Some(release);
        self.device_id = device_id;
        self.facing = facing;
    }

    fn stop(&mut self) {
        self.pump.abort();
        self.release.take();
    }
}

impl Drop for LocalTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_pump(
    rtp: Arc<TrackLocalStaticSample>,
    mut samples: mpsc::Receiver<Sample>,
    enabled: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sample) = samples.recv().await {
            // Muted tracks keep draining the device so it never backs up.
            if !enabled.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(e) = rtp.write_sample(&sample).await {
                debug!("write sample failed: {e}");
            }
        }
    })
}

/// The captured audio (and optionally video) for one call.
pub struct LocalMediaStream {
    stream_id: String,
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl LocalMediaStream {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }
}

/// Opens the microphone and, when asked, the first camera.
///
/// A failure on the camera releases the already-open microphone.
pub async fn open_stream(
    backend: Arc<dyn CaptureBackend>,
    want_video: bool,
) -> Result<LocalMediaStream, AcquisitionError> {
    let stream_id = format!("chapel-{:016x}", rand::random::<u64>());
    let mic = backend.open_microphone().await?;
    let video = if want_video {
        let facing = backend
            .camera_facings()
            .first()
            .copied()
            .ok_or(AcquisitionError::DeviceUnavailable {
                device: TrackKind::Video,
            })?;
        let cam = backend.open_camera(facing).await?;
        Some(LocalTrack::new(TrackKind::Video, &stream_id, cam, Some(facing)))
    } else {
        None
    };
    let audio = LocalTrack::new(TrackKind::Audio, &stream_id, mic, None);
    info!(stream=%stream_id, video = video.is_some(), "local media acquired");
    Ok(LocalMediaStream {
        stream_id,
        audio: Some(audio),
        video,
    })
}

/// Owns the local stream for the lifetime of a call.
pub struct MediaSource {
    backend: Arc<dyn CaptureBackend>,
    stream: Option<LocalMediaStream>,
}

impl MediaSource {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            stream: None,
        }
    }

    pub fn backend(&self) -> Arc<dyn CaptureBackend> {
        self.backend.clone()
    }

    pub async fn acquire(
        &mut self,
        want_video: bool,
    ) -> Result<&LocalMediaStream, AcquisitionError> {
        let stream = open_stream(self.backend.clone(), want_video).await?;
        Ok(self.install(stream))
    }

    /// Adopts a stream opened elsewhere, replacing (and releasing) any current one.
    pub fn install(&mut self, stream: LocalMediaStream) -> &LocalMediaStream {
        self.stream.insert(stream)
    }

    pub fn stream(&self) -> Option<&LocalMediaStream> {
        self.stream.as_ref()
    }

    /// Flips the audio track; returns the new enabled flag (false without a track).
    pub fn toggle_audio(&mut self) -> bool {
        match self.stream.as_ref().and_then(|s| s.audio.as_ref()) {
            Some(track) => {
                let now = track.toggle();
                info!(enabled = now, "audio toggled");
                now
            }
            None => false,
        }
    }

    pub fn toggle_video(&mut self) -> bool {
        match self.stream.as_ref().and_then(|s| s.video.as_ref()) {
            Some(track) => {
                let now = track.toggle();
                info!(enabled = now, "video toggled");
                now
            }
            None => false,
        }
    }

    /// Cycles to the next camera. Returns whether the camera changed.
    pub async fn switch_camera(&mut self) -> bool {
        let Some(track) = self.stream.as_mut().and_then(|s| s.video.as_mut()) else {
            return false;
        };
        let facings = self.backend.camera_facings();
        if facings.len() < 2 {
            return false;
        }
        let next = match track.facing.and_then(|f| facings.iter().position(|x| *x == f)) {
            Some(i) => facings[(i + 1) % facings.len()],
            None => facings[0],
        };
        if Some(next) == track.facing {
            return false;
        }
        match self.backend.open_camera(next).await {
            Ok(feed) => {
                track.replace_feed(feed, Some(next));
                info!(facing=?next, "camera switched");
                true
            }
            Err(e) => {
                warn!(facing=?next, "camera switch failed: {e}");
                false
            }
        }
    }

    /// Stops every track and releases the devices. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            for track in stream.audio.iter_mut().chain(stream.video.iter_mut()) {
                track.stop();
            }
            info!(stream=%stream.stream_id, "local media released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TestPatternCapture;

    #[tokio::test]
    async fn acquire_audio_only_opens_just_the_microphone() {
        let capture = Arc::new(TestPatternCapture::new());
        let mut media = MediaSource::new(capture.clone());
        let stream = media.acquire(false).await.unwrap();
        assert!(stream.audio().is_some());
        assert!(stream.video().is_none());
        assert_eq!(capture.active_devices(), 1);
    }

    #[tokio::test]
    async fn denied_permission_opens_nothing() {
        let capture = Arc::new(TestPatternCapture::new().deny_permission());
        let mut media = MediaSource::new(capture.clone());
        let err = media.acquire(true).await.err().unwrap();
        assert_eq!(
            err,
            AcquisitionError::PermissionDenied {
                device: TrackKind::Audio
            }
        );
        assert_eq!(capture.active_devices(), 0);
    }

    #[tokio::test]
    async fn missing_camera_releases_the_microphone() {
        let capture = Arc::new(TestPatternCapture::new().with_cameras(Vec::new()));
        let mut media = MediaSource::new(capture.clone());
        let err = media.acquire(true).await.err().unwrap();
        assert_eq!(
            err,
            AcquisitionError::DeviceUnavailable {
                device: TrackKind::Video
            }
        );
        assert_eq!(capture.active_devices(), 0);
    }

    #[tokio::test]
    async fn toggles_flip_and_report_state() {
        let capture = Arc::new(TestPatternCapture::new());
        let mut media = MediaSource::new(capture);
        assert!(!media.toggle_audio());
        media.acquire(true).await.unwrap();
        assert!(!media.toggle_audio());
        assert!(media.toggle_audio());
        assert!(!media.toggle_video());
        assert!(!media.stream().unwrap().video().unwrap().is_enabled());
        assert!(media.stream().unwrap().audio().unwrap().is_enabled());
    }

    #[tokio::test]
    async fn switch_camera_keeps_track_and_swaps_device() {
        let capture = Arc::new(TestPatternCapture::new());
        let mut media = MediaSource::new(capture.clone());
        media.acquire(true).await.unwrap();
        let before = media.stream().unwrap().video().unwrap().rtp_track();
        assert!(media.switch_camera().await);
        let video = media.stream().unwrap().video().unwrap();
        assert_eq!(video.facing(), Some(CameraFacing::Back));
        assert!(Arc::ptr_eq(&before, &video.rtp_track()));
        assert_eq!(capture.active_devices(), 2);
    }

    #[tokio::test]
    async fn switch_camera_is_a_noop_without_a_second_camera() {
        let capture = Arc::new(TestPatternCapture::new().with_cameras(vec![CameraFacing::Front]));
        let mut media = MediaSource::new(capture);
        media.acquire(true).await.unwrap();
        assert!(!media.switch_camera().await);

        let mut audio_only = MediaSource::new(Arc::new(TestPatternCapture::new()));
        audio_only.acquire(false).await.unwrap();
        assert!(!audio_only.switch_camera().await);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_frees_devices() {
        let capture = Arc::new(TestPatternCapture::new());
        let mut media = MediaSource::new(capture.clone());
        media.acquire(true).await.unwrap();
        assert_eq!(capture.active_devices(), 2);
        media.release();
        media.release();
        assert_eq!(capture.active_devices(), 0);
        assert!(media.stream().is_none());
    }
}
