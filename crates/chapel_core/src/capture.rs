/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webrtc::media::Sample;

use crate::config::HostPermissions;
use crate::error::AcquisitionError;
use crate::media::{CameraFacing, CaptureBackend, CaptureFeed, TrackKind};

// Opus "silence" TOC + padding, 20 ms.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(66);

/// Silent audio and a placeholder video payload; no real devices involved.
pub struct TestPatternCapture {
    deny: bool,
    microphone: bool,
    cameras: Vec<CameraFacing>,
    opened: Mutex<Vec<CancellationToken>>,
}

impl Default for TestPatternCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl TestPatternCapture {
    pub fn new() -> Self {
        Self {
            deny: false,
            microphone: true,
            cameras: vec![CameraFacing::Front, CameraFacing::Back],
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn deny_permission(mut self) -> Self {
        self.deny = true;
        self
    }

    pub fn without_microphone(mut self) -> Self {
        self.microphone = false;
        self
    }

    pub fn with_cameras(mut self, cameras: Vec<CameraFacing>) -> Self {
        self.cameras = cameras;
        self
    }

    /// Devices currently held open by a live feed.
    pub fn active_devices(&self) -> usize {
        let opened = self.opened.lock().unwrap_or_else(|e| e.into_inner());
        opened.iter().filter(|t| !t.is_cancelled()).count()
    }

    fn open(&self, device_id: String, payload: Bytes, frame: Duration) -> CaptureFeed {
        let (feed, tx, stop) = CaptureFeed::channel(device_id.clone(), 16);
        {
            let mut opened = self.opened.lock().unwrap_or_else(|e| e.into_inner());
            opened.retain(|t| !t.is_cancelled());
            opened.push(stop.clone());
        }
        tokio::spawn(generate(device_id, tx, stop, payload, frame));
        feed
    }
}

async fn generate(
    device_id: String,
    tx: mpsc::Sender<Sample>,
    stop: CancellationToken,
    payload: Bytes,
    frame: Duration,
) {
    let mut tick = tokio::time::interval(frame);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tick.tick() => {
                let sample = Sample {
                    data: payload.clone(),
                    duration: frame,
                    ..Default::default()
                };
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(device=%device_id, "test pattern stopped");
}

#[async_trait]
impl CaptureBackend for TestPatternCapture {
    async fn open_microphone(&self) -> Result<CaptureFeed, AcquisitionError> {
        if self.deny {
            return Err(AcquisitionError::PermissionDenied {
                device: TrackKind::Audio,
            });
        }
        if !self.microphone {
            return Err(AcquisitionError::DeviceUnavailable {
                device: TrackKind::Audio,
            });
        }
        Ok(self.open(
            "test-microphone".to_string(),
            Bytes::from_static(OPUS_SILENCE),
            AUDIO_FRAME,
        ))
    }

    async fn open_camera(&self, facing: CameraFacing) -> Result<CaptureFeed, AcquisitionError> {
        if self.deny {
            return Err(AcquisitionError::PermissionDenied {
                device: TrackKind::Video,
            });
        }
        if !self.cameras.contains(&facing) {
            return Err(AcquisitionError::DeviceUnavailable {
                device: TrackKind::Video,
            });
        }
        let id = match facing {
            CameraFacing::Front => "test-camera-front",
            CameraFacing::Back => "test-camera-back",
        };
        Ok(self.open(id.to_string(), Bytes::from_static(&[0u8; 32]), VIDEO_FRAME))
    }

    fn camera_facings(&self) -> Vec<CameraFacing> {
        self.cameras.clone()
    }
}

struct HostSink {
    tx: mpsc::Sender<Sample>,
    stop: CancellationToken,
    facing: Option<CameraFacing>,
}

/// Capture driven by the embedding app: the app owns the OS devices and
/// pushes already-encoded Opus / VP8 frames in.
pub struct HostCapture {
    permissions: HostPermissions,
    cameras: Vec<CameraFacing>,
    sinks: Mutex<HashMap<TrackKind, HostSink>>,
}

impl HostCapture {
    pub fn new(permissions: HostPermissions, cameras: Vec<CameraFacing>) -> Self {
        Self {
            permissions,
            cameras,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    fn attach(&self, kind: TrackKind, facing: Option<CameraFacing>) -> CaptureFeed {
        let id = match facing {
            Some(CameraFacing::Front) => "host-camera-front",
            Some(CameraFacing::Back) => "host-camera-back",
            None => "host-microphone",
        };
        let (feed, tx, stop) = CaptureFeed::channel(id, 32);
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.insert(kind, HostSink { tx, stop, facing });
        info!(device = id, "host capture attached");
        feed
    }

    /// Queues one encoded frame. False when the device is not open or the
    /// queue is full.
    pub fn push(&self, kind: TrackKind, data: Bytes, duration: Duration) -> bool {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sink) = sinks.get(&kind) else {
            return false;
        };
        if sink.stop.is_cancelled() {
            sinks.remove(&kind);
            return false;
        }
        sink.tx
            .try_send(Sample {
                data,
                duration,
                ..Default::default()
            })
            .is_ok()
    }

    /// Camera the host should be capturing from right now.
    pub fn active_camera(&self) -> Option<CameraFacing> {
        let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks
            .get(&TrackKind::Video)
            .filter(|s| !s.stop.is_cancelled())
            .and_then(|s| s.facing)
    }
}

#[async_trait]
impl CaptureBackend for HostCapture {
    async fn open_microphone(&self) -> Result<CaptureFeed, AcquisitionError> {
        if !self.permissions.microphone {
            return Err(AcquisitionError::PermissionDenied {
                device: TrackKind::Audio,
            });
        }
        Ok(self.attach(TrackKind::Audio, None))
    }

    async fn open_camera(&self, facing: CameraFacing) -> Result<CaptureFeed, AcquisitionError> {
        if !self.permissions.camera {
            return Err(AcquisitionError::PermissionDenied {
                device: TrackKind::Video,
            });
        }
        if !self.cameras.contains(&facing) {
            return Err(AcquisitionError::DeviceUnavailable {
                device: TrackKind::Video,
            });
        }
        Ok(self.attach(TrackKind::Video, Some(facing)))
    }

    fn camera_facings(&self) -> Vec<CameraFacing> {
        self.cameras.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pattern_emits_samples_until_released() {
        let capture = TestPatternCapture::new();
        let mut feed = capture.open_microphone().await.unwrap();
        let sample = feed.samples.recv().await.unwrap();
        assert_eq!(&sample.data[..], OPUS_SILENCE);
        assert_eq!(capture.active_devices(), 1);
        drop(feed.release);
        assert_eq!(capture.active_devices(), 0);
    }

    #[tokio::test]
    async fn host_push_requires_an_open_device() {
        let capture = HostCapture::new(HostPermissions::default(), vec![CameraFacing::Front]);
        assert!(!capture.push(TrackKind::Audio, Bytes::from_static(b"x"), AUDIO_FRAME));

        let mut feed = capture.open_microphone().await.unwrap();
        assert!(capture.push(TrackKind::Audio, Bytes::from_static(b"x"), AUDIO_FRAME));
        assert_eq!(&feed.samples.recv().await.unwrap().data[..], b"x");

        drop(feed.release);
        assert!(!capture.push(TrackKind::Audio, Bytes::from_static(b"y"), AUDIO_FRAME));
    }

    #[tokio::test]
    async fn host_permissions_and_cameras_are_enforced() {
        let capture = HostCapture::new(
            HostPermissions {
                microphone: true,
                camera: false,
            },
            vec![CameraFacing::Front],
        );
        assert_eq!(
            capture.open_camera(CameraFacing::Front).await.err(),
            Some(AcquisitionError::PermissionDenied {
                device: TrackKind::Video
            })
        );

        let capture = HostCapture::new(HostPermissions::default(), vec![CameraFacing::Front]);
        assert_eq!(
            capture.open_camera(CameraFacing::Back).await.err(),
            Some(AcquisitionError::DeviceUnavailable {
                device: TrackKind::Video
            })
        );
        let _feed = capture.open_camera(CameraFacing::Front).await.unwrap();
        assert_eq!(capture.active_camera(), Some(CameraFacing::Front));
    }
}
