/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Deserialize;
use std::time::Duration;

use crate::media::CameraFacing;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Which capture backend feeds the local tracks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Encoded samples pushed by the host app through the C ABI.
    #[default]
    Host,
    /// Built-in silent audio / placeholder video.
    TestPattern,
}

/// Permissions the host already obtained from the OS before starting a call.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct HostPermissions {
    #[serde(default = "granted")]
    pub microphone: bool,
    #[serde(default = "granted")]
    pub camera: bool,
}

fn granted() -> bool {
    true
}

impl Default for HostPermissions {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
        }
    }
}

/// Per-call configuration, deserialized from the host's JSON.
#[derive(Clone, Debug, Deserialize)]
pub struct CallConfig {
    /// `ws://` or `wss://` URL of the rendezvous endpoint.
    pub signaling_url: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
    #[serde(default)]
    pub join_timeout_secs: Option<u64>,
    /// Bound on the offer/answer exchange once the peer connection exists.
    #[serde(default)]
    pub negotiation_timeout_secs: Option<u64>,
    #[serde(default)]
    pub reconnect_attempts: Option<u32>,
    #[serde(default)]
    pub reconnect_initial_backoff_ms: Option<u64>,
    #[serde(default)]
    pub reconnect_max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub ping_secs: Option<u64>,
    #[serde(default)]
    pub capture: CaptureMode,
    #[serde(default)]
    pub permissions: HostPermissions,
    /// Cameras the device has, in switch order. Empty means none.
    #[serde(default = "default_cameras")]
    pub cameras: Vec<CameraFacing>,
}

fn default_cameras() -> Vec<CameraFacing> {
    vec![CameraFacing::Front, CameraFacing::Back]
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8790/ws".to_string(),
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
            join_timeout_secs: None,
            negotiation_timeout_secs: None,
            reconnect_attempts: None,
            reconnect_initial_backoff_ms: None,
            reconnect_max_backoff_ms: None,
            ping_secs: None,
            capture: CaptureMode::default(),
            permissions: HostPermissions::default(),
            cameras: default_cameras(),
        }
    }
}

impl CallConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs.unwrap_or(15).clamp(1, 120))
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs.unwrap_or(30).clamp(5, 300))
    }

    pub fn signaling(&self) -> SignalingConfig {
        let initial = self.reconnect_initial_backoff_ms.unwrap_or(250).clamp(50, 5_000);
        SignalingConfig {
            url: self.signaling_url.trim().to_string(),
            reconnect_attempts: self.reconnect_attempts.unwrap_or(5).clamp(1, 20),
            initial_backoff: Duration::from_millis(initial),
            max_backoff: Duration::from_millis(
                self.reconnect_max_backoff_ms.unwrap_or(5_000).clamp(initial, 60_000),
            ),
            ping_every: Duration::from_secs(self.ping_secs.unwrap_or(10).clamp(1, 120)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SignalingConfig {
    pub url: String,
    pub reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub ping_every: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_fills_defaults() {
        let cfg: CallConfig =
            serde_json::from_str(r#"{"signaling_url": " ws://relay.example/ws "}"#).unwrap();
        assert_eq!(cfg.capture, CaptureMode::Host);
        assert!(cfg.permissions.microphone && cfg.permissions.camera);
        assert_eq!(cfg.cameras, vec![CameraFacing::Front, CameraFacing::Back]);
        assert_eq!(cfg.join_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.signaling().url, "ws://relay.example/ws");
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let cfg: CallConfig = serde_json::from_str(
            r#"{
                "signaling_url": "ws://x/ws",
                "join_timeout_secs": 0,
                "negotiation_timeout_secs": 100000,
                "reconnect_initial_backoff_ms": 1000,
                "reconnect_max_backoff_ms": 10,
                "permissions": {"camera": false}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.join_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.negotiation_timeout(), Duration::from_secs(300));
        let sig = cfg.signaling();
        assert_eq!(sig.max_backoff, sig.initial_backoff);
        assert!(cfg.permissions.microphone);
        assert!(!cfg.permissions.camera);
    }
}
