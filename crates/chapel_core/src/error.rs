/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::Serialize;
use thiserror::Error;

use crate::media::TrackKind;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AcquisitionError {
    #[error("permission denied for {device}")]
    PermissionDenied { device: TrackKind },
    #[error("no {device} capture device available")]
    DeviceUnavailable { device: TrackKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("invalid negotiation state: {0}")]
    InvalidNegotiationState(String),
    #[error("peer connection closed")]
    Closed,
    #[error("peer connection backend: {0}")]
    Backend(String),
}

impl PeerError {
    pub(crate) fn backend(e: anyhow::Error) -> Self {
        Self::Backend(format!("{e:#}"))
    }
}

/// Failures surfaced to the caller through the error notification.
///
/// A remote hangup is not an error; it arrives as a disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallError {
    #[error("permission denied for {device}")]
    PermissionDenied { device: TrackKind },
    #[error("no {device} capture device available")]
    DeviceUnavailable { device: TrackKind },
    #[error("signaling connection error: {reason}")]
    SignalingConnectionError { reason: String },
    #[error("signaling timed out waiting for {stage}")]
    SignalingTimeout { stage: String },
    #[error("room {room_id} already has two participants")]
    RoomFull { room_id: String },
    #[error("negotiation failed: {reason}")]
    NegotiationFailure { reason: String },
    #[error("connectivity could not be established")]
    IceFailure,
}

impl From<AcquisitionError> for CallError {
    fn from(e: AcquisitionError) -> Self {
        match e {
            AcquisitionError::PermissionDenied { device } => Self::PermissionDenied { device },
            AcquisitionError::DeviceUnavailable { device } => Self::DeviceUnavailable { device },
        }
    }
}

impl From<SignalingError> for CallError {
    fn from(e: SignalingError) -> Self {
        Self::SignalingConnectionError {
            reason: e.to_string(),
        }
    }
}

impl From<PeerError> for CallError {
    fn from(e: PeerError) -> Self {
        Self::NegotiationFailure {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_errors_surface_as_connection_errors() {
        for (err, reason) in [
            (
                SignalingError::Connect("connection refused".into()),
                "signaling connect failed: connection refused",
            ),
            (SignalingError::Closed, "signaling channel closed"),
        ] {
            assert_eq!(
                CallError::from(err),
                CallError::SignalingConnectionError {
                    reason: reason.to_string()
                }
            );
        }
    }
}
