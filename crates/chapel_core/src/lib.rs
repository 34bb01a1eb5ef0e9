/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! One-to-one audio/video calling: local capture, rendezvous signaling and
//! WebRTC negotiation driven by a single call session actor.

pub mod capture;
pub mod config;
pub mod error;
pub mod ffi;
pub mod media;
pub mod peer;
pub mod runtime;
pub mod session;
pub mod signaling;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod webrtc_peer;

pub use config::CallConfig;
pub use error::{AcquisitionError, CallError, PeerError, SignalingError};
pub use media::{CameraFacing, TrackKind};
pub use session::{CallDeps, CallEvent, CallSession, CallState, DisconnectReason, SessionTimeouts};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
