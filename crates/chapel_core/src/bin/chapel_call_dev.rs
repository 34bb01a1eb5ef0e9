/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use chapel_core::capture::TestPatternCapture;
use chapel_core::config::{CallConfig, CaptureMode};
use chapel_core::session::{CallDeps, CallSession, SessionTimeouts};
use chapel_core::signaling::WsSignaling;
use chapel_core::webrtc_peer::WebrtcPeerFactory;
use chapel_protocol::{ParticipantId, RoomId};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    chapel_core::runtime::init_logging();

    let mut cfg = CallConfig {
        capture: CaptureMode::TestPattern,
        ..CallConfig::default()
    };
    if let Ok(url) = std::env::var("CHAPEL_SIGNALING_URL") {
        cfg.signaling_url = url;
    }
    let room = std::env::var("CHAPEL_ROOM").unwrap_or_else(|_| "42".to_string());
    let user: u64 = std::env::var("CHAPEL_USER")
        .unwrap_or_else(|_| "1".to_string())
        .parse()
        .context("CHAPEL_USER must be a number")?;
    let want_video = std::env::var("CHAPEL_AUDIO_ONLY").is_err();

    let deps = CallDeps {
        capture: Arc::new(TestPatternCapture::new().with_cameras(cfg.cameras.clone())),
        signaling: Arc::new(WsSignaling::new(cfg.signaling())),
        peers: Arc::new(WebrtcPeerFactory::new(cfg.ice_servers.clone())),
    };
    let (session, mut events) = CallSession::spawn(deps, SessionTimeouts::from(&cfg));
    info!(room=%room, user, url=%cfg.signaling_url, "starting call");
    session.start(RoomId::new(room), ParticipantId(user), want_video);

    let mut state = session.watch_state();
    loop {
        tokio::select! {
            ev = events.recv() => {
                let Some(ev) = ev else { break };
                match serde_json::to_string(&ev) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("serialize event failed: {e}"),
                }
            }
            changed = state.changed() => {
                if changed.is_err() || state.borrow().is_terminal() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("hanging up");
                break;
            }
        }
    }
    session.end().await;
    while let Ok(ev) = events.try_recv() {
        if let Ok(line) = serde_json::to_string(&ev) {
            println!("{line}");
        }
    }
    Ok(())
}
