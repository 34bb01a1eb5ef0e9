/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Call registry for embedders: each call runs on its own tokio runtime and
//! is addressed by an opaque handle.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use chapel_protocol::{ParticipantId, RoomId};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::{thread, time::Duration};
use tracing::{debug, error, info};

use crate::capture::{HostCapture, TestPatternCapture};
use crate::config::{CallConfig, CaptureMode};
use crate::media::{CameraFacing, CaptureBackend, TrackKind};
use crate::peer::RemoteMediaSink;
use crate::session::{CallDeps, CallEvent, CallSession, CallState, SessionTimeouts};
use crate::signaling::WsSignaling;
use crate::webrtc_peer::WebrtcPeerFactory;

static HANDLE_SEQ: AtomicU64 = AtomicU64::new(1);

pub type EventCallback = Box<dyn Fn(&CallEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CallRequest {
    pub room_id: RoomId,
    pub participant: ParticipantId,
    pub want_video: bool,
}

struct RunningCall {
    rt: tokio::runtime::Runtime,
    session: CallSession,
    host_capture: Option<Arc<HostCapture>>,
}

static REGISTRY: Mutex<Vec<(u64, RunningCall)>> = Mutex::new(Vec::new());

fn registry() -> MutexGuard<'static, Vec<(u64, RunningCall)>> {
    REGISTRY.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "info".parse::<tracing_subscriber::filter::Directive>() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt().with_env_filter(filter).try_init().ok();
}

/// Starts a call and returns its handle. Events are delivered on a runtime
/// worker thread; the callback must not call back into this module.
pub fn start(
    cfg: CallConfig,
    request: CallRequest,
    on_event: EventCallback,
    media_sink: Option<Arc<dyn RemoteMediaSink>>,
) -> Result<u64> {
    init_logging();
    if cfg.signaling_url.trim().is_empty() {
        bail!("signaling_url is required");
    }
    if request.room_id.as_str().trim().is_empty() {
        bail!("room id is required");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("chapel-call")
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    let (capture, host_capture): (Arc<dyn CaptureBackend>, Option<Arc<HostCapture>>) =
        match cfg.capture {
            CaptureMode::Host => {
                let host = Arc::new(HostCapture::new(cfg.permissions, cfg.cameras.clone()));
                (host.clone(), Some(host))
            }
            CaptureMode::TestPattern => (
                Arc::new(TestPatternCapture::new().with_cameras(cfg.cameras.clone())),
                None,
            ),
        };
    let mut peers = WebrtcPeerFactory::new(cfg.ice_servers.clone());
    if let Some(sink) = media_sink {
        peers = peers.with_sink(sink);
    }
    let deps = CallDeps {
        capture,
        signaling: Arc::new(WsSignaling::new(cfg.signaling())),
        peers: Arc::new(peers),
    };

    let session = {
        let _enter = rt.enter();
        let (session, mut events) = CallSession::spawn(deps, SessionTimeouts::from(&cfg));
        tokio::spawn(async move {
            while let Some(ev) = events.recv().await {
                on_event(&ev);
            }
        });
        session
    };
    session.start(request.room_id.clone(), request.participant, request.want_video);

    let handle = HANDLE_SEQ.fetch_add(1, Ordering::Relaxed);
    registry().push((
        handle,
        RunningCall {
            rt,
            session,
            host_capture,
        },
    ));
    info!(handle, room=%request.room_id, "call registered");
    Ok(handle)
}

fn with_call<T>(handle: u64, f: impl FnOnce(&RunningCall) -> T) -> Result<T> {
    let reg = registry();
    let (_, call) = reg
        .iter()
        .find(|(h, _)| *h == handle)
        .context("invalid handle")?;
    Ok(f(call))
}

/// Runs a session request to completion from a host thread.
fn ask<F, Fut>(handle: u64, f: F) -> Result<bool>
where
    F: FnOnce(CallSession) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    if tokio::runtime::Handle::try_current().is_ok() {
        bail!("call controls cannot be used from a runtime thread");
    }
    let (rt, session) = with_call(handle, |c| (c.rt.handle().clone(), c.session.clone()))?;
    Ok(rt.block_on(f(session)))
}

fn was_issued(handle: u64) -> bool {
    handle != 0 && handle < HANDLE_SEQ.load(Ordering::Relaxed)
}

/// Hangs up and unregisters the call. Teardown finishes in the background.
/// Ending a call that was already ended is a no-op.
pub fn end(handle: u64) -> Result<()> {
    let call = {
        let mut reg = registry();
        match reg.iter().position(|(h, _)| *h == handle) {
            Some(idx) => reg.swap_remove(idx).1,
            None if was_issued(handle) => {
                debug!(handle, "call already ended");
                return Ok(());
            }
            None => bail!("invalid handle"),
        }
    };
    // Join in background to avoid blocking the UI thread.
    let spawned = thread::Builder::new()
        .name("chapel-call-end".into())
        .spawn(move || {
            let RunningCall { rt, session, .. } = call;
            rt.block_on(session.end());
            drop(session);
            rt.shutdown_timeout(Duration::from_secs(2));
        });
    if let Err(e) = spawned {
        error!(handle, "spawn teardown thread failed: {e}");
    }
    Ok(())
}

pub fn toggle_audio(handle: u64) -> Result<bool> {
    ask(handle, |s| async move { s.toggle_audio().await })
}

pub fn toggle_video(handle: u64) -> Result<bool> {
    ask(handle, |s| async move { s.toggle_video().await })
}

pub fn switch_camera(handle: u64) -> Result<bool> {
    ask(handle, |s| async move { s.switch_camera().await })
}

pub fn state(handle: u64) -> Result<CallState> {
    with_call(handle, |c| c.session.state())
}

/// Feeds one encoded frame from the host's capture pipeline.
pub fn push_sample(handle: u64, kind: TrackKind, data: Bytes, duration: Duration) -> Result<bool> {
    with_call(handle, |c| match &c.host_capture {
        Some(host) => Ok(host.push(kind, data, duration)),
        None => Err(anyhow::anyhow!("call does not use host capture")),
    })?
}

/// Camera the host should currently capture from.
pub fn active_camera(handle: u64) -> Result<Option<CameraFacing>> {
    with_call(handle, |c| c.host_capture.as_ref().and_then(|h| h.active_camera()))
}
