/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - CHAPEL Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! C ABI for mobile hosts.
//!
//! Return codes: 0 ok, 1 bad argument, 2 invalid config, 3 runtime error.
//! Strings written to `out_err` must be freed with `chapel_core_string_free`.

use crate::config::CallConfig;
use crate::media::{CameraFacing, TrackKind};
use crate::peer::{RemoteMediaSink, RemoteTrack};
use crate::runtime::{self, CallRequest};
use bytes::Bytes;
use chapel_protocol::{ParticipantId, RoomId};
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub type ChapelEventCallback = extern "C" fn(user_data: *mut c_void, event_json: *const c_char);
pub type ChapelMediaCallback =
    extern "C" fn(user_data: *mut c_void, kind: c_int, data: *const u8, len: usize);

pub const CHAPEL_TRACK_AUDIO: c_int = 0;
pub const CHAPEL_TRACK_VIDEO: c_int = 1;

/// Host context pointer; the host guarantees it outlives the call.
#[derive(Clone, Copy)]
struct UserData(*mut c_void);

unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

fn set_err(out_err: *mut *mut c_char, msg: String) {
    if out_err.is_null() {
        return;
    }
    let c = CString::new(msg.replace('\0', " ")).unwrap_or_default();
    unsafe {
        *out_err = c.into_raw();
    }
}

fn track_kind(kind: c_int) -> Option<TrackKind> {
    match kind {
        CHAPEL_TRACK_AUDIO => Some(TrackKind::Audio),
        CHAPEL_TRACK_VIDEO => Some(TrackKind::Video),
        _ => None,
    }
}

struct FfiMediaSink {
    cb: ChapelMediaCallback,
    user_data: UserData,
}

impl RemoteMediaSink for FfiMediaSink {
    fn on_rtp(&self, track: &RemoteTrack, payload: &[u8]) {
        let kind = match track.kind {
            TrackKind::Audio => CHAPEL_TRACK_AUDIO,
            TrackKind::Video => CHAPEL_TRACK_VIDEO,
        };
        (self.cb)(self.user_data.0, kind, payload.as_ptr(), payload.len());
    }
}

/// Starts a call. `on_event` receives each event as JSON, valid only for
/// the duration of the callback.
#[no_mangle]
pub extern "C" fn chapel_call_start(
    config_json: *const c_char,
    room_id: *const c_char,
    participant_id: u64,
    want_video: c_int,
    on_event: Option<ChapelEventCallback>,
    on_media: Option<ChapelMediaCallback>,
    user_data: *mut c_void,
    out_handle: *mut u64,
    out_err: *mut *mut c_char,
) -> c_int {
    if config_json.is_null() || room_id.is_null() || out_handle.is_null() {
        set_err(out_err, "null argument".to_string());
        return 1;
    }
    let cfg_str = unsafe { CStr::from_ptr(config_json) }.to_string_lossy().to_string();
    let cfg: CallConfig = match serde_json::from_str(&cfg_str) {
        Ok(v) => v,
        Err(e) => {
            set_err(out_err, format!("invalid config json: {e}"));
            return 2;
        }
    };
    let room = unsafe { CStr::from_ptr(room_id) }.to_string_lossy().to_string();
    let ud = UserData(user_data);

    let on_event: runtime::EventCallback = Box::new(move |ev| {
        let Some(cb) = on_event else { return };
        let json = match serde_json::to_string(ev) {
            Ok(v) => v,
            Err(e) => {
                warn!("serialize call event failed: {e}");
                return;
            }
        };
        let Ok(c) = CString::new(json) else { return };
        let ud = ud;
        cb(ud.0, c.as_ptr());
    });
    let sink = on_media.map(|cb| {
        Arc::new(FfiMediaSink {
            cb,
            user_data: ud,
        }) as Arc<dyn RemoteMediaSink>
    });

    let request = CallRequest {
        room_id: RoomId::new(room),
        participant: ParticipantId(participant_id),
        want_video: want_video != 0,
    };
    match runtime::start(cfg, request, on_event, sink) {
        Ok(handle) => {
            unsafe {
                *out_handle = handle;
            }
            0
        }
        Err(e) => {
            set_err(out_err, format!("{e:#}"));
            3
        }
    }
}

#[no_mangle]
pub extern "C" fn chapel_call_end(handle: u64, out_err: *mut *mut c_char) -> c_int {
    match runtime::end(handle) {
        Ok(()) => 0,
        Err(e) => {
            set_err(out_err, format!("{e:#}"));
            1
        }
    }
}

fn flag_result(res: anyhow::Result<bool>, out: *mut c_int, out_err: *mut *mut c_char) -> c_int {
    match res {
        Ok(v) => {
            if !out.is_null() {
                unsafe {
                    *out = v as c_int;
                }
            }
            0
        }
        Err(e) => {
            set_err(out_err, format!("{e:#}"));
            3
        }
    }
}

/// Writes the new enabled flag to `out_enabled`.
#[no_mangle]
pub extern "C" fn chapel_call_toggle_audio(
    handle: u64,
    out_enabled: *mut c_int,
    out_err: *mut *mut c_char,
) -> c_int {
    flag_result(runtime::toggle_audio(handle), out_enabled, out_err)
}

#[no_mangle]
pub extern "C" fn chapel_call_toggle_video(
    handle: u64,
    out_enabled: *mut c_int,
    out_err: *mut *mut c_char,
) -> c_int {
    flag_result(runtime::toggle_video(handle), out_enabled, out_err)
}

/// Writes 1 to `out_switched` when the camera changed.
#[no_mangle]
pub extern "C" fn chapel_call_switch_camera(
    handle: u64,
    out_switched: *mut c_int,
    out_err: *mut *mut c_char,
) -> c_int {
    flag_result(runtime::switch_camera(handle), out_switched, out_err)
}

/// 0 none, 1 front, 2 back; negative on invalid handle.
#[no_mangle]
pub extern "C" fn chapel_call_active_camera(handle: u64) -> c_int {
    match runtime::active_camera(handle) {
        Ok(None) => 0,
        Ok(Some(CameraFacing::Front)) => 1,
        Ok(Some(CameraFacing::Back)) => 2,
        Err(_) => -1,
    }
}

/// Queues one encoded Opus (audio) or VP8 (video) frame.
#[no_mangle]
pub extern "C" fn chapel_call_push_sample(
    handle: u64,
    kind: c_int,
    data: *const u8,
    len: usize,
    duration_us: u64,
    out_queued: *mut c_int,
    out_err: *mut *mut c_char,
) -> c_int {
    let Some(kind) = track_kind(kind) else {
        set_err(out_err, format!("unknown track kind {kind}"));
        return 1;
    };
    if data.is_null() || len == 0 {
        set_err(out_err, "empty sample".to_string());
        return 1;
    }
    let bytes = Bytes::copy_from_slice(unsafe { std::slice::from_raw_parts(data, len) });
    flag_result(
        runtime::push_sample(handle, kind, bytes, Duration::from_micros(duration_us)),
        out_queued,
        out_err,
    )
}

#[no_mangle]
pub extern "C" fn chapel_core_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn chapel_core_string_free(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(ptr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    fn take_err(err: *mut c_char) -> String {
        assert!(!err.is_null());
        let s = unsafe { CStr::from_ptr(err) }.to_string_lossy().to_string();
        chapel_core_string_free(err);
        s
    }

    #[test]
    fn null_arguments_are_rejected() {
        let mut err: *mut c_char = ptr::null_mut();
        let rc = chapel_call_start(
            ptr::null(),
            ptr::null(),
            1,
            0,
            None,
            None,
            ptr::null_mut(),
            ptr::null_mut(),
            &mut err,
        );
        assert_eq!(rc, 1);
        assert_eq!(take_err(err), "null argument");
    }

    #[test]
    fn bad_config_json_is_reported() {
        let cfg = CString::new("{not json").unwrap();
        let room = CString::new("42").unwrap();
        let mut handle = 0u64;
        let mut err: *mut c_char = ptr::null_mut();
        let rc = chapel_call_start(
            cfg.as_ptr(),
            room.as_ptr(),
            1,
            1,
            None,
            None,
            ptr::null_mut(),
            &mut handle,
            &mut err,
        );
        assert_eq!(rc, 2);
        assert!(take_err(err).starts_with("invalid config json"));
    }

    #[test]
    fn unknown_handle_fails_cleanly() {
        let mut err: *mut c_char = ptr::null_mut();
        assert_eq!(chapel_call_end(u64::MAX, &mut err), 1);
        assert_eq!(take_err(err), "invalid handle");
        assert_eq!(chapel_call_active_camera(u64::MAX), -1);

        let mut err: *mut c_char = ptr::null_mut();
        let sample = [1u8, 2, 3];
        let rc = chapel_call_push_sample(
            u64::MAX,
            7,
            sample.as_ptr(),
            sample.len(),
            20_000,
            ptr::null_mut(),
            &mut err,
        );
        assert_eq!(rc, 1);
        assert!(take_err(err).contains("unknown track kind"));
    }

    #[test]
    fn second_end_is_a_no_op() {
        let cfg = CString::new(
            r#"{"signaling_url":"ws://127.0.0.1:1/ws","reconnect_attempts":1,"capture":"test_pattern"}"#,
        )
        .unwrap();
        let room = CString::new("42").unwrap();
        let mut handle = 0u64;
        let mut err: *mut c_char = ptr::null_mut();
        let rc = chapel_call_start(
            cfg.as_ptr(),
            room.as_ptr(),
            1,
            0,
            None,
            None,
            ptr::null_mut(),
            &mut handle,
            &mut err,
        );
        assert_eq!(rc, 0);
        assert!(err.is_null());

        assert_eq!(chapel_call_end(handle, &mut err), 0);
        assert_eq!(chapel_call_end(handle, &mut err), 0);
        assert!(err.is_null());
    }

    #[test]
    fn version_is_a_c_string() {
        let v = unsafe { CStr::from_ptr(chapel_core_version()) };
        assert_eq!(v.to_str().unwrap(), env!("CARGO_PKG_VERSION"));
    }
}
