//! FFI bindings for the posture fusion core
//!
//! This module provides C-compatible functions for driving a fusion session
//! from a host service written in another language. Estimates, configs and
//! tick outputs cross the boundary as JSON. All returned strings are allocated
//! by Rust and must be freed by the caller using `posture_free_string`.
//!
//! The host runs the estimators itself: it calls `posture_session_begin_tick`
//! with the sensor outcome, runs the camera only if asked to, then calls
//! `posture_session_complete_tick` with the ticket it was handed.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::config::{ModeConfig, SessionSettings};
use crate::error::FusionError;
use crate::mode::sensor_plan;
use crate::session::{FusionCore, PendingTick};
use crate::types::{EstimateOutcome, OutcomeRecord};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Set the last error message
fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Clear the last error message
fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Serialize a result to a C string, recording the error on failure
fn respond<T: Serialize>(result: Result<T, FusionError>) -> *mut c_char {
    match result.and_then(|value| Ok(serde_json::to_string(&value)?)) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

fn timestamp(now_ms: i64) -> Result<DateTime<Utc>, FusionError> {
    Utc.timestamp_millis_opt(now_ms).single().ok_or_else(|| {
        FusionError::InvalidReading(format!("timestamp {now_ms} ms is out of range"))
    })
}

/// Parse an optional outcome; NULL means the estimator was not run
unsafe fn optional_outcome(
    json: *const c_char,
    now: DateTime<Utc>,
) -> Result<Option<EstimateOutcome>, FusionError> {
    if json.is_null() {
        return Ok(None);
    }
    let json = cstr_to_string(json)
        .ok_or_else(|| FusionError::InvalidEstimate("estimate is not valid UTF-8".to_string()))?;
    OutcomeRecord::from_json(&json, now).map(Some)
}

/// Reply to `posture_session_begin_tick`
#[derive(Debug, Serialize)]
struct BeginReply {
    ticket: u64,
    run_camera: bool,
}

// ============================================================================
// Session API
// ============================================================================

/// Opaque handle to a fusion session
pub struct PostureSessionHandle {
    core: FusionCore,
    config: ModeConfig,
    pending: Option<PendingTick>,
}

impl PostureSessionHandle {
    fn begin(
        &mut self,
        sensor: Option<EstimateOutcome>,
        now: DateTime<Utc>,
    ) -> PendingTick {
        // Sensor outcomes are ignored in modes that never run the sensor
        let sensor = if sensor_plan(self.config.mode) {
            Some(sensor.unwrap_or(EstimateOutcome::Unavailable))
        } else {
            None
        };
        self.core.begin(self.config, sensor, now)
    }

    fn take_pending(&mut self, ticket: u64) -> Result<PendingTick, FusionError> {
        match self.pending.take() {
            Some(pending) if pending.ticket() == ticket => Ok(pending),
            other => {
                self.pending = other;
                Err(FusionError::SupersededTick {
                    ticket,
                    latest: self.core.latest_ticket(),
                })
            }
        }
    }
}

/// Create a new fusion session.
///
/// # Safety
/// - `settings_json` must be a valid null-terminated C string or NULL for defaults.
/// - Returns a pointer to a newly allocated session; free it with `posture_session_free`.
/// - Returns NULL on error; call `posture_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn posture_session_new(
    settings_json: *const c_char,
) -> *mut PostureSessionHandle {
    clear_last_error();

    let settings = if settings_json.is_null() {
        SessionSettings::default()
    } else {
        let json = match cstr_to_string(settings_json) {
            Some(s) => s,
            None => {
                set_last_error("Invalid settings string pointer");
                return ptr::null_mut();
            }
        };
        match serde_json::from_str::<SessionSettings>(&json) {
            Ok(settings) => settings,
            Err(e) => {
                set_last_error(&FusionError::InvalidConfig(e.to_string()).to_string());
                return ptr::null_mut();
            }
        }
    };

    match FusionCore::new(settings) {
        Ok(core) => Box::into_raw(Box::new(PostureSessionHandle {
            core,
            config: ModeConfig::default(),
            pending: None,
        })),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Free a fusion session.
///
/// # Safety
/// - `session` must be a valid pointer returned by `posture_session_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn posture_session_free(session: *mut PostureSessionHandle) {
    if !session.is_null() {
        drop(Box::from_raw(session));
    }
}

/// Replace the mode config used from the next tick on.
///
/// # Safety
/// - `session` must be a valid pointer returned by `posture_session_new`.
/// - `config_json` must be a valid null-terminated C string.
/// - Returns 0 on success, non-zero on error; an invalid config is not applied.
#[no_mangle]
pub unsafe extern "C" fn posture_session_set_config(
    session: *mut PostureSessionHandle,
    config_json: *const c_char,
) -> i32 {
    clear_last_error();

    if session.is_null() {
        set_last_error("Null session pointer");
        return -1;
    }

    let handle = &mut *session;

    let json = match cstr_to_string(config_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid config string pointer");
            return -1;
        }
    };

    match ModeConfig::from_json(&json) {
        Ok(config) => {
            handle.config = config;
            0
        }
        Err(e) => {
            set_last_error(&e.to_string());
            -1
        }
    }
}

/// Begin a tick with the sensor outcome.
///
/// Returns `{"ticket": n, "run_camera": bool}`. A tick begun earlier and not
/// yet completed is superseded.
///
/// # Safety
/// - `session` must be a valid pointer returned by `posture_session_new`.
/// - `sensor_json` must be a valid null-terminated C string or NULL (sensor unavailable).
/// - Returns a newly allocated string that must be freed with `posture_free_string`.
/// - Returns NULL on error; call `posture_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn posture_session_begin_tick(
    session: *mut PostureSessionHandle,
    sensor_json: *const c_char,
    now_ms: i64,
) -> *mut c_char {
    clear_last_error();

    if session.is_null() {
        set_last_error("Null session pointer");
        return ptr::null_mut();
    }

    let handle = &mut *session;

    let result = timestamp(now_ms).and_then(|now| {
        let sensor = optional_outcome(sensor_json, now)?;
        let pending = handle.begin(sensor, now);
        let reply = BeginReply {
            ticket: pending.ticket(),
            run_camera: pending.run_camera(),
        };
        handle.pending = Some(pending);
        Ok(reply)
    });
    respond(result)
}

/// Complete a tick with the camera outcome and return the tick output JSON.
///
/// # Safety
/// - `session` must be a valid pointer returned by `posture_session_new`.
/// - `camera_json` must be a valid null-terminated C string or NULL (camera not run).
/// - Returns a newly allocated string that must be freed with `posture_free_string`.
/// - Returns NULL on error, including a ticket that is no longer current.
#[no_mangle]
pub unsafe extern "C" fn posture_session_complete_tick(
    session: *mut PostureSessionHandle,
    ticket: u64,
    camera_json: *const c_char,
    now_ms: i64,
) -> *mut c_char {
    clear_last_error();

    if session.is_null() {
        set_last_error("Null session pointer");
        return ptr::null_mut();
    }

    let handle = &mut *session;

    let result = timestamp(now_ms).and_then(|now| {
        let camera = optional_outcome(camera_json, now)?;
        let pending = handle.take_pending(ticket)?;
        handle.core.complete(pending, camera, now)
    });
    respond(result)
}

/// Run a whole tick when both outcomes are already at hand.
///
/// The camera outcome is only used if the mode policy asks for the camera.
///
/// # Safety
/// - `session` must be a valid pointer returned by `posture_session_new`.
/// - `sensor_json` and `camera_json` must be valid null-terminated C strings or NULL.
/// - Returns a newly allocated string that must be freed with `posture_free_string`.
/// - Returns NULL on error; call `posture_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn posture_session_tick(
    session: *mut PostureSessionHandle,
    sensor_json: *const c_char,
    camera_json: *const c_char,
    now_ms: i64,
) -> *mut c_char {
    clear_last_error();

    if session.is_null() {
        set_last_error("Null session pointer");
        return ptr::null_mut();
    }

    let handle = &mut *session;

    let result = timestamp(now_ms).and_then(|now| {
        let sensor = optional_outcome(sensor_json, now)?;
        let camera = optional_outcome(camera_json, now)?;
        let pending = handle.begin(sensor, now);
        let camera = if pending.run_camera() { camera } else { None };
        handle.core.complete(pending, camera, now)
    });
    respond(result)
}

/// Report the last completed state without running a tick.
///
/// # Safety
/// - `session` must be a valid pointer returned by `posture_session_new`.
/// - Returns a newly allocated string that must be freed with `posture_free_string`.
#[no_mangle]
pub unsafe extern "C" fn posture_session_snapshot(
    session: *mut PostureSessionHandle,
    now_ms: i64,
) -> *mut c_char {
    clear_last_error();

    if session.is_null() {
        set_last_error("Null session pointer");
        return ptr::null_mut();
    }

    let handle = &*session;
    respond(timestamp(now_ms).map(|now| handle.core.snapshot(now)))
}

/// Session statistics as JSON.
///
/// # Safety
/// - `session` must be a valid pointer returned by `posture_session_new`.
/// - Returns a newly allocated string that must be freed with `posture_free_string`.
#[no_mangle]
pub unsafe extern "C" fn posture_session_stats(session: *mut PostureSessionHandle) -> *mut c_char {
    clear_last_error();

    if session.is_null() {
        set_last_error("Null session pointer");
        return ptr::null_mut();
    }

    let handle = &*session;
    respond(Ok(handle.core.stats()))
}

/// Reset the session to its initial state.
///
/// # Safety
/// - `session` must be a valid pointer returned by `posture_session_new`.
/// - Returns 0 on success, non-zero on error.
#[no_mangle]
pub unsafe extern "C" fn posture_session_reset(session: *mut PostureSessionHandle) -> i32 {
    clear_last_error();

    if session.is_null() {
        set_last_error("Null session pointer");
        return -1;
    }

    let handle = &mut *session;
    handle.pending = None;
    handle.core.reset();
    0
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by the posture functions.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a posture function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn posture_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next posture function call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn posture_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

// ============================================================================
// Version Information
// ============================================================================

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn posture_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::ffi::CString;

    const T0: i64 = 1_705_309_200_000;

    fn cstring(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    unsafe fn take_json(ptr: *mut c_char) -> Value {
        assert!(!ptr.is_null(), "unexpected error: {:?}", last_error());
        let value = serde_json::from_str(CStr::from_ptr(ptr).to_str().unwrap()).unwrap();
        posture_free_string(ptr);
        value
    }

    unsafe fn last_error() -> Option<String> {
        let error = posture_last_error();
        if error.is_null() {
            None
        } else {
            Some(CStr::from_ptr(error).to_str().unwrap().to_string())
        }
    }

    #[test]
    fn test_ffi_session_lifecycle() {
        unsafe {
            let session = posture_session_new(ptr::null());
            assert!(!session.is_null());

            let config = cstring(r#"{"mode": "fusion"}"#);
            assert_eq!(posture_session_set_config(session, config.as_ptr()), 0);

            let sensor = cstring(r#"{"label": "Correct_posture", "confidence": 0.8, "source": "sensor"}"#);
            let begin = take_json(posture_session_begin_tick(session, sensor.as_ptr(), T0));
            assert_eq!(begin["run_camera"], true);
            let ticket = begin["ticket"].as_u64().unwrap();

            let camera = cstring(r#"{"label": "Correct_posture", "confidence": 0.95, "source": "camera"}"#);
            let output = take_json(posture_session_complete_tick(
                session,
                ticket,
                camera.as_ptr(),
                T0,
            ));
            assert_eq!(output["label"], "Correct_posture");
            assert_eq!(output["fusion_reason"], "agreement_boost");
            assert_eq!(output["mode"], "fusion");
            assert_eq!(output["stale"], false);

            let stats = take_json(posture_session_stats(session));
            assert_eq!(stats["ticks"], 1);
            assert_eq!(stats["camera_invocations"], 1);

            assert_eq!(posture_session_reset(session), 0);
            let snapshot = take_json(posture_session_snapshot(session, T0 + 1000));
            assert_eq!(snapshot["label"], Value::Null);

            posture_session_free(session);
        }
    }

    #[test]
    fn test_ffi_stale_ticket_rejected() {
        unsafe {
            let session = posture_session_new(ptr::null());
            let config = cstring(r#"{"mode": "camera_only"}"#);
            posture_session_set_config(session, config.as_ptr());

            let first = take_json(posture_session_begin_tick(session, ptr::null(), T0));
            let second = take_json(posture_session_begin_tick(session, ptr::null(), T0 + 1000));

            let camera = cstring(r#"{"label": "Leaning_left", "confidence": 0.9, "source": "camera"}"#);
            let late = posture_session_complete_tick(
                session,
                first["ticket"].as_u64().unwrap(),
                camera.as_ptr(),
                T0 + 2000,
            );
            assert!(late.is_null());
            assert!(last_error().unwrap().contains("superseded"));

            let output = take_json(posture_session_complete_tick(
                session,
                second["ticket"].as_u64().unwrap(),
                camera.as_ptr(),
                T0 + 2000,
            ));
            assert_eq!(output["label"], "Leaning_left");

            let stats = take_json(posture_session_stats(session));
            assert_eq!(stats["superseded_ticks"], 1);

            posture_session_free(session);
        }
    }

    #[test]
    fn test_ffi_single_shot_tick_skips_unrequested_camera() {
        unsafe {
            let settings = cstring(r#"{"stability": {"window": 5}}"#);
            let session = posture_session_new(settings.as_ptr());
            assert!(!session.is_null());

            // Default AutoSmart: a confident correct sensor keeps the camera off
            let sensor = cstring(r#"{"label": "Correct_posture", "confidence": 0.9, "source": "sensor"}"#);
            let camera = cstring(r#"{"label": "Leaning_left", "confidence": 0.99, "source": "camera"}"#);
            let output = take_json(posture_session_tick(
                session,
                sensor.as_ptr(),
                camera.as_ptr(),
                T0,
            ));

            assert_eq!(output["label"], "Correct_posture");
            assert_eq!(output["camera_invoked"], false);
            assert_eq!(output["fusion_reason"], "sensor_only_fallback");

            posture_session_free(session);
        }
    }

    #[test]
    fn test_ffi_timeout_outcome() {
        unsafe {
            let session = posture_session_new(ptr::null());
            let config = cstring(r#"{"mode": "fusion"}"#);
            posture_session_set_config(session, config.as_ptr());

            let sensor = cstring(r#"{"label": "Leaning_forward", "confidence": 0.6, "source": "sensor"}"#);
            let timeout = cstring(r#"{"status": "timeout"}"#);
            let output = take_json(posture_session_tick(
                session,
                sensor.as_ptr(),
                timeout.as_ptr(),
                T0,
            ));
            assert_eq!(output["fusion_reason"], "sensor_only_fallback");

            let stats = take_json(posture_session_stats(session));
            assert_eq!(stats["estimator_timeouts"], 1);

            posture_session_free(session);
        }
    }

    #[test]
    fn test_ffi_error_handling() {
        unsafe {
            let bad_settings = cstring(r#"{"stability": {"window": 0}}"#);
            assert!(posture_session_new(bad_settings.as_ptr()).is_null());
            assert!(last_error().is_some());

            let session = posture_session_new(ptr::null());
            let bad_config = cstring(r#"{"mode": "fusion", "fusion_weights": {"sensor": 0.7, "camera": 0.7}}"#);
            assert_eq!(posture_session_set_config(session, bad_config.as_ptr()), -1);
            assert!(last_error().unwrap().contains("sum to 1.0"));

            let garbage = cstring("not json");
            assert!(posture_session_tick(session, garbage.as_ptr(), ptr::null(), T0).is_null());
            assert!(last_error().unwrap().starts_with("Invalid estimate"));

            assert!(posture_session_stats(ptr::null_mut()).is_null());
            assert_eq!(last_error().as_deref(), Some("Null session pointer"));

            posture_session_free(session);
        }
    }

    #[test]
    fn test_ffi_version() {
        unsafe {
            let version = posture_version();
            assert!(!version.is_null());

            let version_str = CStr::from_ptr(version).to_str().unwrap();
            assert_eq!(version_str, crate::CORE_VERSION);
        }
    }
}
