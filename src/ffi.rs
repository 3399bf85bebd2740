//! C ABI exports.
//!
//! Sessions are identified by the packed `u64` form of [`SessionHandle`];
//! `0` is the null handle. Calls with a null or stale handle are no-ops
//! that report failure. Out-pointers may be null and are then skipped.

#![allow(clippy::missing_safety_doc)]

use std::ffi::c_void;

use tracing::debug;

use crate::api;
use crate::handle::SessionHandle;
use crate::window::{MonitorHandle, WindowId};
use crate::{CaptureTarget, error::BridgeError};

fn handle(raw: u64) -> Option<SessionHandle> {
    SessionHandle::from_raw(raw)
}

fn create(target: CaptureTarget) -> u64 {
    match api::create_session(target) {
        Ok(handle) => handle.to_raw(),
        Err(err) => {
            debug!(error = %err, "session creation failed");
            SessionHandle::NULL_RAW
        }
    }
}

/// Writes `value` through `ptr` when it is non-null.
unsafe fn write_out<T>(ptr: *mut T, value: T) {
    if let Some(slot) = unsafe { ptr.as_mut() } {
        *slot = value;
    }
}

/// Starts capturing the window `hwnd`. Returns `0` on failure.
#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_create_session(hwnd: isize) -> u64 {
    let window = WindowId::from_raw_handle(hwnd);
    if window.is_null() {
        return SessionHandle::NULL_RAW;
    }
    create(CaptureTarget::Window(window))
}

/// Starts capturing the display `hmonitor`, or the primary display when it
/// is `0`. Returns `0` on failure.
#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_create_monitor_session(hmonitor: isize) -> u64 {
    let monitor = MonitorHandle::from_raw_handle(hmonitor);
    if monitor.is_null() {
        create(CaptureTarget::PrimaryMonitor)
    } else {
        create(CaptureTarget::Monitor(monitor))
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_destroy_session(session: u64) {
    if let Some(handle) = handle(session) {
        let _ = api::destroy_session(handle);
    }
}

/// Frame counter, or `-1` for an invalid handle.
#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_capture_status(session: u64) -> i64 {
    handle(session)
        .and_then(|handle| api::capture_status(handle).ok())
        .map_or(-1, |count| count.min(i64::MAX as u64) as i64)
}

/// Outstanding leases, or `-1` for an invalid handle.
#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_reader_count(session: u64) -> i32 {
    handle(session)
        .and_then(|handle| api::reader_count(handle).ok())
        .map_or(-1, |count| count.min(i32::MAX as usize) as i32)
}

#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_set_max_resolution(session: u64, max_width: i32, max_height: i32) {
    if let Some(handle) = handle(session) {
        let _ = api::set_max_resolution(handle, max_width, max_height);
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_set_vrr_enabled(session: u64, enabled: i32) {
    if let Some(handle) = handle(session) {
        let _ = api::set_vrr_enabled(handle, enabled != 0);
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_set_border_required(session: u64, required: i32) {
    if let Some(handle) = handle(session) {
        let _ = api::set_border_required(handle, required != 0);
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_set_crop_rect(session: u64, x: i32, y: i32, width: i32, height: i32) {
    if let Some(handle) = handle(session) {
        let _ = api::set_crop_rect(handle, x, y, width, height);
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_set_interop_enabled(session: u64, enabled: i32) {
    if let Some(handle) = handle(session) {
        let _ = api::set_interop_enabled(handle, enabled != 0);
    }
}

/// Copies the latest frame into `out_buffer`. Returns `false` without
/// copying when there is no frame yet or `buffer_size` is too small; the
/// dimensions are still reported in the latter case so the caller can
/// re-allocate.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn snow_bridge_copy_latest_frame(
    session: u64,
    out_buffer: *mut u8,
    buffer_size: usize,
    out_width: *mut i32,
    out_height: *mut i32,
) -> bool {
    let Some(handle) = handle(session) else {
        return false;
    };
    if out_buffer.is_null() {
        return false;
    }
    // SAFETY: the caller guarantees `out_buffer` is valid for `buffer_size`
    // writable bytes.
    let dst = unsafe { std::slice::from_raw_parts_mut(out_buffer, buffer_size) };
    match api::copy_latest_frame(handle, dst) {
        Ok(descriptor) => {
            unsafe {
                write_out(out_width, descriptor.width as i32);
                write_out(out_height, descriptor.height as i32);
            }
            true
        }
        Err(BridgeError::BufferTooSmall { width, height, .. }) => {
            unsafe {
                write_out(out_width, width as i32);
                write_out(out_height, height as i32);
            }
            false
        }
        Err(_) => false,
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn snow_bridge_peek_latest_frame(
    session: u64,
    out_width: *mut i32,
    out_height: *mut i32,
    out_required_size: *mut usize,
) -> bool {
    let Some(Ok((descriptor, size))) = handle(session).map(api::peek_latest_frame) else {
        return false;
    };
    unsafe {
        write_out(out_width, descriptor.width as i32);
        write_out(out_height, descriptor.height as i32);
        write_out(out_required_size, size);
    }
    true
}

/// Leases the latest frame without copying. Every successful call must be
/// matched by [`snow_bridge_release_latest_frame`]; the buffer must not be
/// used after that, nor after the session is destroyed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn snow_bridge_acquire_latest_frame(
    session: u64,
    out_buffer: *mut *const u8,
    out_size: *mut usize,
    out_width: *mut i32,
    out_height: *mut i32,
) -> bool {
    let Some(Ok(lease)) = handle(session).map(api::acquire_latest_frame) else {
        return false;
    };
    unsafe {
        write_out(out_buffer, lease.ptr);
        write_out(out_size, lease.len);
        write_out(out_width, lease.descriptor.width as i32);
        write_out(out_height, lease.descriptor.height as i32);
    }
    true
}

#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_release_latest_frame(session: u64) {
    if let Some(handle) = handle(session) {
        let _ = api::release_latest_frame(handle);
    }
}

/// Raw `ID3D11Device*`, not add-ref'd. Null when unavailable.
#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_device(session: u64) -> *mut c_void {
    handle(session)
        .and_then(|handle| api::device_ptr(handle).ok())
        .unwrap_or(std::ptr::null_mut())
}

/// Raw `ID3D11Texture2D*` of the latest processed frame, not add-ref'd.
#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_latest_texture(session: u64) -> *mut c_void {
    handle(session)
        .and_then(|handle| api::latest_texture_ptr(handle).ok())
        .unwrap_or(std::ptr::null_mut())
}

/// Legacy DXGI shared handle of the latest processed frame.
#[unsafe(no_mangle)]
pub extern "C" fn snow_bridge_shared_handle(session: u64) -> *mut c_void {
    handle(session)
        .and_then(|handle| api::shared_handle(handle).ok())
        .unwrap_or(std::ptr::null_mut())
}
