//! Handle-based call surface over a process-wide session registry.
//!
//! Every call resolves its handle under the registry lock, clones the
//! session's `Arc` and releases the lock before doing any work, so a slow
//! consumer never blocks other sessions.

use std::ffi::c_void;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use tracing::debug;

use crate::CaptureTarget;
use crate::error::{BridgeError, BridgeResult};
use crate::exchange::RawLease;
use crate::frame::FrameDescriptor;
use crate::geometry::CropRect;
use crate::handle::{HandleTable, SessionHandle};
use crate::session::{Session, SessionConfig};

static REGISTRY: LazyLock<Mutex<HandleTable<Arc<Session>>>> =
    LazyLock::new(|| Mutex::new(HandleTable::new()));

fn registry() -> MutexGuard<'static, HandleTable<Arc<Session>>> {
    match REGISTRY.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lookup(handle: SessionHandle) -> BridgeResult<Arc<Session>> {
    registry()
        .get(handle)
        .cloned()
        .ok_or(BridgeError::InvalidHandle)
}

/// Registers an already built session.
pub fn register_session(session: Session) -> SessionHandle {
    let handle = registry().insert(Arc::new(session));
    debug!(handle = handle.to_raw(), "session registered");
    handle
}

pub fn create_session(target: CaptureTarget) -> BridgeResult<SessionHandle> {
    create_session_with_config(target, SessionConfig::default())
}

pub fn create_session_with_config(
    target: CaptureTarget,
    config: SessionConfig,
) -> BridgeResult<SessionHandle> {
    let session = Session::builder(target).with_config(config).build()?;
    Ok(register_session(session))
}

/// Closes the session and invalidates `handle`. Resources are released once
/// any call still running on another thread finishes with the session.
pub fn destroy_session(handle: SessionHandle) -> BridgeResult<()> {
    let session = registry()
        .remove(handle)
        .ok_or(BridgeError::InvalidHandle)?;
    session.close();
    debug!(handle = handle.to_raw(), "session destroyed");
    Ok(())
}

pub fn capture_status(handle: SessionHandle) -> BridgeResult<u64> {
    Ok(lookup(handle)?.frame_count())
}

pub fn reader_count(handle: SessionHandle) -> BridgeResult<usize> {
    Ok(lookup(handle)?.reader_count())
}

pub fn set_max_resolution(handle: SessionHandle, width: i32, height: i32) -> BridgeResult<()> {
    lookup(handle)?.set_max_resolution(width, height);
    Ok(())
}

pub fn set_vrr_enabled(handle: SessionHandle, enabled: bool) -> BridgeResult<()> {
    lookup(handle)?.set_vrr_enabled(enabled);
    Ok(())
}

/// Returns whether the platform applied the change.
pub fn set_border_required(handle: SessionHandle, required: bool) -> BridgeResult<bool> {
    Ok(lookup(handle)?.set_border_required(required))
}

pub fn set_crop_rect(
    handle: SessionHandle,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
) -> BridgeResult<CropRect> {
    Ok(lookup(handle)?.set_crop_rect(x, y, width, height))
}

pub fn set_interop_enabled(handle: SessionHandle, enabled: bool) -> BridgeResult<()> {
    lookup(handle)?.set_interop_enabled(enabled);
    Ok(())
}

pub fn copy_latest_frame(handle: SessionHandle, dst: &mut [u8]) -> BridgeResult<FrameDescriptor> {
    lookup(handle)?.copy_latest_frame(dst)
}

pub fn peek_latest_frame(handle: SessionHandle) -> BridgeResult<(FrameDescriptor, usize)> {
    lookup(handle)?.peek_latest_frame()
}

/// The returned pointer stays valid until the matching
/// [`release_latest_frame`] and must not outlive [`destroy_session`].
pub fn acquire_latest_frame(handle: SessionHandle) -> BridgeResult<RawLease> {
    lookup(handle)?.acquire_latest_frame_raw()
}

pub fn release_latest_frame(handle: SessionHandle) -> BridgeResult<()> {
    lookup(handle)?.release_latest_frame();
    Ok(())
}

pub fn device_ptr(handle: SessionHandle) -> BridgeResult<*mut c_void> {
    Ok(lookup(handle)?.device_ptr())
}

pub fn latest_texture_ptr(handle: SessionHandle) -> BridgeResult<*mut c_void> {
    Ok(lookup(handle)?.latest_texture_ptr())
}

pub fn shared_handle(handle: SessionHandle) -> BridgeResult<*mut c_void> {
    Ok(lookup(handle)?.shared_handle())
}
