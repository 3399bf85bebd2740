use std::ffi::c_void;
use std::sync::Arc;

use tracing::debug;

use crate::CaptureTarget;
use crate::env_config;
use crate::error::{BridgeError, BridgeResult};
use crate::exchange::{FrameLease, RawLease};
use crate::frame::FrameDescriptor;
use crate::geometry::{CropRect, MaxBound};
use crate::pipeline::BridgeState;
use crate::settings::CaptureSettings;

/// Frame-pool depth requested from the capture service.
pub const DEFAULT_FRAME_POOL_BUFFERS: i32 = 10;

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    /// Number of buffers in the capture frame pool.
    pub frame_pool_buffers: i32,
    /// Composite the mouse cursor into captured frames.
    pub capture_cursor: bool,
    /// Ask the system to draw its yellow capture border. Best effort: older
    /// systems always draw it.
    pub border_required: bool,
    pub max_bound: MaxBound,
    pub crop: CropRect,
    /// Create the small flip-model swap chain used to signal variable
    /// refresh cadence for window targets.
    pub vrr_swap_chain: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_pool_buffers: env_config::frame_pool_buffers_override()
                .unwrap_or(DEFAULT_FRAME_POOL_BUFFERS),
            capture_cursor: false,
            border_required: false,
            max_bound: MaxBound::DISABLED,
            crop: CropRect::default(),
            vrr_swap_chain: env_config::vrr_swap_chain_allowed(),
        }
    }
}

/// Platform half of a session: owns the device, capture objects and any
/// side channels. Implemented by the Windows backend.
pub trait SessionBackend: Send + Sync {
    /// Returns `false` when the platform cannot change the border.
    fn set_border_required(&self, required: bool) -> bool;

    /// Raw device pointer for interop, or null.
    fn device_ptr(&self) -> *mut c_void;

    /// Raw pointer to the most recent processed texture, or null. Not
    /// reference-counted; invalidated by the next frame.
    fn latest_texture_ptr(&self) -> *mut c_void;

    /// Shareable OS handle for the most recent processed texture, or null.
    fn shared_handle(&self) -> *mut c_void;

    /// Stops frame delivery. Called once, after the closing flag is set.
    fn close(&self);
}

pub struct SessionBuilder {
    target: CaptureTarget,
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new(target: CaptureTarget) -> Self {
        Self {
            target,
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn frame_pool_buffers(mut self, buffers: i32) -> Self {
        self.config.frame_pool_buffers = buffers.max(1);
        self
    }

    pub fn capture_cursor(mut self, enabled: bool) -> Self {
        self.config.capture_cursor = enabled;
        self
    }

    pub fn border_required(mut self, required: bool) -> Self {
        self.config.border_required = required;
        self
    }

    pub fn max_resolution(mut self, width: i32, height: i32) -> Self {
        self.config.max_bound = MaxBound::new(width, height);
        self
    }

    pub fn crop_rect(mut self, x: i32, y: i32, width: i32, height: i32) -> Self {
        self.config.crop = CropRect::clamped(x, y, width, height);
        self
    }

    pub fn vrr_swap_chain(mut self, enabled: bool) -> Self {
        self.config.vrr_swap_chain = enabled;
        self
    }

    pub fn build(self) -> BridgeResult<Session> {
        let state = Arc::new(BridgeState::new(CaptureSettings::new(
            self.config.crop,
            self.config.max_bound,
        )));
        let backend = crate::platform::open_session(&self.target, &self.config, &state)?;
        debug!(capture = %self.target.describe(), "capture session created");
        Ok(Session::from_parts(state, backend))
    }
}

/// A live capture session. Consumers may call any method from any thread.
pub struct Session {
    state: Arc<BridgeState>,
    backend: Box<dyn SessionBackend>,
}

impl Session {
    pub fn builder(target: CaptureTarget) -> SessionBuilder {
        SessionBuilder::new(target)
    }

    pub fn new(target: CaptureTarget) -> BridgeResult<Self> {
        Self::builder(target).build()
    }

    pub(crate) fn from_parts(state: Arc<BridgeState>, backend: Box<dyn SessionBackend>) -> Self {
        Self { state, backend }
    }

    /// Successful publishes so far.
    pub fn frame_count(&self) -> u64 {
        self.state.exchange.frame_count()
    }

    pub fn reader_count(&self) -> usize {
        self.state.exchange.reader_count()
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.state.settings
    }

    /// `(0, 0)` disables scaling.
    pub fn set_max_resolution(&self, width: i32, height: i32) {
        let bound = MaxBound::new(width, height);
        self.state.settings.set_max_bound(bound);
        debug!(width = bound.width, height = bound.height, "max resolution set");
    }

    pub fn set_crop_rect(&self, x: i32, y: i32, width: i32, height: i32) -> CropRect {
        let rect = self.state.settings.set_crop_rect(x, y, width, height);
        debug!(?rect, "crop rectangle set");
        rect
    }

    pub fn set_vrr_enabled(&self, enabled: bool) {
        self.state.settings.set_vrr_enabled(enabled);
    }

    /// Best effort; returns whether the platform applied the change.
    pub fn set_border_required(&self, required: bool) -> bool {
        self.backend.set_border_required(required)
    }

    pub fn set_interop_enabled(&self, enabled: bool) {
        self.state.settings.set_interop_enabled(enabled);
    }

    fn ensure_open(&self) -> BridgeResult<()> {
        if self.state.is_closing() {
            Err(BridgeError::Closing)
        } else {
            Ok(())
        }
    }

    pub fn copy_latest_frame(&self, dst: &mut [u8]) -> BridgeResult<FrameDescriptor> {
        self.ensure_open()?;
        self.state.exchange.copy_out(dst)
    }

    /// Dimensions and byte size of the latest frame.
    pub fn peek_latest_frame(&self) -> BridgeResult<(FrameDescriptor, usize)> {
        self.ensure_open()?;
        self.state.exchange.peek()
    }

    pub fn acquire_latest_frame(&self) -> BridgeResult<FrameLease<'_>> {
        self.ensure_open()?;
        self.state.exchange.acquire()
    }

    /// Lease for callers that cannot hold a Rust guard. Must be paired with
    /// [`Session::release_latest_frame`]. Fails with [`BridgeError::Closing`]
    /// once [`Session::close`] has run.
    pub fn acquire_latest_frame_raw(&self) -> BridgeResult<RawLease> {
        self.ensure_open()?;
        self.state.exchange.acquire_raw()
    }

    pub fn release_latest_frame(&self) {
        self.state.exchange.release();
    }

    pub fn device_ptr(&self) -> *mut c_void {
        self.backend.device_ptr()
    }

    pub fn latest_texture_ptr(&self) -> *mut c_void {
        self.backend.latest_texture_ptr()
    }

    pub fn shared_handle(&self) -> *mut c_void {
        self.backend.shared_handle()
    }

    pub fn is_closing(&self) -> bool {
        self.state.is_closing()
    }

    /// Stops capture. Safe to call more than once; also runs on drop.
    pub fn close(&self) {
        if self.state.begin_close() {
            self.backend.close();
            debug!("capture session closed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
