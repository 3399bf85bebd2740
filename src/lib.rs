pub mod api;
pub(crate) mod env_config;
pub mod error;
pub mod exchange;
pub mod ffi;
pub mod frame;
pub mod geometry;
pub mod handle;
pub mod pipeline;
mod platform;
pub mod readback;
pub mod session;
pub mod settings;
pub mod window;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureTarget {
    PrimaryMonitor,

    /// Capture a display by native monitor handle.
    Monitor(window::MonitorHandle),

    /// Capture a top-level window by native window handle. The window's
    /// client area and frame are captured as composed by the system.
    Window(window::WindowId),
}

impl CaptureTarget {
    /// Short identifier used in logs and error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::PrimaryMonitor => "primary-monitor".to_string(),
            Self::Monitor(monitor) => monitor.stable_id(),
            Self::Window(window) => format!("window:{}", window.stable_id()),
        }
    }
}

pub use error::{BridgeError, BridgeErrorClass, BridgeResult};
pub use exchange::{FrameLease, RawLease};
pub use frame::{FrameDescriptor, PixelFormat};
pub use geometry::{CropRect, MaxBound};
pub use handle::SessionHandle;
pub use pipeline::FrameOutcome;
pub use session::{Session, SessionBuilder, SessionConfig};
pub use window::{MonitorHandle, WindowId};
