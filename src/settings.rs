use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::geometry::{CropRect, MaxBound};

/// Settings a consumer may change at any time while frames are flowing.
///
/// Crop and bound values are packed into single atomic words so the
/// producer always reads a tear-free snapshot without taking a lock.
#[derive(Debug, Default)]
pub struct CaptureSettings {
    crop: AtomicU64,
    max_bound: AtomicU64,
    vrr_enabled: AtomicBool,
    interop_enabled: AtomicBool,
}

impl CaptureSettings {
    pub fn new(crop: CropRect, max_bound: MaxBound) -> Self {
        Self {
            crop: AtomicU64::new(crop.pack()),
            max_bound: AtomicU64::new(max_bound.pack()),
            vrr_enabled: AtomicBool::new(false),
            interop_enabled: AtomicBool::new(false),
        }
    }

    /// Clamps and stores a crop rectangle; returns what was stored.
    pub fn set_crop_rect(&self, x: i32, y: i32, width: i32, height: i32) -> CropRect {
        let rect = CropRect::clamped(x, y, width, height);
        self.crop.store(rect.pack(), Ordering::Release);
        rect
    }

    pub fn crop_rect(&self) -> CropRect {
        CropRect::unpack(self.crop.load(Ordering::Acquire))
    }

    pub fn set_max_bound(&self, bound: MaxBound) {
        self.max_bound.store(bound.pack(), Ordering::Release);
    }

    pub fn max_bound(&self) -> MaxBound {
        MaxBound::unpack(self.max_bound.load(Ordering::Acquire))
    }

    pub fn set_vrr_enabled(&self, enabled: bool) {
        self.vrr_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn vrr_enabled(&self) -> bool {
        self.vrr_enabled.load(Ordering::Relaxed)
    }

    /// Reserved for a GPU-only consumption path; the pipeline does not
    /// consult it yet.
    pub fn set_interop_enabled(&self, enabled: bool) {
        self.interop_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn interop_enabled(&self) -> bool {
        self.interop_enabled.load(Ordering::Relaxed)
    }

    /// Everything the producer needs for one frame, read once.
    pub(crate) fn snapshot(&self) -> FrameSettings {
        FrameSettings {
            crop: self.crop_rect(),
            max_bound: self.max_bound(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct FrameSettings {
    pub crop: CropRect,
    pub max_bound: MaxBound,
}
