//! Crop rectangles and aspect-preserving scale bounds.

use crate::frame::MAX_DIMENSION;

/// A sub-rectangle in source-pixel coordinates.
///
/// Values are always stored pre-clamped to `[0, MAX_DIMENSION]`; a zero
/// width or height means "no crop".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

fn clamp_field(value: i32) -> u32 {
    value.clamp(0, MAX_DIMENSION as i32) as u32
}

impl CropRect {
    /// Builds a rectangle from caller-supplied signed values, clamping
    /// negatives to zero and everything to [`MAX_DIMENSION`].
    pub fn clamped(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x: clamp_field(x),
            y: clamp_field(y),
            width: clamp_field(width),
            height: clamp_field(height),
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Right edge (exclusive).
    pub const fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Bottom edge (exclusive).
    pub const fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// Intersects the rectangle with a `source_width` x `source_height`
    /// surface. `None` when the overlap is empty.
    pub fn within_source(&self, source_width: u32, source_height: u32) -> Option<Self> {
        if !self.is_enabled() || self.x >= source_width || self.y >= source_height {
            return None;
        }
        let right = self.right().min(source_width);
        let bottom = self.bottom().min(source_height);
        Some(Self {
            x: self.x,
            y: self.y,
            width: right - self.x,
            height: bottom - self.y,
        })
    }

    pub(crate) const fn pack(self) -> u64 {
        (self.x as u64)
            | ((self.y as u64) << 16)
            | ((self.width as u64) << 32)
            | ((self.height as u64) << 48)
    }

    pub(crate) const fn unpack(packed: u64) -> Self {
        Self {
            x: (packed & 0xffff) as u32,
            y: ((packed >> 16) & 0xffff) as u32,
            width: ((packed >> 32) & 0xffff) as u32,
            height: ((packed >> 48) & 0xffff) as u32,
        }
    }
}

/// Maximum output size. `(0, 0)` disables scaling; scaling only engages
/// when both bounds are non-zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaxBound {
    pub width: u32,
    pub height: u32,
}

impl MaxBound {
    pub const DISABLED: Self = Self {
        width: 0,
        height: 0,
    };

    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width: width.max(0) as u32,
            height: height.max(0) as u32,
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Aspect-fit target size for a `width` x `height` frame, or `None`
    /// when the frame already fits (or the bound is disabled).
    ///
    /// One axis lands exactly on its bound and the other stays within its
    /// bound; both are at least one pixel.
    pub fn fit(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        if !self.is_enabled() || width == 0 || height == 0 {
            return None;
        }
        if width <= self.width && height <= self.height {
            return None;
        }
        let scale = (self.width as f64 / width as f64).min(self.height as f64 / height as f64);
        let target_w = ((width as f64 * scale).round() as u32).clamp(1, self.width);
        let target_h = ((height as f64 * scale).round() as u32).clamp(1, self.height);
        Some((target_w, target_h))
    }

    pub(crate) const fn pack(self) -> u64 {
        (self.width as u64) | ((self.height as u64) << 32)
    }

    pub(crate) const fn unpack(packed: u64) -> Self {
        Self {
            width: (packed & 0xffff_ffff) as u32,
            height: (packed >> 32) as u32,
        }
    }
}
