use crate::error::{BridgeError, BridgeResult};

/// Largest width or height accepted from the capture service, and the
/// ceiling applied to crop rectangle fields.
pub const MAX_DIMENSION: u32 = 8192;

/// Host pixel layout produced by readback. Only 8-bit BGRA is supported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelFormat {
    #[default]
    Bgra8,
}

impl PixelFormat {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgra8 => 4,
        }
    }
}

/// Dimensions and layout of one published frame. Rows are tightly packed:
/// the stride is always `width * 4`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl FrameDescriptor {
    pub const fn bgra(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Bgra8,
        }
    }

    pub fn row_bytes(&self) -> BridgeResult<usize> {
        (self.width as usize)
            .checked_mul(self.format.bytes_per_pixel())
            .ok_or(BridgeError::BufferOverflow)
    }

    pub fn byte_len(&self) -> BridgeResult<usize> {
        self.row_bytes()?
            .checked_mul(self.height as usize)
            .ok_or(BridgeError::BufferOverflow)
    }
}

/// A frame as delivered by the capture service, before any processing.
#[derive(Clone, Debug)]
pub struct SourceFrame<T> {
    pub texture: T,
    pub width: u32,
    pub height: u32,
}

/// Rejects zero-sized frames and frames above [`MAX_DIMENSION`] on either axis.
pub fn validate_source_dimensions(width: u32, height: u32) -> BridgeResult<()> {
    if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(BridgeError::InvalidDimensions { width, height });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_sizes_are_tightly_packed() {
        let desc = FrameDescriptor::bgra(1920, 1080);
        assert_eq!(desc.row_bytes().unwrap(), 7680);
        assert_eq!(desc.byte_len().unwrap(), 1920 * 1080 * 4);
    }

    #[test]
    fn source_dimensions_respect_ceiling() {
        assert!(validate_source_dimensions(1, 1).is_ok());
        assert!(validate_source_dimensions(MAX_DIMENSION, MAX_DIMENSION).is_ok());
        assert!(matches!(
            validate_source_dimensions(0, 1080),
            Err(BridgeError::InvalidDimensions {
                width: 0,
                height: 1080
            })
        ));
        assert!(validate_source_dimensions(1920, 0).is_err());
        assert!(validate_source_dimensions(MAX_DIMENSION + 1, 10).is_err());
        assert!(validate_source_dimensions(10, MAX_DIMENSION + 1).is_err());
    }
}
