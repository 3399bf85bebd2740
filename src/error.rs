use std::fmt;

#[derive(Debug)]
pub enum BridgeError {
    InvalidTarget(String),

    /// The session handle is null, stale, or was never issued.
    InvalidHandle,

    /// Nothing has been published yet.
    NoFrame,

    /// The caller-supplied destination cannot hold the latest frame.
    /// Carries the size and dimensions the caller should re-allocate for.
    BufferTooSmall {
        required: usize,
        width: u32,
        height: u32,
    },

    /// A source frame reported dimensions that are zero or above the
    /// safety ceiling.
    InvalidDimensions {
        width: u32,
        height: u32,
    },

    BufferOverflow,

    BackendUnavailable(String),

    /// The session is being torn down.
    Closing,

    Platform(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeErrorClass {
    InvalidInput,
    Unsupported,
    Transient,
    Fatal,
}

impl BridgeError {
    pub fn class(&self) -> BridgeErrorClass {
        match self {
            Self::InvalidTarget(_) | Self::InvalidHandle | Self::BufferTooSmall { .. } => {
                BridgeErrorClass::InvalidInput
            }
            Self::BackendUnavailable(_) => BridgeErrorClass::Unsupported,
            Self::NoFrame | Self::InvalidDimensions { .. } | Self::Closing => {
                BridgeErrorClass::Transient
            }
            Self::BufferOverflow | Self::Platform(_) => BridgeErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), BridgeErrorClass::Transient)
            || matches!(self, Self::BufferTooSmall { .. })
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTarget(id) => write!(f, "capture target is not available: {id}"),
            Self::InvalidHandle => write!(f, "session handle is null or no longer valid"),
            Self::NoFrame => write!(f, "no frame has been published yet"),
            Self::BufferTooSmall {
                required,
                width,
                height,
            } => write!(
                f,
                "destination buffer too small: {width}x{height} frame needs {required} bytes"
            ),
            Self::InvalidDimensions { width, height } => {
                write!(f, "source frame dimensions out of range: {width}x{height}")
            }
            Self::BufferOverflow => write!(f, "frame buffer size overflow"),
            Self::BackendUnavailable(message) => {
                write!(f, "no available capture backend: {message}")
            }
            Self::Closing => write!(f, "session is closing"),
            Self::Platform(inner) => write!(f, "{inner}"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Platform(inner) => Some(inner.as_ref()),
            _ => None,
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_too_small_is_caller_recoverable() {
        let err = BridgeError::BufferTooSmall {
            required: 16,
            width: 2,
            height: 2,
        };
        assert_eq!(err.class(), BridgeErrorClass::InvalidInput);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("16 bytes"));
    }

    #[test]
    fn platform_errors_are_fatal_and_keep_their_source() {
        let err = BridgeError::Platform(anyhow::anyhow!("CreateTexture2D failed"));
        assert_eq!(err.class(), BridgeErrorClass::Fatal);
        assert!(!err.is_retryable());
        assert!(std::error::Error::source(&err).is_some());
    }
}
