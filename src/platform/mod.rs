use std::sync::Arc;

use crate::CaptureTarget;
use crate::error::BridgeResult;
use crate::pipeline::BridgeState;
use crate::session::{SessionBackend, SessionConfig};

#[cfg(target_os = "windows")]
pub(crate) mod windows;

#[cfg(target_os = "windows")]
pub(crate) fn open_session(
    target: &CaptureTarget,
    config: &SessionConfig,
    state: &Arc<BridgeState>,
) -> BridgeResult<Box<dyn SessionBackend>> {
    let session = windows::wgc::WgcSession::open(target, config, state)?;
    Ok(Box::new(session))
}

#[cfg(not(target_os = "windows"))]
pub(crate) fn open_session(
    target: &CaptureTarget,
    _config: &SessionConfig,
    _state: &Arc<BridgeState>,
) -> BridgeResult<Box<dyn SessionBackend>> {
    Err(crate::error::BridgeError::BackendUnavailable(format!(
        "screen capture is only supported on Windows (target {})",
        target.describe()
    )))
}

#[cfg(all(test, not(target_os = "windows")))]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    #[test]
    fn session_creation_fails_cleanly_off_windows() {
        let state = Arc::new(BridgeState::default());
        let result = open_session(
            &CaptureTarget::PrimaryMonitor,
            &SessionConfig::default(),
            &state,
        );
        assert!(matches!(result, Err(BridgeError::BackendUnavailable(_))));
    }
}
