//! Environment-variable knobs.
//!
//! Every tuning override the bridge honours is read through these helpers
//! so truthy parsing and integer validation live in one place.

pub(crate) const FRAME_POOL_BUFFERS_VAR: &str = "SNOW_BRIDGE_FRAME_POOL_BUFFERS";
pub(crate) const DISABLE_VRR_SWAPCHAIN_VAR: &str = "SNOW_BRIDGE_DISABLE_VRR_SWAPCHAIN";

/// Upper limit accepted for a frame-pool depth override.
const FRAME_POOL_BUFFERS_MAX: u64 = 64;

pub(crate) fn is_truthy(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// `true` when the variable is set to `1`, `true`, `yes` or `on`
/// (case-insensitive, surrounding whitespace ignored).
#[inline]
pub(crate) fn env_var_truthy(var_name: &str) -> bool {
    std::env::var(var_name)
        .map(|raw| is_truthy(&raw))
        .unwrap_or(false)
}

pub(crate) fn parse_positive_u64(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok().filter(|value| *value > 0)
}

/// Parses the variable as a `u64`, returning `Some` only for values > 0.
#[inline]
pub(crate) fn env_var_positive_u64(var_name: &str) -> Option<u64> {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| parse_positive_u64(&raw))
}

/// Frame-pool depth override, clamped to a sane upper limit.
pub(crate) fn frame_pool_buffers_override() -> Option<i32> {
    env_var_positive_u64(FRAME_POOL_BUFFERS_VAR)
        .map(|value| value.min(FRAME_POOL_BUFFERS_MAX) as i32)
}

/// Declares a cached boolean flag backed by a `OnceLock<bool>`.
///
/// `enabled_unless(fn_name, "VAR")` is on by default and switched off when
/// the variable is truthy.
macro_rules! define_env_flag {
    (enabled_unless($fn_name:ident, $var:expr)) => {
        #[inline]
        pub(crate) fn $fn_name() -> bool {
            static VALUE: ::std::sync::OnceLock<bool> = ::std::sync::OnceLock::new();
            *VALUE.get_or_init(|| !$crate::env_config::env_var_truthy($var))
        }
    };
}

define_env_flag!(enabled_unless(
    vrr_swap_chain_allowed,
    DISABLE_VRR_SWAPCHAIN_VAR
));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values_are_case_and_whitespace_insensitive() {
        for raw in ["1", "true", " TRUE ", "Yes", "on"] {
            assert!(is_truthy(raw), "{raw:?} should be truthy");
        }
        for raw in ["", "0", "false", "off", "enabled"] {
            assert!(!is_truthy(raw), "{raw:?} should not be truthy");
        }
    }

    #[test]
    fn positive_integers_reject_zero_and_garbage() {
        assert_eq!(parse_positive_u64(" 12 "), Some(12));
        assert_eq!(parse_positive_u64("0"), None);
        assert_eq!(parse_positive_u64("-3"), None);
        assert_eq!(parse_positive_u64("ten"), None);
    }
}
