//! Environment variable helpers
//!
//! Every reqmux config struct has a `from_env()` constructor built on these:
//! library defaults first, then any `REQMUX_*` override that parses.
//!
//! ```ignore
//! use reqmux_core::env::{env_get, env_get_bool};
//!
//! let batch: usize = env_get("REQMUX_DRAIN_BATCH", 256);
//! let flush = env_get_bool("REQMUX_LOG_FLUSH", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, falling back to `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`; `None` when unset or unparsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true, anything else
/// that is set is false.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Milliseconds variable as a `Duration`.
#[inline]
pub fn env_get_millis(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__REQMUX_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_opt::<u32>("__REQMUX_TEST_UNSET__").is_none());
        assert_eq!(env_get_str("__REQMUX_TEST_UNSET__", "dflt"), "dflt");
        assert!(env_get_bool("__REQMUX_TEST_UNSET__", true));
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__REQMUX_TEST_NUM__", " 123 ");
        let val: usize = env_get("__REQMUX_TEST_NUM__", 0);
        assert_eq!(val, 123);
        assert_eq!(
            env_get_millis("__REQMUX_TEST_NUM__", Duration::ZERO),
            Duration::from_millis(123)
        );
        std::env::remove_var("__REQMUX_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__REQMUX_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__REQMUX_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__REQMUX_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for (raw, expected) in [("1", true), ("TRUE", true), ("on", true), ("0", false), ("garbage", false)] {
            std::env::set_var("__REQMUX_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__REQMUX_TEST_BOOL__", !expected), expected, "{}", raw);
        }
        std::env::remove_var("__REQMUX_TEST_BOOL__");
    }
}
