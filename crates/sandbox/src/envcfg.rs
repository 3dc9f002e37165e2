//! Numeric environment-variable parsing with defaults.
//!
//! Values are read the way the host always has: a leading run of digits is
//! accepted (trailing garbage ignored), anything unparsable or out of range
//! keeps the built-in default.

use std::env;

fn parse_u64(raw: &str) -> Option<u64> {
    let s = raw.trim_start();
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let digits = &s[..end];
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Reads `key` as a u64, keeping `default` when unset, empty, malformed, or
/// out of range.
pub fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => parse_u64(&raw).unwrap_or(default),
        _ => default,
    }
}

/// Reads `key` as a u32; values above `u32::MAX` keep the default.
pub fn env_u32(key: &str, default: u32) -> u32 {
    let v = env_u64(key, u64::from(default));
    u32::try_from(v).unwrap_or(default)
}

/// Reads `key` as a boolean flag: any nonzero numeric value enables it.
pub fn env_flag(key: &str) -> bool {
    env_u64(key, 0) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_leading_digits() {
        assert_eq!(parse_u64("123"), Some(123));
        assert_eq!(parse_u64("  42ms"), Some(42));
        assert_eq!(parse_u64("ms42"), None);
        assert_eq!(parse_u64(""), None);
        // 21 digits overflows u64 and must fall back to the default.
        assert_eq!(parse_u64("999999999999999999999"), None);
    }

    #[test]
    fn unset_keys_keep_defaults() {
        assert_eq!(env_u64("SAGE_TEST_UNSET_U64", 7), 7);
        assert_eq!(env_u32("SAGE_TEST_UNSET_U32", 9), 9);
        assert!(!env_flag("SAGE_TEST_UNSET_FLAG"));
    }

    #[test]
    fn reads_set_keys() {
        env::set_var("SAGE_TEST_SET_U64", "640");
        assert_eq!(env_u64("SAGE_TEST_SET_U64", 1), 640);
        env::set_var("SAGE_TEST_SET_FLAG", "1");
        assert!(env_flag("SAGE_TEST_SET_FLAG"));
        env::set_var("SAGE_TEST_SET_BAD", "not-a-number");
        assert_eq!(env_u32("SAGE_TEST_SET_BAD", 3), 3);
    }
}
