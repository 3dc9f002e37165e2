//! Console verbosity policy.
//!
//! A single numeric threshold decides which `__sage_console` messages reach
//! the log: -1 silences everything, 4 lets `debug` through. Named levels and
//! numeric strings are both accepted.

/// Parses a level name or numeric string. Numbers clamp to [-1, 4].
pub fn parse_level(raw: &str) -> Option<i32> {
    let s = raw.trim().to_ascii_lowercase();
    Some(match s.as_str() {
        "silent" | "none" | "off" => -1,
        "error" => 0,
        "warn" | "warning" => 1,
        "info" | "log" => 2,
        "verbose" => 3,
        "debug" => 4,
        _ => return s.parse::<i64>().ok().map(|n| n.clamp(-1, 4) as i32),
    })
}

/// Threshold from `SAGE_CONSOLE_LEVEL`; defaults to warn, or debug when the
/// host is verbose.
pub fn threshold_from_env(verbose: bool) -> i32 {
    let default = if verbose { 4 } else { 1 };
    match std::env::var("SAGE_CONSOLE_LEVEL") {
        Ok(raw) if !raw.is_empty() => parse_level(&raw).unwrap_or(default),
        _ => default,
    }
}

/// Level of one console message; unknown tags count as info.
pub fn message_level(tag: &str) -> i32 {
    match parse_level(tag) {
        Some(level) if level >= 0 => level,
        _ => 2,
    }
}
