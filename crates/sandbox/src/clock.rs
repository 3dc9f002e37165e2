//! Monotonic clock anchored at first use.
//!
//! Deadlines are plain nanosecond counters so the interrupt hook can compare
//! them without allocating; zero always means "no deadline".

use std::sync::OnceLock;
use std::time::Instant;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Nanoseconds since the process-local monotonic epoch. Never zero after the
/// first call, so callers can use zero as the "no deadline" sentinel.
pub fn now_ns() -> u64 {
    let ns = epoch().elapsed().as_nanos() as u64;
    ns.max(1)
}

/// Milliseconds since the monotonic epoch, as a float for `performance.now`.
pub fn now_ms() -> f64 {
    now_ns() as f64 / 1e6
}

/// Deadline `ms` milliseconds from now, or zero when `ms` is zero.
pub fn deadline_after_ms(ms: u64) -> u64 {
    if ms == 0 {
        return 0;
    }
    now_ns().saturating_add(ms.saturating_mul(1_000_000))
}
