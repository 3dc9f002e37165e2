//! Cryptographically secure random bytes from the operating system.

use anyhow::{anyhow, Result};

/// Fills `buf` from the OS entropy source.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::getrandom(buf).map_err(|e| anyhow!("gather entropy: {e}"))
}
