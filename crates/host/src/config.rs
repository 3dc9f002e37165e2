//! Resource limits and budgets, with environment-variable defaults.

use sandbox::envcfg;

/// Budgets for the two kinds of VM entry.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Budget for bootstrap and plugin-module evaluation, in milliseconds.
    pub load_ms: u32,
    /// Budget for event emission, command dispatch and promise resolution.
    pub event_ms: u32,
}

impl Timeouts {
    pub fn from_env() -> Self {
        Self {
            load_ms: envcfg::env_u32("SAGE_PLUGIN_LOAD_TIMEOUT_MS", 500),
            event_ms: envcfg::env_u32("SAGE_PLUGIN_EVENT_TIMEOUT_MS", 50),
        }
    }
}

/// Per-VM allocation caps. Zero disables a cap.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub mem_bytes: u64,
    pub stack_bytes: u64,
}

impl Limits {
    pub fn from_env() -> Self {
        Self {
            mem_bytes: envcfg::env_u64("SAGE_PLUGIN_MEM_LIMIT_MB", 64).saturating_mul(1024 * 1024),
            stack_bytes: envcfg::env_u64("SAGE_PLUGIN_STACK_LIMIT_KB", 1024).saturating_mul(1024),
        }
    }
}
