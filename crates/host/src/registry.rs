//! Builtin pseudo-module registry.
//!
//! Builtins are reserved names under the `sage:` scheme whose source the
//! embedder registers up front; they bypass the filesystem entirely.

use std::collections::HashMap;

use anyhow::{bail, Result};

/// Scheme every builtin module name must carry.
pub const MODULE_SCHEME: &str = "sage:";

#[derive(Debug, Default)]
pub struct BuiltinModules {
    modules: HashMap<String, String>,
}

impl BuiltinModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a builtin. The name must be `sage:<something>`.
    pub fn add(&mut self, name: &str, source: &str) -> Result<()> {
        let Some(rest) = name.strip_prefix(MODULE_SCHEME) else {
            bail!("builtin module name must start with `{MODULE_SCHEME}`");
        };
        if rest.is_empty() {
            bail!("builtin module name is empty");
        }
        self.modules.insert(name.to_string(), source.to_string());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.modules.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }
}
