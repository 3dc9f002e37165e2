//! Per-plugin data directory resolution.
//!
//! Each plugin gets one private directory derived from its script name,
//! created lazily with mode 0700 under the user's state directory.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::paths::{canonicalize, mkdir_p};

/// Directory under which every plugin data dir lives:
/// `$XDG_STATE_HOME/sage/plugins`, else `$HOME/.local/state/sage/plugins`,
/// else `$TMPDIR/sage/plugins`.
pub fn data_dir_base() -> PathBuf {
    if let Ok(xdg) = env::var("XDG_STATE_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("sage").join("plugins");
        }
    }
    if let Ok(home) = env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home)
                .join(".local")
                .join("state")
                .join("sage")
                .join("plugins");
        }
    }
    env::temp_dir().join("sage").join("plugins")
}

/// Stable directory name for a plugin: script basename with the trailing
/// extension stripped, characters outside `[A-Za-z0-9._-]` mapped to `_`,
/// clamped to 96 chars; `plugin` when nothing is left.
pub fn plugin_id(path: &Path) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match base.rsplit_once('.') {
        Some((s, _)) if !s.is_empty() => s.to_string(),
        _ => base,
    };
    let mut id: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    id.truncate(96);
    if id.is_empty() {
        id = "plugin".to_string();
    }
    id
}

/// Creates (if needed) and canonicalizes the data directory for the plugin at
/// `plugin_path`.
pub fn ensure_data_dir(plugin_path: &Path) -> Result<PathBuf> {
    let dir = data_dir_base().join(plugin_id(plugin_path));
    mkdir_p(&dir, 0o700)?;
    canonicalize(&dir)
}
