//! Plugin-visible log routing.
//!
//! Plugin output never touches stdout (that would corrupt a TUI). Lines go
//! to the per-user log file, opened lazily in append mode; with
//! `SAGE_PLUGIN_LOG_STDERR` set they mirror to stderr instead. When no file
//! can be opened the line is dropped.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use sandbox::{envcfg, mkdir_p};
use tracing::debug;

fn default_log_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("SAGE_PLUGIN_LOG") {
        if !p.is_empty() {
            return Some(PathBuf::from(p));
        }
    }
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        if !xdg.is_empty() {
            return Some(PathBuf::from(xdg).join("sage").join("plugins.log"));
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return Some(
                PathBuf::from(home)
                    .join(".cache")
                    .join("sage")
                    .join("plugins.log"),
            );
        }
    }
    None
}

pub struct LogRouter {
    path: Option<PathBuf>,
    file: Option<File>,
    to_stderr: bool,
}

impl LogRouter {
    pub fn from_env(verbose: bool) -> Self {
        let path = default_log_path();
        if verbose {
            if let Some(p) = &path {
                eprintln!("sage[plugin] log: {}", p.display());
            }
        }
        Self {
            path,
            file: None,
            to_stderr: envcfg::env_flag("SAGE_PLUGIN_LOG_STDERR"),
        }
    }

    /// Replaces the log path; any open file is closed and the next write
    /// reopens on demand. `None` clears the path entirely.
    pub fn set_path(&mut self, path: Option<PathBuf>) {
        self.file = None;
        self.path = path;
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    fn file_handle(&mut self) -> Option<&mut File> {
        if self.file.is_none() {
            let path = self.path.as_ref()?;
            if let Some(parent) = path.parent() {
                let _ = mkdir_p(parent, 0o755);
            }
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => self.file = Some(f),
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "cannot open plugin log");
                    return None;
                }
            }
        }
        self.file.as_mut()
    }

    /// Writes one line, flushing immediately so a crash loses nothing.
    pub fn write_line(&mut self, line: &str) {
        if self.to_stderr {
            eprintln!("{line}");
            return;
        }
        if let Some(f) = self.file_handle() {
            let _ = writeln!(f, "{line}");
            let _ = f.flush();
        }
    }
}
