//! The process-wide facade the embedder drives.
//!
//! Owns every plugin runtime and all shared state. Events fan out in plugin
//! insertion order; a failing plugin is disabled and skipped from then on,
//! and never stops its neighbours.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, ensure, Context as _, Result};
use tracing::{debug, info};

use crate::config::{Limits, Timeouts};
use crate::console;
use crate::events::{CopyPayload, Event, OpenPayload, SearchPayload, TabChangePayload};
use crate::logging::LogRouter;
use crate::plugin::PluginRuntime;
use crate::queue::{CommandQueue, TakeCmd};
use crate::registry::BuiltinModules;
use crate::state::{HostShared, SharedRef};

pub struct Host {
    shared: SharedRef,
    /// Boxed so every runtime keeps a stable address while the table grows.
    plugins: Vec<Box<PluginRuntime>>,
    bootstrap: Option<String>,
}

impl Host {
    pub fn new(verbose: bool) -> Self {
        let shared = Rc::new(RefCell::new(HostShared {
            queue: CommandQueue::new(),
            allowlist: BTreeSet::new(),
            builtins: BuiltinModules::new(),
            log: LogRouter::from_env(verbose),
            verbose,
            console_threshold: console::threshold_from_env(verbose),
            had_error: false,
            disabled: false,
            next_fetch_id: 0,
            timeouts: Timeouts::from_env(),
            limits: Limits::from_env(),
        }));
        info!(verbose, "plugin host created");
        Self {
            shared,
            plugins: Vec::new(),
            bootstrap: None,
        }
    }

    /// Budgets for subsequent VM entries; already-running entries keep the
    /// budget they started with.
    pub fn set_timeouts_ms(&mut self, load_ms: u32, event_ms: u32) {
        self.shared.borrow_mut().timeouts = Timeouts { load_ms, event_ms };
    }

    /// Allocation caps for every VM, existing ones included. Zero leaves a
    /// cap unchanged.
    pub fn set_limits(&mut self, mem_bytes: u64, stack_bytes: u64) {
        {
            let mut sh = self.shared.borrow_mut();
            if mem_bytes > 0 {
                sh.limits.mem_bytes = mem_bytes;
            }
            if stack_bytes > 0 {
                sh.limits.stack_bytes = stack_bytes;
            }
        }
        for plugin in &self.plugins {
            plugin.apply_limits();
        }
    }

    /// Replaces the plugin log path; `None` clears it.
    pub fn set_log_path(&mut self, path: Option<&Path>) {
        self.shared
            .borrow_mut()
            .log
            .set_path(path.map(Path::to_path_buf));
    }

    /// Adds one canonical path to the read allowlist. The path must exist.
    pub fn allow_fs_read_path(&mut self, path: &Path) -> Result<()> {
        let canon = sandbox::paths::canonicalize(path)?;
        self.shared.borrow_mut().allowlist.insert(canon);
        Ok(())
    }

    /// Pre-sizes the plugin table. Only valid before the first plugin loads.
    pub fn reserve_plugins(&mut self, n: usize) -> Result<()> {
        ensure!(
            self.plugins.is_empty(),
            "reserve_plugins must be called before any plugin is loaded"
        );
        self.plugins.reserve(n);
        Ok(())
    }

    /// Registers a `sage:`-scheme builtin module.
    pub fn add_builtin_module(&mut self, name: &str, source: &str) -> Result<()> {
        self.shared.borrow_mut().builtins.add(name, source)
    }

    /// Validates the bootstrap by running it in a throwaway plugin, then
    /// stores it for every later [`Host::eval_file`]. A bootstrap that fails
    /// validation disables the host for the session.
    pub fn eval_bootstrap(&mut self, source: &str) -> Result<()> {
        let mut probe = PluginRuntime::probe(Rc::clone(&self.shared))?;
        match probe.eval_bootstrap(source) {
            Ok(()) => {
                self.bootstrap = Some(source.to_string());
                debug!("bootstrap accepted");
                Ok(())
            }
            Err(err) => {
                let mut sh = self.shared.borrow_mut();
                sh.disabled = true;
                sh.had_error = true;
                Err(err.context("bootstrap validation failed"))
            }
        }
    }

    /// Loads one plugin file: fresh VM, bootstrap, then the module itself.
    /// A plugin that fails stays in the table, disabled.
    pub fn eval_file(&mut self, path: &Path) -> Result<()> {
        {
            let sh = self.shared.borrow();
            ensure!(!sh.disabled, "plugin host is disabled");
        }
        let Some(bootstrap) = self.bootstrap.clone() else {
            self.shared.borrow_mut().had_error = true;
            bail!("no bootstrap installed");
        };
        let source = match std::fs::read(path) {
            Ok(source) => source,
            Err(err) => {
                let mut sh = self.shared.borrow_mut();
                sh.had_error = true;
                sh.plugin_line(path, &format!("failed to read plugin: {err}"));
                return Err(err).context(format!("read plugin {}", path.display()));
            }
        };
        let mut plugin = Box::new(
            PluginRuntime::new(Rc::clone(&self.shared), path).map_err(|err| {
                self.shared.borrow_mut().had_error = true;
                err
            })?,
        );
        let result = plugin
            .eval_bootstrap(&bootstrap)
            .and_then(|()| plugin.load_module(&source));
        self.plugins.push(plugin);
        result
    }

    /// Fans one event out to every enabled plugin, in insertion order.
    pub fn emit(&mut self, event: &Event) -> Result<()> {
        let mut failed = false;
        for plugin in &mut self.plugins {
            if plugin.emit(event).is_err() {
                failed = true;
            }
        }
        ensure!(!failed, "plugin error during `{}`", event.name());
        Ok(())
    }

    pub fn emit_open(&mut self, path: &str, tab: i64, tab_count: i64) -> Result<()> {
        self.emit(&Event::Open(OpenPayload {
            path: path.to_string(),
            tab,
            tab_count,
        }))
    }

    pub fn emit_tab_change(&mut self, from: i64, to: i64, tab_count: i64) -> Result<()> {
        self.emit(&Event::TabChange(TabChangePayload {
            from,
            to,
            tab_count,
        }))
    }

    pub fn emit_search(&mut self, query: &str, regex: bool, ignore_case: bool) -> Result<()> {
        self.emit(&Event::Search(SearchPayload {
            query: query.to_string(),
            regex,
            ignore_case,
        }))
    }

    pub fn emit_copy(&mut self, bytes: i64) -> Result<()> {
        self.emit(&Event::Copy(CopyPayload { bytes }))
    }

    pub fn emit_quit(&mut self) -> Result<()> {
        self.emit(&Event::Quit)
    }

    /// Asks every enabled plugin to handle a command; true when any did.
    pub fn command(&mut self, name: &str, args: &str) -> bool {
        let mut handled = false;
        for plugin in &mut self.plugins {
            let verdict = plugin.dispatch(name, args);
            handled = handled || verdict;
        }
        handled
    }

    /// One supervision tick: delivers finished subprocesses and fetches back
    /// into their VMs.
    pub fn poll(&mut self) {
        for plugin in &mut self.plugins {
            plugin.poll();
        }
    }

    /// Copies the oldest queued shell command into `buf`; see [`TakeCmd`].
    pub fn take_exec_cmd(&mut self, buf: &mut [u8]) -> TakeCmd {
        self.shared.borrow_mut().queue.take_into(buf)
    }

    /// Takes the oldest queued shell command as an owned string.
    pub fn take_cmd(&mut self) -> Option<String> {
        self.shared.borrow_mut().queue.take()
    }

    pub fn queued_commands(&self) -> usize {
        self.shared.borrow().queue.len()
    }

    /// Returns and clears the latched error bit.
    pub fn take_error(&mut self) -> bool {
        std::mem::replace(&mut self.shared.borrow_mut().had_error, false)
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    pub fn disabled_count(&self) -> usize {
        self.plugins.iter().filter(|p| p.is_disabled()).count()
    }

    /// Paths of currently enabled plugins, in insertion order.
    pub fn enabled_plugins(&self) -> Vec<PathBuf> {
        self.plugins
            .iter()
            .filter(|p| !p.is_disabled())
            .map(|p| p.path())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_is_only_valid_before_loading() {
        let mut host = Host::new(false);
        assert!(host.reserve_plugins(8).is_ok());
        assert_eq!(host.plugin_count(), 0);
    }

    #[test]
    fn take_error_clears_the_latch() {
        let mut host = Host::new(false);
        assert!(!host.take_error());
        host.shared.borrow_mut().had_error = true;
        assert!(host.take_error());
        assert!(!host.take_error());
    }

    #[test]
    fn eval_file_requires_a_bootstrap() {
        let mut host = Host::new(false);
        assert!(host.eval_file(Path::new("/nonexistent.js")).is_err());
        assert!(host.take_error());
    }

    #[test]
    fn builtin_names_are_validated() {
        let mut host = Host::new(false);
        assert!(host.add_builtin_module("sage:x", "export {};").is_ok());
        assert!(host.add_builtin_module("x", "export {};").is_err());
    }
}
