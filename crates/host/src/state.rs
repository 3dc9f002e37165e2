//! Shared mutable state.
//!
//! Everything here lives on the embedder's thread. [`HostShared`] is owned by
//! the facade and handed to every host-API closure through an `Rc`;
//! [`PluginState`] is the per-plugin counterpart. The deadline [`Budget`] is
//! the one piece also visible to the VM interrupt hook.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rquickjs::{Function, Persistent};
use supervise::{ExecTask, FetchTask};

use crate::config::{Limits, Timeouts};
use crate::logging::LogRouter;
use crate::queue::CommandQueue;
use crate::registry::BuiltinModules;
use sandbox::clock;

/// Deadline for the current VM entry, consulted by the interrupt hook.
#[derive(Debug, Default)]
pub(crate) struct Budget {
    deadline_ns: Cell<u64>,
    timed_out: Cell<bool>,
}

impl Budget {
    /// Installs a deadline `ms` from now; zero disables preemption.
    pub fn begin(&self, ms: u64) {
        self.timed_out.set(false);
        self.deadline_ns.set(clock::deadline_after_ms(ms));
    }

    pub fn end(&self) {
        self.deadline_ns.set(0);
    }

    /// Interrupt-hook check: records and reports expiry.
    pub fn check_expired(&self) -> bool {
        let deadline = self.deadline_ns.get();
        if deadline == 0 {
            return false;
        }
        if clock::now_ns() >= deadline {
            self.timed_out.set(true);
            return true;
        }
        false
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out.get()
    }
}

/// Host-wide state shared with every plugin's host-API closures.
pub(crate) struct HostShared {
    pub queue: CommandQueue,
    pub allowlist: BTreeSet<PathBuf>,
    pub builtins: BuiltinModules,
    pub log: LogRouter,
    pub verbose: bool,
    pub console_threshold: i32,
    pub had_error: bool,
    pub disabled: bool,
    pub next_fetch_id: u64,
    pub timeouts: Timeouts,
    pub limits: Limits,
}

impl HostShared {
    pub fn log_line(&mut self, line: &str) {
        self.log.write_line(line);
    }

    /// One `sage[plugin:<path>]`-prefixed line.
    pub fn plugin_line(&mut self, path: &Path, msg: &str) {
        let line = format!("sage[plugin:{}] {}", path.display(), msg);
        self.log.write_line(&line);
    }
}

pub(crate) type SharedRef = Rc<RefCell<HostShared>>;

/// A subprocess whose promise is still pending.
pub(crate) struct PendingExec {
    pub task: ExecTask,
    pub resolve: Persistent<Function<'static>>,
    pub reject: Persistent<Function<'static>>,
}

/// A fetch whose promise is still pending.
pub(crate) struct PendingFetch {
    pub task: FetchTask,
    pub resolve: Persistent<Function<'static>>,
    pub reject: Persistent<Function<'static>>,
}

/// Per-plugin state shared with that plugin's host-API closures.
pub(crate) struct PluginState {
    /// Path as the embedder supplied it; used in log prefixes and the
    /// data-dir id.
    pub path: PathBuf,
    /// Realpath of the source; module name of the root module.
    pub canonical: PathBuf,
    /// Directory every non-builtin import must stay inside.
    pub root: PathBuf,
    /// Created on first use.
    pub data_dir: Option<PathBuf>,
    pub execs: Vec<PendingExec>,
    pub fetches: Vec<PendingFetch>,
}

pub(crate) type PluginRef = Rc<RefCell<PluginState>>;

#[cfg(test)]
mod tests {
    use super::Budget;

    #[test]
    fn budget_expiry_is_latched() {
        let b = Budget::default();
        assert!(!b.check_expired());

        b.begin(0);
        assert!(!b.check_expired());

        b.begin(10_000);
        assert!(!b.check_expired());
        assert!(!b.timed_out());

        // An already-passed deadline trips on the next check.
        b.begin(10_000);
        b.deadline_ns.set(1);
        assert!(b.check_expired());
        assert!(b.timed_out());

        b.end();
        assert!(!b.check_expired());
    }
}
