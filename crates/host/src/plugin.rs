//! Per-plugin VM supervision.
//!
//! One `PluginRuntime` owns one VM (runtime + context), the captured emit and
//! command hooks, and the plugin's in-flight background work. Every VM entry
//! runs under a deadline budget installed on the interrupt hook; expiry
//! disables the plugin for the rest of the session. Release order matters:
//! persistent callbacks and pending work are always dropped while the VM is
//! still alive.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, bail, Context as _, Result};
use rquickjs::promise::PromiseState;
use rquickjs::{
    Array, ArrayBuffer, CatchResultExt, CaughtError, Context, Ctx, Exception, Function, Module,
    Object, Persistent, Result as JsResult, Runtime, Value,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::api;
use crate::events::Event;
use crate::modules::{SageLoader, SageResolver};
use crate::state::{Budget, PendingExec, PendingFetch, PluginRef, PluginState, SharedRef};
use crate::values::{coerce_display, js_truthy, json_to_js};
use supervise::{ExecOutcome, FetchResponse};

/// Jobs executed per drain before giving up on a spinning plugin.
const MAX_JOB_DRAIN: usize = 1024;

struct VmCore {
    // Field order: the context must drop before the runtime.
    context: Context,
    runtime: Runtime,
}

pub(crate) struct PluginRuntime {
    state: PluginRef,
    emit_fn: Option<Persistent<Function<'static>>>,
    cmd_fn: Option<Persistent<Function<'static>>>,
    budget: Rc<Budget>,
    shared: SharedRef,
    vm: Option<VmCore>,
    disabled: bool,
}

impl PluginRuntime {
    /// VM for a real plugin file. The file must exist; its realpath'd
    /// directory becomes the module root.
    pub(crate) fn new(shared: SharedRef, display_path: &Path) -> Result<Self> {
        let canonical = sandbox::paths::canonicalize(display_path)?;
        let root = canonical
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .to_path_buf();
        Self::create(shared, display_path.to_path_buf(), canonical, root)
    }

    /// Throwaway VM used to validate a bootstrap before it is accepted.
    pub(crate) fn probe(shared: SharedRef) -> Result<Self> {
        let dir = std::env::temp_dir();
        Self::create(shared, PathBuf::from("<bootstrap>"), dir.clone(), dir)
    }

    fn create(
        shared: SharedRef,
        path: PathBuf,
        canonical: PathBuf,
        root: PathBuf,
    ) -> Result<Self> {
        let limits = shared.borrow().limits;
        let runtime = Runtime::new().context("create VM runtime")?;
        if limits.mem_bytes > 0 {
            runtime.set_memory_limit(limits.mem_bytes as usize);
        }
        if limits.stack_bytes > 0 {
            runtime.set_max_stack_size(limits.stack_bytes as usize);
        }

        let budget = Rc::new(Budget::default());
        {
            let budget = Rc::clone(&budget);
            runtime.set_interrupt_handler(Some(Box::new(move || budget.check_expired())));
        }
        runtime.set_loader(
            SageResolver { root: root.clone() },
            SageLoader {
                shared: Rc::clone(&shared),
            },
        );

        let context = Context::full(&runtime).context("create VM context")?;
        let state: PluginRef = Rc::new(RefCell::new(PluginState {
            path,
            canonical,
            root,
            data_dir: None,
            execs: Vec::new(),
            fetches: Vec::new(),
        }));
        context
            .with(|ctx| api::install(&ctx, &shared, &state))
            .map_err(|e| anyhow!("install host api: {e}"))?;

        debug!(plugin = %state.borrow().path.display(), "plugin VM created");
        Ok(Self {
            state,
            emit_fn: None,
            cmd_fn: None,
            budget,
            shared,
            vm: Some(VmCore { context, runtime }),
            disabled: false,
        })
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub(crate) fn path(&self) -> PathBuf {
        self.state.borrow().path.clone()
    }

    /// Re-applies the host's current allocation caps.
    pub(crate) fn apply_limits(&self) {
        let limits = self.shared.borrow().limits;
        if let Some(vm) = &self.vm {
            if limits.mem_bytes > 0 {
                vm.runtime.set_memory_limit(limits.mem_bytes as usize);
            }
            if limits.stack_bytes > 0 {
                vm.runtime.set_max_stack_size(limits.stack_bytes as usize);
            }
        }
    }

    fn event_budget_ms(&self) -> u64 {
        u64::from(self.shared.borrow().timeouts.event_ms)
    }

    fn load_budget_ms(&self) -> u64 {
        u64::from(self.shared.borrow().timeouts.load_ms)
    }

    /// Logs one exception, plus its stack when the host is verbose, and
    /// latches the error bit.
    fn note_exception<'js>(&self, ctx: &Ctx<'js>, caught: CaughtError<'js>) {
        let (text, stack) = match caught {
            CaughtError::Exception(exc) => {
                let msg = exc
                    .message()
                    .unwrap_or_else(|| "unknown exception".to_string());
                (msg, exc.stack())
            }
            CaughtError::Value(v) => (coerce_display(ctx, v), None),
            CaughtError::Error(e) => (e.to_string(), None),
        };
        let path = self.state.borrow().path.clone();
        let mut sh = self.shared.borrow_mut();
        sh.had_error = true;
        sh.plugin_line(&path, &format!("exception: {text}"));
        if sh.verbose {
            if let Some(stack) = stack {
                sh.plugin_line(&path, &format!("stack: {stack}"));
            }
        }
    }

    fn drain_jobs(&mut self) {
        if self.disabled {
            return;
        }
        let Some(vm) = &self.vm else {
            return;
        };
        let mut iterations = 0;
        while iterations < MAX_JOB_DRAIN {
            match vm.runtime.execute_pending_job() {
                Ok(true) => iterations += 1,
                Ok(false) => break,
                Err(_) => {
                    iterations += 1;
                    vm.context.with(|ctx| {
                        let exc = ctx.catch();
                        self.note_exception(&ctx, CaughtError::Value(exc));
                    });
                }
            }
        }
        if self.budget.timed_out() {
            self.disable("timeout while draining jobs");
        }
    }

    /// One log line, the error latch, and a full release of the VM and every
    /// piece of in-flight work. Irreversible.
    pub(crate) fn disable(&mut self, reason: &str) {
        if self.disabled {
            return;
        }
        self.disabled = true;
        let path = self.state.borrow().path.clone();
        warn!(plugin = %path.display(), reason, "disabling plugin");
        {
            let mut sh = self.shared.borrow_mut();
            sh.had_error = true;
            sh.plugin_line(&path, &format!("{reason}; disabling plugin"));
        }
        self.release_vm();
    }

    fn release_vm(&mut self) {
        {
            let mut st = self.state.borrow_mut();
            for pending in &st.fetches {
                pending.task.cancel();
            }
            // Dropping the lists joins every fetch worker and kills and reaps
            // every subprocess, with their persistents freed while the VM is
            // still alive.
            st.fetches.clear();
            st.execs.clear();
        }
        self.emit_fn = None;
        self.cmd_fn = None;
        self.budget.end();
        self.vm = None;
    }

    /// Evaluates the bootstrap as a global script under the load budget, then
    /// captures `__sage_emit` (required) and `__sage_cmd` (optional).
    pub(crate) fn eval_bootstrap(&mut self, source: &str) -> Result<()> {
        if self.disabled {
            bail!("plugin is disabled");
        }
        self.budget.begin(self.load_budget_ms());
        let threw = {
            let Some(vm) = &self.vm else {
                bail!("plugin VM is gone")
            };
            vm.context
                .with(|ctx| match ctx.eval::<(), _>(source).catch(&ctx) {
                    Ok(()) => false,
                    Err(caught) => {
                        self.note_exception(&ctx, caught);
                        true
                    }
                })
        };
        if self.budget.timed_out() {
            self.disable("bootstrap timed out");
            bail!("bootstrap timed out");
        }
        self.drain_jobs();
        self.budget.end();
        if self.disabled {
            bail!("plugin disabled during bootstrap");
        }
        if threw {
            self.disable("bootstrap threw");
            bail!("bootstrap threw an exception");
        }

        let (emit, cmd) = {
            let Some(vm) = &self.vm else {
                bail!("plugin VM is gone")
            };
            vm.context.with(|ctx| {
                let globals = ctx.globals();
                let emit = globals
                    .get::<_, Option<Function>>("__sage_emit")
                    .unwrap_or(None)
                    .map(|f| Persistent::save(&ctx, f));
                let cmd = globals
                    .get::<_, Option<Function>>("__sage_cmd")
                    .unwrap_or(None)
                    .map(|f| Persistent::save(&ctx, f));
                (emit, cmd)
            })
        };
        match emit {
            Some(emit) => self.emit_fn = Some(emit),
            None => {
                self.disable("bootstrap did not define a callable __sage_emit");
                bail!("bootstrap did not define __sage_emit");
            }
        }
        self.cmd_fn = cmd;
        Ok(())
    }

    /// Compiles the plugin source as a module and evaluates it under the load
    /// budget. A promise still pending after the drain means top-level await,
    /// which is refused.
    pub(crate) fn load_module(&mut self, source: &[u8]) -> Result<()> {
        if self.disabled {
            bail!("plugin is disabled");
        }
        let name = self.state.borrow().canonical.to_string_lossy().into_owned();
        self.budget.begin(self.load_budget_ms());

        let evaluated = {
            let Some(vm) = &self.vm else {
                bail!("plugin VM is gone")
            };
            vm.context.with(|ctx| {
                let declared = match Module::declare(ctx.clone(), name.as_bytes().to_vec(), source.to_vec())
                    .catch(&ctx)
                {
                    Ok(m) => m,
                    Err(caught) => {
                        self.note_exception(&ctx, caught);
                        return None;
                    }
                };
                match declared.eval().catch(&ctx) {
                    Ok((_, promise)) => Some(Persistent::save(&ctx, promise)),
                    Err(caught) => {
                        self.note_exception(&ctx, caught);
                        None
                    }
                }
            })
        };

        if self.budget.timed_out() {
            self.disable("plugin load timed out");
            bail!("plugin load timed out");
        }
        let Some(promise) = evaluated else {
            self.budget.end();
            self.disable("plugin module failed to evaluate");
            bail!("plugin module failed to evaluate");
        };
        self.drain_jobs();
        self.budget.end();
        if self.disabled {
            bail!("plugin disabled during load");
        }

        let failure = {
            let Some(vm) = &self.vm else {
                bail!("plugin VM is gone")
            };
            vm.context.with(|ctx| match promise.restore(&ctx) {
                Ok(p) => match p.state() {
                    PromiseState::Pending => {
                        Some("plugin uses top-level await and never finished loading")
                    }
                    PromiseState::Rejected => {
                        let _ = p.result::<Value>();
                        let exc = ctx.catch();
                        self.note_exception(&ctx, CaughtError::Value(exc));
                        Some("plugin module evaluation was rejected")
                    }
                    PromiseState::Resolved => None,
                },
                Err(_) => Some("plugin module state was lost"),
            })
        };
        if let Some(reason) = failure {
            self.disable(reason);
            bail!("{reason}");
        }
        info!(plugin = %self.state.borrow().path.display(), "plugin loaded");
        Ok(())
    }

    /// Calls the emit hook with `(name, payload)` under the event budget.
    pub(crate) fn emit(&mut self, event: &Event) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        let Some(emit_fn) = self.emit_fn.clone() else {
            return Ok(());
        };
        let payload = event.payload();
        self.budget.begin(self.event_budget_ms());
        let threw = {
            let Some(vm) = &self.vm else {
                bail!("plugin VM is gone")
            };
            vm.context.with(|ctx| -> Result<bool> {
                let hook = emit_fn
                    .restore(&ctx)
                    .map_err(|e| anyhow!("restore emit hook: {e}"))?;
                let payload_js = match &payload {
                    Some(p) => json_to_js(&ctx, p).map_err(|e| anyhow!("build payload: {e}"))?,
                    None => Value::new_undefined(ctx.clone()),
                };
                match hook.call::<_, Value>((event.name(), payload_js)).catch(&ctx) {
                    Ok(_) => Ok(false),
                    Err(caught) => {
                        self.note_exception(&ctx, caught);
                        Ok(true)
                    }
                }
            })?
        };
        if self.budget.timed_out() {
            self.disable(&format!("event `{}` timed out", event.name()));
            bail!("event `{}` timed out", event.name());
        }
        self.drain_jobs();
        self.budget.end();
        if self.disabled {
            bail!("plugin disabled during event `{}`", event.name());
        }
        if threw {
            bail!("plugin threw during event `{}`", event.name());
        }
        Ok(())
    }

    /// Calls the command hook; the returned truthiness is this plugin's
    /// "handled" verdict.
    pub(crate) fn dispatch(&mut self, name: &str, args: &str) -> bool {
        if self.disabled {
            return false;
        }
        let Some(cmd_fn) = self.cmd_fn.clone() else {
            return false;
        };
        self.budget.begin(self.event_budget_ms());
        let verdict = {
            let Some(vm) = &self.vm else {
                return false;
            };
            vm.context.with(|ctx| {
                let hook = match cmd_fn.restore(&ctx) {
                    Ok(h) => h,
                    Err(_) => return false,
                };
                match hook.call::<_, Value>((name, args)).catch(&ctx) {
                    Ok(v) => js_truthy(&v),
                    Err(caught) => {
                        self.note_exception(&ctx, caught);
                        false
                    }
                }
            })
        };
        if self.budget.timed_out() {
            self.disable(&format!("command `{name}` timed out"));
            return false;
        }
        self.drain_jobs();
        self.budget.end();
        if self.disabled {
            return false;
        }
        verdict
    }

    /// Delivers finished background work: subprocesses first, then fetches,
    /// one completion at a time so a disable mid-delivery leaves nothing
    /// half-owned.
    pub(crate) fn poll(&mut self) {
        loop {
            if self.disabled {
                return;
            }
            let next = {
                let mut st = self.state.borrow_mut();
                let mut found = None;
                for i in 0..st.execs.len() {
                    if let Some(outcome) = st.execs[i].task.poll() {
                        found = Some((i, outcome));
                        break;
                    }
                }
                found.map(|(i, outcome)| (st.execs.remove(i), outcome))
            };
            match next {
                Some((pending, outcome)) => self.complete_exec(pending, outcome),
                None => break,
            }
        }
        loop {
            if self.disabled {
                return;
            }
            let next = {
                let mut st = self.state.borrow_mut();
                st.fetches
                    .iter()
                    .position(|p| p.task.is_done())
                    .map(|i| st.fetches.remove(i))
            };
            match next {
                Some(pending) => self.complete_fetch(pending),
                None => break,
            }
        }
    }

    fn complete_exec(&mut self, pending: PendingExec, outcome: ExecOutcome) {
        let PendingExec {
            task,
            resolve,
            reject,
        } = pending;
        drop(task);

        let failed = outcome.failed();
        let mut payload = json!({
            "code": outcome.code,
            "stdout": String::from_utf8_lossy(&outcome.stdout),
            "stderr": String::from_utf8_lossy(&outcome.stderr),
            "timedOut": outcome.timed_out,
            "truncated": outcome.truncated,
            "signal": outcome.signal,
        });
        if failed {
            let message = if outcome.timed_out {
                "process timed out"
            } else {
                "process output truncated"
            };
            payload["message"] = serde_json::Value::from(message);
            self.shared.borrow_mut().had_error = true;
        }

        self.budget.begin(self.event_budget_ms());
        {
            let Some(vm) = &self.vm else {
                return;
            };
            vm.context.with(|ctx| {
                let (taken, other) = if failed {
                    (reject, resolve)
                } else {
                    (resolve, reject)
                };
                let _ = other.restore(&ctx);
                let Ok(callback) = taken.restore(&ctx) else {
                    return;
                };
                let Ok(value) = json_to_js(&ctx, &payload) else {
                    return;
                };
                if let Err(caught) = callback.call::<_, ()>((value,)).catch(&ctx) {
                    self.note_exception(&ctx, caught);
                }
            });
        }
        if self.budget.timed_out() {
            self.disable("promise resolution timed out");
            return;
        }
        self.drain_jobs();
        self.budget.end();
    }

    fn complete_fetch(&mut self, pending: PendingFetch) {
        let PendingFetch {
            task,
            resolve,
            reject,
        } = pending;
        let id = task.id();
        let resp = task.join();
        debug!(id, status = resp.status, failed = resp.failed(), "fetch completed");

        let failed = resp.failed();
        if failed {
            self.shared.borrow_mut().had_error = true;
        }

        self.budget.begin(self.event_budget_ms());
        {
            let Some(vm) = &self.vm else {
                return;
            };
            vm.context.with(|ctx| {
                let (taken, other) = if failed {
                    (reject, resolve)
                } else {
                    (resolve, reject)
                };
                let _ = other.restore(&ctx);
                let Ok(callback) = taken.restore(&ctx) else {
                    return;
                };
                let built = if failed {
                    build_fetch_error(&ctx, &resp)
                } else {
                    build_fetch_result(&ctx, &resp)
                };
                let Ok(value) = built else {
                    return;
                };
                if let Err(caught) = callback.call::<_, ()>((value,)).catch(&ctx) {
                    self.note_exception(&ctx, caught);
                }
            });
        }
        if self.budget.timed_out() {
            self.disable("promise resolution timed out");
            return;
        }
        self.drain_jobs();
        self.budget.end();
    }
}

impl Drop for PluginRuntime {
    fn drop(&mut self) {
        self.release_vm();
    }
}

fn build_fetch_result<'js>(ctx: &Ctx<'js>, resp: &FetchResponse) -> JsResult<Value<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("status", i32::from(resp.status))?;
    obj.set("statusText", resp.status_text.as_str())?;
    obj.set("url", resp.url.as_str())?;
    let headers = Array::new(ctx.clone())?;
    for (i, (name, value)) in resp.headers.iter().enumerate() {
        let pair = Array::new(ctx.clone())?;
        pair.set(0, name.as_str())?;
        pair.set(1, value.as_str())?;
        headers.set(i, pair)?;
    }
    obj.set("headers", headers)?;
    obj.set("body", ArrayBuffer::new(ctx.clone(), resp.body.clone())?)?;
    obj.set("truncated", resp.truncated)?;
    Ok(obj.into_value())
}

fn build_fetch_error<'js>(ctx: &Ctx<'js>, resp: &FetchResponse) -> JsResult<Value<'js>> {
    let message = resp
        .error
        .clone()
        .unwrap_or_else(|| "fetch failed".to_string());
    let error = Exception::from_message(ctx.clone(), &message)?;
    error.set("status", i32::from(resp.status))?;
    error.set("url", resp.url.as_str())?;
    error.set("truncated", resp.truncated)?;
    if resp.aborted {
        error.set("name", "AbortError")?;
    }
    Ok(error.into_value())
}
