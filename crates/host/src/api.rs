//! The fixed `__sage_*` surface injected into every plugin's global object.
//!
//! Error discipline: bad caller input throws a VM exception and latches
//! nothing; runtime failures of work the plugin asked for come back as
//! rejected promises and latch the host error bit when they complete.

use std::path::{Path, PathBuf};

use rquickjs::convert::Coerced;
use rquickjs::function::{Func, Opt, Rest};
use rquickjs::{
    ArrayBuffer, Ctx, Exception, FromJs, Persistent, Promise, Result as JsResult, TypedArray,
    Value,
};
use tracing::debug;

use crate::state::{PendingExec, PendingFetch, PluginRef, SharedRef};
use crate::values::{coerce_display, js_truthy};
use crate::{console, queue, APP_VERSION, ENGINE_VERSION};
use sandbox::paths::{self, OpenMode};
use supervise::{exec, fetch, ExecTask, FetchRequest, FetchTask};

/// Largest `__sage_crypto_random_bytes` request.
pub(crate) const MAX_RANDOM_BYTES: usize = 1024 * 1024;
/// Ceiling for any scoped-FS read.
pub(crate) const READ_CAP_CEILING: usize = 4 * 1024 * 1024;
/// Read cap used when the caller does not pass one.
pub(crate) const READ_CAP_DEFAULT: usize = 256 * 1024;
/// Largest accepted data-root write.
pub(crate) const WRITE_CAP: usize = 4 * 1024 * 1024;

fn throw<'js, T>(ctx: &Ctx<'js>, msg: &str) -> JsResult<T> {
    Err(Exception::throw_message(ctx, msg))
}

/// Forces a closure passed to `Func::from` to be usable for every `'js`
/// instead of the single (ambiguous) lifetime rustc would otherwise infer
/// for a closure literal wrapping an invariant rquickjs return type.
fn constrain_buf<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, f64) -> JsResult<ArrayBuffer<'js>>,
{
    f
}

fn constrain_path_buf<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, String, Opt<f64>) -> JsResult<ArrayBuffer<'js>>,
{
    f
}

fn constrain_exec<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, String, Opt<f64>, Opt<f64>) -> JsResult<Promise<'js>>,
{
    f
}

fn constrain_fetch<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, String, Opt<rquickjs::Object<'js>>) -> JsResult<Promise<'js>>,
{
    f
}

fn constrain_write<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, String, Value<'js>) -> JsResult<()>,
{
    f
}

fn constrain_console<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Value<'js>, Rest<Value<'js>>) -> JsResult<()>,
{
    f
}

fn constrain_log<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Rest<Value<'js>>) -> JsResult<()>,
{
    f
}

fn constrain_report<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Opt<Value<'js>>) -> JsResult<()>,
{
    f
}

/// Defines the whole host API on the context's global object.
pub(crate) fn install(ctx: &Ctx<'_>, shared: &SharedRef, plugin: &PluginRef) -> JsResult<()> {
    let g = ctx.globals();

    g.set("__sage_console", Func::from(constrain_console({
        let sh = shared.clone();
        let pl = plugin.clone();
        move |ctx: Ctx<'_>, level: Value<'_>, args: Rest<Value<'_>>| {
            console_log(ctx, &sh, &pl, level, args)
        }
    })))?;
    g.set("__sage_log", Func::from(constrain_log({
        let sh = shared.clone();
        let pl = plugin.clone();
        move |ctx: Ctx<'_>, args: Rest<Value<'_>>| js_log(ctx, &sh, &pl, args)
    })))?;
    g.set("__sage_report_exception", Func::from(constrain_report({
        let sh = shared.clone();
        let pl = plugin.clone();
        move |ctx: Ctx<'_>, err: Opt<Value<'_>>| report_exception(ctx, &sh, &pl, err)
    })))?;
    g.set("__sage_exec", Func::from({
        let sh = shared.clone();
        move |ctx: Ctx<'_>, cmd: Coerced<String>| enqueue_command(ctx, &sh, cmd)
    }))?;

    g.set("__sage_env_get", Func::from(|name: String| std::env::var(&name).ok()))?;
    g.set("__sage_env_set", Func::from(
        |ctx: Ctx<'_>, name: String, value: String, overwrite: Opt<bool>| {
            env_set(ctx, name, value, overwrite)
        },
    ))?;
    g.set("__sage_env_unset", Func::from(|name: String| {
        if !name.is_empty() {
            std::env::remove_var(&name);
        }
    }))?;

    g.set("__sage_app_version", Func::from(|| APP_VERSION))?;
    g.set("__sage_qjs_version", Func::from(|| ENGINE_VERSION))?;
    g.set("__sage_crypto_random_bytes", Func::from(
        constrain_buf(|ctx: Ctx<'_>, len: f64| crypto_random_bytes(ctx, len)),
    ))?;
    g.set("__sage_performance_now", Func::from(sandbox::clock::now_ms))?;
    g.set("__sage_process_pid", Func::from(|| f64::from(std::process::id())))?;
    g.set("__sage_process_ppid", Func::from(|| f64::from(sandbox::parent_pid())))?;
    g.set("__sage_process_cwd", Func::from(|ctx: Ctx<'_>| process_cwd(ctx)))?;

    g.set("__sage_process_exec", Func::from(constrain_exec({
        let pl = plugin.clone();
        move |ctx: Ctx<'_>, cmd: String, timeout_ms: Opt<f64>, max_bytes: Opt<f64>| {
            process_exec(ctx, &pl, cmd, timeout_ms, max_bytes)
        }
    })))?;
    g.set("__sage_fetch", Func::from(constrain_fetch({
        let sh = shared.clone();
        let pl = plugin.clone();
        move |ctx: Ctx<'_>, url: String, opts: Opt<rquickjs::Object<'_>>| {
            fetch_start(ctx, &sh, &pl, url, opts)
        }
    })))?;
    g.set("__sage_fetch_abort", Func::from({
        let pl = plugin.clone();
        move |id: f64| fetch_abort(&pl, id)
    }))?;

    g.set("__sage_fs_data_dir", Func::from({
        let pl = plugin.clone();
        move |ctx: Ctx<'_>| fs_data_dir(ctx, &pl)
    }))?;
    g.set("__sage_fs_exists", Func::from({
        let sh = shared.clone();
        let pl = plugin.clone();
        move |path: String| allowed_read_path(&sh, &pl, &path).is_ok()
    }))?;
    g.set("__sage_fs_read_text", Func::from({
        let sh = shared.clone();
        let pl = plugin.clone();
        move |ctx: Ctx<'_>, path: String, max: Opt<f64>| fs_read_text(ctx, &sh, &pl, path, max)
    }))?;
    g.set("__sage_fs_read_bytes", Func::from(constrain_path_buf({
        let sh = shared.clone();
        let pl = plugin.clone();
        move |ctx: Ctx<'_>, path: String, max: Opt<f64>| fs_read_bytes(ctx, &sh, &pl, path, max)
    })))?;
    g.set("__sage_fs_read_data_text", Func::from({
        let pl = plugin.clone();
        move |ctx: Ctx<'_>, rel: String, max: Opt<f64>| fs_read_data_text(ctx, &pl, rel, max)
    }))?;
    g.set("__sage_fs_read_data_bytes", Func::from(constrain_path_buf({
        let pl = plugin.clone();
        move |ctx: Ctx<'_>, rel: String, max: Opt<f64>| fs_read_data_bytes(ctx, &pl, rel, max)
    })))?;
    g.set("__sage_fs_write_data_text", Func::from({
        let pl = plugin.clone();
        move |ctx: Ctx<'_>, rel: String, text: String| fs_write_data_text(ctx, &pl, rel, text)
    }))?;
    g.set("__sage_fs_write_data_bytes", Func::from(constrain_write({
        let pl = plugin.clone();
        move |ctx: Ctx<'_>, rel: String, data: Value<'_>| fs_write_data_bytes(ctx, &pl, rel, data)
    })))?;
    g.set("__sage_fs_list_data", Func::from({
        let pl = plugin.clone();
        move |ctx: Ctx<'_>, rel: Opt<String>| fs_list_data(ctx, &pl, rel)
    }))?;

    Ok(())
}

fn console_log<'js>(
    ctx: Ctx<'js>,
    shared: &SharedRef,
    plugin: &PluginRef,
    level: Value<'js>,
    args: Rest<Value<'js>>,
) -> JsResult<()> {
    let tag = coerce_display(&ctx, level);
    let threshold = shared.borrow().console_threshold;
    if threshold < 0 || console::message_level(&tag) > threshold {
        return Ok(());
    }
    let mut line = format!("sage[console:{}:{}]", tag, plugin.borrow().path.display());
    for value in args.0 {
        line.push(' ');
        line.push_str(&coerce_display(&ctx, value));
    }
    shared.borrow_mut().log_line(&line);
    Ok(())
}

fn js_log<'js>(
    ctx: Ctx<'js>,
    shared: &SharedRef,
    plugin: &PluginRef,
    args: Rest<Value<'js>>,
) -> JsResult<()> {
    if !shared.borrow().verbose {
        return Ok(());
    }
    let mut line = format!("sage[js:{}]", plugin.borrow().path.display());
    for value in args.0 {
        line.push(' ');
        line.push_str(&coerce_display(&ctx, value));
    }
    shared.borrow_mut().log_line(&line);
    Ok(())
}

fn report_exception<'js>(
    ctx: Ctx<'js>,
    shared: &SharedRef,
    plugin: &PluginRef,
    err: Opt<Value<'js>>,
) -> JsResult<()> {
    let exc = match err.0 {
        Some(v) => v,
        None => ctx.catch(),
    };
    let text = coerce_display(&ctx, exc.clone());
    let stack = exc
        .as_object()
        .and_then(|o| o.get::<_, Option<Coerced<String>>>("stack").ok().flatten())
        .map(|c| c.0);

    let path = plugin.borrow().path.clone();
    let mut sh = shared.borrow_mut();
    sh.had_error = true;
    sh.plugin_line(&path, &format!("error: {text}"));
    if sh.verbose {
        if let Some(stack) = stack {
            sh.plugin_line(&path, &format!("stack: {stack}"));
        }
    }
    Ok(())
}

fn enqueue_command<'js>(ctx: Ctx<'js>, shared: &SharedRef, cmd: Coerced<String>) -> JsResult<()> {
    let cmd = cmd.0;
    if cmd.len() > queue::MAX_COMMAND_BYTES {
        return throw(&ctx, "command exceeds 4096 bytes");
    }
    let mut sh = shared.borrow_mut();
    if sh.disabled {
        drop(sh);
        return throw(&ctx, "plugin host is disabled");
    }
    if let Err(err) = sh.queue.enqueue(&cmd) {
        sh.had_error = true;
        let msg = err.to_string();
        drop(sh);
        return throw(&ctx, &msg);
    }
    Ok(())
}

fn env_set<'js>(
    ctx: Ctx<'js>,
    name: String,
    value: String,
    overwrite: Opt<bool>,
) -> JsResult<()> {
    if name.is_empty() || name.contains('=') || name.contains('\0') {
        return throw(&ctx, "invalid environment variable name");
    }
    if !overwrite.0.unwrap_or(true) && std::env::var_os(&name).is_some() {
        return Ok(());
    }
    std::env::set_var(&name, &value);
    Ok(())
}

fn crypto_random_bytes(ctx: Ctx<'_>, len: f64) -> JsResult<ArrayBuffer<'_>> {
    if !len.is_finite() || len < 0.0 || len.fract() != 0.0 {
        return throw(&ctx, "length must be a non-negative integer");
    }
    let len = len as usize;
    if len > MAX_RANDOM_BYTES {
        return throw(&ctx, "length exceeds 1 MiB");
    }
    let mut buf = vec![0u8; len];
    sandbox::rng::fill_random(&mut buf)
        .map_err(|e| Exception::throw_message(&ctx, &e.to_string()))?;
    ArrayBuffer::new(ctx.clone(), buf)
}

fn process_cwd(ctx: Ctx<'_>) -> JsResult<String> {
    std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .map_err(|e| Exception::throw_message(&ctx, &format!("cwd: {e}")))
}

fn clamp_timeout(v: f64, ceiling: u64) -> u64 {
    if !v.is_finite() || v <= 0.0 {
        0
    } else {
        (v as u64).min(ceiling)
    }
}

fn clamp_bytes(v: f64, ceiling: usize) -> usize {
    if !v.is_finite() || v < 1.0 {
        1
    } else {
        (v as usize).min(ceiling)
    }
}

fn process_exec<'js>(
    ctx: Ctx<'js>,
    plugin: &PluginRef,
    cmd: String,
    timeout_ms: Opt<f64>,
    max_bytes: Opt<f64>,
) -> JsResult<Promise<'js>> {
    if cmd.is_empty() {
        return throw(&ctx, "command is empty");
    }
    if cmd.len() > exec::MAX_CMD_BYTES {
        return throw(&ctx, "command exceeds 8192 bytes");
    }
    let timeout_ms = match timeout_ms.0 {
        Some(v) => clamp_timeout(v, exec::MAX_TIMEOUT_MS),
        None => exec::DEFAULT_TIMEOUT_MS,
    };
    let max_bytes = match max_bytes.0 {
        Some(v) => clamp_bytes(v, exec::MAX_CAPTURE_BYTES),
        None => exec::DEFAULT_CAPTURE_BYTES,
    };

    let task = ExecTask::spawn(&cmd, timeout_ms, max_bytes)
        .map_err(|e| Exception::throw_message(&ctx, &e.to_string()))?;
    let (promise, resolve, reject) = Promise::new(&ctx)?;
    plugin.borrow_mut().execs.push(PendingExec {
        task,
        resolve: Persistent::save(&ctx, resolve),
        reject: Persistent::save(&ctx, reject),
    });
    Ok(promise)
}

fn parse_headers<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> JsResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    if let Some(arr) = value.as_array() {
        for entry in arr.iter::<Value>() {
            let entry = entry?;
            let Some(pair) = entry.as_array() else {
                return throw(ctx, "headers entries must be [name, value] pairs");
            };
            let name: Coerced<String> = pair.get(0)?;
            let value: Coerced<String> = pair.get(1)?;
            let name = name.0.trim().to_string();
            if name.is_empty() {
                return throw(ctx, "header name is empty");
            }
            out.push((name, value.0.trim().to_string()));
        }
        return Ok(out);
    }
    if let Some(obj) = value.as_object() {
        for prop in obj.props::<String, Coerced<String>>() {
            let (name, value) = prop?;
            let name = name.trim().to_string();
            if name.is_empty() {
                continue;
            }
            out.push((name, value.0.trim().to_string()));
        }
        return Ok(out);
    }
    throw(ctx, "headers must be an array of pairs or an object")
}

fn body_bytes<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> JsResult<Vec<u8>> {
    if let Some(s) = value.as_string() {
        return Ok(s.to_string()?.into_bytes());
    }
    if let Ok(buf) = ArrayBuffer::from_js(ctx, value.clone()) {
        return buf
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Exception::throw_message(ctx, "byte buffer is detached"));
    }
    if let Ok(view) = TypedArray::<u8>::from_js(ctx, value.clone()) {
        return view
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Exception::throw_message(ctx, "byte buffer is detached"));
    }
    throw(ctx, "expected a string or byte buffer")
}

fn parse_fetch_opts<'js>(
    ctx: &Ctx<'js>,
    url: String,
    opts: Option<rquickjs::Object<'js>>,
) -> JsResult<FetchRequest> {
    let mut req = FetchRequest {
        url,
        method: "GET".to_string(),
        headers: Vec::new(),
        body: None,
        timeout_ms: fetch::DEFAULT_TIMEOUT_MS,
        max_bytes: fetch::DEFAULT_BODY_BYTES,
        follow_redirects: true,
    };
    let Some(opts) = opts else {
        return Ok(req);
    };

    if let Some(method) = opts.get::<_, Option<Coerced<String>>>("method")? {
        let method = method.0.to_ascii_uppercase();
        if method.is_empty()
            || method.len() > 32
            || !method.bytes().all(|b| (33..=126).contains(&b))
        {
            return throw(ctx, "invalid method");
        }
        req.method = method;
    }
    if let Some(headers) = opts.get::<_, Option<Value>>("headers")? {
        req.headers = parse_headers(ctx, headers)?;
    }
    if let Some(body) = opts.get::<_, Option<Value>>("body")? {
        let bytes = body_bytes(ctx, body)?;
        if bytes.len() > fetch::MAX_UPLOAD_BYTES {
            return throw(ctx, "body exceeds 16 MiB");
        }
        req.body = Some(bytes);
    }
    if let Some(t) = opts.get::<_, Option<f64>>("timeoutMs")? {
        req.timeout_ms = clamp_timeout(t, fetch::MAX_TIMEOUT_MS);
    }
    if let Some(m) = opts.get::<_, Option<f64>>("maxBytes")? {
        req.max_bytes = clamp_bytes(m, fetch::MAX_BODY_BYTES);
    }
    if let Some(f) = opts.get::<_, Option<Value>>("followRedirects")? {
        req.follow_redirects = js_truthy(&f);
    }

    if matches!(req.method.as_str(), "GET" | "HEAD") && req.body.is_some() {
        return throw(ctx, "GET/HEAD requests cannot carry a body");
    }
    Ok(req)
}

fn fetch_start<'js>(
    ctx: Ctx<'js>,
    shared: &SharedRef,
    plugin: &PluginRef,
    url: String,
    opts: Opt<rquickjs::Object<'js>>,
) -> JsResult<Promise<'js>> {
    if url.is_empty() {
        return throw(&ctx, "url is empty");
    }
    let req = parse_fetch_opts(&ctx, url, opts.0)?;
    let id = {
        let mut sh = shared.borrow_mut();
        sh.next_fetch_id += 1;
        sh.next_fetch_id
    };
    let (promise, resolve, reject) = Promise::new(&ctx)?;
    promise.set("id", id as f64)?;
    debug!(id, url = %req.url, method = %req.method, "fetch dispatched");
    let task = FetchTask::spawn(id, req);
    plugin.borrow_mut().fetches.push(PendingFetch {
        task,
        resolve: Persistent::save(&ctx, resolve),
        reject: Persistent::save(&ctx, reject),
    });
    Ok(promise)
}

fn fetch_abort(plugin: &PluginRef, id: f64) -> bool {
    let id = id as u64;
    let st = plugin.borrow();
    for pending in &st.fetches {
        if pending.task.id() == id {
            pending.task.cancel();
            return true;
        }
    }
    false
}

/// Creates the data dir on first use and caches its realpath.
fn ensure_data_dir(plugin: &PluginRef) -> anyhow::Result<PathBuf> {
    let mut st = plugin.borrow_mut();
    if let Some(dir) = &st.data_dir {
        return Ok(dir.clone());
    }
    let dir = sandbox::ensure_data_dir(&st.path)?;
    st.data_dir = Some(dir.clone());
    Ok(dir)
}

fn fs_data_dir(ctx: Ctx<'_>, plugin: &PluginRef) -> JsResult<String> {
    ensure_data_dir(plugin)
        .map(|d| d.to_string_lossy().into_owned())
        .map_err(|e| Exception::throw_message(&ctx, &e.to_string()))
}

/// Allowlist gate: the canonical path must sit under the plugin's data dir or
/// match an allowlisted path exactly.
fn allowed_read_path(
    shared: &SharedRef,
    plugin: &PluginRef,
    raw: &str,
) -> anyhow::Result<PathBuf> {
    let canon = paths::canonicalize(Path::new(raw))?;
    if let Ok(dir) = ensure_data_dir(plugin) {
        if paths::contains(&dir, &canon) {
            return Ok(canon);
        }
    }
    if shared.borrow().allowlist.contains(&canon) {
        return Ok(canon);
    }
    anyhow::bail!("access denied: {raw}")
}

fn read_cap(ctx: &Ctx<'_>, max_bytes: Option<f64>) -> JsResult<usize> {
    match max_bytes {
        None => Ok(READ_CAP_DEFAULT),
        Some(v) if v.is_finite() && v >= 1.0 => Ok((v as usize).min(READ_CAP_CEILING)),
        Some(_) => throw(ctx, "maxBytes must be a positive number"),
    }
}

fn fs_read_allowed(
    ctx: &Ctx<'_>,
    shared: &SharedRef,
    plugin: &PluginRef,
    path: &str,
    max: Option<f64>,
) -> JsResult<Vec<u8>> {
    let cap = read_cap(ctx, max)?;
    let canon = allowed_read_path(shared, plugin, path)
        .map_err(|e| Exception::throw_message(ctx, &e.to_string()))?;
    let file = std::fs::File::open(&canon)
        .map_err(|e| Exception::throw_message(ctx, &format!("open {path}: {e}")))?;
    paths::read_bounded(file, cap).map_err(|e| Exception::throw_message(ctx, &e.to_string()))
}

fn fs_read_text<'js>(
    ctx: Ctx<'js>,
    shared: &SharedRef,
    plugin: &PluginRef,
    path: String,
    max: Opt<f64>,
) -> JsResult<String> {
    let bytes = fs_read_allowed(&ctx, shared, plugin, &path, max.0)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn fs_read_bytes<'js>(
    ctx: Ctx<'js>,
    shared: &SharedRef,
    plugin: &PluginRef,
    path: String,
    max: Opt<f64>,
) -> JsResult<ArrayBuffer<'js>> {
    let bytes = fs_read_allowed(&ctx, shared, plugin, &path, max.0)?;
    ArrayBuffer::new(ctx.clone(), bytes)
}

fn data_open(
    ctx: &Ctx<'_>,
    plugin: &PluginRef,
    rel: &str,
    mode: OpenMode,
) -> JsResult<std::fs::File> {
    let dir =
        ensure_data_dir(plugin).map_err(|e| Exception::throw_message(ctx, &e.to_string()))?;
    paths::open_beneath(&dir, rel, mode).map_err(|e| Exception::throw_message(ctx, &e.to_string()))
}

fn fs_read_data_text<'js>(
    ctx: Ctx<'js>,
    plugin: &PluginRef,
    rel: String,
    max: Opt<f64>,
) -> JsResult<String> {
    let cap = read_cap(&ctx, max.0)?;
    let file = data_open(&ctx, plugin, &rel, OpenMode::Read)?;
    let bytes =
        paths::read_bounded(file, cap).map_err(|e| Exception::throw_message(&ctx, &e.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn fs_read_data_bytes<'js>(
    ctx: Ctx<'js>,
    plugin: &PluginRef,
    rel: String,
    max: Opt<f64>,
) -> JsResult<ArrayBuffer<'js>> {
    let cap = read_cap(&ctx, max.0)?;
    let file = data_open(&ctx, plugin, &rel, OpenMode::Read)?;
    let bytes =
        paths::read_bounded(file, cap).map_err(|e| Exception::throw_message(&ctx, &e.to_string()))?;
    ArrayBuffer::new(ctx.clone(), bytes)
}

fn write_data(ctx: &Ctx<'_>, plugin: &PluginRef, rel: &str, bytes: &[u8]) -> JsResult<()> {
    if bytes.len() > WRITE_CAP {
        return throw(ctx, "write exceeds 4 MiB");
    }
    let file = data_open(ctx, plugin, rel, OpenMode::Write)?;
    paths::write_all(file, bytes).map_err(|e| Exception::throw_message(ctx, &e.to_string()))
}

fn fs_write_data_text<'js>(
    ctx: Ctx<'js>,
    plugin: &PluginRef,
    rel: String,
    text: String,
) -> JsResult<()> {
    write_data(&ctx, plugin, &rel, text.as_bytes())
}

fn fs_write_data_bytes<'js>(
    ctx: Ctx<'js>,
    plugin: &PluginRef,
    rel: String,
    data: Value<'js>,
) -> JsResult<()> {
    let bytes = body_bytes(&ctx, data)?;
    write_data(&ctx, plugin, &rel, &bytes)
}

fn fs_list_data<'js>(
    ctx: Ctx<'js>,
    plugin: &PluginRef,
    rel: Opt<String>,
) -> JsResult<Vec<String>> {
    let dir =
        ensure_data_dir(plugin).map_err(|e| Exception::throw_message(&ctx, &e.to_string()))?;
    let handle = match rel.0 {
        Some(r) => data_open(&ctx, plugin, &r, OpenMode::Dir)?,
        None => std::fs::File::open(&dir)
            .map_err(|e| Exception::throw_message(&ctx, &format!("open data dir: {e}")))?,
    };
    paths::list_dir(handle).map_err(|e| Exception::throw_message(&ctx, &e.to_string()))
}
