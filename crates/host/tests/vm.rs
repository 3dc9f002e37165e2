//! End-to-end tests driving real plugin VMs through the embedder API.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use host::{Host, TakeCmd};

/// Points the log and the plugin data roots at a directory that lives for
/// the whole test run, before the first `Host` is created.
fn test_base() -> &'static Path {
    static BASE: OnceLock<PathBuf> = OnceLock::new();
    BASE.get_or_init(|| {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        std::mem::forget(dir);
        std::env::set_var("SAGE_PLUGIN_LOG", path.join("plugins.log"));
        std::env::set_var("XDG_STATE_HOME", path.join("state"));
        path
    })
}

fn new_host() -> Host {
    test_base();
    Host::new(false)
}

/// Bootstrap that fans events out to handlers the plugin module registers.
const BOOTSTRAP: &str = r#"
globalThis.__handlers = [];
globalThis.__sage_emit = (name, payload) => {
    for (const h of globalThis.__handlers) h(name, payload);
};
globalThis.__sage_cmd = (name, args) => name === "greet";
"#;

fn write_plugin(dir: &Path, name: &str, source: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, source).unwrap();
    path
}

fn pump(host: &mut Host, timeout: Duration) -> Option<String> {
    let start = Instant::now();
    loop {
        host.poll();
        if let Some(cmd) = host.take_cmd() {
            return Some(cmd);
        }
        if start.elapsed() > timeout {
            return None;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn bootstrap_without_emit_hook_is_rejected() {
    let mut host = new_host();
    assert!(host.eval_bootstrap("globalThis.x = 1;").is_err());
    assert!(host.take_error());

    // The session is disabled from here on.
    let tmp = tempfile::TempDir::new().unwrap();
    let plugin = write_plugin(tmp.path(), "late.js", "export {};");
    assert!(host.eval_file(&plugin).is_err());
}

#[test]
fn events_reach_plugins_and_commands_report_verdicts() {
    let mut host = new_host();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let plugin = write_plugin(
        tmp.path(),
        "events.js",
        r#"
globalThis.__handlers.push((name, payload) => {
    if (name === "open") {
        __sage_exec("open " + payload.path + ":" + payload.tab + "/" + payload.tab_count);
    }
});
export {};
"#,
    );
    host.eval_file(&plugin).unwrap();
    assert_eq!(host.plugin_count(), 1);
    assert_eq!(host.disabled_count(), 0);

    host.emit_open("/tmp/file.txt", 1, 2).unwrap();
    assert_eq!(host.take_cmd().as_deref(), Some("open /tmp/file.txt:1/2"));

    assert!(host.command("greet", ""));
    assert!(!host.command("unknown", ""));
    assert!(!host.take_error());
}

#[test]
fn take_exec_cmd_retains_entries_that_do_not_fit() {
    let mut host = new_host();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let plugin = write_plugin(
        tmp.path(),
        "queuecheck.js",
        r#"__sage_exec("a command that needs room"); export {};"#,
    );
    host.eval_file(&plugin).unwrap();

    let mut small = [0u8; 4];
    assert_eq!(host.take_exec_cmd(&mut small), TakeCmd::TooSmall(25));
    assert_eq!(host.queued_commands(), 1);

    let mut big = [0u8; 64];
    match host.take_exec_cmd(&mut big) {
        TakeCmd::Taken(n) => assert_eq!(&big[..n], b"a command that needs room"),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(host.take_exec_cmd(&mut big), TakeCmd::Empty);
}

#[test]
fn imports_outside_the_plugin_root_are_refused() {
    let mut host = new_host();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::write(tmp.path().join("escape.js"), "export const leaked = 1;").unwrap();
    let root = tmp.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let plugin = write_plugin(&root, "escaper.js", r#"import "../escape.js"; export {};"#);

    assert!(host.eval_file(&plugin).is_err());
    assert_eq!(host.disabled_count(), 1);
    assert!(host.take_error());
}

#[test]
fn builtin_modules_resolve_by_scheme() {
    let mut host = new_host();
    host.add_builtin_module("sage:util", "export const seven = 7;")
        .unwrap();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let plugin = write_plugin(
        tmp.path(),
        "uses_builtin.js",
        r#"import { seven } from "sage:util"; __sage_exec("got " + seven); export {};"#,
    );
    host.eval_file(&plugin).unwrap();
    assert_eq!(host.take_cmd().as_deref(), Some("got 7"));
}

#[test]
fn relative_imports_inside_the_root_work() {
    let mut host = new_host();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(tmp.path().join("lib")).unwrap();
    std::fs::write(
        tmp.path().join("lib/answer.js"),
        "export const answer = 42;",
    )
    .unwrap();
    let plugin = write_plugin(
        tmp.path(),
        "importer.js",
        r#"import { answer } from "./lib/answer.js"; __sage_exec("answer " + answer); export {};"#,
    );
    host.eval_file(&plugin).unwrap();
    assert_eq!(host.take_cmd().as_deref(), Some("answer 42"));
}

#[test]
fn runaway_event_handler_disables_only_that_plugin() {
    let mut host = new_host();
    host.set_timeouts_ms(1000, 50);
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let spinner = write_plugin(
        tmp.path(),
        "spinner.js",
        r#"
globalThis.__handlers.push((name) => {
    if (name === "quit") { for (;;) {} }
});
export {};
"#,
    );
    let steady = write_plugin(
        tmp.path(),
        "steady.js",
        r#"
globalThis.__handlers.push((name, payload) => {
    if (name === "search") { __sage_exec("saw " + payload.query); }
});
export {};
"#,
    );
    host.eval_file(&spinner).unwrap();
    host.eval_file(&steady).unwrap();

    host.emit_search("first", false, false).unwrap();
    assert_eq!(host.take_cmd().as_deref(), Some("saw first"));

    let started = Instant::now();
    assert!(host.emit_quit().is_err());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(host.disabled_count(), 1);
    assert!(host.take_error());

    // The surviving plugin still observes events in order.
    host.emit_search("second", false, false).unwrap();
    assert_eq!(host.take_cmd().as_deref(), Some("saw second"));
    assert!(!host.take_error());
}

#[test]
fn top_level_await_is_refused() {
    let mut host = new_host();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let plugin = write_plugin(
        tmp.path(),
        "tla.js",
        r#"await new Promise(() => {}); export {};"#,
    );
    assert!(host.eval_file(&plugin).is_err());
    assert_eq!(host.disabled_count(), 1);
    assert!(host.take_error());
}

#[test]
fn exec_promises_resolve_through_poll() {
    let mut host = new_host();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let plugin = write_plugin(
        tmp.path(),
        "execer.js",
        r#"
globalThis.__handlers.push((name) => {
    if (name === "copy") {
        __sage_process_exec("printf hi", 5000, 1024)
            .then(r => __sage_exec("exec " + r.code + " " + r.stdout + " " + r.timedOut));
    }
});
export {};
"#,
    );
    host.eval_file(&plugin).unwrap();
    host.emit_copy(3).unwrap();

    let cmd = pump(&mut host, Duration::from_secs(10)).expect("exec never completed");
    assert_eq!(cmd, "exec 0 hi false");
    assert!(!host.take_error());
}

#[test]
fn exec_deadline_rejects_with_metadata() {
    let mut host = new_host();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let plugin = write_plugin(
        tmp.path(),
        "sleeper.js",
        r#"
globalThis.__handlers.push((name) => {
    if (name === "copy") {
        __sage_process_exec("sleep 30", 100, 1024)
            .catch(e => __sage_exec("timeout " + e.timedOut + " " + e.signal));
    }
});
export {};
"#,
    );
    host.eval_file(&plugin).unwrap();
    host.emit_copy(0).unwrap();

    let cmd = pump(&mut host, Duration::from_secs(10)).expect("exec never completed");
    assert_eq!(cmd, "timeout true 9");
    // A rejected subprocess is a plugin-observable runtime error.
    assert!(host.take_error());
    assert_eq!(host.disabled_count(), 0);
}

#[test]
fn data_root_io_roundtrips_and_allowlist_blocks() {
    let mut host = new_host();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let allowed = tmp.path().join("allowed.txt");
    std::fs::write(&allowed, "allowed-content").unwrap();
    host.allow_fs_read_path(&allowed).unwrap();

    let plugin = write_plugin(
        tmp.path(),
        "fsdata.js",
        &format!(
            r#"
globalThis.__handlers.push((name) => {{
    if (name !== "search") return;
    __sage_fs_write_data_text("a/b/c.txt", "hi");
    const round = __sage_fs_read_data_text("a/b/c.txt");
    const listing = __sage_fs_list_data().join(",");
    let denied = "no";
    try {{ __sage_fs_read_text("/etc/passwd"); }} catch (e) {{ denied = "yes"; }}
    const ok = __sage_fs_read_text({allowed:?});
    const missing = __sage_fs_exists("/etc/passwd") ? "leak" : "clean";
    __sage_exec(["fs", round, listing, denied, ok, missing].join(" "));
}});
export {{}};
"#,
            allowed = allowed.display().to_string()
        ),
    );
    host.eval_file(&plugin).unwrap();
    host.emit_search("go", false, false).unwrap();

    assert_eq!(
        host.take_cmd().as_deref(),
        Some("fs hi a yes allowed-content clean")
    );
    assert!(!host.take_error());
}

#[test]
fn traversal_segments_are_rejected() {
    let mut host = new_host();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let plugin = write_plugin(
        tmp.path(),
        "traversal.js",
        r#"
globalThis.__handlers.push((name) => {
    if (name !== "search") return;
    let outcome = "allowed";
    try { __sage_fs_write_data_text("../outside.txt", "x"); } catch (e) { outcome = "blocked"; }
    let abs = "allowed";
    try { __sage_fs_read_data_text("/etc/passwd"); } catch (e) { abs = "blocked"; }
    __sage_exec("traversal " + outcome + " " + abs);
});
export {};
"#,
    );
    host.eval_file(&plugin).unwrap();
    host.emit_search("go", false, false).unwrap();
    assert_eq!(host.take_cmd().as_deref(), Some("traversal blocked blocked"));
}

#[test]
fn fetch_roundtrips_through_a_local_server() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        let _ = sock.read(&mut buf);
        sock.write_all(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .unwrap();
    });

    let mut host = new_host();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let plugin = write_plugin(
        tmp.path(),
        "fetcher.js",
        r#"
globalThis.__handlers.push((name, payload) => {
    if (name !== "open") return;
    __sage_fetch(payload.path, { timeoutMs: 5000 }).then(r => {
        const body = String.fromCharCode.apply(null, new Uint8Array(r.body));
        __sage_exec("fetch " + r.status + " " + r.statusText + " " + body + " " + r.truncated);
    });
});
export {};
"#,
    );
    host.eval_file(&plugin).unwrap();
    host.emit_open(&format!("http://{addr}/"), 0, 1).unwrap();

    let cmd = pump(&mut host, Duration::from_secs(10)).expect("fetch never completed");
    assert_eq!(cmd, "fetch 200 OK hello false");
    server.join().unwrap();
    assert!(!host.take_error());
}

#[test]
fn fetch_abort_rejects_with_abort_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = std::thread::spawn(move || {
        let (mut sock, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        let _ = sock.read(&mut buf);
        let _ = sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100000000\r\n\r\n");
        let chunk = vec![b'a'; 1024];
        while sock.write_all(&chunk).is_ok() {
            std::thread::sleep(Duration::from_millis(10));
        }
    });

    let mut host = new_host();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let plugin = write_plugin(
        tmp.path(),
        "aborter.js",
        r#"
globalThis.__handlers.push((name, payload) => {
    if (name !== "open") return;
    const p = __sage_fetch(payload.path, { timeoutMs: 60000 });
    p.catch(e => __sage_exec("aborted " + e.name + " " + e.truncated));
    globalThis.__pending = p.id;
});
globalThis.__handlers.push((name) => {
    if (name === "copy" && globalThis.__pending !== undefined) {
        __sage_fetch_abort(globalThis.__pending);
    }
});
export {};
"#,
    );
    host.eval_file(&plugin).unwrap();
    host.emit_open(&format!("http://{addr}/"), 0, 1).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    host.emit_copy(0).unwrap();

    let cmd = pump(&mut host, Duration::from_secs(10)).expect("abort never completed");
    assert_eq!(cmd, "aborted AbortError false");
    // A failed fetch latches the error bit.
    assert!(host.take_error());
    let _ = server.join();
}

#[test]
fn misc_surface_reports_sane_values() {
    let mut host = new_host();
    host.eval_bootstrap(BOOTSTRAP).unwrap();

    let tmp = tempfile::TempDir::new().unwrap();
    let plugin = write_plugin(
        tmp.path(),
        "misc.js",
        r#"
globalThis.__handlers.push((name) => {
    if (name !== "copy") return;
    const rnd = __sage_crypto_random_bytes(8);
    __sage_env_set("SAGE_TEST_VM_VAR", "v1");
    const env = __sage_env_get("SAGE_TEST_VM_VAR");
    __sage_env_unset("SAGE_TEST_VM_VAR");
    const gone = __sage_env_get("SAGE_TEST_VM_VAR") === undefined;
    const now = typeof __sage_performance_now();
    const pid = __sage_process_pid() > 0;
    const ver = typeof __sage_app_version();
    __sage_exec(["misc", rnd.byteLength, env, gone, now, pid, ver].join(" "));
});
export {};
"#,
    );
    host.eval_file(&plugin).unwrap();
    host.emit_copy(0).unwrap();
    assert_eq!(
        host.take_cmd().as_deref(),
        Some("misc 8 v1 true number true string")
    );
}
