//! Subprocess supervision.
//!
//! Commands run under `/bin/sh -c` with both output streams piped back to the
//! host. The pipes are switched to non-blocking mode so the host thread can
//! drain them during its poll tick without ever stalling the VM. A task is
//! terminal once the child has been reaped and both pipes have reached EOF.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use sandbox::clock;

/// Longest accepted command string, in bytes.
pub const MAX_CMD_BYTES: usize = 8192;
/// Upper clamp for the per-command timeout.
pub const MAX_TIMEOUT_MS: u64 = 600_000;
/// Timeout used when the caller does not pass one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Upper clamp for per-stream capture.
pub const MAX_CAPTURE_BYTES: usize = 16 * 1024 * 1024;
/// Capture cap used when the caller does not pass one.
pub const DEFAULT_CAPTURE_BYTES: usize = 1024 * 1024;

/// Terminal state of a supervised subprocess.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub truncated: bool,
    pub signal: Option<i32>,
}

impl ExecOutcome {
    /// A failed outcome rejects the promise it backs.
    pub fn failed(&self) -> bool {
        self.timed_out || self.truncated
    }
}

/// One in-flight subprocess. Dropping the task kills and reaps the child.
pub struct ExecTask {
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    max_bytes: usize,
    deadline_ns: u64,
    timed_out: bool,
    truncated: bool,
    killed: bool,
    status: Option<ExitStatus>,
    spawn_failed: bool,
}

#[allow(unsafe_code)]
fn set_nonblocking(fd: RawFd) -> Result<()> {
    // Safety: fcntl on a descriptor we own; no memory is shared.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error()).context("read pipe flags");
    }
    // Safety: as above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("set pipe non-blocking");
    }
    Ok(())
}

impl ExecTask {
    /// Validates `cmd` and starts `/bin/sh -c <cmd>`. A failure to start the
    /// shell is folded into a terminal exit-127 outcome, so the returned task
    /// always completes through [`ExecTask::poll`].
    pub fn spawn(cmd: &str, timeout_ms: u64, max_bytes: usize) -> Result<Self> {
        if cmd.is_empty() {
            bail!("command is empty");
        }
        if cmd.len() > MAX_CMD_BYTES {
            bail!("command exceeds {MAX_CMD_BYTES} bytes");
        }
        let timeout_ms = timeout_ms.min(MAX_TIMEOUT_MS);
        let max_bytes = max_bytes.clamp(1, MAX_CAPTURE_BYTES);

        let spawned = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut task = Self {
            child: None,
            stdout: None,
            stderr: None,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            max_bytes,
            deadline_ns: clock::deadline_after_ms(timeout_ms),
            timed_out: false,
            truncated: false,
            killed: false,
            status: None,
            spawn_failed: false,
        };

        match spawned {
            Ok(mut child) => {
                debug!(pid = child.id(), "subprocess started");
                let stdout = child.stdout.take();
                let stderr = child.stderr.take();
                let nonblocking = stdout
                    .as_ref()
                    .map_or(Ok(()), |s| set_nonblocking(s.as_raw_fd()))
                    .and_then(|()| {
                        stderr
                            .as_ref()
                            .map_or(Ok(()), |s| set_nonblocking(s.as_raw_fd()))
                    });
                if let Err(err) = nonblocking {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(err);
                }
                task.child = Some(child);
                task.stdout = stdout;
                task.stderr = stderr;
            }
            Err(err) => {
                warn!(error = %err, "failed to spawn /bin/sh");
                task.spawn_failed = true;
            }
        }
        Ok(task)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Sends SIGKILL once; the child is reaped by a later poll tick.
    pub fn kill(&mut self) {
        if self.killed || self.status.is_some() {
            return;
        }
        if let Some(child) = &mut self.child {
            if let Err(err) = child.kill() {
                warn!(error = %err, "failed to kill subprocess");
            }
            self.killed = true;
        }
    }

    fn drain_stream<R: Read>(
        stream: &mut Option<R>,
        buf: &mut Vec<u8>,
        cap: usize,
        truncated: &mut bool,
    ) {
        let Some(reader) = stream.as_mut() else {
            return;
        };
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => {
                    *stream = None;
                    return;
                }
                Ok(n) => {
                    let room = cap.saturating_sub(buf.len());
                    if n > room {
                        buf.extend_from_slice(&chunk[..room]);
                        if !*truncated {
                            *truncated = true;
                            // A flooding writer refills the pipe faster than we
                            // drain it; stop here, the kill happens this tick.
                            return;
                        }
                    } else {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    *stream = None;
                    return;
                }
            }
        }
    }

    /// One supervision tick: drain, enforce the deadline and the capture cap,
    /// reap. Returns the outcome once terminal.
    pub fn poll(&mut self) -> Option<ExecOutcome> {
        if self.spawn_failed {
            return Some(ExecOutcome {
                code: 127,
                ..ExecOutcome::default()
            });
        }

        Self::drain_stream(
            &mut self.stdout,
            &mut self.stdout_buf,
            self.max_bytes,
            &mut self.truncated,
        );
        Self::drain_stream(
            &mut self.stderr,
            &mut self.stderr_buf,
            self.max_bytes,
            &mut self.truncated,
        );

        if self.status.is_none() {
            if self.deadline_ns != 0 && clock::now_ns() >= self.deadline_ns {
                self.timed_out = true;
                self.kill();
            } else if self.truncated {
                self.kill();
            }
        }

        if self.status.is_none() {
            if let Some(child) = &mut self.child {
                match child.try_wait() {
                    Ok(Some(status)) => self.status = Some(status),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, "failed to reap subprocess");
                        self.status = Some(ExitStatus::from_raw(127 << 8));
                    }
                }
            }
        }

        let status = self.status?;
        if self.stdout.is_some() || self.stderr.is_some() {
            return None;
        }
        Some(ExecOutcome {
            code: status
                .code()
                .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)),
            stdout: std::mem::take(&mut self.stdout_buf),
            stderr: std::mem::take(&mut self.stderr_buf),
            timed_out: self.timed_out,
            truncated: self.truncated,
            signal: status.signal(),
        })
    }
}

impl Drop for ExecTask {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if self.status.is_none() {
                if let Err(err) = child.kill() {
                    debug!(error = %err, "kill on drop failed");
                }
                if let Err(err) = child.wait() {
                    warn!(error = %err, "failed to reap subprocess on drop");
                }
            }
        }
    }
}
