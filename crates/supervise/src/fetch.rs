//! HTTP transfer supervision.
//!
//! Every request gets its own worker thread driving a libcurl easy handle;
//! the record it fills is the only object shared across threads. The worker
//! writes the response until it releases `done`; the host thread reads it
//! only after an acquire load of `done` (or after join). `cancelled` is the
//! one field written by the host and read by the worker; it is advisory and
//! re-checked after the join, so relaxed ordering is enough.
//!
//! The status text is taken verbatim from each `HTTP/x y REASON` status
//! line, and every new status line clears the captured headers, so only the
//! final hop of a redirect chain survives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use curl::easy::{Easy, List};
use tracing::{debug, warn};

/// Upper clamp for response capture.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
/// Response capture cap used when the caller does not pass one.
pub const DEFAULT_BODY_BYTES: usize = 16 * 1024 * 1024;
/// Largest accepted request body.
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
/// Upper clamp for the total-transfer timeout.
pub const MAX_TIMEOUT_MS: u64 = 600_000;
/// Total-transfer timeout used when the caller does not pass one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Redirect hops followed when redirects are enabled.
pub const MAX_REDIRECTS: usize = 10;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A validated, ready-to-run transfer.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout_ms: u64,
    pub max_bytes: usize,
    pub follow_redirects: bool,
}

/// What the worker produced. `error` is set for cancellation, overflow, and
/// transport failures; `headers` always describe the final hop only.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub truncated: bool,
    pub aborted: bool,
    pub error: Option<String>,
}

impl FetchResponse {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

struct FetchShared {
    done: AtomicBool,
    cancelled: AtomicBool,
    response: Mutex<FetchResponse>,
}

/// One in-flight transfer. Dropping the task cancels it and joins the worker.
pub struct FetchTask {
    id: u64,
    shared: Arc<FetchShared>,
    worker: Option<JoinHandle<()>>,
}

/// One raw header-callback line. A `HTTP/x y REASON` line starts a new hop:
/// it resets the captured headers and keeps the reason text exactly as the
/// server sent it. Anything else is a trimmed `name: value` pair.
fn capture_header_line(
    line: &[u8],
    headers: &mut Vec<(String, String)>,
    status_text: &mut String,
) {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return;
    }
    if line.starts_with("HTTP/") {
        headers.clear();
        let mut parts = line.splitn(3, ' ');
        let _version = parts.next();
        let _code = parts.next();
        *status_text = parts.next().unwrap_or("").trim().to_string();
        return;
    }
    if let Some((name, value)) = line.split_once(':') {
        let name = name.trim();
        if !name.is_empty() {
            headers.push((name.to_string(), value.trim().to_string()));
        }
    }
}

fn configure(easy: &mut Easy, req: &FetchRequest) -> Result<(), curl::Error> {
    easy.url(&req.url)?;
    easy.connect_timeout(CONNECT_TIMEOUT)?;
    if req.timeout_ms > 0 {
        easy.timeout(Duration::from_millis(req.timeout_ms))?;
    }
    easy.follow_location(req.follow_redirects)?;
    if req.follow_redirects {
        easy.max_redirections(MAX_REDIRECTS as u32)?;
    }
    easy.progress(true)?;
    if req.method == "HEAD" {
        easy.nobody(true)?;
    }
    if let Some(body) = &req.body {
        easy.post_fields_copy(body)?;
    }
    easy.custom_request(&req.method)?;
    let mut list = List::new();
    for (name, value) in &req.headers {
        list.append(&format!("{name}: {value}"))?;
    }
    easy.http_headers(list)?;
    Ok(())
}

fn run_transfer(req: &FetchRequest, shared: &FetchShared) -> FetchResponse {
    let mut out = FetchResponse {
        url: req.url.clone(),
        ..FetchResponse::default()
    };

    // Creating the first handle runs libcurl's one-time global init.
    let mut easy = Easy::new();
    if let Err(err) = configure(&mut easy, req) {
        out.error = Some(err.to_string());
        return out;
    }

    let mut headers: Vec<(String, String)> = Vec::new();
    let mut status_text = String::new();
    let mut body: Vec<u8> = Vec::new();
    let mut truncated = false;
    let max_bytes = req.max_bytes;

    let performed = {
        let mut transfer = easy.transfer();
        let result = transfer
            .header_function(|line| {
                capture_header_line(line, &mut headers, &mut status_text);
                true
            })
            .and_then(|()| {
                transfer.write_function(|data| {
                    let room = max_bytes.saturating_sub(body.len());
                    if data.len() > room {
                        body.extend_from_slice(&data[..room]);
                        truncated = true;
                        // A short write makes libcurl abort the transfer.
                        return Ok(room);
                    }
                    body.extend_from_slice(data);
                    Ok(data.len())
                })
            })
            .and_then(|()| {
                transfer.progress_function(|_, _, _, _| !shared.cancelled.load(Ordering::Relaxed))
            });
        match result {
            Ok(()) => transfer.perform(),
            Err(err) => Err(err),
        }
    };

    out.headers = headers;
    out.status_text = status_text;
    out.body = body;
    out.truncated = truncated;
    out.status = easy.response_code().map(|c| c as u16).unwrap_or(0);
    if let Ok(Some(effective)) = easy.effective_url() {
        if !effective.is_empty() {
            out.url = effective.to_string();
        }
    }

    if let Err(err) = performed {
        if err.is_aborted_by_callback() && shared.cancelled.load(Ordering::Relaxed) {
            out.aborted = true;
            out.error = Some("aborted".to_string());
        } else if out.truncated {
            out.error = Some("response body exceeds maxBytes".to_string());
        } else if err.is_operation_timedout() {
            out.error = Some("request timed out".to_string());
        } else {
            out.error = Some(err.to_string());
        }
    }
    out
}

impl FetchTask {
    /// Starts the worker thread for `req`. A thread that cannot be spawned
    /// completes immediately with an error response.
    pub fn spawn(id: u64, req: FetchRequest) -> Self {
        let shared = Arc::new(FetchShared {
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            response: Mutex::new(FetchResponse {
                url: req.url.clone(),
                ..FetchResponse::default()
            }),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("sage-fetch-{id}"))
            .spawn(move || {
                let out = run_transfer(&req, &worker_shared);
                debug!(
                    status = out.status,
                    bytes = out.body.len(),
                    error = out.error.as_deref().unwrap_or(""),
                    "fetch finished"
                );
                match worker_shared.response.lock() {
                    Ok(mut guard) => *guard = out,
                    Err(poisoned) => *poisoned.into_inner() = out,
                }
                worker_shared.done.store(true, Ordering::Release);
            });

        let worker = match handle {
            Ok(h) => Some(h),
            Err(err) => {
                warn!(error = %err, "failed to start fetch worker");
                match shared.response.lock() {
                    Ok(mut guard) => guard.error = Some("failed to start worker thread".to_string()),
                    Err(poisoned) => {
                        poisoned.into_inner().error = Some("failed to start worker thread".to_string())
                    }
                }
                shared.done.store(true, Ordering::Release);
                None
            }
        };

        Self { id, shared, worker }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Asks the worker to end the transfer at its next progress check.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Relaxed);
    }

    /// True once the worker has published its response.
    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    /// Joins the worker and takes the response. Blocks if the transfer is
    /// still running; poll [`FetchTask::is_done`] first to avoid that.
    pub fn join(mut self) -> FetchResponse {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("fetch worker panicked");
            }
        }
        match self.shared.response.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Drop for FetchTask {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.cancelled.store(true, Ordering::Relaxed);
            if handle.join().is_err() {
                warn!("fetch worker panicked");
            }
        }
    }
}
