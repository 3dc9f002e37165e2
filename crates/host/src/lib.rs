//! The sage plugin host core.
//!
//! Loads untrusted scripts into per-plugin VM instances, runs them under
//! deadline budgets, exposes the curated `__sage_*` host API, and shuttles
//! application events in and shell commands out. The embedder drives
//! everything through [`Host`]: load a bootstrap, load plugin files, emit
//! events, call [`Host::poll`] regularly, and drain the command queue.

mod api;
pub mod config;
pub mod console;
pub mod events;
mod host;
pub mod logging;
mod modules;
mod plugin;
pub mod queue;
pub mod registry;
mod state;
mod values;

pub use config::{Limits, Timeouts};
pub use events::Event;
pub use host::Host;
pub use queue::{CommandQueue, TakeCmd};
pub use registry::{BuiltinModules, MODULE_SCHEME};

/// Version string reported by `__sage_app_version`.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version string reported by `__sage_qjs_version`.
pub const ENGINE_VERSION: &str = "quickjs (rquickjs 0.11)";
