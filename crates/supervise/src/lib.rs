//! Supervisors for work that outlives a single VM call: subprocesses drained
//! by non-blocking reads on the host thread, and HTTP transfers driven by one
//! worker thread each. Both expose plain outcome records; translating an
//! outcome into a promise resolution is the host's job.

pub mod exec;
pub mod fetch;

pub use exec::{ExecOutcome, ExecTask};
pub use fetch::{FetchRequest, FetchResponse, FetchTask};
