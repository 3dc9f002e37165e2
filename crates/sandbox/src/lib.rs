//! Leaf primitives shared by the plugin host: monotonic clock, OS entropy,
//! environment parsing, and the path/filesystem operations the capability
//! sandbox is built from.

pub mod clock;
pub mod datadir;
pub mod envcfg;
pub mod paths;
pub mod rng;

pub use datadir::{data_dir_base, ensure_data_dir, plugin_id};
pub use paths::{
    contains, list_dir, mkdir_p, open_beneath, read_bounded, validate_relative, write_all, OpenMode,
};

/// Parent process id of the host.
#[allow(unsafe_code)]
pub fn parent_pid() -> u32 {
    // Safety: getppid has no failure modes and touches no shared state.
    unsafe { libc::getppid() as u32 }
}
