//! Platform abstraction layer.
//!
//! OS-specific process primitives live here rather than being scattered
//! through the supervisor.
//!
//! # Supported Platforms
//!
//! - **Linux / macOS**: process groups and signals via `nix`
//! - **Windows**: descendant-tree termination via `windows-sys`

pub mod process;

pub use process::{child_pids, descendant_pids, has_children, is_process_alive};

#[cfg(unix)]
pub use process::signal_process_group;

#[cfg(windows)]
pub use process::terminate_tree;

/// Returns the current platform name.
pub fn current_platform() -> &'static str {
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "windows")]
    {
        "windows"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        "unknown"
    }
}
