//! Platform-specific process primitives.
//!
//! Liveness checks, child enumeration, process-group signalling on Unix and
//! descendant-tree termination on Windows. Everything here works on raw PIDs;
//! ownership of spawned children lives in `crate::process`.

#![cfg_attr(windows, allow(unsafe_code))]

use crate::error::Result;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

/// Check if a process with the given PID exists.
///
/// # Platform Behavior
/// - **Unix**: `kill(pid, 0)`
/// - **Windows**: `OpenProcess` + `GetExitCodeProcess`
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid as NixPid;

        match kill(NixPid::from_raw(pid as i32), None) {
            Ok(()) => true,
            // Exists but belongs to someone else.
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        windows::is_alive(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        tracing::warn!("Process alive check not implemented for this platform");
        true
    }
}

fn process_table() -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());
    system
}

/// `(pid, parent)` pairs for every process, with threads filtered out.
fn parent_links(system: &System) -> Vec<(Pid, Option<Pid>)> {
    system
        .processes()
        .iter()
        .filter(|(_, process)| process.thread_kind().is_none())
        .map(|(pid, process)| (*pid, process.parent()))
        .collect()
}

/// Direct children of a process.
pub fn child_pids(pid: u32) -> Vec<u32> {
    let parent = Pid::from_u32(pid);
    parent_links(&process_table())
        .into_iter()
        .filter(|(child, link)| *link == Some(parent) && *child != parent)
        .map(|(child, _)| child.as_u32())
        .collect()
}

/// Whether a process currently has at least one child.
pub fn has_children(pid: u32) -> bool {
    !child_pids(pid).is_empty()
}

/// All descendants of a process, parents before their children.
pub fn descendant_pids(pid: u32) -> Vec<u32> {
    let links = parent_links(&process_table());
    let root = Pid::from_u32(pid);

    let mut descendants = Vec::new();
    let mut frontier = vec![root];

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for parent in frontier {
            for (child, link) in &links {
                if *link == Some(parent)
                    && *child != root
                    && !descendants.contains(&child.as_u32())
                {
                    descendants.push(child.as_u32());
                    next.push(*child);
                }
            }
        }
        frontier = next;
    }

    descendants
}

/// Send a signal to every process in a process group.
///
/// Returns `Ok(false)` if the group no longer exists.
#[cfg(unix)]
pub fn signal_process_group(pgid: u32, signal: nix::sys::signal::Signal) -> Result<bool> {
    use crate::error::SupervisorError;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid as NixPid;

    match killpg(NixPid::from_raw(pgid as i32), signal) {
        Ok(()) => {
            debug!("Sent {:?} to process group {}", signal, pgid);
            Ok(true)
        }
        Err(nix::errno::Errno::ESRCH) => {
            debug!("Process group {} is already gone", pgid);
            Ok(false)
        }
        Err(e) => Err(SupervisorError::Signal {
            pid: pgid,
            message: e.to_string(),
        }),
    }
}

/// Terminate a process and all of its descendants, deepest first.
///
/// Returns `true` if every termination call succeeded or found the target
/// already gone. Waiting for the root to exit is left to the caller, which
/// owns the root's handle.
#[cfg(windows)]
pub fn terminate_tree(pid: u32) -> Result<bool> {
    let mut targets = descendant_pids(pid);
    targets.reverse();
    targets.push(pid);

    let mut all_ok = true;
    for target in targets {
        if !windows::terminate(target) {
            tracing::warn!("TerminateProcess failed for {}", target);
            all_ok = false;
        }
    }
    Ok(all_ok)
}

#[cfg(windows)]
mod windows {
    use windows_sys::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, TerminateProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        PROCESS_TERMINATE,
    };

    pub(super) fn is_alive(pid: u32) -> bool {
        // SAFETY: the handle is checked for null before use and closed exactly once.
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                return false;
            }
            let mut code: u32 = 0;
            let ok = GetExitCodeProcess(handle, &mut code);
            CloseHandle(handle);
            ok != 0 && code == STILL_ACTIVE as u32
        }
    }

    pub(super) fn terminate(pid: u32) -> bool {
        // SAFETY: the handle is checked for null before use and closed exactly once.
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                // Already gone, or exited between enumeration and now.
                return !is_alive(pid);
            }
            let ok = TerminateProcess(handle, 1);
            CloseHandle(handle);
            ok != 0 || !is_alive(pid)
        }
    }
}
