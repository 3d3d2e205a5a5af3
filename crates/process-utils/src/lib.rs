//! Small process-related helpers shared across the workspace.
//!
//! Command construction hides the console window on Windows. The signal helpers
//! deliver a polite termination request to a pid; forced kills go through
//! `Child::kill` on the owning handle.

use std::ffi::OsStr;

#[cfg(not(windows))]
use sysinfo::Signal;
use sysinfo::{Pid, ProcessesToUpdate, System};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Outcome of a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationRequest {
    /// The request was delivered to the process.
    Delivered,
    /// The process no longer exists.
    NotFound,
    /// The platform refused or does not support the request.
    Rejected,
}

/// Ask a process to terminate gracefully.
///
/// Unix targets receive `SIGTERM`. Windows has no equivalent signal, so
/// `taskkill` without `/F` is used, which posts a close request to the process
/// tree.
pub fn request_termination(pid: u32) -> TerminationRequest {
    #[cfg(windows)]
    {
        let status = std_command("taskkill")
            .args(["/PID", &pid.to_string(), "/T"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => TerminationRequest::Delivered,
            Ok(_) if !is_alive(pid) => TerminationRequest::NotFound,
            _ => TerminationRequest::Rejected,
        }
    }

    #[cfg(not(windows))]
    {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            None => TerminationRequest::NotFound,
            Some(process) => match process.kill_with(Signal::Term) {
                Some(true) => TerminationRequest::Delivered,
                _ => TerminationRequest::Rejected,
            },
        }
    }
}

/// Check whether a pid currently refers to a live process.
pub fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
