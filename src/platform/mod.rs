//! Platform-specific process control

#[cfg(unix)]
pub mod unix;

use anyhow::Result;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

/// Force kill a process
pub fn kill_process(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::kill_process(pid)
    }
    #[cfg(not(unix))]
    {
        let mut system = System::new();
        let pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new(),
        );
        match system.process(pid) {
            Some(process) if process.kill() => Ok(()),
            Some(_) => anyhow::bail!("Failed to kill process {}", pid),
            None => anyhow::bail!("No such process: {}", pid),
        }
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unix::is_process_running(pid)
    }
    #[cfg(not(unix))]
    {
        process_info(pid).is_some()
    }
}

/// Run the child in its own session where the platform supports it
pub fn detach(cmd: &mut tokio::process::Command) {
    #[cfg(unix)]
    {
        unix::detach_session(cmd);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// OS-reported start time of a process, in seconds since the epoch.
///
/// Exited-but-unreaped processes report `None`.
pub fn process_start_time(pid: u32) -> Option<u64> {
    process_info(pid)
}

/// Whether `pid` still refers to the process recorded with `fingerprint`.
///
/// A missing fingerprint falls back to a plain liveness check.
pub fn is_same_process(pid: u32, fingerprint: Option<u64>) -> bool {
    if !is_process_running(pid) {
        return false;
    }
    match fingerprint {
        Some(expected) => process_start_time(pid) == Some(expected),
        None => true,
    }
}

fn process_info(pid: u32) -> Option<u64> {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new(),
    );
    system
        .process(pid)
        .filter(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
        .map(|process| process.start_time())
}
