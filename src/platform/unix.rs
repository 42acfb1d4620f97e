//! Unix process signalling

use anyhow::Result;

/// Force kill a process (SIGKILL)
pub fn kill_process(pid: u32) -> Result<()> {
    let pid = to_pid(pid)?;
    unsafe {
        let result = libc::kill(pid, libc::SIGKILL);
        if result == 0 {
            Ok(())
        } else {
            anyhow::bail!(
                "Failed to kill process: {}",
                std::io::Error::last_os_error()
            )
        }
    }
}

/// Check if a process exists
pub fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = to_pid(pid) else {
        return false;
    };
    unsafe {
        // kill with signal 0 checks if process exists without sending a signal
        if libc::kill(pid, 0) == 0 {
            return true;
        }
    }
    // EPERM means it exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Detach the child into its own session so it outlives the manager's terminal
pub fn detach_session(cmd: &mut tokio::process::Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

fn to_pid(pid: u32) -> Result<libc::pid_t> {
    // 0 and negative values address process groups, never a single process
    match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => anyhow::bail!("Invalid pid: {}", pid),
    }
}
