//! Platform-specific process management.
//!
//! The target application is started in its own process group so that helper
//! processes it spawns can be torn down together with it.
//!
//! # Platform Behavior
//! - **Linux/macOS**: the child leads a new process group; termination sends
//!   SIGTERM to the group, then SIGKILL
//! - **Windows**: the child gets a new process group; termination runs
//!   `taskkill /T`, then `taskkill /F /T`

use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How hard to ask a process group to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Ask politely (SIGTERM / taskkill without /F).
    Graceful,
    /// No way to refuse (SIGKILL / taskkill /F).
    Forced,
}

/// Capability to signal a whole process group.
///
/// The group is identified by the pid of its leader. A group that no longer
/// exists counts as success.
#[async_trait]
pub trait TerminateProcessGroup: Send + Sync {
    async fn terminate_process_group(&self, pid: u32, how: Termination) -> Result<()>;
}

/// Terminator for the current OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformTerminator;

#[async_trait]
impl TerminateProcessGroup for PlatformTerminator {
    async fn terminate_process_group(&self, pid: u32, how: Termination) -> Result<()> {
        #[cfg(unix)]
        {
            signal_group_unix(pid, how)
        }

        #[cfg(windows)]
        {
            taskkill_tree(pid, how).await
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = (pid, how);
            Err(HarnessError::Other(
                "Process termination not implemented for this platform".into(),
            ))
        }
    }
}

#[cfg(unix)]
fn signal_group_unix(pid: u32, how: Termination) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match how {
        Termination::Graceful => Signal::SIGTERM,
        Termination::Forced => Signal::SIGKILL,
    };

    debug!("Sending {} to process group {}", signal, pid);
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        // Group already gone
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(HarnessError::Other(format!(
            "Failed to send {} to process group {}: {}",
            signal, pid, e
        ))),
    }
}

#[cfg(windows)]
async fn taskkill_tree(pid: u32, how: Termination) -> Result<()> {
    let pid_arg = pid.to_string();
    let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
    if how == Termination::Forced {
        args.push("/F");
    }

    debug!("Running taskkill {:?}", args);
    let output = Command::new("taskkill")
        .args(&args)
        .output()
        .await
        .map_err(|e| HarnessError::Other(format!("Failed to run taskkill: {}", e)))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    // "not found" errors are OK - process already dead
    if stderr.contains("not found") || stderr.contains("not running") {
        Ok(())
    } else {
        Err(HarnessError::Other(format!(
            "taskkill failed for {}: {}",
            pid,
            stderr.trim()
        )))
    }
}

/// Put the command's child into a new process group.
pub fn isolate_process_group(command: &mut Command) {
    #[cfg(unix)]
    {
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = command;
    }
}

/// Stop a child and its process group, escalating to a forced kill.
///
/// The leader gets `grace` to exit after the graceful signal. The group is
/// force-killed afterwards in every case, so helpers that outlived the leader
/// are gone too. The child is reaped before returning.
pub async fn terminate_child(
    child: &mut Child,
    terminator: &dyn TerminateProcessGroup,
    grace: Duration,
) -> Result<()> {
    let pid = match child.id() {
        Some(pid) => pid,
        None => {
            debug!("Target process already reaped");
            return Ok(());
        }
    };

    if let Err(e) = terminator
        .terminate_process_group(pid, Termination::Graceful)
        .await
    {
        warn!("Graceful termination of {} failed: {}", pid, e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Process {} exited with {}", pid, status),
        Ok(Err(e)) => warn!("Waiting for process {} failed: {}", pid, e),
        Err(_) => debug!("Process {} still running after {:?}, killing", pid, grace),
    }

    let forced = terminator
        .terminate_process_group(pid, Termination::Forced)
        .await;

    // The leader itself, in case it left the group.
    if let Err(e) = child.start_kill() {
        if e.kind() != std::io::ErrorKind::InvalidInput {
            debug!("Direct kill of {} failed: {}", pid, e);
        }
    }

    match tokio::time::timeout(crate::config::ProcessConfig::REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Reaping process {} failed: {}", pid, e),
        Err(_) => warn!("Process {} was not reaped in time", pid),
    }

    forced
}

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: `kill(pid, 0)`
/// - **Windows**: `OpenProcess` with `PROCESS_QUERY_LIMITED_INFORMATION`
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), None::<Signal>).is_ok()
    }

    #[cfg(windows)]
    {
        is_process_alive_windows(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("Process alive check not implemented for this platform");
        let _ = pid;
        true
    }
}

#[cfg(windows)]
#[allow(unsafe_code)]
fn is_process_alive_windows(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    // SAFETY: OpenProcess has no memory preconditions; a non-null handle is
    // owned here and closed exactly once.
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if !handle.is_null() {
            CloseHandle(handle);
            true
        } else {
            false
        }
    }
}
