//! Spawning the target application.

use crate::error::{HarnessError, Result};
use crate::platform;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Everything needed to start the target with remote control enabled.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Path to the target binary.
    pub binary_path: PathBuf,
    /// Profile directory the target runs with.
    pub profile_dir: PathBuf,
    /// Working directory of the target.
    pub data_dir: Option<PathBuf>,
    /// Port for the remote-control server.
    pub control_port: u16,
    /// Additional arguments to pass.
    pub extra_args: Vec<String>,
    /// Open developer tools on startup.
    pub devtools: bool,
    /// Path to write stdout/stderr logs.
    pub log_file: Option<PathBuf>,
}

impl LaunchConfig {
    pub fn new(
        binary_path: impl AsRef<Path>,
        profile_dir: impl AsRef<Path>,
        control_port: u16,
    ) -> Self {
        Self {
            binary_path: binary_path.as_ref().to_path_buf(),
            profile_dir: profile_dir.as_ref().to_path_buf(),
            data_dir: None,
            control_port,
            extra_args: Vec::new(),
            devtools: false,
            log_file: None,
        }
    }

    /// Set the working directory.
    pub fn with_data_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.data_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set extra arguments.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_devtools(mut self, devtools: bool) -> Self {
        self.devtools = devtools;
        self
    }

    /// Set the log file path.
    pub fn with_log_file(mut self, path: impl AsRef<Path>) -> Self {
        self.log_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Command line arguments for the target.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-start-debugger-server".to_string(),
            self.control_port.to_string(),
            "-profile".to_string(),
            self.profile_dir.display().to_string(),
            "-no-remote".to_string(),
            "-foreground".to_string(),
        ];
        if self.devtools {
            args.push("-devtools".to_string());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Reserve a free local port.
///
/// The port is read from a bound listener, then released for the target to
/// bind.
pub fn pick_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Spawn the target in its own process group.
pub fn launch_target(config: &LaunchConfig) -> Result<Child> {
    // Bare names are resolved through PATH by spawn.
    let is_bare_name = config.binary_path.components().count() == 1;
    if !is_bare_name && !config.binary_path.exists() {
        return Err(HarnessError::launch(format!(
            "target binary not found: {}",
            config.binary_path.display()
        )));
    }

    let mut cmd = Command::new(&config.binary_path);
    cmd.args(config.args());

    if let Some(ref data_dir) = config.data_dir {
        fs::create_dir_all(data_dir).map_err(|e| HarnessError::io_with_path(e, data_dir))?;
        cmd.current_dir(data_dir);
    }

    cmd.stdin(Stdio::null());
    if let Some(ref log_file) = config.log_file {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent).ok();
        }

        let file = fs::File::create(log_file).map_err(|e| HarnessError::Io {
            message: "create log file".to_string(),
            path: Some(log_file.clone()),
            source: Some(e),
        })?;
        let stdout_file = file.try_clone().map_err(|e| HarnessError::Io {
            message: "clone log file handle".to_string(),
            path: Some(log_file.clone()),
            source: Some(e),
        })?;
        cmd.stdout(Stdio::from(stdout_file));
        cmd.stderr(Stdio::from(file));
    } else {
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
    }

    platform::isolate_process_group(&mut cmd);
    // Never leave the target behind if the supervisor is dropped mid-launch.
    cmd.kill_on_drop(true);

    debug!("Spawning {} {:?}", config.binary_path.display(), config.args());
    let child = cmd.spawn().map_err(|e| {
        HarnessError::launch(format!(
            "failed to start {}: {}",
            config.binary_path.display(),
            e
        ))
    })?;

    info!(
        "Launched {} with PID {} (control port {})",
        config.binary_path.display(),
        child.id().unwrap_or_default(),
        config.control_port
    );
    Ok(child)
}
