//! Build collaborator.
//!
//! The asset pipeline itself lives outside plugdev. It is driven through the
//! [`Build`] trait, which must finish before a launch or a reload proceeds.

use crate::config::BuildConfig;
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

/// How much of the plugin to rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildScope {
    /// Script bundling only.
    Scripts,
    /// The whole asset pipeline.
    Full,
}

/// Produces a loadable plugin directory.
#[async_trait]
pub trait Build: Send + Sync {
    async fn build(&self, scope: BuildScope) -> Result<()>;
}

/// Runs configured shell commands.
///
/// Output goes straight to the terminal. A missing command is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CommandBuild {
    full: Option<String>,
    scripts: Option<String>,
    cwd: Option<PathBuf>,
    env_vars: HashMap<String, String>,
}

impl CommandBuild {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            full: config.command.clone(),
            scripts: config.scripts_command.clone(),
            cwd: config.cwd.clone(),
            env_vars: HashMap::new(),
        }
    }

    /// Add an environment variable for every command.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Command line for `scope`; scripts fall back to the full build.
    pub fn command_for(&self, scope: BuildScope) -> Option<&str> {
        match scope {
            BuildScope::Scripts => self.scripts.as_deref().or(self.full.as_deref()),
            BuildScope::Full => self.full.as_deref(),
        }
    }
}

#[async_trait]
impl Build for CommandBuild {
    async fn build(&self, scope: BuildScope) -> Result<()> {
        let Some(line) = self.command_for(scope) else {
            debug!("No build command for {:?}", scope);
            return Ok(());
        };

        info!("Building ({:?}): {}", scope, line);
        let mut cmd = shell(line);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        let status = cmd.status().await.map_err(|e| HarnessError::Rebuild {
            message: format!("failed to run `{}`: {}", line, e),
        })?;

        if status.success() {
            Ok(())
        } else {
            Err(HarnessError::Rebuild {
                message: format!("`{}` exited with {}", line, status),
            })
        }
    }
}

fn shell(line: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(line);
        cmd
    }

    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(line);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(command: Option<&str>, scripts: Option<&str>) -> BuildConfig {
        BuildConfig {
            command: command.map(String::from),
            scripts_command: scripts.map(String::from),
            cwd: None,
        }
    }

    #[test]
    fn test_scripts_fall_back_to_full_command() {
        let build = CommandBuild::from_config(&config(Some("make"), None));
        assert_eq!(build.command_for(BuildScope::Scripts), Some("make"));

        let build = CommandBuild::from_config(&config(Some("make"), Some("make js")));
        assert_eq!(build.command_for(BuildScope::Scripts), Some("make js"));
        assert_eq!(build.command_for(BuildScope::Full), Some("make"));
    }

    #[tokio::test]
    async fn test_no_command_is_noop() {
        let build = CommandBuild::default();
        build.build(BuildScope::Full).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runs_in_cwd_with_env() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(Some("echo \"$PLUGDEV_TEST_VALUE\" > out.txt"), None);
        cfg.cwd = Some(dir.path().to_path_buf());

        CommandBuild::from_config(&cfg)
            .with_env("PLUGDEV_TEST_VALUE", "hello")
            .build(BuildScope::Full)
            .await
            .unwrap();

        let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_is_rebuild_error() {
        let build = CommandBuild::from_config(&config(Some("exit 3"), None));
        let err = build.build(BuildScope::Full).await.unwrap_err();
        assert!(matches!(err, HarnessError::Rebuild { .. }));
    }
}
