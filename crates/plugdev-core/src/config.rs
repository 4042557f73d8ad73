//! Configuration for plugdev.
//!
//! `HarnessConfig` is the static configuration object every runtime component
//! is built from. It is read from `plugdev.json` (all fields optional) and then
//! overridden by command line flags. Tuning constants that are not user facing
//! live in the unit structs at the bottom of this module.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Target application to launch.
    pub target: TargetConfig,
    /// Plugins to install as temporary add-ons.
    pub plugins: Vec<PluginSpec>,
    /// Source watching and rebuild scheduling.
    pub watch: WatchConfig,
    /// External build commands.
    pub build: BuildConfig,
    /// Remote-control connection tuning.
    pub connect: ConnectConfig,
    /// Test result collection.
    pub tests: TestConfig,
}

impl HarnessConfig {
    /// Load a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| HarnessError::io_with_path(e, path))?;
        serde_json::from_str(&contents).map_err(|e| HarnessError::Config {
            message: format!("{}: {}", path.display(), e),
        })
    }

    /// Check the configuration before any component starts.
    ///
    /// The target binary is deliberately not checked here: a missing binary is
    /// a launch failure and is reported by the supervisor.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if plugin.id.trim().is_empty() {
                return Err(HarnessError::Config {
                    message: format!("plugin at {} has an empty id", plugin.source_dir.display()),
                });
            }
            if !seen.insert(plugin.id.as_str()) {
                return Err(HarnessError::Config {
                    message: format!("plugin id {} is configured twice", plugin.id),
                });
            }
        }

        if self.watch.debounce_ms == 0 {
            return Err(HarnessError::Config {
                message: "watch.debounce_ms must be greater than zero".to_string(),
            });
        }

        if self.connect.retries == 0 {
            return Err(HarnessError::Config {
                message: "connect.retries must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

/// Target application settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Path to the target binary.
    pub binary: Option<PathBuf>,
    /// Profile directory; a temporary one is created when unset.
    pub profile_dir: Option<PathBuf>,
    /// Data directory, used as the working directory of the target.
    pub data_dir: Option<PathBuf>,
    /// Extra arguments appended to the launch command.
    pub args: Vec<String>,
    /// Open the target's developer tools on startup.
    pub devtools: bool,
    /// Preference overrides written into the profile before launch.
    pub prefs: BTreeMap<String, Value>,
    /// Remote-control port (0 = pick a free one).
    pub control_port: u16,
    /// Where the target's stdout/stderr go; discarded when unset.
    pub log_file: Option<PathBuf>,
}

impl TargetConfig {
    /// Built-in preferences merged under the user overrides.
    pub fn effective_prefs(&self) -> BTreeMap<String, Value> {
        let mut prefs = default_prefs();
        for (key, value) in &self.prefs {
            prefs.insert(key.clone(), value.clone());
        }
        prefs
    }
}

/// Preferences the target needs for remote control and an uninterrupted run.
pub fn default_prefs() -> BTreeMap<String, Value> {
    let entries: [(&str, Value); 10] = [
        ("devtools.debugger.remote-enabled", Value::Bool(true)),
        ("devtools.chrome.enabled", Value::Bool(true)),
        ("devtools.debugger.prompt-connection", Value::Bool(false)),
        ("xpinstall.signatures.required", Value::Bool(false)),
        ("extensions.autoDisableScopes", Value::from(10)),
        ("browser.shell.checkDefaultBrowser", Value::Bool(false)),
        ("browser.tabs.warnOnClose", Value::Bool(false)),
        ("datareporting.policy.dataSubmissionEnabled", Value::Bool(false)),
        ("toolkit.telemetry.enabled", Value::Bool(false)),
        (
            "browser.startup.homepage_override.mstone",
            Value::String("ignore".to_string()),
        ),
    ];
    entries
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// One plugin to install into the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Stable id used in logs and reports.
    pub id: String,
    /// Directory holding the built, loadable plugin.
    pub source_dir: PathBuf,
}

impl PluginSpec {
    pub fn new(id: impl Into<String>, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source_dir: source_dir.into(),
        }
    }
}

/// Which rebuild a change triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebuildPolicy {
    /// Script changes rebuild scripts only, everything else runs the full build.
    #[default]
    Granular,
    /// Every change runs the full build.
    AlwaysFull,
}

/// Source watching settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Watch for changes after the first launch.
    pub enabled: bool,
    /// Directory to watch (defaults to the current directory).
    pub source_root: Option<PathBuf>,
    /// Quiet period after the last change before a rebuild starts.
    pub debounce_ms: u64,
    /// Paths never reported as changes (e.g. the build output directory).
    pub ignore: Vec<PathBuf>,
    /// Extensions that count as script sources.
    pub script_extensions: Vec<String>,
    pub policy: RebuildPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source_root: None,
            debounce_ms: 500,
            ignore: Vec::new(),
            script_extensions: ["js", "mjs", "cjs", "ts", "jsx", "tsx"]
                .into_iter()
                .map(String::from)
                .collect(),
            policy: RebuildPolicy::Granular,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Whether `path` is a script source.
    pub fn is_script(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .map(|ext| self.script_extensions.iter().any(|s| *s == ext))
            .unwrap_or(false)
    }
}

/// External build commands, run through the platform shell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Full asset pipeline.
    pub command: Option<String>,
    /// Script bundling only; falls back to `command` when unset.
    pub scripts_command: Option<String>,
    /// Working directory for both commands.
    pub cwd: Option<PathBuf>,
}

/// Remote-control connection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Connection attempts before the launch is declared failed.
    pub retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Per-request reply timeout; requests wait forever when unset. A
    /// timeout on a request already sent closes the connection.
    pub request_timeout_ms: Option<u64>,
    /// How long the advisory quit request may take during exit.
    pub quit_grace_ms: u64,
    /// Emit a timeout event after this much socket inactivity.
    pub idle_timeout_ms: Option<u64>,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            retries: 10,
            initial_backoff_ms: 250,
            max_backoff_ms: 2000,
            request_timeout_ms: None,
            quit_grace_ms: 1000,
            idle_timeout_ms: None,
        }
    }
}

impl ConnectConfig {
    /// Delay before connection attempt `attempt + 1` (exponential, capped).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn quit_grace(&self) -> Duration {
        Duration::from_millis(self.quit_grace_ms)
    }
}

/// Test result collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Stop the run on the first failed test.
    pub abort_on_fail: bool,
    /// Stop the run when the suite reports its end.
    pub exit_on_finish: bool,
}

/// Remote-control protocol limits.
pub struct RemoteConfig;

impl RemoteConfig {
    /// Largest accepted frame payload.
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
    /// Longest accepted decimal length prefix.
    pub const MAX_PREFIX_DIGITS: usize = 20;
    pub const READ_BUFFER_SIZE: usize = 16 * 1024;
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
    pub const COMMAND_CHANNEL_CAPACITY: usize = 64;
    /// Bound on a single TCP connect attempt.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Target process settings.
pub struct ProcessConfig;

impl ProcessConfig {
    /// Time between SIGTERM and SIGKILL for the target's process group.
    pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);
    /// How long to wait for the killed child to be reaped.
    pub const REAP_TIMEOUT: Duration = Duration::from_secs(1);
    pub const PREFS_FILE_NAME: &'static str = "user.js";
    pub const CONFIG_FILE_NAME: &'static str = "plugdev.json";
    /// Environment variable carrying the result bridge port to build commands.
    pub const BRIDGE_PORT_ENV: &'static str = "PLUGDEV_BRIDGE_PORT";
    /// Preference carrying the result bridge port into the target.
    pub const BRIDGE_PORT_PREF: &'static str = "plugdev.bridge.port";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert!(config.watch.enabled);
        assert_eq!(config.watch.debounce(), Duration::from_millis(500));
        assert_eq!(config.connect.retries, 10);
        assert_eq!(config.watch.policy, RebuildPolicy::Granular);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_json() {
        let config: HarnessConfig = serde_json::from_str(
            r#"{
                "target": {"binary": "/usr/bin/firefox", "devtools": true},
                "plugins": [{"id": "tabs", "source_dir": "dist"}],
                "watch": {"debounce_ms": 200, "policy": "always-full"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.target.binary, Some(PathBuf::from("/usr/bin/firefox")));
        assert!(config.target.devtools);
        assert_eq!(config.plugins, vec![PluginSpec::new("tabs", "dist")]);
        assert_eq!(config.watch.debounce_ms, 200);
        assert_eq!(config.watch.policy, RebuildPolicy::AlwaysFull);
        // untouched sections keep their defaults
        assert_eq!(config.connect.initial_backoff_ms, 250);
    }

    #[test]
    fn test_validate_rejects_duplicate_plugins() {
        let config = HarnessConfig {
            plugins: vec![PluginSpec::new("a", "one"), PluginSpec::new("a", "two")],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(HarnessError::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_zero_debounce() {
        let mut config = HarnessConfig::default();
        config.watch.debounce_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let connect = ConnectConfig::default();
        assert_eq!(connect.backoff(0), Duration::from_millis(250));
        assert_eq!(connect.backoff(1), Duration::from_millis(500));
        assert_eq!(connect.backoff(2), Duration::from_millis(1000));
        assert_eq!(connect.backoff(3), Duration::from_millis(2000));
        assert_eq!(connect.backoff(30), Duration::from_millis(2000));
    }

    #[test]
    fn test_user_prefs_override_defaults() {
        let mut target = TargetConfig::default();
        target
            .prefs
            .insert("devtools.chrome.enabled".to_string(), Value::Bool(false));
        target
            .prefs
            .insert("custom.pref".to_string(), Value::from("x"));

        let prefs = target.effective_prefs();
        assert_eq!(prefs["devtools.chrome.enabled"], Value::Bool(false));
        assert_eq!(prefs["custom.pref"], Value::from("x"));
        assert_eq!(prefs["devtools.debugger.remote-enabled"], Value::Bool(true));
    }

    #[test]
    fn test_is_script() {
        let watch = WatchConfig::default();
        assert!(watch.is_script(Path::new("src/background.js")));
        assert!(watch.is_script(Path::new("src/popup/App.TSX")));
        assert!(!watch.is_script(Path::new("src/popup/style.css")));
        assert!(!watch.is_script(Path::new("manifest.json")));
    }
}
