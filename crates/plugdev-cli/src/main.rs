//! plugdev - run browser plugins in a live target and collect test results.
//!
//! `plugdev run` builds the plugins, launches the target with remote control
//! enabled, installs the plugins and reloads them whenever their sources
//! change. `plugdev test` does the same and additionally serves the result
//! bridge that in-target tests report to.

mod handler;
mod run;
mod server;
mod session;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use plugdev_core::{HarnessConfig, HarnessError, PluginSpec, ProcessConfig};
use serde_json::Value;
use session::Mode;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "plugdev", version)]
#[command(about = "Develop and test browser plugins against a live target")]
struct Args {
    /// Configuration file (defaults to ./plugdev.json when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch the target, install the plugins and reload them on change
    Run {
        #[command(flatten)]
        target: TargetArgs,

        /// Do not watch the sources
        #[arg(long)]
        no_watch: bool,
    },
    /// Launch the target and collect results posted by in-target tests
    Test {
        #[command(flatten)]
        target: TargetArgs,

        /// Stop at the first failing test
        #[arg(long)]
        abort_on_fail: bool,

        /// Stop when the suite reports its end
        #[arg(long)]
        exit_on_finish: bool,

        /// Keep rebuilding and reloading on source changes
        #[arg(long)]
        watch: bool,
    },
}

/// Overrides applied on top of the configuration file.
#[derive(clap::Args, Debug, Default)]
struct TargetArgs {
    /// Target binary
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Profile directory (a temporary one is used when unset)
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Data directory, used as the target's working directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Plugin to install (repeatable)
    #[arg(long = "plugin", value_name = "ID=DIR", value_parser = parse_plugin)]
    plugins: Vec<PluginSpec>,

    /// Preference to set in the profile; the value is read as JSON, falling
    /// back to a string (repeatable)
    #[arg(long = "pref", value_name = "KEY=VALUE", value_parser = parse_pref)]
    prefs: Vec<(String, Value)>,

    /// Extra argument for the target (repeatable)
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Open the target's developer tools
    #[arg(long)]
    devtools: bool,

    /// Remote-control port (0 = pick a free one)
    #[arg(long)]
    port: Option<u16>,

    /// File receiving the target's output
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Full build command
    #[arg(long)]
    build_command: Option<String>,

    /// Build command for script-only changes
    #[arg(long)]
    scripts_command: Option<String>,

    /// Directory to watch for source changes
    #[arg(long)]
    source_root: Option<PathBuf>,

    /// Quiet period before a rebuild, in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,
}

impl TargetArgs {
    fn apply(self, config: &mut HarnessConfig) {
        if let Some(binary) = self.binary {
            config.target.binary = Some(binary);
        }
        if let Some(profile) = self.profile {
            config.target.profile_dir = Some(profile);
        }
        if let Some(data_dir) = self.data_dir {
            config.target.data_dir = Some(data_dir);
        }
        if !self.plugins.is_empty() {
            config.plugins = self.plugins;
        }
        config.target.prefs.extend(self.prefs);
        config.target.args.extend(self.args);
        config.target.devtools |= self.devtools;
        if let Some(port) = self.port {
            config.target.control_port = port;
        }
        if let Some(log_file) = self.log_file {
            config.target.log_file = Some(log_file);
        }
        if let Some(command) = self.build_command {
            config.build.command = Some(command);
        }
        if let Some(command) = self.scripts_command {
            config.build.scripts_command = Some(command);
        }
        if let Some(source_root) = self.source_root {
            config.watch.source_root = Some(source_root);
        }
        if let Some(debounce_ms) = self.debounce_ms {
            config.watch.debounce_ms = debounce_ms;
        }
    }
}

fn parse_plugin(value: &str) -> std::result::Result<PluginSpec, String> {
    match value.split_once('=') {
        Some((id, dir)) if !id.is_empty() && !dir.is_empty() => Ok(PluginSpec::new(id, dir)),
        _ => Err(format!("expected ID=DIR, got '{}'", value)),
    }
}

fn parse_pref(value: &str) -> std::result::Result<(String, Value), String> {
    let Some((key, raw)) = value.split_once('=') else {
        return Err(format!("expected KEY=VALUE, got '{}'", value));
    };
    if key.is_empty() {
        return Err(format!("empty preference name in '{}'", value));
    }
    let parsed = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), parsed))
}

/// Load the explicit config file, else `./plugdev.json` when it exists, else
/// defaults.
fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    match path {
        Some(path) => HarnessConfig::from_path(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => {
            let default = Path::new(ProcessConfig::CONFIG_FILE_NAME);
            if default.is_file() {
                debug!("Using {}", default.display());
                HarnessConfig::from_path(default)
                    .with_context(|| format!("failed to load {}", default.display()))
            } else {
                Ok(HarnessConfig::default())
            }
        }
    }
}

/// Exit code for a session that failed to start.
fn failure_exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<HarnessError>()
        .map_or(1, HarnessError::exit_code)
}

fn build_config(args: Args) -> Result<(HarnessConfig, Mode)> {
    let mut config = load_config(args.config.as_deref())?;

    let mode = match args.command {
        Command::Run { target, no_watch } => {
            target.apply(&mut config);
            if no_watch {
                config.watch.enabled = false;
            }
            Mode::Run
        }
        Command::Test {
            target,
            abort_on_fail,
            exit_on_finish,
            watch,
        } => {
            target.apply(&mut config);
            config.tests.abort_on_fail |= abort_on_fail;
            config.tests.exit_on_finish |= exit_on_finish;
            config.watch.enabled = watch;
            Mode::Test
        }
    };

    if config.plugins.is_empty() {
        bail!("no plugins configured (use --plugin ID=DIR or the plugins list in the config file)");
    }
    Ok((config, mode))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG wins over --debug
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let (config, mode) = build_config(args)?;
    info!("Starting plugdev ({:?} mode)", mode);

    let code = match session::run_session(config, mode).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            failure_exit_code(&e)
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
