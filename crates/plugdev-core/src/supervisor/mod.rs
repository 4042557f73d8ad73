//! Target instance supervision.
//!
//! The supervisor owns the target process and the remote-control connection
//! to it. It writes the profile preferences, spawns the target, waits for the
//! control port with bounded backoff, installs every configured plugin as a
//! temporary add-on, reloads them in place and finally tears everything down.
//!
//! ```text
//! Idle -> Launching -> Running <-> Reloading
//!                         |
//!                      Exiting -> Stopped
//! ```
//!
//! A failed launch goes straight to `Stopped`.

pub mod launcher;
pub mod profile;

pub use launcher::{launch_target, pick_free_port, LaunchConfig};
pub use profile::{render_pref, Profile};

use crate::config::{ConnectConfig, HarnessConfig, PluginSpec, ProcessConfig, TargetConfig};
use crate::devloop::ReloadTarget;
use crate::error::{HarnessError, Result};
use crate::platform::{self, PlatformTerminator, TerminateProcessGroup};
use crate::protocol::{
    ClientEvent, ClientOptions, ConnectionState, Packet, ProtocolClient, ROOT_ACTOR,
};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Child;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Launching,
    Running,
    Reloading,
    Exiting,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A plugin currently loaded in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPlugin {
    /// Configured plugin id.
    pub id: String,
    /// Directory it was installed from.
    pub source_dir: PathBuf,
    /// Add-on id assigned by the target; used to uninstall it.
    pub addon_id: String,
}

/// Outcome of a [`InstanceSupervisor::reload`].
#[derive(Debug, Default)]
pub struct ReloadReport {
    /// Plugins that were uninstalled and installed again.
    pub reloaded: Vec<String>,
    /// Plugins that failed, with the error.
    pub failures: Vec<(String, HarnessError)>,
}

impl ReloadReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Launches, reloads and stops one target instance.
pub struct InstanceSupervisor {
    target: TargetConfig,
    plugins: Vec<PluginSpec>,
    connect: ConnectConfig,
    extra_prefs: BTreeMap<String, Value>,
    terminator: Arc<dyn TerminateProcessGroup>,

    state: SupervisorState,
    child: Option<Child>,
    client: Option<ProtocolClient>,
    addons_actor: Option<String>,
    installed: Vec<InstalledPlugin>,
    profile: Option<Profile>,
    control_port: Option<u16>,
}

impl InstanceSupervisor {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            target: config.target.clone(),
            plugins: config.plugins.clone(),
            connect: config.connect.clone(),
            extra_prefs: BTreeMap::new(),
            terminator: Arc::new(PlatformTerminator),
            state: SupervisorState::Idle,
            child: None,
            client: None,
            addons_actor: None,
            installed: Vec::new(),
            profile: None,
            control_port: None,
        }
    }

    /// Replace the process-group terminator.
    pub fn with_terminator(mut self, terminator: Arc<dyn TerminateProcessGroup>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Add a preference on top of the configured ones.
    pub fn with_pref(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra_prefs.insert(key.into(), value.into());
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Plugins currently installed in the target.
    pub fn installed(&self) -> &[InstalledPlugin] {
        &self.installed
    }

    /// Remote-control port of the running target.
    pub fn control_port(&self) -> Option<u16> {
        self.control_port
    }

    /// PID of the spawned target.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Subscribe to events of the live connection.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<ClientEvent>> {
        self.client.as_ref().map(ProtocolClient::subscribe)
    }

    /// Watch the state of the live connection.
    pub fn watch_connection(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.client.as_ref().map(ProtocolClient::watch_state)
    }

    fn expect_state(&self, expected: SupervisorState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HarnessError::InvalidState {
                expected: expected.to_string(),
                found: self.state.to_string(),
            })
        }
    }

    /// Launch the target and install every plugin.
    ///
    /// Fails with a launch error when the binary is unset or missing, or when
    /// the control port never becomes reachable; the process is killed and
    /// the supervisor is `Stopped` in that case. Fails with an install error
    /// when a plugin does not install; the instance then stays `Running` with
    /// the plugins that did install, and `exit` cleans it up.
    pub async fn run(&mut self) -> Result<()> {
        self.expect_state(SupervisorState::Idle)?;
        self.state = SupervisorState::Launching;

        match self.launch().await {
            Ok(client) => {
                self.client = Some(client);
            }
            Err(e) => {
                self.stop_process().await;
                self.remove_profile();
                self.state = SupervisorState::Stopped;
                return Err(e);
            }
        }

        self.state = SupervisorState::Running;
        self.install_all().await
    }

    /// Attach to a target that is already listening on `port`.
    ///
    /// No process is owned: `exit` disconnects but kills nothing.
    pub async fn attach(&mut self, port: u16) -> Result<()> {
        self.expect_state(SupervisorState::Idle)?;
        self.state = SupervisorState::Launching;

        let client = ProtocolClient::new(ClientOptions::from(&self.connect));
        if let Err(e) = client.connect(port).await {
            self.state = SupervisorState::Stopped;
            return Err(e);
        }
        self.client = Some(client);
        self.control_port = Some(port);

        self.state = SupervisorState::Running;
        self.install_all().await
    }

    async fn launch(&mut self) -> Result<ProtocolClient> {
        let binary = self.target.binary.clone().ok_or_else(|| {
            HarnessError::launch("target binary path is not set (target.binary or --binary)")
        })?;

        let profile = Profile::prepare(self.target.profile_dir.as_deref())?;
        let mut prefs = self.target.effective_prefs();
        prefs.extend(self.extra_prefs.clone());
        profile.write_prefs(&prefs)?;

        let port = match self.target.control_port {
            0 => pick_free_port()?,
            port => port,
        };

        let mut launch = LaunchConfig::new(&binary, profile.path(), port)
            .with_extra_args(self.target.args.clone())
            .with_devtools(self.target.devtools);
        if let Some(ref data_dir) = self.target.data_dir {
            launch = launch.with_data_dir(data_dir);
        }
        if let Some(ref log_file) = self.target.log_file {
            launch = launch.with_log_file(log_file);
        }

        self.profile = Some(profile);
        self.control_port = Some(port);
        self.child = Some(launch_target(&launch)?);

        self.connect_with_retry(port).await
    }

    /// Connect to the control port, retrying with exponential backoff.
    ///
    /// Each attempt uses a fresh client since a closed one cannot reconnect.
    async fn connect_with_retry(&mut self, port: u16) -> Result<ProtocolClient> {
        let retries = self.connect.retries.max(1);
        let mut last_error = None;

        for attempt in 0..retries {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    return Err(HarnessError::launch(format!(
                        "target exited with {} before opening control port {}",
                        status, port
                    )));
                }
            }

            let client = ProtocolClient::new(ClientOptions::from(&self.connect));
            match client.connect(port).await {
                Ok(greeting) => {
                    debug!(
                        "Control port {} answered on attempt {}: {:?}",
                        port,
                        attempt + 1,
                        greeting.get_str("applicationType")
                    );
                    return Ok(client);
                }
                Err(e) => {
                    debug!("Connect attempt {} to port {} failed: {}", attempt + 1, port, e);
                    last_error = Some(e);
                }
            }

            if attempt + 1 < retries {
                tokio::time::sleep(self.connect.backoff(attempt)).await;
            }
        }

        Err(HarnessError::launch(format!(
            "control port {} was not reachable after {} attempts{}",
            port,
            retries,
            last_error
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        )))
    }

    /// Find the add-ons actor through the root actor.
    async fn addons_actor(&mut self) -> Result<String> {
        let client = self
            .client
            .as_ref()
            .filter(|client| client.state() != ConnectionState::Closed)
            .ok_or_else(HarnessError::connection_closed)?;
        if let Some(ref actor) = self.addons_actor {
            return Ok(actor.clone());
        }
        let root = client.request("getRoot").await?;
        let actor = root
            .get_str("addonsActor")
            .map(String::from)
            .ok_or_else(|| HarnessError::Request {
                actor: ROOT_ACTOR.to_string(),
                message: "getRoot reply has no addonsActor".to_string(),
                error: None,
            })?;
        debug!("Add-ons actor is {}", actor);
        self.addons_actor = Some(actor.clone());
        Ok(actor)
    }

    /// Install all configured plugins concurrently.
    ///
    /// Every plugin is attempted; the first failure is returned.
    async fn install_all(&mut self) -> Result<()> {
        if self.plugins.is_empty() {
            return Ok(());
        }
        let actor = self.addons_actor().await.map_err(|e| HarnessError::Install {
            plugin: "*".to_string(),
            message: e.to_string(),
        })?;
        let client = self.client.as_ref().ok_or_else(HarnessError::connection_closed)?;

        let results = join_all(
            self.plugins
                .iter()
                .map(|plugin| install_plugin(client, &actor, plugin)),
        )
        .await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(installed) => {
                    info!("Installed {} as {}", installed.id, installed.addon_id);
                    self.installed.push(installed);
                }
                Err(e) => {
                    warn!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Uninstall and reinstall every plugin without restarting the target.
    ///
    /// Best effort: a plugin that fails is recorded in the report and the
    /// others still reload. A plugin whose install failed earlier is
    /// installed fresh. Fails with a connection error, touching nothing, once
    /// the remote-control connection has closed.
    pub async fn reload(&mut self) -> Result<ReloadReport> {
        self.expect_state(SupervisorState::Running)?;
        self.state = SupervisorState::Reloading;

        let mut report = ReloadReport::default();
        let actor = match self.addons_actor().await {
            Ok(actor) => actor,
            // Nothing can be reinstalled over a dead connection.
            Err(e) if e.is_connection_fatal() => {
                self.state = SupervisorState::Running;
                return Err(e);
            }
            Err(e) => {
                for plugin in &self.plugins {
                    report.failures.push((
                        plugin.id.clone(),
                        HarnessError::Install {
                            plugin: plugin.id.clone(),
                            message: e.to_string(),
                        },
                    ));
                }
                self.state = SupervisorState::Running;
                return Ok(report);
            }
        };

        let client = match self.client.as_ref() {
            Some(client) => client,
            None => {
                self.state = SupervisorState::Running;
                return Err(HarnessError::connection_closed());
            }
        };

        let previous = std::mem::take(&mut self.installed);
        let results = join_all(self.plugins.iter().map(|plugin| {
            let current = previous.iter().find(|p| p.id == plugin.id).cloned();
            reload_plugin(client, &actor, plugin, current)
        }))
        .await;

        for (plugin, outcome) in self.plugins.iter().zip(results) {
            match outcome {
                ReloadOutcome::Reloaded(installed) => {
                    report.reloaded.push(plugin.id.clone());
                    self.installed.push(installed);
                }
                ReloadOutcome::UninstallFailed(current, e) => {
                    report.failures.push((plugin.id.clone(), e));
                    self.installed.push(current);
                }
                ReloadOutcome::InstallFailed(e) => {
                    report.failures.push((plugin.id.clone(), e));
                }
            }
        }

        for (plugin, e) in &report.failures {
            warn!("Reload of {} failed: {}", plugin, e);
        }
        info!(
            "Reloaded {} of {} plugins",
            report.reloaded.len(),
            self.plugins.len()
        );

        self.state = SupervisorState::Running;
        Ok(report)
    }

    /// Shut the target down.
    ///
    /// Sends an advisory quit request, disconnects, then kills the process
    /// group regardless of how the request went. Calling this on an instance
    /// that never ran or already stopped does nothing.
    pub async fn exit(&mut self) {
        match self.state {
            SupervisorState::Stopped => return,
            SupervisorState::Idle => {
                self.state = SupervisorState::Stopped;
                return;
            }
            _ => {}
        }
        self.state = SupervisorState::Exiting;
        info!("Stopping target");

        if let Some(client) = self.client.take() {
            match tokio::time::timeout(self.connect.quit_grace(), client.request("quit")).await {
                Ok(Ok(_)) => debug!("Target acknowledged quit"),
                Ok(Err(e)) => debug!("Quit request failed: {}", e),
                Err(_) => debug!("Quit request timed out"),
            }
            client.disconnect().await;
        }

        self.stop_process().await;
        self.remove_profile();

        self.installed.clear();
        self.addons_actor = None;
        self.state = SupervisorState::Stopped;
    }

    async fn stop_process(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = platform::terminate_child(
                &mut child,
                self.terminator.as_ref(),
                ProcessConfig::TERMINATE_GRACE,
            )
            .await
            {
                warn!("Failed to kill target process group: {}", e);
            }
        }
    }

    fn remove_profile(&mut self) {
        if let Some(profile) = self.profile.take() {
            if let Err(e) = profile.remove() {
                warn!("Failed to remove temporary profile: {}", e);
            }
        }
    }
}

#[async_trait]
impl ReloadTarget for InstanceSupervisor {
    async fn reload(&mut self) -> Result<ReloadReport> {
        InstanceSupervisor::reload(self).await
    }
}

enum ReloadOutcome {
    Reloaded(InstalledPlugin),
    UninstallFailed(InstalledPlugin, HarnessError),
    InstallFailed(HarnessError),
}

/// Uninstall `current` (if any), then install `plugin` again.
async fn reload_plugin(
    client: &ProtocolClient,
    actor: &str,
    plugin: &PluginSpec,
    current: Option<InstalledPlugin>,
) -> ReloadOutcome {
    if let Some(current) = current {
        if let Err(e) = uninstall_plugin(client, actor, &current).await {
            return ReloadOutcome::UninstallFailed(current, e);
        }
    }
    match install_plugin(client, actor, plugin).await {
        Ok(installed) => ReloadOutcome::Reloaded(installed),
        Err(e) => ReloadOutcome::InstallFailed(e),
    }
}

async fn install_plugin(
    client: &ProtocolClient,
    actor: &str,
    plugin: &PluginSpec,
) -> Result<InstalledPlugin> {
    let install_error = |message: String| HarnessError::Install {
        plugin: plugin.id.clone(),
        message,
    };

    let source_dir = plugin.source_dir.canonicalize().map_err(|e| {
        install_error(format!(
            "source directory {} is not readable: {}",
            plugin.source_dir.display(),
            e
        ))
    })?;

    let request = Packet::new(actor, "installTemporaryAddon")
        .with("addonPath", source_dir.display().to_string());
    let reply = client
        .request(request)
        .await
        .map_err(|e| install_error(e.to_string()))?;

    let addon_id = reply
        .get("addon")
        .and_then(|addon| addon.get("id"))
        .and_then(Value::as_str)
        .ok_or_else(|| install_error("install reply carries no add-on id".to_string()))?;

    Ok(InstalledPlugin {
        id: plugin.id.clone(),
        source_dir,
        addon_id: addon_id.to_string(),
    })
}

async fn uninstall_plugin(
    client: &ProtocolClient,
    actor: &str,
    installed: &InstalledPlugin,
) -> Result<()> {
    let request = Packet::new(actor, "uninstallAddon").with("addonId", installed.addon_id.clone());
    client
        .request(request)
        .await
        .map(|_| ())
        .map_err(|e| HarnessError::Install {
            plugin: installed.id.clone(),
            message: format!("uninstall failed: {}", e),
        })
}
