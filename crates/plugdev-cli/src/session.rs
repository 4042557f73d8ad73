//! One `run` or `test` session: build, launch, watch, tear down.

use crate::run::RunOutcome;
use crate::server::ResultBridge;
use anyhow::{Context, Result};
use plugdev_core::{
    Build, BuildScope, ClientEvent, CommandBuild, ConnectionState, DevLoop, HarnessConfig,
    InstanceSupervisor, ProcessConfig,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Develop: reload plugins on source changes until interrupted.
    Run,
    /// Collect results posted by in-target tests.
    Test,
}

/// Why the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Interrupted,
    TargetClosed,
    Tests(RunOutcome),
}

/// Run a session to completion and return the process exit code.
///
/// Start-up failures (build, launch, connection, install) are errors. Once the
/// target is running, everything ends with cleanup and an exit code.
pub async fn run_session(config: HarnessConfig, mode: Mode) -> Result<i32> {
    config.validate().context("invalid configuration")?;

    let mut bridge = match mode {
        Mode::Test => Some(
            ResultBridge::start(config.tests.clone())
                .await
                .context("failed to start the result bridge")?,
        ),
        Mode::Run => None,
    };

    let mut builder = CommandBuild::from_config(&config.build);
    if let Some(bridge) = &bridge {
        builder = builder.with_env(ProcessConfig::BRIDGE_PORT_ENV, bridge.port().to_string());
    }

    let result = supervise(&config, Arc::new(builder), bridge.as_mut()).await;

    if let Some(bridge) = bridge.as_mut() {
        let run = bridge.snapshot().await;
        if !run.finished {
            println!("{}", run.summary());
        }
        bridge.close().await;
    }
    result
}

async fn supervise(
    config: &HarnessConfig,
    builder: Arc<CommandBuild>,
    mut bridge: Option<&mut ResultBridge>,
) -> Result<i32> {
    info!("Building plugins");
    builder
        .build(BuildScope::Full)
        .await
        .context("initial build failed")?;

    let mut supervisor = InstanceSupervisor::new(config);
    if let Some(bridge) = bridge.as_deref() {
        supervisor = supervisor.with_pref(ProcessConfig::BRIDGE_PORT_PREF, bridge.port());
    }

    if let Err(e) = supervisor.run().await {
        supervisor.exit().await;
        return Err(e).context("failed to start the target");
    }

    let dev_loop = DevLoop::new(&config.watch, builder);
    // Stays open while watching is disabled.
    let (_idle, mut events) = mpsc::channel(1);
    let _watcher = if config.watch.enabled {
        match dev_loop.watch() {
            Ok((watcher, rx)) => {
                events = rx;
                Some(watcher)
            }
            Err(e) => {
                supervisor.exit().await;
                return Err(e).context("failed to watch plugin sources");
            }
        }
    } else {
        None
    };

    let target_events = supervisor.subscribe();
    let target_state = supervisor.watch_connection();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let looping =
        tokio::spawn(async move { dev_loop.run(supervisor, events, shutdown_rx).await });

    info!("Target is running; press Ctrl+C to stop");

    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl+C: {}", e);
            }
            StopReason::Interrupted
        }
        _ = target_closed(target_state, target_events) => StopReason::TargetClosed,
        outcome = test_outcome(bridge.as_deref_mut()) => StopReason::Tests(outcome),
    };
    debug!("Stopping session: {:?}", reason);

    let _ = shutdown.send(true);
    let mut supervisor = looping.await.context("dev loop task failed")?;
    supervisor.exit().await;

    let code = match reason {
        StopReason::Interrupted => {
            info!("Interrupted");
            0
        }
        StopReason::TargetClosed => {
            info!("Target closed");
            match bridge {
                Some(bridge) => bridge.snapshot().await.exit_code(),
                None => 0,
            }
        }
        StopReason::Tests(outcome) => outcome.exit_code(),
    };
    Ok(code)
}

/// Resolves when the remote-control connection closes, from either side.
async fn target_closed(
    state: Option<watch::Receiver<ConnectionState>>,
    events: Option<broadcast::Receiver<ClientEvent>>,
) {
    let (Some(mut state), Some(mut events)) = (state, events) else {
        return std::future::pending().await;
    };
    loop {
        tokio::select! {
            _ = state.wait_for(|s| *s == ConnectionState::Closed) => return,
            event = events.recv() => match event {
                Ok(ClientEvent::End) | Err(broadcast::error::RecvError::Closed) => return,
                Ok(ClientEvent::Error(message)) => warn!("Remote-control error: {}", message),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }
}

/// Resolves with the test outcome; never resolves outside test mode.
async fn test_outcome(bridge: Option<&mut ResultBridge>) -> RunOutcome {
    if let Some(bridge) = bridge {
        if let Some(outcome) = bridge.outcome().await {
            return outcome;
        }
    }
    std::future::pending().await
}
