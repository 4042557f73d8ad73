//! Watch, rebuild, reload.
//!
//! The dev loop watches the plugin sources, waits for a burst of changes to
//! settle, rebuilds and then reloads the running target. Cycles run inline in
//! the loop, so a change that arrives mid-cycle schedules the next cycle
//! instead of overlapping the current one.
//!
//! Failures inside a cycle are logged and swallowed: the target keeps running
//! the last good build and the loop keeps watching.

pub mod debounce;

pub use debounce::{Debouncer, WatchEvent};

use crate::build::{Build, BuildScope};
use crate::config::{RebuildPolicy, WatchConfig};
use crate::error::{HarnessError, Result};
use crate::supervisor::ReloadReport;
use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Capacity of the watcher -> loop channel.
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// Something that can pick up a fresh build without restarting.
#[async_trait]
pub trait ReloadTarget: Send {
    async fn reload(&mut self) -> Result<ReloadReport>;
}

/// Result of one rebuild+reload cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The build succeeded and the target was asked to reload.
    Reloaded(ReloadReport),
    /// The build or the reload failed; the previous build stays live.
    Failed(HarnessError),
}

/// Debounced rebuild scheduler.
pub struct DevLoop {
    root: PathBuf,
    ignore: Vec<PathBuf>,
    config: WatchConfig,
    builder: Arc<dyn Build>,
}

impl DevLoop {
    pub fn new(config: &WatchConfig, builder: Arc<dyn Build>) -> Self {
        let root = config
            .source_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."));
        let root = root.canonicalize().unwrap_or(root);
        let ignore = config
            .ignore
            .iter()
            .map(|path| {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    root.join(path)
                };
                path.canonicalize().unwrap_or(path)
            })
            .collect();

        Self {
            root,
            ignore,
            config: config.clone(),
            builder,
        }
    }

    /// Watched directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Which build a change to `path` needs.
    pub fn scope_for(&self, path: &Path) -> BuildScope {
        match self.config.policy {
            RebuildPolicy::AlwaysFull => BuildScope::Full,
            RebuildPolicy::Granular if self.config.is_script(path) => BuildScope::Scripts,
            RebuildPolicy::Granular => BuildScope::Full,
        }
    }

    /// Whether a change to `path` is ignored.
    ///
    /// Ignored: anything under a dot-directory or named with a leading dot,
    /// configured ignore paths, and editor scratch files.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let hidden = relative.components().any(|c| {
            c.as_os_str()
                .to_str()
                .map(|s| s.starts_with('.') && s != "." && s != "..")
                .unwrap_or(false)
        });
        if hidden {
            return true;
        }

        if self.ignore.iter().any(|ignored| path.starts_with(ignored)) {
            return true;
        }

        is_editor_temp(path)
    }

    /// Start watching the source root.
    ///
    /// Changed paths arrive on the returned channel until the watcher is
    /// dropped.
    pub fn watch(&self) -> Result<(SourceWatcher, mpsc::Receiver<PathBuf>)> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let watcher = SourceWatcher::start(&self.root, tx)?;
        Ok((watcher, rx))
    }

    /// Schedule cycles for the changed paths on `events` until `shutdown`
    /// flips, then hand the target back.
    pub async fn run<T: ReloadTarget>(
        &self,
        mut target: T,
        mut events: mpsc::Receiver<PathBuf>,
        mut shutdown: watch::Receiver<bool>,
    ) -> T {
        let mut debouncer = Debouncer::new(self.config.debounce());
        let mut events_open = true;

        while !*shutdown.borrow() {
            let deadline = debouncer.deadline();
            let window = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = events.recv(), if events_open => match event {
                    Some(path) if self.is_ignored(&path) => {
                        debug!("Ignoring change to {}", path.display());
                    }
                    Some(path) => {
                        debug!("Change to {}", path.display());
                        debouncer.observe(WatchEvent::now(path));
                    }
                    None => {
                        warn!("File watcher stopped; no further rebuilds");
                        events_open = false;
                    }
                },
                _ = window => {
                    if let Some(event) = debouncer.fire(Instant::now()) {
                        self.cycle(&mut target, &event).await;
                    }
                }
            }
        }

        debug!("Dev loop stopped");
        target
    }

    /// Rebuild for `event` and reload the target. Never fails.
    pub async fn cycle<T: ReloadTarget>(&self, target: &mut T, event: &WatchEvent) -> CycleOutcome {
        let scope = self.scope_for(&event.path);
        info!(
            "{} changed, rebuilding ({:?})",
            event
                .path
                .strip_prefix(&self.root)
                .unwrap_or(&event.path)
                .display(),
            scope
        );

        if let Err(e) = self.builder.build(scope).await {
            let e = match e {
                HarnessError::Rebuild { .. } => e,
                other => HarnessError::Rebuild {
                    message: other.to_string(),
                },
            };
            error!("{}; keeping the previous build", e);
            return CycleOutcome::Failed(e);
        }

        match target.reload().await {
            Ok(report) => {
                if report.is_success() {
                    info!("Reloaded {} plugin(s)", report.reloaded.len());
                } else {
                    warn!(
                        "Reloaded {} plugin(s), {} failed",
                        report.reloaded.len(),
                        report.failures.len()
                    );
                }
                CycleOutcome::Reloaded(report)
            }
            Err(e) => {
                let e = HarnessError::Rebuild {
                    message: format!("reload failed: {}", e),
                };
                error!("{}", e);
                CycleOutcome::Failed(e)
            }
        }
    }
}

fn is_editor_temp(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.ends_with('~') || name == "4913" || (name.starts_with('#') && name.ends_with('#')) {
        return true;
    }
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("swp" | "swx" | "tmp")
    )
}

/// Recursive file system watcher feeding changed paths into a channel.
///
/// Stops when dropped.
pub struct SourceWatcher {
    _watcher: RecommendedWatcher,
}

impl SourceWatcher {
    pub fn start(root: &Path, tx: mpsc::Sender<PathBuf>) -> Result<Self> {
        let (event_tx, event_rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();

        let mut watcher = notify::recommended_watcher(event_tx)
            .map_err(|e| HarnessError::Other(format!("Failed to create file watcher: {}", e)))?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| HarnessError::Other(format!("Failed to watch directory: {}", e)))?;

        info!("Watching {} for changes", root.display());

        // Ends when the watcher (and with it the sender) is dropped, or when
        // the loop stops listening.
        std::thread::spawn(move || {
            for result in event_rx {
                match result {
                    Ok(event) => {
                        if matches!(event.kind, EventKind::Access(_)) {
                            continue;
                        }
                        for path in event.paths {
                            if tx.blocking_send(path).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("File watcher error: {}", e),
                }
            }
            debug!("File watcher thread exiting");
        });

        Ok(Self { _watcher: watcher })
    }
}
