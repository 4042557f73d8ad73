//! plugdev core - runtime engine for developing browser plugins against a live
//! target application.
//!
//! The crate launches the target with remote control enabled, installs plugin
//! builds into it as temporary add-ons over the actor-addressed remote-control
//! protocol, reloads them when sources change and tears the target down again.
//! The HTTP result bridge and the command line live in `plugdev-cli`.
//!
//! # Example
//!
//! ```rust,ignore
//! use plugdev_core::{HarnessConfig, InstanceSupervisor};
//!
//! #[tokio::main]
//! async fn main() -> plugdev_core::Result<()> {
//!     let config = HarnessConfig::from_path("plugdev.json")?;
//!     let mut supervisor = InstanceSupervisor::new(&config);
//!
//!     supervisor.run().await?;
//!     let report = supervisor.reload().await?;
//!     println!("Reloaded {} plugins", report.reloaded.len());
//!
//!     supervisor.exit().await;
//!     Ok(())
//! }
//! ```

pub mod build;
pub mod config;
pub mod devloop;
pub mod error;
pub mod platform;
pub mod protocol;
pub mod supervisor;

// Re-export commonly used types
pub use build::{Build, BuildScope, CommandBuild};
pub use config::{
    BuildConfig, ConnectConfig, HarnessConfig, PluginSpec, ProcessConfig, RebuildPolicy,
    RemoteConfig, TargetConfig, TestConfig, WatchConfig,
};
pub use devloop::{CycleOutcome, DevLoop, ReloadTarget, SourceWatcher};
pub use error::{HarnessError, Result};
pub use protocol::{
    ClientEvent, ClientOptions, ConnectionState, FrameError, Packet, ProtocolClient, RequestSpec,
};
pub use supervisor::{InstalledPlugin, InstanceSupervisor, ReloadReport, SupervisorState};
