//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific process control live here rather than
//! in the supervisor.

pub mod process;

pub use process::{
    is_process_alive, isolate_process_group, terminate_child, PlatformTerminator, Termination,
    TerminateProcessGroup,
};
