//! Error types for plugdev.
//!
//! One enum covers the whole runtime. Variants follow the propagation policy:
//! frame (fatal) and connection errors tear down a connection, request and
//! install errors stay local to one request or plugin, rebuild errors never
//! leave the dev loop.

use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::FrameError;

/// Main error type for the plugdev runtime.
#[derive(Debug, Error)]
pub enum HarnessError {
    // Protocol errors
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Request to {actor} failed: {message}")]
    Request {
        actor: String,
        message: String,
        /// Error marker carried by the reply, if the actor sent one.
        error: Option<String>,
    },

    // Target process errors
    #[error("Launch failed: {message}")]
    Launch { message: String },

    #[error("Plugin {plugin} failed to install: {message}")]
    Install { plugin: String, message: String },

    // Dev loop errors
    #[error("Rebuild failed: {message}")]
    Rebuild { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid state: expected {expected}, found {found}")]
    InvalidState { expected: String, found: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for plugdev operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        HarnessError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl HarnessError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        HarnessError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Shorthand for a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        HarnessError::Connection {
            message: message.into(),
        }
    }

    /// The error every outstanding request receives when its connection goes away.
    pub fn connection_closed() -> Self {
        Self::connection("connection closed")
    }

    /// Shorthand for a launch error.
    pub fn launch(message: impl Into<String>) -> Self {
        HarnessError::Launch {
            message: message.into(),
        }
    }

    /// Whether this error ends the connection it happened on.
    ///
    /// Fatal frame errors and connection errors reject all outstanding work;
    /// everything else is local to one request or plugin.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            HarnessError::Frame(frame) => frame.is_fatal(),
            HarnessError::Connection { .. } => true,
            _ => false,
        }
    }

    /// Process exit code for a run that ends with this error.
    pub fn exit_code(&self) -> i32 {
        1
    }
}
