//! Error types for pluginbus.
//!
//! Errors fall into four families that are handled differently:
//! transport faults end the affected connection, routing faults drop a single
//! message, application faults travel back to the caller inside the response
//! envelope, and caller-side faults (timeout, cancellation) are produced
//! locally by `send`.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the broker and the plugin runtime.
#[derive(Debug, Error)]
pub enum BusError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Failed to connect to master at {addr}: {message}")]
    Connect { addr: String, message: String },

    #[error("Registration failed: {message}")]
    Registration { message: String },

    #[error("Plugin is not connected to the master")]
    NotConnected,

    #[error("Connection to the master was closed")]
    ConnectionClosed,

    // Routing errors
    #[error("Target plugin not found: {name}")]
    RouteNotFound { name: String },

    // Application errors
    #[error("Remote error from {plugin}: {message}")]
    Remote { plugin: String, message: String },

    #[error("no handler for method: {method}")]
    NoHandler { method: String },

    // Caller-side errors
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for pluginbus operations.
pub type Result<T> = std::result::Result<T, BusError>;

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BusError {
    /// Faults in moving frames over a connection. Most end that connection;
    /// an oversized outgoing frame is refused before it is written.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BusError::Io { .. }
                | BusError::Json { .. }
                | BusError::FrameTooLarge { .. }
                | BusError::Connect { .. }
                | BusError::Registration { .. }
                | BusError::NotConnected
                | BusError::ConnectionClosed
        )
    }

    /// Errors reported by the remote handler (or its absence) as data.
    pub fn is_application(&self) -> bool {
        matches!(self, BusError::Remote { .. } | BusError::NoHandler { .. })
    }

    /// Errors produced by the caller's own deadline or cancellation.
    pub fn is_caller_side(&self) -> bool {
        matches!(self, BusError::Timeout(_) | BusError::Cancelled)
    }
}
