//! Custom error types for the orchestrator.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a single surface for everything that
//! can go wrong between a control request arriving and a device finishing its run.
//!
//! ## Error Hierarchy
//!
//! - **`NotFound`**: a named device (or other entity) is not registered.
//! - **`UnsupportedOperation`**: the device kind or executor does not offer the
//!   capability (e.g. pause on a non-pausable device).
//! - **`NotImplemented`**: a base default was not overridden by the device kind.
//! - **`IllegalState`**: an invalid lifecycle transition or a re-binding attempt
//!   on a queue process that has already started.
//! - **`Disposed`**: any operation on a controller after `dispose()`.
//! - **`Routing`**: what callers of the request router see. It wraps any of the
//!   above, as well as interrupted or timed-out waits, and keeps the cause.
//!
//! The remaining variants cover the connection layer, configuration loading and
//! aggregated failures (dispose, listener fan-out).

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Device '{0}' has been disposed")]
    Disposed(String),

    #[error("Routing error: {message}")]
    Routing {
        message: String,
        #[source]
        source: Box<DaqError>,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Cannot dispose of '{name}'")]
    DisposeFailed {
        name: String,
        #[source]
        source: Box<DaqError>,
    },

    #[error("{} listener(s) failed during notification", .0.len())]
    ListenerFailures(Vec<DaqError>),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration load error: {0}")]
    Config(#[from] figment::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DaqError {
    /// Wraps `self` into a [`DaqError::Routing`] unless it already is one.
    pub fn into_routing(self, message: impl Into<String>) -> DaqError {
        match self {
            routing @ DaqError::Routing { .. } => routing,
            other => DaqError::Routing {
                message: message.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through routing and dispose wrappers.
    pub fn root_cause(&self) -> &DaqError {
        match self {
            DaqError::Routing { source, .. } | DaqError::DisposeFailed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), DaqError::NotFound(_))
    }

    pub fn is_illegal_state(&self) -> bool {
        matches!(self.root_cause(), DaqError::IllegalState(_))
    }
}
