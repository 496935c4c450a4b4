//! Remote device connection primitives.
//!
//! A [`DeviceConnection`] is the opaque handle through which a lifecycle
//! controller talks to its hardware. Its wire protocol is not the controller's
//! concern. Defaults describe the most limited device: configuration is not
//! implemented and pause/resume are unsupported, so a device kind has to opt in
//! to each explicitly.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::core::Position;
use crate::error::{AppResult, DaqError};

/// Optional capabilities of a connection kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub pausable: bool,
}

impl DeviceCapabilities {
    pub fn pausable() -> Self {
        Self { pausable: true }
    }
}

/// Progress reported by a connection while a run is executing.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum RunProgress {
    WillWrite(Position),
    Written { position: Position, percent: f64 },
}

/// Handed to [`DeviceConnection::run`]: lets the connection report points as
/// they are written and see whether the run has been aborted.
pub struct RunContext {
    progress: mpsc::UnboundedSender<RunProgress>,
    aborted: watch::Receiver<bool>,
}

impl RunContext {
    pub(crate) fn new(
        progress: mpsc::UnboundedSender<RunProgress>,
        aborted: watch::Receiver<bool>,
    ) -> Self {
        Self { progress, aborted }
    }

    pub fn point_will_write(&self, position: &Position) {
        // The receiver only goes away once the run is over
        let _ = self.progress.send(RunProgress::WillWrite(position.clone()));
    }

    pub fn point_written(&self, position: &Position, percent_complete: f64) {
        let _ = self.progress.send(RunProgress::Written {
            position: position.clone(),
            percent: percent_complete.clamp(0.0, 100.0),
        });
    }

    pub fn is_aborted(&self) -> bool {
        *self.aborted.borrow()
    }
}

/// Connection to one remote device, exclusively owned by its controller.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::default()
    }

    async fn configure(&self, _model: &serde_json::Value) -> AppResult<()> {
        Err(DaqError::NotImplemented(
            "Configure has not been implemented!".to_string(),
        ))
    }

    /// Execute one run. Should return promptly once `ctx.is_aborted()`.
    async fn run(&self, position: Option<&Position>, ctx: &RunContext) -> AppResult<()>;

    async fn abort(&self) -> AppResult<()>;

    async fn pause(&self) -> AppResult<()> {
        Err(DaqError::UnsupportedOperation(
            "This device is not pausable".to_string(),
        ))
    }

    async fn resume(&self) -> AppResult<()> {
        Err(DaqError::UnsupportedOperation(
            "This device is not resumable".to_string(),
        ))
    }

    /// Release the remote resource.
    async fn close(&self) -> AppResult<()>;
}

/// Creates connections; one call per device at registration time.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(&self, device_name: &str) -> AppResult<Box<dyn DeviceConnection>>;
}
