//! Runnable devices and their lifecycle.
//!
//! - [`RunnableDevice`]: the object-safe surface registries hand out
//! - [`LifecycleController`]: the state machine every real device runs on
//! - [`DeviceConnection`]: the remote primitives a controller drives
//! - [`simulated`]: in-process connections for tests and dry runs

pub mod connection;
pub mod controller;
pub mod listener;
pub mod simulated;

pub use connection::{DeviceCapabilities, DeviceConnection, DeviceConnector, RunContext};
pub use controller::{LifecycleController, RunHandle};
pub use listener::{
    DeviceEventBean, LifecycleListener, ListenerId, RunEvent, RunEventKind, RunListener,
};

use async_trait::async_trait;

use crate::core::{DeviceInformation, DeviceState, Position};
use crate::error::{AppResult, DaqError};

/// A device with a configure/run/abort lifecycle.
///
/// Defaults mirror the most limited device: no lifecycle information, no
/// pause or resume.
#[async_trait]
pub trait RunnableDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Execution-order priority; lower levels run first.
    fn level(&self) -> i32;

    fn set_level(&self, level: i32);

    fn state(&self) -> DeviceState;

    /// Full snapshot, or `None` if this device cannot describe itself.
    fn device_information(&self) -> Option<DeviceInformation> {
        None
    }

    async fn configure(&self, model: serde_json::Value) -> AppResult<()>;

    /// Run to completion on the caller's task, returning the outcome state.
    async fn run(&self, position: Option<Position>) -> AppResult<DeviceState>;

    /// Run on a worker task, surfacing only failures that happen quickly.
    async fn start(&self, position: Option<Position>) -> AppResult<RunHandle>;

    async fn abort(&self) -> AppResult<()>;

    async fn reset(&self) -> AppResult<()>;

    async fn pause(&self) -> AppResult<()> {
        Err(DaqError::UnsupportedOperation(format!(
            "'{}' is not pausable",
            self.name()
        )))
    }

    async fn resume(&self) -> AppResult<()> {
        Err(DaqError::UnsupportedOperation(format!(
            "'{}' is not resumable",
            self.name()
        )))
    }

    async fn dispose(&self) -> AppResult<()>;
}
