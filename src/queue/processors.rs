//! Concrete queue processors.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use super::process::{ProcessContext, ProcessOutcome, QueueProcessor};
use super::QueueBean;
use crate::core::{DeviceState, Position};
use crate::device::{LifecycleController, RunnableDevice};
use crate::error::{AppResult, DaqError};

/// Steps through a fixed amount of simulated work.
pub struct SimulatedProcessor {
    bean: QueueBean,
    steps: u32,
    step_delay: Duration,
    fail_at: Option<u32>,
}

impl SimulatedProcessor {
    pub fn new(bean: QueueBean, steps: u32, step_delay: Duration) -> Self {
        Self {
            bean,
            steps: steps.max(1),
            step_delay,
            fail_at: None,
        }
    }

    /// Fail when `step` is reached.
    pub fn failing_at(mut self, step: u32) -> Self {
        self.fail_at = Some(step);
        self
    }
}

#[async_trait]
impl QueueProcessor for SimulatedProcessor {
    fn bean(&self) -> &QueueBean {
        &self.bean
    }

    async fn execute(&self, ctx: &ProcessContext<'_>) -> AppResult<ProcessOutcome> {
        for step in 0..self.steps {
            if ctx.is_terminated() {
                debug!(task = %self.bean.name, step, "Simulated task terminated");
                return Ok(ProcessOutcome::Terminated);
            }
            if self.fail_at == Some(step) {
                return Err(DaqError::Processing(format!(
                    "Simulated failure at step {} of {}",
                    step, self.steps
                )));
            }
            sleep(self.step_delay).await;
            ctx.report_progress(f64::from(step + 1) * 100.0 / f64::from(self.steps), None);
        }
        Ok(ProcessOutcome::Completed(Some(format!(
            "Completed {} simulated steps",
            self.steps
        ))))
    }
}

/// Payload understood by [`DeviceRunProcessor`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRunPayload {
    #[serde(default)]
    pub model: Option<serde_json::Value>,
    #[serde(default)]
    pub position: Option<Position>,
}

impl DeviceRunPayload {
    pub fn from_bean(bean: &QueueBean) -> AppResult<Self> {
        if bean.payload.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(bean.payload.clone())?)
    }
}

/// Runs one device through its lifecycle and mirrors its progress.
///
/// Termination aborts the device.
pub struct DeviceRunProcessor {
    bean: QueueBean,
    device: LifecycleController,
    poll_interval: Duration,
}

impl DeviceRunProcessor {
    pub fn new(bean: QueueBean, device: LifecycleController, poll_interval: Duration) -> Self {
        Self {
            bean,
            device,
            poll_interval,
        }
    }
}

#[async_trait]
impl QueueProcessor for DeviceRunProcessor {
    fn bean(&self) -> &QueueBean {
        &self.bean
    }

    async fn execute(&self, ctx: &ProcessContext<'_>) -> AppResult<ProcessOutcome> {
        let payload = DeviceRunPayload::from_bean(&self.bean)?;
        if let Some(model) = payload.model {
            self.device.configure(model).await?;
        }

        let mut events = self.device.subscribe_events();
        let handle = self.device.start(payload.position).await?;
        info!(task = %self.bean.name, device = %self.device.name(), "Device run started");

        loop {
            loop {
                match events.try_recv() {
                    Ok(event) if event.percent_complete > 0.0 => {
                        ctx.report_progress(event.percent_complete, event.message)
                    }
                    Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
            if handle.is_finished() {
                break;
            }
            if ctx.is_terminated() {
                self.device.abort().await?;
                handle.wait().await?;
                return Ok(ProcessOutcome::Terminated);
            }
            sleep(self.poll_interval).await;
        }

        match handle.wait().await? {
            DeviceState::Complete => Ok(ProcessOutcome::Completed(Some(format!(
                "Run of '{}' complete",
                self.device.name()
            )))),
            DeviceState::Aborted => Ok(ProcessOutcome::Terminated),
            other => Err(DaqError::Processing(format!(
                "Run of '{}' ended in state {}",
                self.device.name(),
                other
            ))),
        }
    }

    async fn pause(&self) -> AppResult<()> {
        self.device.pause().await
    }

    async fn resume(&self) -> AppResult<()> {
        self.device.resume().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_defaults_when_null() {
        let bean = QueueBean::new("run", serde_json::Value::Null);
        assert_eq!(DeviceRunPayload::from_bean(&bean).unwrap(), DeviceRunPayload::default());
    }

    #[test]
    fn test_payload_reads_model_and_position() {
        let bean = QueueBean::new(
            "run",
            serde_json::json!({
                "model": {"exposure": 0.1},
                "position": {"values": {"x": 1.0}, "step": 3}
            }),
        );
        let payload = DeviceRunPayload::from_bean(&bean).unwrap();
        assert_eq!(payload.model.unwrap()["exposure"], 0.1);
        let position = payload.position.unwrap();
        assert_eq!(position.get("x"), Some(1.0));
        assert_eq!(position.step, Some(3));
    }

    #[test]
    fn test_payload_rejects_wrong_shape() {
        let bean = QueueBean::new("run", serde_json::json!({"position": "nowhere"}));
        assert!(DeviceRunPayload::from_bean(&bean).is_err());
    }
}
