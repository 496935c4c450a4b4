//! Queue execution
//!
//! Long-running work is described by a [`QueueBean`] and carried out by a
//! [`QueueProcessor`]. A [`QueueProcess`] binds the two, runs the processor at
//! most once and broadcasts the bean's status and percent complete as the work
//! progresses:
//!
//! ```text
//! SUBMITTED --execute--> RUNNING (0%) --+--> COMPLETE (100%)
//!                                       +--> TERMINATED (terminate() observed)
//!                                       +--> FAILED (processor error)
//! ```
//!
//! Termination is cooperative: processors poll the flag, so its latency is the
//! processor's polling granularity. [`QueueConsumer`] pulls beans from a
//! [`TaskSource`] and runs each one on its own Tokio task.

pub mod consumer;
pub mod process;
pub mod processors;

pub use consumer::{ChannelTaskSource, ConsumerReport, ProcessorFactory, QueueConsumer, TaskSource};
pub use process::{ProcessContext, ProcessOutcome, QueueProcess, QueueProcessor, TerminationHandle};
pub use processors::{DeviceRunPayload, DeviceRunProcessor, SimulatedProcessor};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Status of a queued task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Submitted,
    Running,
    Complete,
    Terminated,
    Failed,
}

impl QueueStatus {
    /// No further status follows a final one.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            QueueStatus::Complete | QueueStatus::Terminated | QueueStatus::Failed
        )
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QueueStatus::Submitted => "SUBMITTED",
            QueueStatus::Running => "RUNNING",
            QueueStatus::Complete => "COMPLETE",
            QueueStatus::Terminated => "TERMINATED",
            QueueStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// A unit of queued work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueBean {
    pub id: Uuid,
    pub name: String,
    pub status: QueueStatus,
    /// 0 to 100
    pub percent_complete: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// What to do; interpreted by the processor
    #[serde(default)]
    pub payload: serde_json::Value,
    pub submission_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl QueueBean {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: QueueStatus::Submitted,
            percent_complete: 0.0,
            message: None,
            payload,
            submission_time: Utc::now(),
            last_update: None,
        }
    }

    /// Same task, regardless of progress.
    pub fn is_same_task(&self, other: &QueueBean) -> bool {
        self.id == other.id
    }

    pub(crate) fn update(&mut self, status: QueueStatus, percent: f64, message: Option<String>) {
        self.status = status;
        self.percent_complete = percent.clamp(0.0, 100.0);
        if message.is_some() {
            self.message = message;
        }
        self.last_update = Some(Utc::now());
    }
}
