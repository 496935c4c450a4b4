//! Core data types shared by the router, the lifecycle controller and the queue.
//!
//! # Data Flow
//!
//! ```text
//! DeviceRequest --> RequestRouter --> registry lookup --> LifecycleController
//!       ^                                                        |
//!       +------------- DeviceInformation appended ---------------+
//! ```
//!
//! A `DeviceRequest` is both the request and the response: the router enriches
//! it with one [`DeviceInformation`] per device it touched and hands it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// =============================================================================
// Request Envelope
// =============================================================================

/// Which registry a request is aimed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    /// Simple named values with no multi-step lifecycle
    Scannable,
    /// Devices driven through configure/run/abort by a remote connection
    Runnable,
}

/// Action to perform on a named runnable device.
///
/// Wire values that are not recognised decode to [`DeviceAction::Unknown`],
/// which the router treats as "report only".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceAction {
    Run,
    Abort,
    Reset,
    #[serde(other)]
    Unknown,
}

/// Target position for a run, keyed by axis name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Axis name to demand value
    pub values: BTreeMap<String, f64>,
    /// Index of this point within its scan, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u64>,
}

impl Position {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style axis insertion.
    pub fn with(mut self, axis: impl Into<String>, value: f64) -> Self {
        self.values.insert(axis.into(), value);
        self
    }

    pub fn with_step(mut self, step: u64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn get(&self, axis: &str) -> Option<f64> {
        self.values.get(axis).copied()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axes: Vec<String> = self
            .values
            .iter()
            .map(|(axis, value)| format!("{}={}", axis, value))
            .collect();
        write!(f, "[{}]", axes.join(", "))
    }
}

/// Control request, enriched in place and returned as the response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    #[serde(default = "Uuid::new_v4")]
    pub unique_id: Uuid,
    pub device_type: DeviceType,
    /// Exact name or full-match regex; `None` enumerates everything
    #[serde(default)]
    pub device_name: Option<String>,
    /// Opaque configuration payload for a runnable device
    #[serde(default)]
    pub device_model: Option<serde_json::Value>,
    #[serde(default)]
    pub device_action: Option<DeviceAction>,
    /// Configure a device created from `device_model` straight away
    #[serde(default)]
    pub configure: bool,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub device_information: Vec<DeviceInformation>,
    /// Set when processing failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DeviceRequest {
    pub fn new(device_type: DeviceType) -> Self {
        Self {
            unique_id: Uuid::new_v4(),
            device_type,
            device_name: None,
            device_model: None,
            device_action: None,
            configure: false,
            position: None,
            device_information: Vec::new(),
            error_message: None,
        }
    }

    /// Request against the simple-value registry.
    pub fn scannable() -> Self {
        Self::new(DeviceType::Scannable)
    }

    /// Request against the runnable-device registry.
    pub fn runnable() -> Self {
        Self::new(DeviceType::Runnable)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    pub fn with_model(mut self, model: serde_json::Value) -> Self {
        self.device_model = Some(model);
        self
    }

    pub fn with_action(mut self, action: DeviceAction) -> Self {
        self.device_action = Some(action);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn configure_on_create(mut self, configure: bool) -> Self {
        self.configure = configure;
        self
    }

    pub fn add_device_information(&mut self, info: DeviceInformation) {
        self.device_information.push(info);
    }

    /// Information for `name`, if this response carries any.
    pub fn information_for(&self, name: &str) -> Option<&DeviceInformation> {
        self.device_information.iter().find(|info| info.name == name)
    }
}

// =============================================================================
// Device State and Information
// =============================================================================

/// Lifecycle state of a runnable device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    /// Registered but not configured
    Idle,
    /// Model applied, ready to run
    Configured,
    /// Executing a run
    Running,
    /// Run suspended (pausable devices only)
    Paused,
    /// Last run finished normally
    Complete,
    /// Last run failed
    Fault,
    /// Last run was aborted
    Aborted,
    /// Connection released; terminal
    Disposed,
}

impl DeviceState {
    /// Running or paused, i.e. a run is in progress.
    pub fn is_running(self) -> bool {
        matches!(self, DeviceState::Running | DeviceState::Paused)
    }

    /// States in which a run can start.
    pub fn is_runnable(self) -> bool {
        matches!(self, DeviceState::Configured | DeviceState::Complete)
    }

    /// States that end a run.
    pub fn is_run_outcome(self) -> bool {
        matches!(
            self,
            DeviceState::Complete | DeviceState::Fault | DeviceState::Aborted
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceState::Idle => "IDLE",
            DeviceState::Configured => "CONFIGURED",
            DeviceState::Running => "RUNNING",
            DeviceState::Paused => "PAUSED",
            DeviceState::Complete => "COMPLETE",
            DeviceState::Fault => "FAULT",
            DeviceState::Aborted => "ABORTED",
            DeviceState::Disposed => "DISPOSED",
        };
        f.write_str(label)
    }
}

/// Snapshot of one device, appended to a [`DeviceRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInformation {
    pub name: String,
    pub device_type: DeviceType,
    /// Lifecycle state; scannables have none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<DeviceState>,
    #[serde(default)]
    pub level: i32,
    #[serde(default)]
    pub pausable: bool,
    /// Last model the device was configured with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DeviceInformation {
    /// Name-only snapshot, used for scannables and for devices without full
    /// lifecycle information.
    pub fn named(name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            name: name.into(),
            device_type,
            state: None,
            level: 0,
            pausable: false,
            model: None,
            label: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
