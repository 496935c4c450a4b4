//! Configuration system using Figment
//!
//! Settings are loaded from:
//! 1. A TOML file (optional; defaults are used for anything missing)
//! 2. Environment variables prefixed with `DAQ_`, nested with `__`
//!
//! ```text
//! DAQ_APPLICATION__LOG_LEVEL=debug
//! DAQ_LIFECYCLE__GRACE_WINDOW_MS=250
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_orchestrator::config::Settings;
//!
//! let settings = Settings::load(Some("orchestrator.toml".as_ref()))?;
//! println!("Grace window: {:?}", settings.lifecycle.grace_window());
//! # Ok::<(), daq_orchestrator::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, DaqError};

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Simple-value devices registered at startup
    #[serde(default)]
    pub scannables: Vec<ScannableDefinition>,
    /// Runnable devices registered at startup
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq-orchestrator".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Timing for the device lifecycle controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// How long `start` waits for an early failure before returning
    #[serde(default = "default_grace_window")]
    pub grace_window_ms: u64,
    /// Upper bound on waiting for the remote abort primitive
    #[serde(default = "default_abort_timeout")]
    pub abort_timeout_ms: u64,
    /// Upper bound on waiting for the connection to close during dispose
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
    /// Capacity of each controller's lifecycle event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

impl LifecycleConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: default_grace_window(),
            abort_timeout_ms: default_abort_timeout(),
            close_timeout_ms: default_close_timeout(),
            event_channel_capacity: default_event_capacity(),
        }
    }
}

/// Queue execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Capacity of the status broadcast channel
    #[serde(default = "default_status_capacity")]
    pub status_channel_capacity: usize,
    /// Polling period used by processors when checking for termination
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Number of steps the simulated processor performs
    #[serde(default = "default_simulated_steps")]
    pub simulated_steps: u32,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            status_channel_capacity: default_status_capacity(),
            poll_interval_ms: default_poll_interval(),
            simulated_steps: default_simulated_steps(),
        }
    }
}

/// A simple-value device entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannableDefinition {
    pub name: String,
    #[serde(default)]
    pub position: f64,
    #[serde(default)]
    pub units: Option<String>,
}

/// A runnable device entry, backed by a simulated connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    pub name: String,
    #[serde(default)]
    pub level: i32,
    #[serde(default)]
    pub pausable: bool,
    /// Simulated run duration
    #[serde(default = "default_run_duration")]
    pub run_duration_ms: u64,
    /// Configuration model applied at registration, if any
    #[serde(default)]
    pub model: Option<serde_json::Value>,
}

fn default_grace_window() -> u64 {
    500
}

fn default_abort_timeout() -> u64 {
    2_000
}

fn default_close_timeout() -> u64 {
    2_000
}

fn default_event_capacity() -> usize {
    256
}

fn default_status_capacity() -> usize {
    1024
}

fn default_poll_interval() -> u64 {
    50
}

fn default_simulated_steps() -> u32 {
    100
}

fn default_run_duration() -> u64 {
    1_000
}

impl Settings {
    /// Load settings from an optional TOML file plus `DAQ_` environment overrides.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment.merge(Env::prefixed("DAQ_").split("__")).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic checks that parsing alone cannot catch.
    pub fn validate(&self) -> AppResult<()> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log level '{}'",
                self.application.log_level
            )));
        }
        if self.lifecycle.event_channel_capacity == 0 || self.queue.status_channel_capacity == 0 {
            return Err(DaqError::Configuration(
                "Channel capacities must be greater than zero".to_string(),
            ));
        }
        if self.queue.poll_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "queue.poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let names = self
            .scannables
            .iter()
            .map(|s| &s.name)
            .chain(self.devices.iter().map(|d| &d.name));
        for name in names {
            if name.trim().is_empty() {
                return Err(DaqError::Configuration("Device name cannot be empty".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate device name '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}
