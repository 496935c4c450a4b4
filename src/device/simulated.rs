//! Simulated device connections
//!
//! In-process stand-ins for remote hardware, for tests and dry runs.
//! All waiting uses `tokio::time`, never `std::thread::sleep`, so they behave
//! under a paused test clock too.
//!
//! # Behaviour knobs
//!
//! - run duration split into a fixed number of written points
//! - failure at connect, immediately on run, or after a delay
//! - pausable or not, configurable or not
//! - abort / close failures

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use super::connection::{DeviceCapabilities, DeviceConnection, DeviceConnector, RunContext};
use crate::config::DeviceDefinition;
use crate::core::Position;
use crate::error::{AppResult, DaqError};

/// How a simulated device behaves.
#[derive(Clone, Debug)]
pub struct SimulatedBehaviour {
    pub run_duration: Duration,
    /// Points written per run
    pub points: u32,
    pub pausable: bool,
    /// When false, `configure` keeps the not-implemented default
    pub configurable: bool,
    /// Fail the run once this much time has passed (zero = at once)
    pub fail_after: Option<Duration>,
    pub fail_connect: bool,
    pub fail_abort: bool,
    pub fail_close: bool,
}

impl Default for SimulatedBehaviour {
    fn default() -> Self {
        Self {
            run_duration: Duration::from_millis(1_000),
            points: 10,
            pausable: false,
            configurable: true,
            fail_after: None,
            fail_connect: false,
            fail_abort: false,
            fail_close: false,
        }
    }
}

impl SimulatedBehaviour {
    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = duration;
        self
    }

    pub fn with_points(mut self, points: u32) -> Self {
        self.points = points.max(1);
        self
    }

    pub fn pausable(mut self) -> Self {
        self.pausable = true;
        self
    }

    pub fn not_configurable(mut self) -> Self {
        self.configurable = false;
        self
    }

    pub fn failing_after(mut self, delay: Duration) -> Self {
        self.fail_after = Some(delay);
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn failing_abort(mut self) -> Self {
        self.fail_abort = true;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

impl From<&DeviceDefinition> for SimulatedBehaviour {
    fn from(definition: &DeviceDefinition) -> Self {
        let mut behaviour =
            SimulatedBehaviour::default().with_run_duration(Duration::from_millis(definition.run_duration_ms));
        behaviour.pausable = definition.pausable;
        behaviour
    }
}

/// Call counters, shared with whoever created the connection.
#[derive(Debug, Default)]
pub struct SimulatedCounters {
    pub configures: AtomicU32,
    pub runs: AtomicU32,
    pub aborts: AtomicU32,
    pub closes: AtomicU32,
}

impl SimulatedCounters {
    pub fn aborts(&self) -> u32 {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn configures(&self) -> u32 {
        self.configures.load(Ordering::SeqCst)
    }
}

/// Simulated connection with realistic timing.
pub struct SimulatedConnection {
    name: String,
    behaviour: SimulatedBehaviour,
    paused: AtomicBool,
    counters: Arc<SimulatedCounters>,
}

impl SimulatedConnection {
    pub fn new(name: impl Into<String>, behaviour: SimulatedBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            paused: AtomicBool::new(false),
            counters: Arc::new(SimulatedCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<SimulatedCounters> {
        Arc::clone(&self.counters)
    }

    fn failure(&self, started: Instant) -> Option<DaqError> {
        let delay = self.behaviour.fail_after?;
        if started.elapsed() >= delay {
            Some(DaqError::Connection(format!(
                "Lost connection to '{}' after {}ms",
                self.name,
                delay.as_millis()
            )))
        } else {
            None
        }
    }
}

#[async_trait]
impl DeviceConnection for SimulatedConnection {
    fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            pausable: self.behaviour.pausable,
        }
    }

    async fn configure(&self, model: &serde_json::Value) -> AppResult<()> {
        if !self.behaviour.configurable {
            return Err(DaqError::NotImplemented(format!(
                "'{}' does not accept configuration",
                self.name
            )));
        }
        if !model.is_object() && !model.is_null() {
            return Err(DaqError::Configuration(format!(
                "Model for '{}' must be an object",
                self.name
            )));
        }
        self.counters.configures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run(&self, position: Option<&Position>, ctx: &RunContext) -> AppResult<()> {
        self.counters.runs.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        if self.behaviour.fail_after == Some(Duration::ZERO) {
            return Err(DaqError::Connection(format!(
                "Connection to '{}' refused",
                self.name
            )));
        }

        let points = self.behaviour.points.max(1);
        let step = self.behaviour.run_duration / points;
        let base = position.cloned().unwrap_or_default();
        debug!(device = %self.name, points, "Simulated run starting at {}", base);

        for index in 0..points {
            while self.paused.load(Ordering::SeqCst) && !ctx.is_aborted() {
                sleep(Duration::from_millis(10)).await;
            }
            if ctx.is_aborted() {
                return Err(DaqError::Processing(format!("Run of '{}' aborted", self.name)));
            }
            let point = base.clone().with_step(u64::from(index));
            ctx.point_will_write(&point);
            sleep(step).await;
            if let Some(err) = self.failure(started) {
                return Err(err);
            }
            let percent = f64::from(index + 1) * 100.0 / f64::from(points);
            ctx.point_written(&point, percent);
        }

        // A failure scheduled beyond the run duration still fires
        if let Some(delay) = self.behaviour.fail_after {
            let elapsed = started.elapsed();
            if delay > elapsed {
                sleep(delay - elapsed).await;
            }
            if let Some(err) = self.failure(started) {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn abort(&self) -> AppResult<()> {
        self.counters.aborts.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        if self.behaviour.fail_abort {
            return Err(DaqError::Connection(format!("Abort of '{}' rejected", self.name)));
        }
        Ok(())
    }

    async fn pause(&self) -> AppResult<()> {
        if !self.behaviour.pausable {
            return Err(DaqError::UnsupportedOperation(
                "This device is not pausable".to_string(),
            ));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> AppResult<()> {
        if !self.behaviour.pausable {
            return Err(DaqError::UnsupportedOperation(
                "This device is not resumable".to_string(),
            ));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        if self.behaviour.fail_close {
            return Err(DaqError::Connection(format!("Close of '{}' failed", self.name)));
        }
        Ok(())
    }
}

/// Hands out simulated connections, per-name behaviour or the default.
#[derive(Default)]
pub struct SimulatedConnector {
    default_behaviour: SimulatedBehaviour,
    behaviours: Mutex<HashMap<String, SimulatedBehaviour>>,
    counters: Mutex<HashMap<String, Arc<SimulatedCounters>>>,
}

impl SimulatedConnector {
    pub fn new(default_behaviour: SimulatedBehaviour) -> Self {
        Self {
            default_behaviour,
            ..Self::default()
        }
    }

    pub fn with_device(self, name: impl Into<String>, behaviour: SimulatedBehaviour) -> Self {
        self.behaviours.lock().insert(name.into(), behaviour);
        self
    }

    /// Counters of the connection created for `name`, if one was created.
    pub fn counters(&self, name: &str) -> Option<Arc<SimulatedCounters>> {
        self.counters.lock().get(name).cloned()
    }
}

#[async_trait]
impl DeviceConnector for SimulatedConnector {
    async fn connect(&self, device_name: &str) -> AppResult<Box<dyn DeviceConnection>> {
        let behaviour = self
            .behaviours
            .lock()
            .get(device_name)
            .cloned()
            .unwrap_or_else(|| self.default_behaviour.clone());
        if behaviour.fail_connect {
            return Err(DaqError::Connection(format!(
                "Cannot create connection to '{}'",
                device_name
            )));
        }
        let connection = SimulatedConnection::new(device_name, behaviour);
        self.counters
            .lock()
            .insert(device_name.to_string(), connection.counters());
        Ok(Box::new(connection))
    }
}
