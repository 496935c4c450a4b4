//! Device registries.
//!
//! Two read-mostly collections: simple-value devices ([`Scannable`]) and
//! runnable devices ([`RunnableDevice`]). The router only depends on the
//! service traits; [`ScannableRegistry`] and [`DeviceRegistry`] are the
//! in-memory implementations. Lookups take a shared lock internally, so
//! concurrent routers need no external locking.
//!
//! Registries are constructed explicitly and passed around as `Arc`s; there is
//! no global instance.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::config::{LifecycleConfig, ScannableDefinition, Settings};
use crate::core::DeviceState;
use crate::device::simulated::SimulatedBehaviour;
use crate::device::{DeviceConnector, LifecycleController, RunnableDevice};
use crate::error::{AppResult, DaqError};

// =============================================================================
// Scannables
// =============================================================================

/// A named value that can be read and set.
pub trait Scannable: Send + Sync {
    fn name(&self) -> &str;

    fn position(&self) -> AppResult<f64>;

    fn set_position(&self, value: f64) -> AppResult<()>;

    fn units(&self) -> Option<&str> {
        None
    }
}

/// Lookup surface over simple-value devices.
pub trait ScannableDeviceService: Send + Sync {
    /// Registered names, in a stable order.
    fn scannable_names(&self) -> AppResult<Vec<String>>;

    fn scannable(&self, name: &str) -> AppResult<Option<Arc<dyn Scannable>>>;
}

/// In-memory value holder.
pub struct SimulatedScannable {
    name: String,
    value: RwLock<f64>,
    units: Option<String>,
}

impl SimulatedScannable {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: RwLock::new(value),
            units: None,
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }
}

impl From<&ScannableDefinition> for SimulatedScannable {
    fn from(definition: &ScannableDefinition) -> Self {
        Self {
            name: definition.name.clone(),
            value: RwLock::new(definition.position),
            units: definition.units.clone(),
        }
    }
}

impl Scannable for SimulatedScannable {
    fn name(&self) -> &str {
        &self.name
    }

    fn position(&self) -> AppResult<f64> {
        Ok(*self.value.read())
    }

    fn set_position(&self, value: f64) -> AppResult<()> {
        if !value.is_finite() {
            return Err(DaqError::Processing(format!(
                "Cannot move '{}' to {}",
                self.name, value
            )));
        }
        *self.value.write() = value;
        Ok(())
    }

    fn units(&self) -> Option<&str> {
        self.units.as_deref()
    }
}

#[derive(Default)]
pub struct ScannableRegistry {
    scannables: RwLock<BTreeMap<String, Arc<dyn Scannable>>>,
}

impl ScannableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        let registry = Self::new();
        for definition in &settings.scannables {
            registry.register(Arc::new(SimulatedScannable::from(definition)))?;
        }
        Ok(registry)
    }

    /// Fails if the name is taken.
    pub fn register(&self, scannable: Arc<dyn Scannable>) -> AppResult<()> {
        match self.scannables.write().entry(scannable.name().to_string()) {
            Entry::Occupied(entry) => Err(DaqError::IllegalState(format!(
                "Scannable '{}' is already registered",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(scannable);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Scannable>> {
        self.scannables.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.scannables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scannables.read().is_empty()
    }
}

impl ScannableDeviceService for ScannableRegistry {
    fn scannable_names(&self) -> AppResult<Vec<String>> {
        Ok(self.scannables.read().keys().cloned().collect())
    }

    fn scannable(&self, name: &str) -> AppResult<Option<Arc<dyn Scannable>>> {
        Ok(self.scannables.read().get(name).cloned())
    }
}

// =============================================================================
// Runnable devices
// =============================================================================

/// Lookup and creation surface over runnable devices.
#[async_trait]
pub trait RunnableDeviceService: Send + Sync {
    /// Registered names, in a stable order.
    fn runnable_device_names(&self) -> AppResult<Vec<String>>;

    fn runnable_device(&self, name: &str) -> AppResult<Option<Arc<dyn RunnableDevice>>>;

    /// Create and register a device described by `model`, configuring it
    /// with the same model when `configure` is set.
    async fn create_runnable_device(
        &self,
        model: serde_json::Value,
        configure: bool,
    ) -> AppResult<Arc<dyn RunnableDevice>>;
}

/// Fields a model must carry for a device to be created from it.
#[derive(Debug, Deserialize)]
struct CreationModel {
    name: String,
    #[serde(default)]
    level: i32,
}

pub struct DeviceRegistry {
    connector: Arc<dyn DeviceConnector>,
    config: LifecycleConfig,
    devices: RwLock<BTreeMap<String, Arc<dyn RunnableDevice>>>,
}

impl DeviceRegistry {
    pub fn new(connector: Arc<dyn DeviceConnector>, config: LifecycleConfig) -> Self {
        Self {
            connector,
            config,
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Connect and register every device listed in `settings`, applying each
    /// definition's model.
    pub async fn from_settings(
        settings: &Settings,
        connector: Arc<dyn DeviceConnector>,
    ) -> AppResult<Self> {
        let registry = Self::new(connector, settings.lifecycle.clone());
        for definition in &settings.devices {
            let controller = LifecycleController::connect(
                definition.name.clone(),
                registry.connector.as_ref(),
                settings.lifecycle.clone(),
            )
            .await?
            .with_level(definition.level);
            if let Some(model) = &definition.model {
                controller.configure(model.clone()).await?;
            }
            registry.register(Arc::new(controller))?;
        }
        info!(count = registry.len(), "Runnable devices registered");
        Ok(registry)
    }

    /// Fails if the name is taken; a registered name never changes owner.
    pub fn register(&self, device: Arc<dyn RunnableDevice>) -> AppResult<()> {
        match self.devices.write().entry(device.name().to_string()) {
            Entry::Occupied(entry) => Err(DaqError::IllegalState(format!(
                "Device '{}' is already registered",
                entry.key()
            ))),
            Entry::Vacant(entry) => {
                entry.insert(device);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn RunnableDevice>> {
        self.devices.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Devices sorted by level, lowest first; ties keep name order.
    pub fn devices_by_level(&self) -> Vec<Arc<dyn RunnableDevice>> {
        let mut devices: Vec<_> = self.devices.read().values().cloned().collect();
        devices.sort_by_key(|device| device.level());
        devices
    }

    /// Poll until no device is in the RUNNING state. Paused devices are not
    /// waited for since nothing here can resume them.
    pub async fn wait_for_runs(&self, poll: Duration) {
        loop {
            let running: Vec<String> = self
                .devices
                .read()
                .values()
                .filter(|device| device.state() == DeviceState::Running)
                .map(|device| device.name().to_string())
                .collect();
            if running.is_empty() {
                return;
            }
            debug!(devices = ?running, "Waiting for runs to finish");
            sleep(poll).await;
        }
    }

    /// Dispose every device, continuing past failures.
    pub async fn dispose_all(&self) -> AppResult<()> {
        let devices: Vec<_> = self.devices.read().values().cloned().collect();
        let mut failures = Vec::new();
        for device in devices {
            if let Err(e) = device.dispose().await {
                warn!(device = %device.name(), "Dispose failed: {}", e);
                failures.push(e);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(failures))
        }
    }
}

#[async_trait]
impl RunnableDeviceService for DeviceRegistry {
    fn runnable_device_names(&self) -> AppResult<Vec<String>> {
        Ok(self.devices.read().keys().cloned().collect())
    }

    fn runnable_device(&self, name: &str) -> AppResult<Option<Arc<dyn RunnableDevice>>> {
        Ok(self.devices.read().get(name).cloned())
    }

    async fn create_runnable_device(
        &self,
        model: serde_json::Value,
        configure: bool,
    ) -> AppResult<Arc<dyn RunnableDevice>> {
        let creation: CreationModel = serde_json::from_value(model.clone()).map_err(|e| {
            DaqError::Configuration(format!("Model does not describe a device: {}", e))
        })?;
        if self.devices.read().contains_key(&creation.name) {
            return Err(DaqError::IllegalState(format!(
                "Device '{}' is already registered",
                creation.name
            )));
        }

        let controller = LifecycleController::connect(
            creation.name.clone(),
            self.connector.as_ref(),
            self.config.clone(),
        )
        .await?
        .with_level(creation.level);

        if configure {
            if let Err(e) = controller.configure(model).await {
                if let Err(dispose_err) = controller.dispose().await {
                    warn!(device = %creation.name, "Dispose after failed configure: {}", dispose_err);
                }
                return Err(e);
            }
        }

        let device: Arc<dyn RunnableDevice> = Arc::new(controller);
        if let Err(e) = self.register(Arc::clone(&device)) {
            // Lost a race with another creator of the same name
            let _ = device.dispose().await;
            return Err(e);
        }
        info!(device = %creation.name, configured = configure, "Device created from model");
        Ok(device)
    }
}

/// Behaviour used for devices declared in settings.
pub fn simulated_behaviours(settings: &Settings) -> Vec<(String, SimulatedBehaviour)> {
    settings
        .devices
        .iter()
        .map(|definition| (definition.name.clone(), SimulatedBehaviour::from(definition)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::simulated::SimulatedConnector;
    use serde_json::json;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(
            Arc::new(SimulatedConnector::default()),
            LifecycleConfig::default(),
        )
    }

    #[test]
    fn test_scannable_names_are_ordered() {
        let registry = ScannableRegistry::new();
        registry.register(Arc::new(SimulatedScannable::new("z", 0.0))).unwrap();
        registry.register(Arc::new(SimulatedScannable::new("x", 1.0))).unwrap();

        assert_eq!(registry.scannable_names().unwrap(), vec!["x", "z"]);
        assert!(registry.scannable("y").unwrap().is_none());
        assert!(registry
            .register(Arc::new(SimulatedScannable::new("x", 2.0)))
            .is_err());
    }

    #[test]
    fn test_simulated_scannable_rejects_nan() {
        let stage = SimulatedScannable::new("stage_x", 0.0).with_units("mm");
        stage.set_position(3.5).unwrap();
        assert_eq!(stage.position().unwrap(), 3.5);
        assert!(stage.set_position(f64::NAN).is_err());
        assert_eq!(stage.units(), Some("mm"));
    }

    #[tokio::test]
    async fn test_create_from_model_configures_when_asked() {
        let registry = registry();
        let device = registry
            .create_runnable_device(json!({"name": "detector", "level": 3, "exposure": 0.1}), true)
            .await
            .unwrap();

        assert_eq!(device.state(), DeviceState::Configured);
        assert_eq!(device.level(), 3);
        assert!(registry.runnable_device("detector").unwrap().is_some());

        let unconfigured = registry
            .create_runnable_device(json!({"name": "analyser"}), false)
            .await
            .unwrap();
        assert_eq!(unconfigured.state(), DeviceState::Idle);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_nameless_models() {
        let registry = registry();
        registry
            .create_runnable_device(json!({"name": "detector"}), false)
            .await
            .unwrap();

        let duplicate = registry
            .create_runnable_device(json!({"name": "detector"}), false)
            .await;
        assert!(matches!(duplicate, Err(DaqError::IllegalState(_))));

        let nameless = registry.create_runnable_device(json!({"exposure": 1}), false).await;
        assert!(matches!(nameless, Err(DaqError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_devices_by_level() {
        let registry = registry();
        for (name, level) in [("c", 2), ("a", 5), ("b", 1)] {
            registry
                .create_runnable_device(json!({"name": name, "level": level}), false)
                .await
                .unwrap();
        }
        let order: Vec<String> = registry
            .devices_by_level()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_after_runs_finish_does_not_abort() {
        let connector = Arc::new(SimulatedConnector::new(
            SimulatedBehaviour::default().with_run_duration(Duration::from_secs(3)),
        ));
        let registry = DeviceRegistry::new(connector.clone(), LifecycleConfig::default());
        let device = registry
            .create_runnable_device(json!({"name": "detector"}), true)
            .await
            .unwrap();

        device.start(None).await.unwrap();
        assert_eq!(device.state(), DeviceState::Running);

        registry.wait_for_runs(Duration::from_millis(100)).await;
        assert_eq!(device.state(), DeviceState::Complete);
        registry.dispose_all().await.unwrap();

        let counters = connector.counters("detector").unwrap();
        assert_eq!(device.state(), DeviceState::Disposed);
        assert_eq!(counters.runs(), 1);
        assert_eq!(counters.aborts(), 0);
        assert_eq!(counters.closes(), 1);
    }
}
