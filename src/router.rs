//! Request router
//!
//! Entry point for control requests. A [`DeviceRequest`] names a registry
//! (scannable or runnable), optionally a device or name pattern, a model and an
//! action. The router resolves the devices, drives the lifecycle operations the
//! request asks for and appends one [`DeviceInformation`] per device touched.
//!
//! # Runnable requests
//!
//! | name | model | behaviour                                             |
//! |------|-------|-------------------------------------------------------|
//! | yes  | any   | configure with model if given, then dispatch action    |
//! | no   | yes   | create a device from the model                         |
//! | no   | no    | list every device that can describe itself             |
//!
//! Every failure reaches the caller as [`DaqError::Routing`] with the original
//! cause attached, and a failed request gains no device information.

use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::{DeviceAction, DeviceInformation, DeviceRequest, DeviceType};
use crate::device::RunnableDevice;
use crate::error::{AppResult, DaqError};
use crate::registry::{RunnableDeviceService, ScannableDeviceService};

/// Which names a request selects.
#[derive(Debug)]
enum NameFilter {
    All,
    Exact(String),
    Pattern(Regex),
}

impl NameFilter {
    fn from_request(name: Option<&str>) -> Self {
        let Some(name) = name else {
            return NameFilter::All;
        };
        if regex::escape(name) == name {
            return NameFilter::Exact(name.to_string());
        }
        match Regex::new(&format!("^(?:{})$", name)) {
            Ok(pattern) => NameFilter::Pattern(pattern),
            // Not a valid pattern, so it can only be meant literally
            Err(_) => NameFilter::Exact(name.to_string()),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            NameFilter::All => true,
            NameFilter::Exact(exact) => exact == name,
            NameFilter::Pattern(pattern) => pattern.is_match(name),
        }
    }
}

pub struct RequestRouter {
    scannables: Arc<dyn ScannableDeviceService>,
    devices: Arc<dyn RunnableDeviceService>,
}

impl RequestRouter {
    pub fn new(
        scannables: Arc<dyn ScannableDeviceService>,
        devices: Arc<dyn RunnableDeviceService>,
    ) -> Self {
        Self {
            scannables,
            devices,
        }
    }

    /// Process `request` and return it enriched.
    pub async fn process(&self, mut request: DeviceRequest) -> AppResult<DeviceRequest> {
        self.process_in_place(&mut request).await?;
        Ok(request)
    }

    /// Process `request`, enriching it in place. On failure the request keeps
    /// its previous information and records the error message.
    pub async fn process_in_place(&self, request: &mut DeviceRequest) -> AppResult<()> {
        debug!(id = %request.unique_id, device_type = ?request.device_type, name = ?request.device_name, "Processing device request");
        let outcome = match request.device_type {
            DeviceType::Scannable => self.process_scannables(request),
            DeviceType::Runnable => self.process_runnables(request).await,
        };

        match outcome {
            Ok(information) => {
                for info in information {
                    request.add_device_information(info);
                }
                request.error_message = None;
                Ok(())
            }
            Err(e) => {
                let error = e.into_routing(format!("Cannot process request {}", request.unique_id));
                let cause = error.root_cause().to_string();
                warn!(id = %request.unique_id, "Device request failed: {}", cause);
                request.error_message = Some(cause);
                Err(error)
            }
        }
    }

    fn process_scannables(&self, request: &DeviceRequest) -> AppResult<Vec<DeviceInformation>> {
        let filter = NameFilter::from_request(request.device_name.as_deref());
        let mut information = Vec::new();

        for name in self.scannables.scannable_names()? {
            if !filter.matches(&name) {
                continue;
            }
            if self.scannables.scannable(&name)?.is_none() {
                return Err(DaqError::NotFound(format!(
                    "There is no created device called '{}'",
                    name
                )));
            }
            information.push(DeviceInformation::named(name, DeviceType::Scannable));
        }

        if let (Some(requested), true) = (&request.device_name, information.is_empty()) {
            return Err(DaqError::NotFound(format!(
                "There is no scannable matching '{}'",
                requested
            )));
        }
        Ok(information)
    }

    async fn process_runnables(&self, request: &DeviceRequest) -> AppResult<Vec<DeviceInformation>> {
        match (&request.device_name, &request.device_model) {
            (Some(name), _) => {
                let info = self.process_named(name, request).await?;
                Ok(vec![info])
            }
            (None, Some(model)) => {
                let device = self
                    .devices
                    .create_runnable_device(model.clone(), request.configure)
                    .await?;
                Ok(vec![snapshot(device.as_ref())])
            }
            (None, None) => self.list_runnables(),
        }
    }

    async fn process_named(&self, name: &str, request: &DeviceRequest) -> AppResult<DeviceInformation> {
        let device = self.devices.runnable_device(name)?.ok_or_else(|| {
            DaqError::NotFound(format!("There is no created device called '{}'", name))
        })?;

        if let Some(model) = &request.device_model {
            device.configure(model.clone()).await?;
        }

        match request.device_action {
            Some(DeviceAction::Run) => {
                let handle = device.start(request.position.clone()).await?;
                info!(device = %name, finished = handle.is_finished(), "Run started");
            }
            Some(DeviceAction::Abort) => device.abort().await?,
            Some(DeviceAction::Reset) => device.reset().await?,
            Some(DeviceAction::Unknown) => {
                debug!(device = %name, "Unrecognised action, reporting state only");
            }
            None => {}
        }

        Ok(snapshot(device.as_ref()))
    }

    fn list_runnables(&self) -> AppResult<Vec<DeviceInformation>> {
        let mut information = Vec::new();
        for name in self.devices.runnable_device_names()? {
            let device = match self.devices.runnable_device(&name) {
                Ok(Some(device)) => device,
                Ok(None) => {
                    warn!(device = %name, "Device '{}' could not be found and will be skipped", name);
                    continue;
                }
                Err(e) => {
                    warn!(device = %name, "Device '{}' could not be resolved and will be skipped: {}", name, e);
                    continue;
                }
            };
            match device.device_information() {
                Some(info) => information.push(info),
                None => warn!(
                    device = %name,
                    "Device '{}' does not expose lifecycle information and will be skipped",
                    name
                ),
            }
        }
        Ok(information)
    }
}

/// Full information if the device offers it, otherwise name and state.
fn snapshot(device: &dyn RunnableDevice) -> DeviceInformation {
    device.device_information().unwrap_or_else(|| {
        let mut info = DeviceInformation::named(device.name(), DeviceType::Runnable);
        info.state = Some(device.state());
        info.level = device.level();
        info
    })
}
