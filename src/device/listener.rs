//! Run and lifecycle listeners, and the ordered fan-out used to notify them.
//!
//! Listeners are held until explicitly removed with the [`ListenerId`] returned
//! when they were added. Notification happens in registration order; a listener
//! that fails is logged and collected, and delivery carries on with the next.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::core::{DeviceState, Position};
use crate::error::{AppResult, DaqError};

/// Handle returned when a listener is added; pass it back to remove it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Which point in a run an event reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEventKind {
    RunWillPerform,
    RunPerformed,
    WriteWillPerform,
    WritePerformed,
}

/// Event delivered to [`RunListener`]s.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: RunEventKind,
    pub device_name: String,
    pub level: i32,
    pub state: DeviceState,
    pub position: Option<Position>,
}

/// Lifecycle event bean.
///
/// A controller may carry a template bean; every event it emits starts as a
/// copy of the template so that fields like `scan_id` or custom `properties`
/// travel with each notification.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEventBean {
    pub device_name: String,
    pub state: Option<DeviceState>,
    pub previous_state: Option<DeviceState>,
    #[serde(default)]
    pub percent_complete: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl DeviceEventBean {
    pub fn with_scan_id(mut self, scan_id: impl Into<String>) -> Self {
        self.scan_id = Some(scan_id.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }
}

/// Observer of run and write points.
#[async_trait]
pub trait RunListener: Send + Sync {
    async fn run_will_perform(&self, _event: &RunEvent) -> AppResult<()> {
        Ok(())
    }

    async fn run_performed(&self, _event: &RunEvent) -> AppResult<()> {
        Ok(())
    }

    async fn write_will_perform(&self, _event: &RunEvent) -> AppResult<()> {
        Ok(())
    }

    async fn write_performed(&self, _event: &RunEvent) -> AppResult<()> {
        Ok(())
    }
}

/// Observer of lifecycle events.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    async fn event_performed(&self, event: &DeviceEventBean) -> AppResult<()>;
}

/// Ordered set of listeners.
pub(crate) struct ListenerSet<L: ?Sized> {
    listeners: Mutex<Vec<(ListenerId, Arc<L>)>>,
    next_id: AtomicU64,
}

impl<L: ?Sized> ListenerSet<L> {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Returns false if no listener had this id.
    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Copy of the current listeners, so no lock is held while notifying.
    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }
}

impl ListenerSet<dyn RunListener> {
    pub(crate) async fn notify(&self, event: &RunEvent) -> AppResult<()> {
        let mut failures = Vec::new();
        for listener in self.snapshot() {
            let result = match event.kind {
                RunEventKind::RunWillPerform => listener.run_will_perform(event).await,
                RunEventKind::RunPerformed => listener.run_performed(event).await,
                RunEventKind::WriteWillPerform => listener.write_will_perform(event).await,
                RunEventKind::WritePerformed => listener.write_performed(event).await,
            };
            if let Err(e) = result {
                warn!(device = %event.device_name, kind = ?event.kind, "Run listener failed: {}", e);
                failures.push(e);
            }
        }
        collect_failures(failures)
    }
}

impl ListenerSet<dyn LifecycleListener> {
    pub(crate) async fn notify(&self, event: &DeviceEventBean) -> AppResult<()> {
        let mut failures = Vec::new();
        for listener in self.snapshot() {
            if let Err(e) = listener.event_performed(event).await {
                warn!(device = %event.device_name, "Lifecycle listener failed: {}", e);
                failures.push(e);
            }
        }
        collect_failures(failures)
    }
}

fn collect_failures(failures: Vec<DaqError>) -> AppResult<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(DaqError::ListenerFailures(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl LifecycleListener for Recorder {
        async fn event_performed(&self, _event: &DeviceEventBean) -> AppResult<()> {
            self.log.lock().push(self.tag);
            if self.fail {
                Err(DaqError::Processing(format!("{} refused", self.tag)))
            } else {
                Ok(())
            }
        }
    }

    fn recorder(tag: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Arc<Recorder> {
        Arc::new(Recorder {
            tag,
            log: Arc::clone(log),
            fail,
        })
    }

    #[tokio::test]
    async fn test_registration_order_and_failure_isolation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set: ListenerSet<dyn LifecycleListener> = ListenerSet::new();
        set.add(recorder("first", &log, false));
        set.add(recorder("second", &log, true));
        set.add(recorder("third", &log, false));

        let result = set.notify(&DeviceEventBean::default()).await;

        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
        match result {
            Err(DaqError::ListenerFailures(failures)) => assert_eq!(failures.len(), 1),
            other => panic!("expected listener failures, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_removed_listener_is_not_notified() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let set: ListenerSet<dyn LifecycleListener> = ListenerSet::new();
        let id = set.add(recorder("gone", &log, false));

        assert!(set.remove(id));
        assert!(!set.remove(id));
        set.notify(&DeviceEventBean::default()).await.unwrap();

        assert!(log.lock().is_empty());
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_template_bean_fields() {
        let bean = DeviceEventBean::default()
            .with_scan_id("scan-7")
            .with_property("beamline", serde_json::json!("i18"));
        assert_eq!(bean.scan_id.as_deref(), Some("scan-7"));
        assert_eq!(bean.properties["beamline"], "i18");
    }
}
