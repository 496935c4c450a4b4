//! Lifecycle controller behaviour against simulated connections.

use async_trait::async_trait;
use daq_orchestrator::config::LifecycleConfig;
use daq_orchestrator::core::{DeviceState, Position};
use daq_orchestrator::device::simulated::{SimulatedBehaviour, SimulatedConnection, SimulatedCounters};
use daq_orchestrator::device::{
    LifecycleController, LifecycleListener, DeviceEventBean, RunEvent, RunListener, RunnableDevice,
};
use daq_orchestrator::error::{AppResult, DaqError};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

/// Helper to create a controller and keep its connection counters.
fn create_device(behaviour: SimulatedBehaviour) -> (LifecycleController, Arc<SimulatedCounters>) {
    let connection = SimulatedConnection::new("malcolm", behaviour);
    let counters = connection.counters();
    let device = LifecycleController::new("malcolm", Box::new(connection), LifecycleConfig::default());
    (device, counters)
}

async fn configured(behaviour: SimulatedBehaviour) -> (LifecycleController, Arc<SimulatedCounters>) {
    let (device, counters) = create_device(behaviour);
    device
        .configure(json!({"exposure": 0.05}))
        .await
        .expect("configure");
    (device, counters)
}

#[derive(Default)]
struct CountingRunListener {
    will_perform: AtomicU32,
    performed: AtomicU32,
    writes: AtomicU32,
}

#[async_trait]
impl RunListener for CountingRunListener {
    async fn run_will_perform(&self, _event: &RunEvent) -> AppResult<()> {
        self.will_perform.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run_performed(&self, _event: &RunEvent) -> AppResult<()> {
        self.performed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn write_performed(&self, _event: &RunEvent) -> AppResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingLifecycleListener {
    events: Mutex<Vec<DeviceEventBean>>,
}

#[async_trait]
impl LifecycleListener for RecordingLifecycleListener {
    async fn event_performed(&self, event: &DeviceEventBean) -> AppResult<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_immediate_failure_is_raised_by_start() {
    let (device, _) = configured(SimulatedBehaviour::default().failing_after(Duration::ZERO)).await;

    let err = device.start(None).await.unwrap_err();
    assert!(matches!(err, DaqError::Connection(_)), "unexpected error: {err}");
    assert_eq!(device.state(), DeviceState::Fault);
}

#[tokio::test(start_paused = true)]
async fn test_late_failure_only_reaches_listeners() {
    let (device, _) = configured(
        SimulatedBehaviour::default()
            .with_run_duration(Duration::from_secs(1))
            .failing_after(Duration::from_secs(2)),
    )
    .await;
    let listener = Arc::new(RecordingLifecycleListener::default());
    device.add_lifecycle_listener(listener.clone());

    let started = Instant::now();
    let handle = device.start(None).await.expect("start returns before the failure");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!handle.is_finished());
    assert_eq!(device.state(), DeviceState::Running);

    assert!(handle.wait().await.is_err());
    assert_eq!(device.state(), DeviceState::Fault);

    let events = listener.events.lock();
    let fault = events
        .iter()
        .find(|e| e.state == Some(DeviceState::Fault))
        .expect("fault event");
    assert!(fault.error_message.as_deref().unwrap_or_default().contains("Lost connection"));
}

#[tokio::test(start_paused = true)]
async fn test_short_run_finishes_inside_grace_window() {
    let (device, counters) =
        configured(SimulatedBehaviour::default().with_run_duration(Duration::from_millis(100))).await;

    let handle = device.start(Some(Position::new().with("x", 1.5))).await.unwrap();
    assert!(handle.is_finished());
    assert_eq!(handle.wait().await.unwrap(), DeviceState::Complete);
    assert_eq!(counters.runs(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_ends_run_and_repeat_is_noop() {
    let (device, counters) =
        configured(SimulatedBehaviour::default().with_run_duration(Duration::from_secs(10))).await;

    let handle = device.start(None).await.unwrap();
    device.abort().await.unwrap();
    assert_eq!(device.state(), DeviceState::Aborted);
    assert_eq!(handle.wait().await.unwrap(), DeviceState::Aborted);

    device.abort().await.unwrap();
    assert_eq!(counters.aborts(), 1);
    assert_eq!(device.state(), DeviceState::Aborted);
}

#[tokio::test(start_paused = true)]
async fn test_pause_requires_capability() {
    let (device, _) =
        configured(SimulatedBehaviour::default().with_run_duration(Duration::from_secs(10))).await;
    let _handle = device.start(None).await.unwrap();

    let err = device.pause().await.unwrap_err();
    assert!(matches!(err, DaqError::UnsupportedOperation(_)));
    assert_eq!(device.state(), DeviceState::Running);
    device.abort().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume_pausable_device() {
    let (device, _) = configured(
        SimulatedBehaviour::default()
            .with_run_duration(Duration::from_secs(2))
            .pausable(),
    )
    .await;
    let handle = device.start(None).await.unwrap();

    device.pause().await.unwrap();
    assert_eq!(device.state(), DeviceState::Paused);
    sleep(Duration::from_secs(5)).await;
    // Still held after longer than the whole run
    assert_eq!(device.state(), DeviceState::Paused);

    device.resume().await.unwrap();
    assert_eq!(device.state(), DeviceState::Running);
    assert_eq!(handle.wait().await.unwrap(), DeviceState::Complete);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_closes_even_when_abort_fails() {
    let (device, counters) = configured(
        SimulatedBehaviour::default()
            .with_run_duration(Duration::from_secs(10))
            .failing_abort(),
    )
    .await;
    let _handle = device.start(None).await.unwrap();

    let err = device.dispose().await.unwrap_err();
    assert!(matches!(err, DaqError::DisposeFailed { .. }));
    assert!(matches!(err.root_cause(), DaqError::Connection(_)));
    assert_eq!(counters.closes(), 1);
    assert_eq!(device.state(), DeviceState::Disposed);

    assert!(matches!(device.configure(json!({})).await, Err(DaqError::Disposed(_))));
    assert!(device.dispose().await.is_ok());
    assert_eq!(counters.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_listeners_notified_until_removed() {
    let (device, _) = configured(
        SimulatedBehaviour::default()
            .with_run_duration(Duration::from_millis(100))
            .with_points(4),
    )
    .await;
    let kept = Arc::new(CountingRunListener::default());
    let removed = Arc::new(CountingRunListener::default());
    device.add_run_listener(kept.clone());
    let id = device.add_run_listener(removed.clone());
    assert!(device.remove_run_listener(id));

    device.start(None).await.unwrap().wait().await.unwrap();

    assert_eq!(kept.will_perform.load(Ordering::SeqCst), 1);
    assert_eq!(kept.performed.load(Ordering::SeqCst), 1);
    assert_eq!(kept.writes.load(Ordering::SeqCst), 4);
    assert_eq!(removed.will_perform.load(Ordering::SeqCst), 0);
    assert_eq!(removed.writes.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_progress_events_are_published() {
    let (device, _) = configured(
        SimulatedBehaviour::default()
            .with_run_duration(Duration::from_millis(100))
            .with_points(5),
    )
    .await;
    let mut events = device.subscribe_events();
    let mut states = device.subscribe_state();

    device.run(None).await.unwrap();

    let mut percents = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.position.is_some() {
            percents.push(event.percent_complete);
        }
    }
    assert_eq!(percents, vec![20.0, 40.0, 60.0, 80.0, 100.0]);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), DeviceState::Complete);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abort_right_after_run_begins_stops_connection() {
    let (device, counters) =
        configured(SimulatedBehaviour::default().with_run_duration(Duration::from_secs(30))).await;
    let mut states = device.subscribe_state();

    let worker = device.clone();
    let run = tokio::spawn(async move { worker.run(None).await });
    states
        .wait_for(|state| *state == DeviceState::Running)
        .await
        .unwrap();
    device.abort().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run should end once aborted")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, DeviceState::Aborted);
    assert_eq!(counters.aborts(), 1);
}
