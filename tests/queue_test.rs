//! Queue process execution contract.

use daq_orchestrator::config::LifecycleConfig;
use daq_orchestrator::core::DeviceState;
use daq_orchestrator::device::simulated::{SimulatedBehaviour, SimulatedConnection};
use daq_orchestrator::device::{LifecycleController, RunnableDevice};
use daq_orchestrator::error::DaqError;
use daq_orchestrator::events::BroadcastPublisher;
use daq_orchestrator::queue::{
    DeviceRunProcessor, QueueBean, QueueProcess, QueueStatus, SimulatedProcessor,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};

fn publisher() -> Arc<BroadcastPublisher<QueueBean>> {
    Arc::new(BroadcastPublisher::new("queue.status", 1024))
}

fn drain(rx: &mut broadcast::Receiver<QueueBean>) -> Vec<QueueBean> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

fn simulated(bean: &QueueBean, steps: u32) -> Arc<SimulatedProcessor> {
    Arc::new(SimulatedProcessor::new(bean.clone(), steps, Duration::from_millis(10)))
}

#[tokio::test(start_paused = true)]
async fn test_second_execute_is_rejected_without_broadcast() {
    let publisher = publisher();
    let bean = QueueBean::new("scan", json!(null));
    let process = QueueProcess::new(bean.clone(), publisher.clone()).with_processor(simulated(&bean, 3));

    let done = process.execute().await.unwrap();
    assert_eq!(done.status, QueueStatus::Complete);
    assert_eq!(done.percent_complete, 100.0);
    let published = publisher.published();

    let err = process.execute().await.unwrap_err();
    assert!(err.is_illegal_state());
    assert_eq!(publisher.published(), published);
}

#[tokio::test(start_paused = true)]
async fn test_terminate_before_work_never_completes() {
    let publisher = publisher();
    let mut rx = publisher.subscribe();
    let bean = QueueBean::new("scan", json!(null));
    let process = QueueProcess::new(bean.clone(), publisher.clone()).with_processor(simulated(&bean, 3));

    process.terminate();
    let done = process.execute().await.unwrap();

    let statuses: Vec<_> = drain(&mut rx).into_iter().map(|b| b.status).collect();
    assert_eq!(statuses, vec![QueueStatus::Running, QueueStatus::Terminated]);
    assert_eq!(done.status, QueueStatus::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_terminate_during_work() {
    let publisher = publisher();
    let mut rx = publisher.subscribe();
    let bean = QueueBean::new("scan", json!(null));
    let process = Arc::new(
        QueueProcess::new(bean.clone(), publisher.clone()).with_processor(simulated(&bean, 100)),
    );
    let handle = process.termination_handle();

    let task = tokio::spawn({
        let process = Arc::clone(&process);
        async move { process.execute().await }
    });
    sleep(Duration::from_millis(205)).await;
    handle.terminate();

    let done = task.await.unwrap().unwrap();
    assert_eq!(done.status, QueueStatus::Terminated);
    assert!(done.percent_complete > 0.0 && done.percent_complete < 100.0);

    let beans = drain(&mut rx);
    assert!(beans.iter().all(|b| b.status != QueueStatus::Complete));
    assert_eq!(beans.last().map(|b| b.status), Some(QueueStatus::Terminated));
}

#[tokio::test(start_paused = true)]
async fn test_processor_failure_is_broadcast() {
    let publisher = publisher();
    let mut rx = publisher.subscribe();
    let bean = QueueBean::new("scan", json!(null));
    let processor = Arc::new(
        SimulatedProcessor::new(bean.clone(), 10, Duration::from_millis(10)).failing_at(5),
    );
    let process = QueueProcess::new(bean, publisher.clone()).with_processor(processor);

    let err = process.execute().await.unwrap_err();
    assert!(matches!(err, DaqError::Processing(_)));

    let last = drain(&mut rx).pop().unwrap();
    assert_eq!(last.status, QueueStatus::Failed);
    assert!(last.message.unwrap().contains("step 5"));
    assert_eq!(last.percent_complete, 50.0);
}

#[tokio::test]
async fn test_mismatched_beans_are_rejected_before_broadcast() {
    let publisher = publisher();
    let bean = QueueBean::new("scan", json!(null));
    let other = QueueBean::new("other", json!(null));
    let process = QueueProcess::new(bean, publisher.clone()).with_processor(simulated(&other, 3));

    assert!(process.execute().await.unwrap_err().is_illegal_state());
    assert_eq!(publisher.published(), 0);
}

fn device(run_duration: Duration) -> LifecycleController {
    LifecycleController::new(
        "det",
        Box::new(SimulatedConnection::new(
            "det",
            SimulatedBehaviour::default()
                .with_run_duration(run_duration)
                .with_points(10),
        )),
        LifecycleConfig::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_device_run_mirrors_progress() {
    let publisher = publisher();
    let mut rx = publisher.subscribe();
    let device = device(Duration::from_secs(2));
    let bean = QueueBean::new("run det", json!({"model": {"exposure": 0.1}}));
    let processor = Arc::new(DeviceRunProcessor::new(
        bean.clone(),
        device.clone(),
        Duration::from_millis(50),
    ));
    let process = QueueProcess::new(bean, publisher.clone()).with_processor(processor);

    let done = process.execute().await.unwrap();
    assert_eq!(done.status, QueueStatus::Complete);
    assert_eq!(device.state(), DeviceState::Complete);

    let percents: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|b| b.status == QueueStatus::Running)
        .map(|b| b.percent_complete)
        .collect();
    assert!(percents.len() > 2);
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test(start_paused = true)]
async fn test_terminating_device_run_aborts_device() {
    let publisher = publisher();
    let device = device(Duration::from_secs(10));
    let bean = QueueBean::new("run det", json!({"model": {}}));
    let processor = Arc::new(DeviceRunProcessor::new(
        bean.clone(),
        device.clone(),
        Duration::from_millis(50),
    ));
    let process = Arc::new(QueueProcess::new(bean, publisher.clone()).with_processor(processor));

    let task = tokio::spawn({
        let process = Arc::clone(&process);
        async move { process.execute().await }
    });
    sleep(Duration::from_secs(1)).await;
    process.terminate();

    let done = task.await.unwrap().unwrap();
    assert_eq!(done.status, QueueStatus::Terminated);
    assert_eq!(device.state(), DeviceState::Aborted);
}
