//! Pulls submitted beans and runs each on its own Tokio task.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use super::process::{QueueProcess, QueueProcessor, TerminationHandle};
use super::{QueueBean, QueueStatus};
use crate::error::{AppResult, DaqError};
use crate::events::EventPublisher;

/// Where submitted beans come from.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Next bean, or `None` once the source is exhausted.
    async fn next_bean(&self) -> Option<QueueBean>;
}

/// Task source fed through a Tokio channel.
pub struct ChannelTaskSource {
    receiver: tokio::sync::Mutex<mpsc::Receiver<QueueBean>>,
}

impl ChannelTaskSource {
    /// Returns the submitting side and the source. The source is exhausted
    /// once every sender is dropped.
    pub fn channel(capacity: usize) -> (mpsc::Sender<QueueBean>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                receiver: tokio::sync::Mutex::new(rx),
            },
        )
    }
}

#[async_trait]
impl TaskSource for ChannelTaskSource {
    async fn next_bean(&self) -> Option<QueueBean> {
        self.receiver.lock().await.recv().await
    }
}

/// Builds the processor for a bean.
pub type ProcessorFactory =
    Box<dyn Fn(&QueueBean) -> AppResult<Arc<dyn QueueProcessor>> + Send + Sync>;

/// Summary of one consumer run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub completed: usize,
    pub terminated: usize,
    pub failed: usize,
}

pub struct QueueConsumer {
    source: Arc<dyn TaskSource>,
    factory: ProcessorFactory,
    publisher: Arc<dyn EventPublisher<QueueBean>>,
    active: Mutex<HashMap<Uuid, TerminationHandle>>,
}

impl QueueConsumer {
    pub fn new(
        source: Arc<dyn TaskSource>,
        factory: ProcessorFactory,
        publisher: Arc<dyn EventPublisher<QueueBean>>,
    ) -> Self {
        Self {
            source,
            factory,
            publisher,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Ids of tasks currently executing.
    pub fn active_tasks(&self) -> Vec<Uuid> {
        self.active.lock().keys().copied().collect()
    }

    /// Request termination of one task. False if it is not running here.
    pub fn terminate(&self, id: &Uuid) -> bool {
        match self.active.lock().get(id) {
            Some(handle) => {
                handle.terminate();
                true
            }
            None => false,
        }
    }

    pub fn terminate_all(&self) {
        for handle in self.active.lock().values() {
            handle.terminate();
        }
    }

    /// Consume until the source is exhausted and every started task ended.
    pub async fn run(self: Arc<Self>) -> AppResult<ConsumerReport> {
        let mut tasks = JoinSet::new();
        let mut report = ConsumerReport::default();

        while let Some(bean) = self.source.next_bean().await {
            let process = match self.bind(bean) {
                Some(process) => process,
                None => {
                    report.failed += 1;
                    continue;
                }
            };
            let id = process.bean().id;
            self.active.lock().insert(id, process.termination_handle());

            let consumer = Arc::clone(&self);
            let span = tracing::info_span!("queue_task", task = %id);
            tasks.spawn(
                async move {
                    let result = process.execute().await;
                    consumer.active.lock().remove(&id);
                    result
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(DaqError::from).and_then(|result| result) {
                Ok(bean) if bean.status == QueueStatus::Terminated => report.terminated += 1,
                Ok(_) => report.completed += 1,
                Err(e) => {
                    warn!("Queue task ended with error: {}", e);
                    report.failed += 1;
                }
            }
        }
        info!(?report, "Task source exhausted");
        Ok(report)
    }

    /// Pair a bean with its processor; a factory failure is broadcast as
    /// FAILED straight away.
    fn bind(&self, bean: QueueBean) -> Option<QueueProcess> {
        match (self.factory)(&bean) {
            Ok(processor) => {
                Some(QueueProcess::new(bean, Arc::clone(&self.publisher)).with_processor(processor))
            }
            Err(e) => {
                error!(task = %bean.name, "No processor for task: {}", e);
                let mut failed = bean;
                failed.update(QueueStatus::Failed, 0.0, Some(e.to_string()));
                if let Err(e) = self.publisher.broadcast(&failed) {
                    warn!(task = %failed.name, "Cannot broadcast task status: {}", e);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastPublisher;
    use crate::queue::SimulatedProcessor;
    use tokio::time::Duration;

    fn simulated_factory() -> ProcessorFactory {
        Box::new(|bean: &QueueBean| {
            if bean.name == "unknown" {
                return Err(DaqError::UnsupportedOperation(format!("No processor for '{}'", bean.name)));
            }
            Ok(Arc::new(SimulatedProcessor::new(bean.clone(), 4, Duration::from_millis(5)))
                as Arc<dyn QueueProcessor>)
        })
    }

    #[tokio::test]
    async fn test_consumer_runs_every_submitted_bean() {
        let (tx, source) = ChannelTaskSource::channel(8);
        let publisher = Arc::new(BroadcastPublisher::new("status", 256));
        let mut rx = publisher.subscribe();
        let consumer = Arc::new(QueueConsumer::new(
            Arc::new(source),
            simulated_factory(),
            publisher.clone(),
        ));

        tx.send(QueueBean::new("first", serde_json::Value::Null)).await.unwrap();
        tx.send(QueueBean::new("second", serde_json::Value::Null)).await.unwrap();
        tx.send(QueueBean::new("unknown", serde_json::Value::Null)).await.unwrap();
        drop(tx);

        let report = consumer.clone().run().await.unwrap();
        assert_eq!(
            report,
            ConsumerReport {
                completed: 2,
                terminated: 0,
                failed: 1
            }
        );
        assert!(consumer.active_tasks().is_empty());

        let finals: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|b| b.status.is_final())
            .map(|b| (b.name, b.status))
            .collect();
        assert_eq!(finals.len(), 3);
        assert!(finals.contains(&("unknown".to_string(), QueueStatus::Failed)));
    }

    #[test]
    fn test_terminate_unknown_task_is_false() {
        let (_tx, source) = ChannelTaskSource::channel(1);
        let consumer = QueueConsumer::new(
            Arc::new(source),
            simulated_factory(),
            Arc::new(BroadcastPublisher::new("status", 4)),
        );
        assert!(!consumer.terminate(&Uuid::new_v4()));
    }
}
