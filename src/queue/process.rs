//! Binding of one queue bean to one processor.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{QueueBean, QueueStatus};
use crate::error::{AppResult, DaqError};
use crate::events::EventPublisher;

/// How a processor finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Work done; the message ends up on the COMPLETE bean.
    Completed(Option<String>),
    /// Termination was observed and the work stopped early.
    Terminated,
}

/// Executor of one kind of queued work.
#[async_trait]
pub trait QueueProcessor: Send + Sync {
    /// The bean this processor was built for.
    fn bean(&self) -> &QueueBean;

    /// Do the work. Implementations poll [`ProcessContext::is_terminated`]
    /// and stop with [`ProcessOutcome::Terminated`] once it is set.
    async fn execute(&self, ctx: &ProcessContext<'_>) -> AppResult<ProcessOutcome>;

    async fn pause(&self) -> AppResult<()> {
        Ok(())
    }

    async fn resume(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Cloneable terminate request for a [`QueueProcess`].
#[derive(Clone, Debug, Default)]
pub struct TerminationHandle {
    flag: Arc<AtomicBool>,
}

impl TerminationHandle {
    pub fn terminate(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What a processor sees of its process while executing.
pub struct ProcessContext<'a> {
    process: &'a QueueProcess,
}

impl ProcessContext<'_> {
    pub fn is_terminated(&self) -> bool {
        self.process.is_terminated()
    }

    /// Broadcast intermediate progress. Ignored once the bean is final.
    pub fn report_progress(&self, percent_complete: f64, message: Option<String>) {
        if self.process.bean.lock().status != QueueStatus::Running {
            return;
        }
        self.process
            .publish(QueueStatus::Running, percent_complete, message);
    }

    /// Snapshot of the bean being processed.
    pub fn bean(&self) -> QueueBean {
        self.process.bean()
    }
}

/// One bean, one processor, executed at most once.
pub struct QueueProcess {
    bean: Mutex<QueueBean>,
    processor: Mutex<Option<Arc<dyn QueueProcessor>>>,
    publisher: Arc<dyn EventPublisher<QueueBean>>,
    started: AtomicBool,
    termination: TerminationHandle,
}

impl QueueProcess {
    pub fn new(bean: QueueBean, publisher: Arc<dyn EventPublisher<QueueBean>>) -> Self {
        Self {
            bean: Mutex::new(bean),
            processor: Mutex::new(None),
            publisher,
            started: AtomicBool::new(false),
            termination: TerminationHandle::default(),
        }
    }

    pub fn with_processor(self, processor: Arc<dyn QueueProcessor>) -> Self {
        *self.processor.lock() = Some(processor);
        self
    }

    pub fn bean(&self) -> QueueBean {
        self.bean.lock().clone()
    }

    pub fn set_bean(&self, bean: QueueBean) -> AppResult<()> {
        self.ensure_unstarted("bean")?;
        *self.bean.lock() = bean;
        Ok(())
    }

    pub fn set_processor(&self, processor: Arc<dyn QueueProcessor>) -> AppResult<()> {
        self.ensure_unstarted("processor")?;
        *self.processor.lock() = Some(processor);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_terminated()
    }

    /// Request termination. Honoured the next time the processor polls.
    pub fn terminate(&self) {
        debug!(task = %self.bean.lock().name, "Termination requested");
        self.termination.terminate();
    }

    pub fn termination_handle(&self) -> TerminationHandle {
        self.termination.clone()
    }

    pub async fn pause(&self) -> AppResult<()> {
        self.bound_processor()?.pause().await
    }

    pub async fn resume(&self) -> AppResult<()> {
        self.bound_processor()?.resume().await
    }

    /// Run the bound processor and return the final bean.
    ///
    /// Binding problems and a second call fail with `IllegalState` before
    /// anything is broadcast. A processor error is broadcast as FAILED and
    /// then returned.
    pub async fn execute(&self) -> AppResult<QueueBean> {
        let processor = self.bound_processor()?;
        {
            let bean = self.bean.lock();
            if !processor.bean().is_same_task(&bean) {
                error!(task = %bean.name, "Process and processor hold different beans");
                return Err(DaqError::IllegalState(format!(
                    "Beans on process ({}) and processor ({}) differ",
                    bean.id,
                    processor.bean().id
                )));
            }
        }
        // A rejected binding leaves the process unstarted and rebindable
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DaqError::IllegalState(format!(
                "Task '{}' has already been executed",
                self.bean.lock().name
            )));
        }

        self.publish(QueueStatus::Running, 0.0, None);
        if self.is_terminated() {
            info!(task = %self.bean.lock().name, "Terminated before work began");
            self.publish(QueueStatus::Terminated, 0.0, None);
            return Ok(self.bean());
        }

        let ctx = ProcessContext { process: self };
        match processor.execute(&ctx).await {
            Ok(ProcessOutcome::Completed(message)) => {
                self.publish(QueueStatus::Complete, 100.0, message);
            }
            Ok(ProcessOutcome::Terminated) => {
                let percent = self.bean.lock().percent_complete;
                self.publish(QueueStatus::Terminated, percent, None);
            }
            Err(e) => {
                warn!(task = %self.bean.lock().name, "Task failed: {}", e);
                let percent = self.bean.lock().percent_complete;
                self.publish(QueueStatus::Failed, percent, Some(e.to_string()));
                return Err(e);
            }
        }
        Ok(self.bean())
    }

    fn ensure_unstarted(&self, what: &str) -> AppResult<()> {
        if self.is_started() {
            Err(DaqError::IllegalState(format!(
                "Cannot change the {} once execution has started",
                what
            )))
        } else {
            Ok(())
        }
    }

    fn bound_processor(&self) -> AppResult<Arc<dyn QueueProcessor>> {
        self.processor
            .lock()
            .clone()
            .ok_or_else(|| DaqError::IllegalState("No processor has been bound".to_string()))
    }

    fn publish(&self, status: QueueStatus, percent: f64, message: Option<String>) {
        let bean = {
            let mut bean = self.bean.lock();
            bean.update(status, percent, message);
            bean.clone()
        };
        debug!(task = %bean.name, status = %bean.status, percent = bean.percent_complete, "Task status");
        if let Err(e) = self.publisher.broadcast(&bean) {
            warn!(task = %bean.name, "Cannot broadcast task status: {}", e);
        }
    }
}

impl std::fmt::Debug for QueueProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bean = self.bean.lock();
        f.debug_struct("QueueProcess")
            .field("task", &bean.name)
            .field("status", &bean.status)
            .field("started", &self.is_started())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastPublisher;

    struct InstantProcessor {
        bean: QueueBean,
    }

    #[async_trait]
    impl QueueProcessor for InstantProcessor {
        fn bean(&self) -> &QueueBean {
            &self.bean
        }

        async fn execute(&self, ctx: &ProcessContext<'_>) -> AppResult<ProcessOutcome> {
            ctx.report_progress(50.0, None);
            Ok(ProcessOutcome::Completed(Some("done".into())))
        }
    }

    fn setup() -> (QueueProcess, Arc<BroadcastPublisher<QueueBean>>, QueueBean) {
        let bean = QueueBean::new("instant", serde_json::Value::Null);
        let publisher = Arc::new(BroadcastPublisher::new("status", 64));
        let process = QueueProcess::new(bean.clone(), publisher.clone());
        (process, publisher, bean)
    }

    #[tokio::test]
    async fn test_execute_broadcasts_running_then_complete() {
        let (process, publisher, bean) = setup();
        let mut rx = publisher.subscribe();
        process
            .set_processor(Arc::new(InstantProcessor { bean }))
            .unwrap();

        let done = process.execute().await.unwrap();
        assert_eq!(done.status, QueueStatus::Complete);
        assert_eq!(done.message.as_deref(), Some("done"));

        let statuses: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|b| (b.status, b.percent_complete))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (QueueStatus::Running, 0.0),
                (QueueStatus::Running, 50.0),
                (QueueStatus::Complete, 100.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_rebinding_after_start_is_rejected() {
        let (process, _publisher, bean) = setup();
        process
            .set_processor(Arc::new(InstantProcessor { bean: bean.clone() }))
            .unwrap();
        process.execute().await.unwrap();

        assert!(process.set_bean(bean.clone()).unwrap_err().is_illegal_state());
        assert!(process
            .set_processor(Arc::new(InstantProcessor { bean }))
            .unwrap_err()
            .is_illegal_state());
    }

    #[tokio::test]
    async fn test_missing_processor_is_illegal_state() {
        let (process, publisher, _bean) = setup();
        assert!(process.execute().await.unwrap_err().is_illegal_state());
        assert_eq!(publisher.published(), 0);
    }

    #[tokio::test]
    async fn test_rejected_binding_can_be_corrected() {
        let (process, publisher, bean) = setup();
        assert!(process.execute().await.unwrap_err().is_illegal_state());
        assert!(!process.is_started());

        let stranger = QueueBean::new("other", serde_json::Value::Null);
        process
            .set_processor(Arc::new(InstantProcessor { bean: stranger }))
            .unwrap();
        assert!(process.execute().await.unwrap_err().is_illegal_state());
        assert!(!process.is_started());
        assert_eq!(publisher.published(), 0);

        process
            .set_processor(Arc::new(InstantProcessor { bean }))
            .unwrap();
        let done = process.execute().await.unwrap();
        assert_eq!(done.status, QueueStatus::Complete);
        assert!(process.execute().await.unwrap_err().is_illegal_state());
    }
}
