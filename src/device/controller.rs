//! Lifecycle controller for one runnable device.
//!
//! # State Machine
//!
//! ```text
//! IDLE --configure--> CONFIGURED --run--> RUNNING --+--> COMPLETE
//!                                          |  ^      +--> FAULT
//!                                    pause |  | resume
//!                                          v  |      +--> ABORTED (abort)
//!                                         PAUSED ----+
//!
//! any state --dispose--> DISPOSED
//! ```
//!
//! `start` is the only asynchronous entry point. It spawns one worker task per
//! run and waits at most the configured grace window: failures inside that
//! window are returned to the caller, anything later is only visible to
//! listeners and to whoever awaits the returned [`RunHandle`].

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

use super::connection::{DeviceCapabilities, DeviceConnection, DeviceConnector, RunContext, RunProgress};
use super::listener::{
    DeviceEventBean, LifecycleListener, ListenerId, ListenerSet, RunEvent, RunEventKind,
    RunListener,
};
use super::RunnableDevice;
use crate::config::LifecycleConfig;
use crate::core::{DeviceInformation, DeviceState, DeviceType, Position};
use crate::error::{AppResult, DaqError};
use crate::events::{BroadcastPublisher, EventPublisher};

/// Cheap, cloneable handle; clones share the same device.
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    level: AtomicI32,
    connection: Arc<dyn DeviceConnection>,
    capabilities: DeviceCapabilities,
    config: LifecycleConfig,
    state: watch::Sender<DeviceState>,
    model: Mutex<Option<serde_json::Value>>,
    template: Mutex<Option<DeviceEventBean>>,
    /// Abort signal for the run in progress, if any
    abort_signal: Mutex<Option<watch::Sender<bool>>>,
    lifecycle_listeners: ListenerSet<dyn LifecycleListener>,
    run_listeners: ListenerSet<dyn RunListener>,
    events: BroadcastPublisher<DeviceEventBean>,
}

impl LifecycleController {
    pub fn new(
        name: impl Into<String>,
        connection: Box<dyn DeviceConnection>,
        config: LifecycleConfig,
    ) -> Self {
        let name = name.into();
        let connection: Arc<dyn DeviceConnection> = Arc::from(connection);
        let capabilities = connection.capabilities();
        let (state, _) = watch::channel(DeviceState::Idle);
        let events = BroadcastPublisher::new(format!("{}.events", name), config.event_channel_capacity);
        Self {
            inner: Arc::new(Inner {
                name,
                level: AtomicI32::new(0),
                connection,
                capabilities,
                config,
                state,
                model: Mutex::new(None),
                template: Mutex::new(None),
                abort_signal: Mutex::new(None),
                lifecycle_listeners: ListenerSet::new(),
                run_listeners: ListenerSet::new(),
                events,
            }),
        }
    }

    /// Create the connection through `connector`, then wrap it.
    pub async fn connect(
        name: impl Into<String>,
        connector: &dyn DeviceConnector,
        config: LifecycleConfig,
    ) -> AppResult<Self> {
        let name = name.into();
        let connection = connector.connect(&name).await?;
        info!(device = %name, "Device connection created");
        Ok(Self::new(name, connection, config))
    }

    pub fn with_level(self, level: i32) -> Self {
        self.inner.level.store(level, Ordering::SeqCst);
        self
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.inner.capabilities
    }

    /// The model from the last successful `configure`.
    pub fn model(&self) -> Option<serde_json::Value> {
        self.inner.model.lock().clone()
    }

    /// Template copied into every lifecycle event this device emits.
    pub fn set_template_bean(&self, bean: DeviceEventBean) {
        *self.inner.template.lock() = Some(bean);
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEventBean> {
        self.inner.events.subscribe()
    }

    pub fn add_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) -> ListenerId {
        self.inner.lifecycle_listeners.add(listener)
    }

    pub fn remove_lifecycle_listener(&self, id: ListenerId) -> bool {
        self.inner.lifecycle_listeners.remove(id)
    }

    pub fn add_run_listener(&self, listener: Arc<dyn RunListener>) -> ListenerId {
        self.inner.run_listeners.add(listener)
    }

    pub fn remove_run_listener(&self, id: ListenerId) -> bool {
        self.inner.run_listeners.remove(id)
    }

    pub async fn fire_run_will_perform(&self, position: Option<&Position>) -> AppResult<()> {
        self.fire_run_event(RunEventKind::RunWillPerform, position).await
    }

    pub async fn fire_run_performed(&self, position: Option<&Position>) -> AppResult<()> {
        self.fire_run_event(RunEventKind::RunPerformed, position).await
    }

    pub async fn fire_write_will_perform(&self, position: Option<&Position>) -> AppResult<()> {
        self.fire_run_event(RunEventKind::WriteWillPerform, position).await
    }

    pub async fn fire_write_performed(&self, position: Option<&Position>) -> AppResult<()> {
        self.fire_run_event(RunEventKind::WritePerformed, position).await
    }

    /// Publish a lifecycle event built from the template bean.
    pub async fn send_event(&self, mut bean: DeviceEventBean) -> AppResult<()> {
        bean.device_name = self.inner.name.clone();
        if bean.timestamp.is_none() {
            bean.timestamp = Some(Utc::now());
        }
        self.inner.events.broadcast(&bean)?;
        self.inner.lifecycle_listeners.notify(&bean).await
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn new_event(&self) -> DeviceEventBean {
        let mut bean = self.inner.template.lock().clone().unwrap_or_default();
        bean.device_name = self.inner.name.clone();
        bean.state = Some(self.state());
        bean.timestamp = Some(Utc::now());
        bean
    }

    async fn fire_run_event(&self, kind: RunEventKind, position: Option<&Position>) -> AppResult<()> {
        let event = RunEvent {
            kind,
            device_name: self.inner.name.clone(),
            level: self.level(),
            state: self.state(),
            position: position.cloned(),
        };
        self.inner.run_listeners.notify(&event).await
    }

    /// Broadcast a state change. Listener failures are logged, never returned:
    /// the transition has already happened.
    async fn announce(&self, previous: DeviceState, message: Option<String>, error: Option<String>) {
        let mut bean = self.new_event();
        bean.previous_state = Some(previous);
        bean.message = message;
        bean.error_message = error;
        if let Err(e) = self.send_event(bean).await {
            warn!(device = %self.inner.name, "Lifecycle notification incomplete: {}", e);
        }
    }

    async fn announce_progress(&self, position: Position, percent: f64) {
        let mut bean = self.new_event();
        bean.previous_state = bean.state;
        bean.percent_complete = percent;
        bean.position = Some(position);
        if let Err(e) = self.send_event(bean).await {
            warn!(device = %self.inner.name, "Progress notification incomplete: {}", e);
        }
    }

    /// Atomically move to `to` if the current state satisfies `allowed`.
    /// Returns the previous state.
    fn transition(
        &self,
        operation: &str,
        allowed: impl Fn(DeviceState) -> bool,
        to: DeviceState,
    ) -> AppResult<DeviceState> {
        self.transition_with(operation, allowed, to, || {})
    }

    /// As [`Self::transition`], running `on_enter` under the state lock when
    /// the state actually changes.
    fn transition_with(
        &self,
        operation: &str,
        allowed: impl Fn(DeviceState) -> bool,
        to: DeviceState,
        on_enter: impl FnOnce(),
    ) -> AppResult<DeviceState> {
        let mut outcome = Err(DaqError::Disposed(self.inner.name.clone()));
        self.inner.state.send_if_modified(|state| {
            if *state == DeviceState::Disposed {
                return false;
            }
            if !allowed(*state) {
                outcome = Err(DaqError::IllegalState(format!(
                    "Cannot {} '{}' while {}",
                    operation, self.inner.name, state
                )));
                return false;
            }
            outcome = Ok(*state);
            if *state == to {
                return false;
            }
            *state = to;
            on_enter();
            true
        });
        if let Ok(previous) = outcome {
            debug!(device = %self.inner.name, from = %previous, to = %to, "{}", operation);
        }
        outcome
    }

    fn ensure_not_disposed(&self) -> AppResult<()> {
        if self.state() == DeviceState::Disposed {
            Err(DaqError::Disposed(self.inner.name.clone()))
        } else {
            Ok(())
        }
    }

    fn before_execute(&self) {
        debug!(device = %self.inner.name, state = %self.state(), "Entering before_execute");
    }

    fn after_execute(&self) {
        debug!(device = %self.inner.name, state = %self.state(), "Entering after_execute");
    }

    /// Drive the connection, forwarding progress, until it finishes or the
    /// run is aborted. Returns `None` when aborted.
    async fn drive(
        &self,
        position: Option<&Position>,
        mut abort_rx: watch::Receiver<bool>,
    ) -> Option<AppResult<()>> {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let ctx = RunContext::new(progress_tx, abort_rx.clone());
        let connection = Arc::clone(&self.inner.connection);
        let mut abort_open = true;

        let outcome = {
            let run = connection.run(position, &ctx);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    result = &mut run => break Some(result),
                    Some(progress) = progress_rx.recv() => self.forward_progress(progress).await,
                    changed = abort_rx.changed(), if abort_open => match changed {
                        Ok(()) if *abort_rx.borrow() => break None,
                        Ok(()) => {}
                        Err(_) => abort_open = false,
                    },
                }
            }
        };
        while let Ok(progress) = progress_rx.try_recv() {
            self.forward_progress(progress).await;
        }
        outcome
    }

    async fn forward_progress(&self, progress: RunProgress) {
        let result = match progress {
            RunProgress::WillWrite(position) => {
                self.fire_write_will_perform(Some(&position)).await
            }
            RunProgress::Written { position, percent } => {
                let fired = self.fire_write_performed(Some(&position)).await;
                self.announce_progress(position, percent).await;
                fired
            }
        };
        if let Err(e) = result {
            warn!(device = %self.inner.name, "Write notification incomplete: {}", e);
        }
    }

    fn was_aborted(&self) -> bool {
        self.state() == DeviceState::Aborted
    }
}

#[async_trait]
impl RunnableDevice for LifecycleController {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn level(&self) -> i32 {
        self.inner.level.load(Ordering::SeqCst)
    }

    fn set_level(&self, level: i32) {
        self.inner.level.store(level, Ordering::SeqCst);
    }

    fn state(&self) -> DeviceState {
        *self.inner.state.borrow()
    }

    fn device_information(&self) -> Option<DeviceInformation> {
        let mut info = DeviceInformation::named(self.inner.name.clone(), DeviceType::Runnable);
        info.state = Some(self.state());
        info.level = self.level();
        info.pausable = self.inner.capabilities.pausable;
        info.model = self.model();
        Some(info)
    }

    async fn configure(&self, model: serde_json::Value) -> AppResult<()> {
        let configurable =
            |s: DeviceState| matches!(s, DeviceState::Idle | DeviceState::Configured | DeviceState::Complete);
        let current = self.state();
        if current == DeviceState::Disposed {
            return Err(DaqError::Disposed(self.inner.name.clone()));
        }
        if !configurable(current) {
            return Err(DaqError::IllegalState(format!(
                "Cannot configure '{}' while {}",
                self.inner.name, current
            )));
        }

        self.inner.connection.configure(&model).await?;
        let previous = self.transition("configure", configurable, DeviceState::Configured)?;
        *self.inner.model.lock() = Some(model);
        self.announce(previous, Some("Configured".to_string()), None).await;
        Ok(())
    }

    async fn run(&self, position: Option<Position>) -> AppResult<DeviceState> {
        let (abort_tx, abort_rx) = watch::channel(false);
        // An abort that sees RUNNING must also find the signal
        let previous = self.transition_with("run", DeviceState::is_runnable, DeviceState::Running, || {
            *self.inner.abort_signal.lock() = Some(abort_tx);
        })?;

        self.before_execute();
        if let Err(e) = self.fire_run_will_perform(position.as_ref()).await {
            warn!(device = %self.inner.name, "Run start notification incomplete: {}", e);
        }
        self.announce(previous, Some("Run started".to_string()), None).await;

        let outcome = self.drive(position.as_ref(), abort_rx).await;
        self.inner.abort_signal.lock().take();

        let result = match outcome {
            None => Ok(DeviceState::Aborted),
            Some(Ok(())) => {
                match self.transition("complete", DeviceState::is_running, DeviceState::Complete) {
                    Ok(before) => {
                        if let Err(e) = self.fire_run_performed(position.as_ref()).await {
                            warn!(device = %self.inner.name, "Run end notification incomplete: {}", e);
                        }
                        self.announce(before, Some("Run complete".to_string()), None).await;
                        Ok(DeviceState::Complete)
                    }
                    // Aborted or disposed while the connection was finishing
                    Err(_) => Ok(self.state()),
                }
            }
            Some(Err(_)) if self.was_aborted() => Ok(DeviceState::Aborted),
            Some(Err(e)) => {
                warn!(device = %self.inner.name, "Run failed: {}", e);
                if let Ok(before) = self.transition("fail", DeviceState::is_running, DeviceState::Fault) {
                    self.announce(before, Some("Run failed".to_string()), Some(e.to_string()))
                        .await;
                }
                Err(e)
            }
        };
        self.after_execute();
        result
    }

    async fn start(&self, position: Option<Position>) -> AppResult<RunHandle> {
        let current = self.state();
        if current == DeviceState::Disposed {
            return Err(DaqError::Disposed(self.inner.name.clone()));
        }
        if !current.is_runnable() {
            return Err(DaqError::IllegalState(format!(
                "Cannot start '{}' while {}",
                self.inner.name, current
            )));
        }

        let worker = self.clone();
        let span = info_span!("device_run", device = %self.inner.name);
        let mut task = tokio::spawn(async move { worker.run(position).await }.instrument(span));

        let grace = self.inner.config.grace_window();
        match timeout(grace, &mut task).await {
            Ok(joined) => {
                let state = joined??;
                Ok(RunHandle::finished(self.inner.name.clone(), state))
            }
            Err(_) => {
                debug!(device = %self.inner.name, grace_ms = grace.as_millis() as u64, "Run continuing in background");
                Ok(RunHandle::running(self.inner.name.clone(), task))
            }
        }
    }

    async fn abort(&self) -> AppResult<()> {
        let previous = match self.transition("abort", DeviceState::is_running, DeviceState::Aborted) {
            Ok(previous) => previous,
            // Nothing running, or already disposed: nothing to do
            Err(_) => return Ok(()),
        };
        if let Some(signal) = self.inner.abort_signal.lock().as_ref() {
            signal.send_replace(true);
        }

        let limit = self.inner.config.abort_timeout();
        let result = match timeout(limit, self.inner.connection.abort()).await {
            Ok(result) => result,
            Err(_) => Err(DaqError::Timeout {
                operation: format!("abort of '{}'", self.inner.name),
                timeout_ms: limit.as_millis() as u64,
            }),
        };

        match result {
            Ok(()) => {
                info!(device = %self.inner.name, "Run aborted");
                self.announce(previous, Some("Run aborted".to_string()), None).await;
                Ok(())
            }
            Err(e) => {
                warn!(device = %self.inner.name, "Abort failed: {}", e);
                if let Ok(before) = self.transition("fail", |s| s == DeviceState::Aborted, DeviceState::Fault) {
                    self.announce(before, Some("Abort failed".to_string()), Some(e.to_string()))
                        .await;
                }
                Err(e)
            }
        }
    }

    async fn reset(&self) -> AppResult<()> {
        let previous = self.transition("reset", |s| !s.is_running(), DeviceState::Idle)?;
        self.inner.model.lock().take();
        if previous != DeviceState::Idle {
            self.announce(previous, Some("Reset".to_string()), None).await;
        }
        Ok(())
    }

    async fn pause(&self) -> AppResult<()> {
        self.ensure_not_disposed()?;
        if !self.inner.capabilities.pausable {
            return Err(DaqError::UnsupportedOperation(format!(
                "'{}' is not pausable",
                self.inner.name
            )));
        }
        let previous = self.transition("pause", |s| s == DeviceState::Running, DeviceState::Paused)?;
        if let Err(e) = self.inner.connection.pause().await {
            if let Err(rollback) = self.transition("pause", |s| s == DeviceState::Paused, previous) {
                warn!(device = %self.inner.name, "Cannot restore state after failed pause: {}", rollback);
            }
            return Err(e);
        }
        self.announce(previous, Some("Paused".to_string()), None).await;
        Ok(())
    }

    async fn resume(&self) -> AppResult<()> {
        self.ensure_not_disposed()?;
        if !self.inner.capabilities.pausable {
            return Err(DaqError::UnsupportedOperation(format!(
                "'{}' is not resumable",
                self.inner.name
            )));
        }
        let previous = self.transition("resume", |s| s == DeviceState::Paused, DeviceState::Running)?;
        if let Err(e) = self.inner.connection.resume().await {
            if let Err(rollback) = self.transition("resume", |s| s == DeviceState::Running, previous) {
                warn!(device = %self.inner.name, "Cannot restore state after failed resume: {}", rollback);
            }
            return Err(e);
        }
        self.announce(previous, Some("Resumed".to_string()), None).await;
        Ok(())
    }

    async fn dispose(&self) -> AppResult<()> {
        let previous = self.state();
        if previous == DeviceState::Disposed {
            return Ok(());
        }

        let aborted = if previous.is_running() {
            self.abort().await
        } else {
            Ok(())
        };

        let limit = self.inner.config.close_timeout();
        let closed = match timeout(limit, self.inner.connection.close()).await {
            Ok(result) => result,
            Err(_) => Err(DaqError::Timeout {
                operation: format!("close of '{}'", self.inner.name),
                timeout_ms: limit.as_millis() as u64,
            }),
        };

        let before = self.inner.state.send_replace(DeviceState::Disposed);
        self.announce(before, Some("Disposed".to_string()), None).await;

        let failure = match (aborted, closed) {
            (Ok(()), Ok(())) => None,
            (Err(abort_err), Ok(())) => Some(abort_err),
            (Ok(()), Err(close_err)) => Some(close_err),
            (Err(abort_err), Err(close_err)) => {
                warn!(device = %self.inner.name, "Close also failed: {}", close_err);
                Some(abort_err)
            }
        };
        match failure {
            None => {
                info!(device = %self.inner.name, "Device disposed");
                Ok(())
            }
            Some(source) => Err(DaqError::DisposeFailed {
                name: self.inner.name.clone(),
                source: Box::new(source),
            }),
        }
    }
}

impl PartialEq for LifecycleController {
    fn eq(&self, other: &Self) -> bool {
        self.inner.name == other.inner.name
    }
}

impl Eq for LifecycleController {}

impl Hash for LifecycleController {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.name.hash(state);
    }
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("name", &self.inner.name)
            .field("level", &self.level())
            .field("state", &self.state())
            .field("lifecycle_listeners", &self.inner.lifecycle_listeners.len())
            .field("run_listeners", &self.inner.run_listeners.len())
            .finish()
    }
}

// =============================================================================
// RunHandle
// =============================================================================

/// Result of [`RunnableDevice::start`].
///
/// Either the run already finished inside the grace window, or it is still
/// executing on its worker task and can be awaited later.
pub struct RunHandle {
    device_name: String,
    inner: RunHandleInner,
}

enum RunHandleInner {
    Finished(DeviceState),
    Running(JoinHandle<AppResult<DeviceState>>),
}

impl RunHandle {
    pub(crate) fn finished(device_name: String, state: DeviceState) -> Self {
        Self {
            device_name,
            inner: RunHandleInner::Finished(state),
        }
    }

    pub(crate) fn running(device_name: String, task: JoinHandle<AppResult<DeviceState>>) -> Self {
        Self {
            device_name,
            inner: RunHandleInner::Running(task),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// True once the run has reached an outcome.
    pub fn is_finished(&self) -> bool {
        match &self.inner {
            RunHandleInner::Finished(_) => true,
            RunHandleInner::Running(task) => task.is_finished(),
        }
    }

    /// Wait for the run to end and return the state it ended in.
    pub async fn wait(self) -> AppResult<DeviceState> {
        match self.inner {
            RunHandleInner::Finished(state) => Ok(state),
            RunHandleInner::Running(task) => task.await?,
        }
    }
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("device_name", &self.device_name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
