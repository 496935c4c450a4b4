//! Publish channel for status, progress and lifecycle beans.
//!
//! The lifecycle controller and the queue process write to an
//! [`EventPublisher`]; delivery guarantees belong to the implementation.
//! [`BroadcastPublisher`] is the in-process implementation, built on a Tokio
//! `broadcast` channel so any number of observers can subscribe.
//!
//! ```
//! use daq_orchestrator::events::{BroadcastPublisher, EventPublisher};
//!
//! # tokio_test::block_on(async {
//! let publisher = BroadcastPublisher::new("queue.status", 16);
//! let mut observer = publisher.subscribe();
//! publisher.broadcast(&"RUNNING".to_string())?;
//! assert_eq!(observer.recv().await.unwrap(), "RUNNING");
//! # Ok::<(), daq_orchestrator::error::DaqError>(())
//! # }).unwrap();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::AppResult;

/// Sink for beans of type `T`.
pub trait EventPublisher<T>: Send + Sync {
    /// Publish one bean.
    fn broadcast(&self, bean: &T) -> AppResult<()>;
}

/// Tokio broadcast-backed publisher.
///
/// Publishing with no subscribers is not an error: nobody asked to hear.
pub struct BroadcastPublisher<T: Clone> {
    topic: String,
    sender: broadcast::Sender<T>,
    published: AtomicU64,
}

impl<T: Clone + Send + 'static> BroadcastPublisher<T> {
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            topic: topic.into(),
            sender,
            published: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total number of beans published on this topic.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl<T: Clone + Send + Sync + 'static> EventPublisher<T> for BroadcastPublisher<T> {
    fn broadcast(&self, bean: &T) -> AppResult<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        if self.sender.send(bean.clone()).is_err() {
            trace!(topic = %self.topic, "No subscribers for published bean");
        }
        Ok(())
    }
}

impl<T: Clone> std::fmt::Debug for BroadcastPublisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastPublisher")
            .field("topic", &self.topic)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
