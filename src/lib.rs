//! Core library for the DAQ orchestrator.
//!
//! Control requests arrive at the [`router::RequestRouter`], which resolves
//! devices from the [`registry`] and drives their lifecycle through
//! [`device::LifecycleController`]. Long-running work is queued as
//! [`queue::QueueBean`]s and executed by [`queue::QueueProcess`].
//! Status and lifecycle beans are published through [`events`].

pub mod config;
pub mod core;
pub mod device;
pub mod error;
pub mod events;
pub mod logging;
pub mod queue;
pub mod registry;
pub mod router;
