/// RTI configuration and logger setup.
pub mod config;

/// Delivery of RTI messages to federates, and the TCP transport.
pub mod connection;

/// Federate-side stub: request/response client and local federation view.
pub mod federate;

/// Federation executions: roster, object model, coordinator and event loop.
pub mod federation;

/// Messages exchanged between federates and the RTI.
pub mod message;

/// Synchronization points, time management and ownership management.
pub mod operations;

/// Registry of federation executions and federate sessions.
pub mod rti;

/// Tracing and logging infrastructure.
#[cfg_attr(test, allow(dead_code))]
pub mod tracing;

pub use crate::{
    config::{Config, ConfigArgs, RtiConfig},
    federate::{FederateView, RtiClient},
    federation::{
        object_model::{AttributeHandle, ObjectClassHandle, ObjectHandle, ObjectModel},
        roster::{FederateHandle, FederateInfo},
    },
    message::{CorrelationId, Notice},
    operations::{
        ownership::Owner,
        sync_point::SyncScope,
        time::{AdvanceKind, LogicalTime},
        ErrorKind, RtiError,
    },
    rti::Rti,
};
