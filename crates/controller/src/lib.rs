//! Tabby reconciliation engine.
//!
//! Cache notifications for Cats and their Deployments are normalized by the
//! [`EventRouter`] into Cat keys on a rate-limited work queue. A fixed pool of
//! workers pops one key at a time and runs a level-triggered
//! [`Reconciler`] pass: read current state, validate, create the Deployment
//! if it is missing, update status, report. Failed passes go back on the
//! queue with backoff; nothing a pass does can stop a worker.

#![forbid(unsafe_code)]

pub mod client;
pub mod controller;
pub mod reconciler;
pub mod router;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{CatStatusUpdater, ClientError, DeploymentCreator, EventRecorder, EventType};
pub use controller::{Controller, ControllerConfig, ControllerError};
pub use reconciler::{DropReason, Outcome, ReconcileError, Reconciler};
pub use router::{EventRouter, IgnoreReason, Notification, RouteDecision};

/// Name of the work queue (metrics label).
pub const QUEUE_NAME: &str = "Cats";
