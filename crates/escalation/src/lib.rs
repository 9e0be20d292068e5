//! Escalation engine: decides when and to whom each out-of-date device is
//! escalated, and keeps the tracked set in step with inventory.
//!
//! - [`EscalationPolicy`]: the policy contract, with [`CadencePolicy`] (weekly
//!   manager day) and [`IntervalBucketPolicy`] (continuous reminder cadence)
//! - [`Messenger`]: send gating, jitter and the flag claims around each send
//! - [`FleetReconciler`]: inventory diff against the tracked set
//! - [`poll_requested`], [`DeadlineCheck`], [`StatusHandler`]

pub mod adhoc;
pub mod bucket;
pub mod cadence;
pub mod deadline;
pub mod error;
pub mod interval;
pub mod messenger;
pub mod policy;
pub mod reconcile;
pub mod scheduler;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use adhoc::poll_requested;
pub use bucket::{BucketKey, BucketSet};
pub use cadence::CadencePolicy;
pub use deadline::{DeadlineCheck, DeadlineOutcome};
pub use error::EscalationError;
pub use interval::IntervalBucketPolicy;
pub use messenger::Messenger;
pub use policy::{build_policy, templates_for, EscalationPolicy, TickReport};
pub use reconcile::{FleetReconciler, ReconcileReport};
pub use scheduler::BucketScheduler;
pub use status::{RoutineStatus, ServiceStatus, StatusHandler};
