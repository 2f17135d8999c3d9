//! Orchestration core: plan loading and DAG analysis, conditional
//! eligibility, the layered task scheduler and its state machine, and the
//! trace/alert observers.
//!
//! The messaging substrate (envelopes, postboxes, the router) lives in
//! `archon-postbox`; this crate drives plans over it.

pub mod alert;
pub mod clock;
pub mod condition;
pub mod context;
pub mod duration;
pub mod handler;
pub mod plan;
pub mod scheduler;
pub mod trace;

pub use clock::{Clock, SystemClock};
pub use context::{RuntimeContext, Scalar};
pub use plan::{Dag, Plan, Task};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerOutcome};
pub use trace::PlanStatus;
