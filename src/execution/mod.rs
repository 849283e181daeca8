//! Stage execution and supervision.
//!
//! One execution unit hosts one generation of one stage. Units come in two
//! backends behind a single {launch, poll, stop} capability:
//!
//! - **Threads**: stages run as OS threads in the supervisor's process.
//! - **Processes**: stages run as forked children, communicating with their
//!   neighbours solely through posix-transport channels; a child crash
//!   (including death by signal) cannot corrupt the supervisor.
//!
//! The supervisor is backend-agnostic: it launches units, observes exits at
//! a bounded interval, relaunches crashed stages under a restart policy,
//! and declares the run complete once every stage has succeeded exactly
//! once.

mod mode;
mod supervisor;
mod unit;

pub use mode::{DeliveryMode, ExecutionMode};
pub use supervisor::{
    BackoffStrategy, RestartPolicy, StageReport, StageStatus, SupervisionReport, Supervisor,
};
