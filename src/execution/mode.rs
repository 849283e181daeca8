//! Execution and delivery modes for pipeline stages.

use crate::channel::TransportKind;

/// How stage execution units are hosted.
///
/// Both backends satisfy the same supervision contract; the difference is
/// the blast radius of a crash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One OS thread per stage, sharing the address space.
    ///
    /// Lowest overhead and works with either channel transport. A panic in
    /// a transform is caught at the thread boundary, but a stage that
    /// corrupts process memory takes the whole pipeline with it.
    #[default]
    Threads,

    /// One forked child process per stage.
    ///
    /// A dying child cannot touch the supervisor's address space, and death
    /// by signal is observed like any other crash. Requires the posix
    /// channel transport, since in-memory channels do not cross the `fork`
    /// boundary.
    Processes,
}

impl ExecutionMode {
    /// Check whether this mode isolates stages from each other's crashes.
    pub fn is_isolated(&self) -> bool {
        matches!(self, Self::Processes)
    }

    /// Check whether a channel transport can carry messages between units
    /// of this mode.
    pub fn supports_transport(&self, transport: TransportKind) -> bool {
        match self {
            Self::Threads => true,
            Self::Processes => transport == TransportKind::Posix,
        }
    }
}

/// What happens to a message that was dequeued by a unit that then died.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The in-flight message is lost; the relaunched unit continues with
    /// the next one. Matches the reference behavior of the substrate.
    #[default]
    AtMostOnce,

    /// The in-flight message is checkpointed before processing and
    /// redelivered to the relaunched unit. A crash after forwarding but
    /// before the checkpoint is cleared can duplicate one message
    /// downstream. Thread units only: a child process cannot share its
    /// checkpoint slot with the supervisor.
    AtLeastOnce,
}
