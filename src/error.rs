//! Error types for Foreman.

use thiserror::Error;

/// Result type alias using Foreman's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Foreman operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Payload exceeds the channel's configured maximum message size.
    #[error("message of {size} bytes exceeds channel limit of {limit} bytes")]
    MessageTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Configured maximum payload size.
        limit: usize,
    },

    /// A channel with this name already exists in the current namespace.
    #[error("channel {0:?} already exists")]
    ChannelAlreadyExists(String),

    /// No channel with this name exists.
    #[error("channel {0:?} not found")]
    ChannelNotFound(String),

    /// The channel was destroyed while an operation was in flight.
    #[error("channel {0:?} is closed")]
    ChannelClosed(String),

    /// A frame read from a channel could not be decoded.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The stage list does not form a valid pipeline.
    #[error("invalid pipeline topology: {0}")]
    Topology(String),

    /// The injected transform returned an error.
    #[error("transform failed in stage {stage:?}: {reason}")]
    Transform {
        /// Name of the failing stage.
        stage: String,
        /// Error reported by the transform.
        reason: String,
    },

    /// An execution unit died without returning a clean result.
    #[error("stage {stage:?} crashed: {reason}")]
    StageCrashed {
        /// Name of the crashed stage.
        stage: String,
        /// How the unit died (panic message, signal, exit code).
        reason: String,
    },

    /// A stage kept crashing until its restart budget ran out.
    #[error("stage {stage:?} exhausted its restart budget after {attempts} attempts")]
    RestartBudgetExhausted {
        /// Name of the stage that gave up.
        stage: String,
        /// Number of launches performed before giving up.
        attempts: u32,
    },

    /// The run was cancelled before completing.
    #[error("pipeline run cancelled")]
    Cancelled,

    /// System call error (via nix).
    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
