//! # Foreman
//!
//! A supervised multi-stage pipeline over bounded named channels.
//!
//! Foreman wires a fixed, linear sequence of worker stages together through
//! fixed-capacity FIFO channels, runs each stage as an independently failing
//! execution unit (OS thread or forked child process), and supervises the
//! set: a crashed stage is relaunched against the same channel bindings
//! under a configurable restart policy, and the run completes once every
//! stage has succeeded exactly once. Channel capacity is the only
//! backpressure mechanism — a slow consumer stalls its producer, and the
//! stall propagates upstream without unbounded buffering.
//!
//! The per-stage work is injected: each stage is a caller-supplied
//! `Transform(input) -> output` over opaque byte payloads. Foreman supplies
//! only the substrate.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use foreman::prelude::*;
//!
//! let frames = (1..=10).map(|i| format!("Frame_{i}").into_bytes());
//! let pipeline = Pipeline::builder()
//!     .source("capture", frames, |p| Ok(p))
//!     .stage("preprocess", |mut p| { p.extend_from_slice(b"_Preprocessed"); Ok(p) })
//!     .sink("integrate", |p| { println!("{}", String::from_utf8_lossy(&p)); Ok(p) })
//!     .build()?;
//!
//! pipeline.run()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod channel;
pub mod error;
pub mod execution;
pub mod message;
pub mod pipeline;
pub mod stage;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cancel::CancelToken;
    pub use crate::channel::{ChannelConfig, TransportKind};
    pub use crate::error::{Error, Result};
    pub use crate::execution::{DeliveryMode, ExecutionMode, RestartPolicy};
    pub use crate::message::Message;
    pub use crate::pipeline::{Pipeline, PipelineBuilder, PipelineConfig};
}

pub use error::{Error, Result};
