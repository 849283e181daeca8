//! Fluent pipeline builder.
//!
//! Stage order is construction order: the first entry is the source (and
//! must bring the feed), every later entry consumes its predecessor's
//! output, and the last entry is the sink. The builder uses state markers
//! to enforce "source first" at compile time; everything else is validated
//! by [`PipelineBuilder::build`] before any channel or unit exists.
//!
//! # Example
//!
//! ```rust,ignore
//! use foreman::pipeline::{Pipeline, PipelineConfig};
//!
//! let pipeline = Pipeline::builder()
//!     .source("frames", frames.into_iter(), |p| Ok(p))
//!     .stage("preprocess", |p| Ok(preprocess(p)))
//!     .sink("integrate", move |p| { results.lock().unwrap().push(p.clone()); Ok(p) })
//!     .build()?;
//!
//! pipeline.run()?;
//! ```

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::execution::{DeliveryMode, ExecutionMode};
use crate::pipeline::{Pipeline, PipelineConfig, StageSpec};
use std::collections::HashSet;
use std::marker::PhantomData;

/// Marker: no stages added yet.
pub struct Empty;

/// Marker: the source is in place; transforms and the sink may follow.
pub struct HasSource;

/// Error type accepted from caller-supplied transforms.
type TransformError = Box<dyn std::error::Error + Send + Sync>;

/// A fluent builder for linear pipelines.
pub struct PipelineBuilder<State = Empty> {
    specs: Vec<StageSpec>,
    config: PipelineConfig,
    cancel: CancelToken,
    _state: PhantomData<State>,
}

impl Default for PipelineBuilder<Empty> {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder<Empty> {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    /// Create a builder with an explicit configuration.
    pub fn with_config(config: PipelineConfig) -> Self {
        Self {
            specs: Vec::new(),
            config,
            cancel: CancelToken::new(),
            _state: PhantomData,
        }
    }

    /// Add the source stage: the feed generates the run's input, the
    /// transform is applied to each generated payload like any other
    /// stage's. The run ends after the feed is exhausted and the resulting
    /// end-of-stream marker has drained through the chain.
    pub fn source<F, T>(
        mut self,
        name: impl Into<String>,
        feed: F,
        transform: T,
    ) -> PipelineBuilder<HasSource>
    where
        F: IntoIterator<Item = Vec<u8>>,
        F::IntoIter: Send + 'static,
        T: Fn(Vec<u8>) -> std::result::Result<Vec<u8>, TransformError> + Send + Sync + 'static,
    {
        self.specs.push(StageSpec {
            name: name.into(),
            feed: Some(Box::new(feed.into_iter())),
            transform: Box::new(transform),
        });
        PipelineBuilder {
            specs: self.specs,
            config: self.config,
            cancel: self.cancel,
            _state: PhantomData,
        }
    }
}

impl PipelineBuilder<HasSource> {
    /// Add an interior stage that consumes the previous stage's output.
    pub fn stage<T>(mut self, name: impl Into<String>, transform: T) -> Self
    where
        T: Fn(Vec<u8>) -> std::result::Result<Vec<u8>, TransformError> + Send + Sync + 'static,
    {
        self.specs.push(StageSpec {
            name: name.into(),
            feed: None,
            transform: Box::new(transform),
        });
        self
    }

    /// Add the terminal stage. Identical to [`Self::stage`] — whichever
    /// entry is last when `build` is called gets no output channel and its
    /// derived messages are the run's final observable output.
    pub fn sink<T>(self, name: impl Into<String>, transform: T) -> Self
    where
        T: Fn(Vec<u8>) -> std::result::Result<Vec<u8>, TransformError> + Send + Sync + 'static,
    {
        self.stage(name, transform)
    }

    /// Use an external cancellation token for the run.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate the pipeline and produce a runnable [`Pipeline`].
    ///
    /// Fails with [`Error::Topology`] before any channel or execution unit
    /// is created.
    pub fn build(self) -> Result<Pipeline> {
        let mut names = HashSet::new();
        for spec in &self.specs {
            if spec.name.is_empty() {
                return Err(Error::Topology("stage names must be non-empty".into()));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(Error::Topology(format!(
                    "duplicate stage name {:?}",
                    spec.name
                )));
            }
        }

        let config = &self.config;
        if config.channel.capacity == 0 {
            return Err(Error::Topology("channel capacity must be at least 1".into()));
        }
        if config.channel.max_message_size == 0 {
            return Err(Error::Topology(
                "channel max message size must be at least 1".into(),
            ));
        }
        if config.channel_prefix.is_empty() || config.channel_prefix.contains('/') {
            return Err(Error::Topology(format!(
                "channel prefix {:?} is not usable as a channel name",
                config.channel_prefix
            )));
        }
        if !config.mode.supports_transport(config.transport) {
            return Err(Error::Topology(
                "process execution units require the posix channel transport".into(),
            ));
        }
        if config.delivery == DeliveryMode::AtLeastOnce && config.mode == ExecutionMode::Processes
        {
            return Err(Error::Topology(
                "at-least-once delivery requires thread execution units".into(),
            ));
        }

        Ok(Pipeline::new(self.specs, self.config, self.cancel))
    }
}
