//! Pipeline assembly and the run lifecycle.
//!
//! The pipeline is the composition root: it owns the run configuration,
//! turns the ordered stage specifications into channel-bound stages, and
//! drives a run to completion under the supervisor. No other component
//! creates or destroys channels.

mod builder;

pub use builder::{Empty, HasSource, PipelineBuilder};

use crate::cancel::CancelToken;
use crate::channel::{ChannelConfig, ChannelRegistry, TransportKind};
use crate::error::Result;
use crate::execution::{
    DeliveryMode, ExecutionMode, RestartPolicy, SupervisionReport, Supervisor,
};
use crate::stage::{Feed, Stage, Transform};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for one pipeline run.
#[derive(Debug)]
pub struct PipelineConfig {
    /// Limits applied uniformly to every channel in the run.
    pub channel: ChannelConfig,
    /// Prefix for generated channel names (`{prefix}-0`, `{prefix}-1`, ...).
    /// On the posix transport these become kernel-wide names, so concurrent
    /// runs need distinct prefixes.
    pub channel_prefix: String,
    /// Channel backing for the run.
    pub transport: TransportKind,
    /// How stage execution units are hosted.
    pub mode: ExecutionMode,
    /// What happens to in-flight messages when a unit dies.
    pub delivery: DeliveryMode,
    /// Relaunch budget and backoff for crashed stages.
    pub restart: RestartPolicy,
    /// Supervisor exit-observation interval.
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            channel_prefix: "foreman".into(),
            transport: TransportKind::default(),
            mode: ExecutionMode::default(),
            delivery: DeliveryMode::default(),
            restart: RestartPolicy::default(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// One ordered entry of the pipeline: a name, a transform, and (for the
/// source only) the feed that generates the run's input.
pub(crate) struct StageSpec {
    pub(crate) name: String,
    pub(crate) feed: Option<Feed>,
    pub(crate) transform: Transform,
}

/// A validated, ready-to-run linear pipeline.
///
/// Built by [`PipelineBuilder`]; validation happens before any channel or
/// execution unit exists, so a rejected pipeline leaves nothing behind.
pub struct Pipeline {
    specs: Vec<StageSpec>,
    config: PipelineConfig,
    cancel: CancelToken,
}

impl Pipeline {
    pub(crate) fn new(specs: Vec<StageSpec>, config: PipelineConfig, cancel: CancelToken) -> Self {
        Self {
            specs,
            config,
            cancel,
        }
    }

    /// Start building a pipeline.
    pub fn builder() -> PipelineBuilder<Empty> {
        PipelineBuilder::new()
    }

    /// Number of stages in the chain.
    pub fn stage_count(&self) -> usize {
        self.specs.len()
    }

    /// Token that cancels this run from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the pipeline to completion.
    ///
    /// Clears stale channels from a previous unclean shutdown, creates the
    /// run's channels, hands the bound stages to the supervisor, and
    /// destroys every channel on the way out — on success and on failure
    /// alike. Returns once all stages have completed successfully.
    pub fn run(self) -> Result<SupervisionReport> {
        let stage_count = self.specs.len();
        let mut registry = ChannelRegistry::new(self.config.transport);

        // N stages, N-1 connecting channels. Stale names are cleared first;
        // the registry's Drop cleans up whatever was created if any step
        // below fails.
        let mut channels = Vec::with_capacity(stage_count.saturating_sub(1));
        for index in 0..stage_count.saturating_sub(1) {
            let name = format!("{}-{}", self.config.channel_prefix, index);
            registry.clear_stale(&name)?;
            channels.push(registry.create(&name, self.config.channel)?);
        }

        let stages: Vec<Arc<Stage>> = self
            .specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                let input = (index > 0).then(|| Arc::clone(&channels[index - 1]));
                let output = (index < stage_count - 1).then(|| Arc::clone(&channels[index]));
                Arc::new(Stage::new(
                    spec.name,
                    spec.feed,
                    spec.transform,
                    input,
                    output,
                    self.config.delivery,
                    self.cancel.clone(),
                ))
            })
            .collect();

        tracing::info!(
            stages = stage_count,
            mode = ?self.config.mode,
            transport = ?self.config.transport,
            "pipeline run starting"
        );

        let supervisor = Supervisor::new(self.config.mode)
            .with_restart_policy(self.config.restart)
            .with_poll_interval(self.config.poll_interval)
            .with_cancel_token(self.cancel.clone());

        let result = supervisor.supervise(&stages);
        registry.destroy_all();

        match &result {
            Ok(_) => tracing::info!("pipeline run completed"),
            Err(e) => tracing::warn!(error = %e, "pipeline run failed"),
        }
        result
    }
}
