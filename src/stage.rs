//! Pipeline stages and the stage runner.
//!
//! A stage wraps a caller-supplied transform between an optional input
//! channel and an optional output channel. The runner is the loop hosted by
//! an execution unit: receive one message (or pull the source feed), apply
//! the transform, forward the derived message, and exit cleanly after
//! processing the end-of-stream marker. Expected termination is a
//! [`RunResult`] value; errors are reserved for actual faults.

use crate::cancel::CancelToken;
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::execution::DeliveryMode;
use crate::message::Message;
use std::sync::{Arc, Mutex, PoisonError};

/// A caller-supplied per-stage transformation.
///
/// Pure with respect to pipeline state: side effects such as logging or
/// collecting sink output are allowed, but must not touch channels.
pub type Transform =
    Box<dyn Fn(Vec<u8>) -> std::result::Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// Generator of source payloads. Exhaustion ends the run: the source emits
/// the end-of-stream marker and exits.
pub type Feed = Box<dyn Iterator<Item = Vec<u8>> + Send>;

/// Terminal status of one stage generation.
#[derive(Debug)]
pub enum RunResult {
    /// The stage processed the end-of-stream marker and exited cleanly.
    Succeeded,
    /// The stage aborted on a fault; the supervisor decides whether to
    /// relaunch.
    Failed(Error),
}

impl RunResult {
    /// Check for clean completion.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One pipeline step: channels, transform, and restart bookkeeping.
///
/// The supervisor shares a stage across generations via `Arc`; a relaunched
/// execution unit runs against the same channel bindings, the same feed
/// position, and the same checkpoint slot.
pub struct Stage {
    name: String,
    feed: Option<Mutex<Feed>>,
    transform: Transform,
    input: Option<Arc<Channel>>,
    output: Option<Arc<Channel>>,
    /// In-flight message slot for redelivery after a crash. Always used for
    /// the end-of-stream marker; used for data only under
    /// [`DeliveryMode::AtLeastOnce`].
    checkpoint: Mutex<Option<Message>>,
    delivery: DeliveryMode,
    cancel: CancelToken,
}

impl Stage {
    pub(crate) fn new(
        name: impl Into<String>,
        feed: Option<Feed>,
        transform: Transform,
        input: Option<Arc<Channel>>,
        output: Option<Arc<Channel>>,
        delivery: DeliveryMode,
        cancel: CancelToken,
    ) -> Self {
        Self {
            name: name.into(),
            feed: feed.map(Mutex::new),
            transform,
            input,
            output,
            checkpoint: Mutex::new(None),
            delivery,
            cancel,
        }
    }

    /// Stage name, unique within a run.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this stage generates its own input.
    pub fn is_source(&self) -> bool {
        self.input.is_none()
    }

    /// Whether this stage has no downstream channel.
    pub fn is_sink(&self) -> bool {
        self.output.is_none()
    }

    /// Run one generation of this stage to a terminal status.
    ///
    /// Hosted by an execution unit; never panics on expected conditions and
    /// never uses the error path for normal termination.
    pub fn run(&self) -> RunResult {
        tracing::debug!(stage = %self.name, "stage running");
        match self.run_loop() {
            Ok(()) => {
                tracing::debug!(stage = %self.name, "stage finished input");
                RunResult::Succeeded
            }
            Err(e) => {
                tracing::debug!(stage = %self.name, error = %e, "stage failed");
                RunResult::Failed(e)
            }
        }
    }

    fn run_loop(&self) -> Result<()> {
        // A previous generation may have died between dequeueing a message
        // and forwarding it; redeliver before touching the channel again.
        if let Some(message) = self.take_checkpoint() {
            tracing::debug!(stage = %self.name, "redelivering checkpointed message");
            if self.process(message)? {
                return Ok(());
            }
        }

        loop {
            let message = self.next_message()?;
            if self.process(message)? {
                return Ok(());
            }
        }
    }

    /// Obtain the next unit of work: the input channel for interior stages,
    /// the feed for the source. An exhausted feed becomes the end-of-stream
    /// marker.
    fn next_message(&self) -> Result<Message> {
        match (&self.input, &self.feed) {
            (Some(channel), _) => channel.recv(&self.cancel),
            (None, Some(feed)) => {
                let mut feed = feed.lock().unwrap_or_else(PoisonError::into_inner);
                Ok(match feed.next() {
                    Some(payload) => Message::Data(payload),
                    None => Message::EndOfStream,
                })
            }
            (None, None) => Err(Error::Topology(format!(
                "stage {:?} has neither an input channel nor a feed",
                self.name
            ))),
        }
    }

    /// Process one message. Returns `true` when the stage should exit
    /// (the message was the end-of-stream marker, now fully forwarded).
    fn process(&self, message: Message) -> Result<bool> {
        let is_eos = message.is_end_of_stream();
        if is_eos || self.delivery == DeliveryMode::AtLeastOnce {
            self.store_checkpoint(message.clone());
        }

        match message {
            Message::Data(payload) => {
                let derived = (self.transform)(payload).map_err(|e| Error::Transform {
                    stage: self.name.clone(),
                    reason: e.to_string(),
                })?;
                if let Some(output) = &self.output {
                    output.send(Message::Data(derived), &self.cancel)?;
                }
                // Sink stages: the derived message is the run's final
                // observable output, owned by the transform.
            }
            Message::EndOfStream => {
                if let Some(output) = &self.output {
                    output.send(Message::EndOfStream, &self.cancel)?;
                }
            }
        }

        self.clear_checkpoint();
        Ok(is_eos)
    }

    fn take_checkpoint(&self) -> Option<Message> {
        self.checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn store_checkpoint(&self, message: Message) {
        *self
            .checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    fn clear_checkpoint(&self) {
        self.checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, ChannelRegistry, TransportKind};

    fn identity() -> Transform {
        Box::new(|payload| Ok(payload))
    }

    fn channel(reg: &mut ChannelRegistry, name: &str) -> Arc<Channel> {
        reg.create(name, ChannelConfig::default()).unwrap()
    }

    #[test]
    fn test_source_drains_feed_and_emits_eos() {
        let mut reg = ChannelRegistry::new(TransportKind::Memory);
        let out = channel(&mut reg, "out");
        let cancel = CancelToken::new();

        let feed: Feed = Box::new(vec![b"a".to_vec(), b"b".to_vec()].into_iter());
        let stage = Stage::new(
            "source",
            Some(feed),
            identity(),
            None,
            Some(out.clone()),
            DeliveryMode::AtMostOnce,
            cancel.clone(),
        );

        assert!(stage.run().is_success());
        assert_eq!(out.recv(&cancel).unwrap(), Message::data(b"a".to_vec()));
        assert_eq!(out.recv(&cancel).unwrap(), Message::data(b"b".to_vec()));
        assert!(out.recv(&cancel).unwrap().is_end_of_stream());
    }

    #[test]
    fn test_interior_stage_transforms_and_forwards_eos() {
        let mut reg = ChannelRegistry::new(TransportKind::Memory);
        let input = channel(&mut reg, "in");
        let output = channel(&mut reg, "out");
        let cancel = CancelToken::new();

        input.send(Message::data(b"ab".to_vec()), &cancel).unwrap();
        input.send(Message::EndOfStream, &cancel).unwrap();

        let upper: Transform = Box::new(|p| Ok(p.to_ascii_uppercase()));
        let stage = Stage::new(
            "upper",
            None,
            upper,
            Some(input),
            Some(output.clone()),
            DeliveryMode::AtMostOnce,
            cancel.clone(),
        );

        assert!(stage.run().is_success());
        assert_eq!(output.recv(&cancel).unwrap(), Message::data(b"AB".to_vec()));
        assert!(output.recv(&cancel).unwrap().is_end_of_stream());
    }

    #[test]
    fn test_transform_error_fails_the_stage() {
        let mut reg = ChannelRegistry::new(TransportKind::Memory);
        let input = channel(&mut reg, "in");
        let cancel = CancelToken::new();

        input.send(Message::data(b"x".to_vec()), &cancel).unwrap();

        let failing: Transform = Box::new(|_| Err("boom".into()));
        let stage = Stage::new(
            "failing",
            None,
            failing,
            Some(input),
            None,
            DeliveryMode::AtMostOnce,
            cancel,
        );

        match stage.run() {
            RunResult::Failed(Error::Transform { stage, reason }) => {
                assert_eq!(stage, "failing");
                assert!(reason.contains("boom"));
            }
            other => panic!("expected Transform failure, got {other:?}"),
        }
    }

    #[test]
    fn test_checkpoint_redelivered_before_channel_input() {
        let mut reg = ChannelRegistry::new(TransportKind::Memory);
        let input = channel(&mut reg, "in");
        let output = channel(&mut reg, "out");
        let cancel = CancelToken::new();

        input.send(Message::EndOfStream, &cancel).unwrap();

        let stage = Stage::new(
            "resumed",
            None,
            identity(),
            Some(input),
            Some(output.clone()),
            DeliveryMode::AtLeastOnce,
            cancel.clone(),
        );
        // Simulate a predecessor generation that died after dequeueing.
        stage.store_checkpoint(Message::data(b"inflight".to_vec()));

        assert!(stage.run().is_success());
        assert_eq!(
            output.recv(&cancel).unwrap(),
            Message::data(b"inflight".to_vec())
        );
        assert!(output.recv(&cancel).unwrap().is_end_of_stream());
    }

    #[test]
    fn test_oversized_forward_fails_without_stale_checkpoint() {
        let mut reg = ChannelRegistry::new(TransportKind::Memory);
        let input = channel(&mut reg, "in");
        let output = reg
            .create(
                "out",
                ChannelConfig {
                    capacity: 1,
                    max_message_size: 4,
                },
            )
            .unwrap();
        let cancel = CancelToken::new();

        input.send(Message::data(b"big!!".to_vec()), &cancel).unwrap();

        let stage = Stage::new(
            "tight",
            None,
            identity(),
            Some(input.clone()),
            Some(output),
            DeliveryMode::AtMostOnce,
            cancel,
        );

        // Payload exceeds the output's limit, so forwarding fails and, under
        // at-most-once, the message is gone but the stage reported the fault.
        match stage.run() {
            RunResult::Failed(Error::MessageTooLarge { .. }) => {}
            other => panic!("expected MessageTooLarge failure, got {other:?}"),
        }
        assert!(stage.take_checkpoint().is_none());
    }

    #[test]
    fn test_eos_checkpointed_when_forward_is_interrupted() {
        let mut reg = ChannelRegistry::new(TransportKind::Memory);
        let input = channel(&mut reg, "in");
        let output = reg
            .create(
                "out",
                ChannelConfig {
                    capacity: 1,
                    max_message_size: 16,
                },
            )
            .unwrap();
        let cancel = CancelToken::new();

        // Fill the output so forwarding the marker blocks, then cancel.
        output.send(Message::data(b"full".to_vec()), &cancel).unwrap();
        input.send(Message::EndOfStream, &cancel).unwrap();

        let stage = Arc::new(Stage::new(
            "interrupted",
            None,
            identity(),
            Some(input),
            Some(output),
            DeliveryMode::AtMostOnce,
            cancel.clone(),
        ));

        let runner = {
            let stage = Arc::clone(&stage);
            std::thread::spawn(move || stage.run())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        cancel.cancel();

        match runner.join().unwrap() {
            RunResult::Failed(Error::Cancelled) => {}
            other => panic!("expected Cancelled failure, got {other:?}"),
        }
        // The marker stays checkpointed, so a relaunch redelivers it and the
        // run can still terminate even under at-most-once delivery.
        assert_eq!(stage.take_checkpoint(), Some(Message::EndOfStream));
    }
}
