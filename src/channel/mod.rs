//! Bounded, named channels connecting adjacent pipeline stages.
//!
//! A channel is a fixed-capacity FIFO byte-message queue with exactly one
//! producer stage and one consumer stage. `send` blocks while the channel is
//! full and `recv` blocks while it is empty; that blocking is the pipeline's
//! only backpressure mechanism.
//!
//! Two transports implement the same contract:
//!
//! - [`TransportKind::Memory`] — kanal-backed in-process queue; thread
//!   execution units only.
//! - [`TransportKind::Posix`] — kernel POSIX message queue; survives `fork`,
//!   required for process execution units.
//!
//! Channels are created once per run by the [`ChannelRegistry`] and destroyed
//! when the run ends. Creating a name that already exists is an error; the
//! assembler clears stale names first, which doubles as the recovery path
//! after an unclean shutdown.

mod memory;
mod posix;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::message::Message;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Poll interval used while blocked on a full or empty channel.
pub(crate) const SUSPEND_POLL: Duration = Duration::from_millis(1);

/// Capacity and message-size limits, applied uniformly to every channel in
/// a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Maximum number of enqueued-but-not-dequeued messages.
    pub capacity: usize,
    /// Maximum payload size in bytes.
    pub max_message_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            max_message_size: 1024,
        }
    }
}

/// Which backing a run's channels use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// In-process queue. Lowest overhead; thread units only.
    #[default]
    Memory,
    /// Kernel POSIX message queue. Required for process units.
    Posix,
}

enum Backend {
    Memory(memory::MemoryQueue),
    Posix(posix::PosixQueue),
}

/// One bounded FIFO queue between a producer stage and a consumer stage.
///
/// Handed out as `Arc<Channel>`; a relaunched execution unit is rebound to
/// the same channel, so in-flight queue contents survive a stage crash.
pub struct Channel {
    name: String,
    config: ChannelConfig,
    backend: Backend,
}

impl Channel {
    /// Channel name, unique within a run.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The limits this channel was created with.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Enqueue a message, blocking while the channel is full.
    ///
    /// Payloads over the configured maximum fail with
    /// [`Error::MessageTooLarge`]; nothing is enqueued. The cancellation
    /// token is observed while blocked.
    pub fn send(&self, message: Message, cancel: &CancelToken) -> Result<()> {
        let frame = message.encode(self.config.max_message_size)?;
        match &self.backend {
            Backend::Memory(q) => q.send(&self.name, frame, cancel),
            Backend::Posix(q) => q.send(&self.name, &frame, cancel),
        }
    }

    /// Dequeue the oldest message, blocking while the channel is empty.
    pub fn recv(&self, cancel: &CancelToken) -> Result<Message> {
        let frame = match &self.backend {
            Backend::Memory(q) => q.recv(&self.name, cancel)?,
            Backend::Posix(q) => q.recv(&self.name, cancel)?,
        };
        Message::decode(&frame)
    }

    /// Number of messages currently enqueued.
    pub fn len(&self) -> Result<usize> {
        match &self.backend {
            Backend::Memory(q) => Ok(q.len()),
            Backend::Posix(q) => q.len(&self.name),
        }
    }

    /// Check whether the channel is currently empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Owner of a run's channel namespace.
///
/// The registry is held by the pipeline (never a global) and is the only
/// component that creates or destroys channels.
pub struct ChannelRegistry {
    transport: TransportKind,
    channels: HashMap<String, Arc<Channel>>,
}

impl ChannelRegistry {
    /// Create an empty registry for the given transport.
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            channels: HashMap::new(),
        }
    }

    /// The transport this registry creates channels on.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Remove any leftover channel of this name from a previous run.
    ///
    /// A no-op when nothing is leftover; for the posix transport this
    /// unlinks the kernel name.
    pub fn clear_stale(&mut self, name: &str) -> Result<()> {
        self.channels.remove(name);
        match self.transport {
            TransportKind::Memory => Ok(()),
            TransportKind::Posix => posix::PosixQueue::unlink(name),
        }
    }

    /// Create a fresh channel. Fails with [`Error::ChannelAlreadyExists`]
    /// if the name is taken.
    pub fn create(&mut self, name: &str, config: ChannelConfig) -> Result<Arc<Channel>> {
        if self.channels.contains_key(name) {
            return Err(Error::ChannelAlreadyExists(name.to_string()));
        }

        let backend = match self.transport {
            TransportKind::Memory => Backend::Memory(memory::MemoryQueue::new(config.capacity)),
            TransportKind::Posix => Backend::Posix(posix::PosixQueue::create(name, &config)?),
        };

        let channel = Arc::new(Channel {
            name: name.to_string(),
            config,
            backend,
        });
        tracing::debug!(channel = name, ?config, "channel created");
        self.channels.insert(name.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Look up a channel by name.
    pub fn get(&self, name: &str) -> Result<Arc<Channel>> {
        self.channels
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ChannelNotFound(name.to_string()))
    }

    /// Destroy one channel. Destroying a name that does not exist is a
    /// no-op.
    pub fn destroy(&mut self, name: &str) -> Result<()> {
        let existed = self.channels.remove(name).is_some();
        if existed {
            tracing::debug!(channel = name, "channel destroyed");
        }
        match self.transport {
            TransportKind::Memory => Ok(()),
            TransportKind::Posix => posix::PosixQueue::unlink(name),
        }
    }

    /// Destroy every channel this registry created.
    pub fn destroy_all(&mut self) {
        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.destroy(&name) {
                tracing::warn!(channel = %name, error = %e, "failed to destroy channel");
            }
        }
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
