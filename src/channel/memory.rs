//! In-memory channel transport built on kanal.
//!
//! Valid for thread execution units only: the queue lives in the process
//! address space, so it does not survive a `fork` boundary. The registry
//! enforces single-creation semantics; this type only moves frames.

use crate::cancel::CancelToken;
use crate::channel::SUSPEND_POLL;
use crate::error::{Error, Result};

/// Bounded in-process frame queue.
///
/// Holds both halves of a kanal channel so the queue stays open for the
/// whole run; termination is signalled by the end-of-stream message, not by
/// dropping a sender.
pub(crate) struct MemoryQueue {
    tx: kanal::Sender<Vec<u8>>,
    rx: kanal::Receiver<Vec<u8>>,
}

impl MemoryQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = kanal::bounded(capacity);
        Self { tx, rx }
    }

    /// Enqueue a frame, blocking while the queue is full.
    ///
    /// Blocking is a bounded poll so the cancellation token is observed at
    /// the suspension point.
    pub(crate) fn send(&self, name: &str, frame: Vec<u8>, cancel: &CancelToken) -> Result<()> {
        loop {
            match self.tx.try_send(frame.clone()) {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    std::thread::sleep(SUSPEND_POLL);
                }
                Err(_) => return Err(Error::ChannelClosed(name.to_string())),
            }
        }
    }

    /// Dequeue a frame, blocking while the queue is empty.
    pub(crate) fn recv(&self, name: &str, cancel: &CancelToken) -> Result<Vec<u8>> {
        loop {
            match self.rx.try_recv() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    std::thread::sleep(SUSPEND_POLL);
                }
                Err(_) => return Err(Error::ChannelClosed(name.to_string())),
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }
}
