//! POSIX message queue transport.
//!
//! Channels on this transport are kernel objects named `/{channel-name}`,
//! shared by descriptor across `fork`, which makes it the only transport
//! valid for process execution units. Creation uses `O_EXCL` so a stale
//! queue from an unclean shutdown surfaces as [`Error::ChannelAlreadyExists`]
//! instead of silently reusing old contents; the assembler unlinks stale
//! names before creating fresh ones.
//!
//! Queues are opened non-blocking and both operations poll at a bounded
//! interval, so the cancellation token is observed while a queue is full or
//! empty.

use crate::cancel::CancelToken;
use crate::channel::{ChannelConfig, SUSPEND_POLL};
use crate::error::{Error, Result};
use crate::message::Message;
use nix::errno::Errno;
use nix::mqueue::{
    mq_attr_member_t, mq_close, mq_getattr, mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag,
    MqAttr, MqdT,
};
use nix::sys::stat::Mode;
use std::ffi::CString;

/// Bounded kernel frame queue.
#[derive(Debug)]
pub(crate) struct PosixQueue {
    kernel_name: CString,
    mqd: Option<MqdT>,
    frame_size: usize,
}

/// Kernel name for a channel: a single leading slash plus the channel name.
fn kernel_name(name: &str) -> Result<CString> {
    if name.is_empty() || name.contains('/') || name.len() > 250 {
        return Err(Error::Topology(format!(
            "channel name {name:?} is not usable as a POSIX queue name"
        )));
    }
    CString::new(format!("/{name}"))
        .map_err(|_| Error::Topology(format!("channel name {name:?} contains a NUL byte")))
}

impl PosixQueue {
    /// Create the kernel queue, failing if one of this name already exists.
    pub(crate) fn create(name: &str, config: &ChannelConfig) -> Result<Self> {
        let kernel_name = kernel_name(name)?;
        let frame_size = Message::frame_size(config.max_message_size);
        let attr = MqAttr::new(
            0,
            config.capacity as mq_attr_member_t,
            frame_size as mq_attr_member_t,
            0,
        );

        let oflag = MQ_OFlag::O_RDWR | MQ_OFlag::O_CREAT | MQ_OFlag::O_EXCL | MQ_OFlag::O_NONBLOCK;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let mqd = match mq_open(kernel_name.as_c_str(), oflag, mode, Some(&attr)) {
            Ok(mqd) => mqd,
            Err(Errno::EEXIST) => return Err(Error::ChannelAlreadyExists(name.to_string())),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            kernel_name,
            mqd: Some(mqd),
            frame_size,
        })
    }

    /// Remove the kernel name. Missing names are a no-op, which makes this
    /// safe to call before creation and after an unclean shutdown.
    pub(crate) fn unlink(name: &str) -> Result<()> {
        match mq_unlink(kernel_name(name)?.as_c_str()) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn descriptor(&self, name: &str) -> Result<&MqdT> {
        self.mqd
            .as_ref()
            .ok_or_else(|| Error::ChannelClosed(name.to_string()))
    }

    /// Enqueue a frame, polling while the queue is full.
    pub(crate) fn send(&self, name: &str, frame: &[u8], cancel: &CancelToken) -> Result<()> {
        let mqd = self.descriptor(name)?;
        loop {
            match mq_send(mqd, frame, 0) {
                Ok(()) => return Ok(()),
                Err(Errno::EAGAIN) => {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    std::thread::sleep(SUSPEND_POLL);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EMSGSIZE) => {
                    return Err(Error::MessageTooLarge {
                        size: frame.len(),
                        limit: self.frame_size,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Dequeue a frame, polling while the queue is empty.
    pub(crate) fn recv(&self, name: &str, cancel: &CancelToken) -> Result<Vec<u8>> {
        let mqd = self.descriptor(name)?;
        let mut buf = vec![0u8; self.frame_size];
        let mut priority = 0u32;
        loop {
            match mq_receive(mqd, &mut buf, &mut priority) {
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(Errno::EAGAIN) => {
                    if cancel.is_cancelled() {
                        return Err(Error::Cancelled);
                    }
                    std::thread::sleep(SUSPEND_POLL);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Messages currently enqueued, from the kernel's attributes.
    pub(crate) fn len(&self, name: &str) -> Result<usize> {
        let attr = mq_getattr(self.descriptor(name)?)?;
        Ok(attr.curmsgs() as usize)
    }
}

impl Drop for PosixQueue {
    fn drop(&mut self) {
        if let Some(mqd) = self.mqd.take() {
            let _ = mq_close(mqd);
        }
    }
}
