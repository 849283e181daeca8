//! Messages passed between pipeline stages.
//!
//! A message is either a unit of work (`Data`) or the explicit end-of-stream
//! marker that tells a stage no further input will follow. The marker is a
//! first-class variant rather than a magic payload value, so stages never have
//! to sniff message contents to decide when to stop.
//!
//! Messages cross channel boundaries as tagged frames: a one-byte tag followed
//! by the payload. The codec is shared by both channel transports.

use crate::error::{Error, Result};

/// Frame tag for a data message.
const TAG_DATA: u8 = 0;
/// Frame tag for the end-of-stream marker.
const TAG_EOS: u8 = 1;

/// A unit of work flowing through the pipeline.
///
/// Ownership transfers fully from producer to channel to consumer; a message
/// is never shared between stages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// An opaque byte payload produced by one stage for the next.
    Data(Vec<u8>),

    /// No more input will follow this message.
    ///
    /// Every stage forwards the marker downstream before exiting, so the
    /// whole chain drains and terminates in order.
    EndOfStream,
}

impl Message {
    /// Create a data message from anything byte-like.
    pub fn data(payload: impl Into<Vec<u8>>) -> Self {
        Self::Data(payload.into())
    }

    /// Check whether this is the end-of-stream marker.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// Payload length in bytes (zero for the marker).
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Data(p) => p.len(),
            Self::EndOfStream => 0,
        }
    }

    /// Encode into a tagged frame for transport.
    ///
    /// Fails with [`Error::MessageTooLarge`] if the payload exceeds
    /// `max_payload`.
    pub fn encode(&self, max_payload: usize) -> Result<Vec<u8>> {
        match self {
            Self::Data(payload) => {
                if payload.len() > max_payload {
                    return Err(Error::MessageTooLarge {
                        size: payload.len(),
                        limit: max_payload,
                    });
                }
                let mut frame = Vec::with_capacity(1 + payload.len());
                frame.push(TAG_DATA);
                frame.extend_from_slice(payload);
                Ok(frame)
            }
            Self::EndOfStream => Ok(vec![TAG_EOS]),
        }
    }

    /// Decode a tagged frame received from a channel.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        match frame.split_first() {
            Some((&TAG_DATA, payload)) => Ok(Self::Data(payload.to_vec())),
            Some((&TAG_EOS, rest)) if rest.is_empty() => Ok(Self::EndOfStream),
            Some((&TAG_EOS, _)) => Err(Error::MalformedFrame(
                "end-of-stream frame carries a payload".into(),
            )),
            Some((&tag, _)) => Err(Error::MalformedFrame(format!("unknown frame tag {tag}"))),
            None => Err(Error::MalformedFrame("empty frame".into())),
        }
    }

    /// Size in bytes of the encoded frame for a payload of `max_payload`
    /// bytes. Channel transports size their slots with this.
    pub const fn frame_size(max_payload: usize) -> usize {
        max_payload + 1
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Self::Data(payload)
    }
}

impl From<&str> for Message {
    fn from(payload: &str) -> Self {
        Self::Data(payload.as_bytes().to_vec())
    }
}
