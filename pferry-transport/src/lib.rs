//! Message-passing seam between ranks.
//!
//! This crate provides:
//! - The `Transport` trait: rank-addressed, tagged, blocking send/receive.
//! - `ChannelMesh`/`ChannelEndpoint`: an in-process mesh of ranks backed by channels.
//! - `StreamPeer`: a point-to-point transport over any byte stream (TCP in practice).

use pferry_core::Rank;
use std::io::Error as IoError;
use std::time::Duration;
use thiserror::Error;

mod channel;
mod stream;

pub use channel::{ChannelEndpoint, ChannelMesh};
pub use stream::StreamPeer;

/// Message kinds exchanged during a ferry session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    /// Declared particle total, once per session.
    Total = 1,
    /// Number of records in the following payload.
    Count = 2,
    /// Raw record bytes.
    Payload = 3,
}

impl Tag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Tag::Total),
            2 => Some(Tag::Count),
            3 => Some(Tag::Payload),
            _ => None,
        }
    }
}

/// Error types that can occur while moving messages between ranks.
#[derive(Error, Debug)]
pub enum TransportError {
    /// An I/O error occurred on a stream transport.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// The peer rank went away before the exchange completed.
    #[error("rank {peer} disconnected")]
    Disconnected { peer: Rank },

    /// No message arrived from the peer within the configured timeout.
    #[error("timed out after {after:?} waiting for {tag:?} from rank {peer}")]
    Timeout { peer: Rank, tag: Tag, after: Duration },

    /// The next message from the peer carries a different tag than expected.
    #[error("expected {expected:?} message, received tag {found}")]
    UnexpectedTag { expected: Tag, found: u8 },

    /// The incoming message does not fit in the receive buffer.
    #[error("message of {len} bytes does not fit in a {capacity} byte buffer")]
    Truncated { capacity: usize, len: usize },

    /// A fixed-size message arrived with the wrong length.
    #[error("expected a {expected} byte message, received {len}")]
    BadLength { expected: usize, len: usize },

    /// The rank is not reachable through this transport.
    #[error("unknown rank {0}")]
    UnknownRank(Rank),
}

/// Blocking, rank-addressed message transport.
///
/// Messages between one ordered pair of ranks are delivered in send order.
/// Receives name the tag they expect; a message with any other tag is an
/// error rather than being skipped.
pub trait Transport {
    /// Rank of the local endpoint.
    fn rank(&self) -> Rank;

    /// Number of ranks reachable through this transport, including the local one.
    fn size(&self) -> u32;

    /// Sends `data` to rank `to`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the peer is unknown or gone, or the
    /// underlying stream fails.
    fn send(&mut self, to: Rank, tag: Tag, data: &[u8]) -> Result<(), TransportError>;

    /// Blocks until the next message from rank `from` arrives and copies it
    /// into `buf`, returning its length.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` on tag mismatch, when the message is larger
    /// than `buf`, on timeout, or if the peer is gone. A message rejected
    /// for its tag or length is still consumed.
    fn recv_into(&mut self, from: Rank, tag: Tag, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn send_u32(&mut self, to: Rank, tag: Tag, value: u32) -> Result<(), TransportError> {
        self.send(to, tag, &value.to_ne_bytes())
    }

    fn recv_u32(&mut self, from: Rank, tag: Tag) -> Result<u32, TransportError> {
        let mut bytes = [0u8; 4];
        let len = self.recv_into(from, tag, &mut bytes)?;
        if len != bytes.len() {
            return Err(TransportError::BadLength { expected: bytes.len(), len });
        }
        Ok(u32::from_ne_bytes(bytes))
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn rank(&self) -> Rank {
        (**self).rank()
    }

    fn size(&self) -> u32 {
        (**self).size()
    }

    fn send(&mut self, to: Rank, tag: Tag, data: &[u8]) -> Result<(), TransportError> {
        (**self).send(to, tag, data)
    }

    fn recv_into(&mut self, from: Rank, tag: Tag, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).recv_into(from, tag, buf)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn rank(&self) -> Rank {
        (**self).rank()
    }

    fn size(&self) -> u32 {
        (**self).size()
    }

    fn send(&mut self, to: Rank, tag: Tag, data: &[u8]) -> Result<(), TransportError> {
        (**self).send(to, tag, data)
    }

    fn recv_into(&mut self, from: Rank, tag: Tag, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).recv_into(from, tag, buf)
    }
}
