//! In-process rank mesh backed by `crossbeam-channel`.
//!
//! Every ordered pair of ranks gets its own channel, so messages from one
//! peer never queue behind another peer's. Each endpoint is meant to be
//! moved onto its own thread.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::trace;
use pferry_core::Rank;
use std::time::Duration;

use super::{Tag, Transport, TransportError};

struct Envelope {
    tag: Tag,
    data: Vec<u8>,
}

/// Factory for a fully connected set of channel endpoints.
pub struct ChannelMesh;

impl ChannelMesh {
    /// Creates `size` endpoints joined by unbounded channels. Sends never
    /// block; receives block until a matching message arrives.
    pub fn connect(size: u32) -> Vec<ChannelEndpoint> {
        Self::connect_bounded(size, None)
    }

    /// Creates `size` endpoints whose channels hold at most `capacity`
    /// messages. `Some(0)` makes every send a rendezvous with its receive.
    pub fn connect_bounded(size: u32, capacity: Option<usize>) -> Vec<ChannelEndpoint> {
        let n = size as usize;
        let mut outboxes: Vec<Vec<Sender<Envelope>>> = (0..n).map(|_| Vec::with_capacity(n)).collect();
        let mut inboxes: Vec<Vec<Receiver<Envelope>>> = (0..n).map(|_| Vec::with_capacity(n)).collect();

        // outboxes[from][to] pairs with inboxes[to][from]
        for from in 0..n {
            for to in 0..n {
                let (tx, rx) = match capacity {
                    Some(cap) => bounded(cap),
                    None => unbounded(),
                };
                outboxes[from].push(tx);
                inboxes[to].push(rx);
            }
        }

        outboxes
            .into_iter()
            .zip(inboxes)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| ChannelEndpoint {
                rank: rank as Rank,
                outboxes,
                inboxes,
                timeout: None,
            })
            .collect()
    }
}

/// One rank's view of a `ChannelMesh`.
pub struct ChannelEndpoint {
    rank: Rank,
    outboxes: Vec<Sender<Envelope>>,
    inboxes: Vec<Receiver<Envelope>>,
    timeout: Option<Duration>,
}

impl ChannelEndpoint {
    /// Bounds how long a receive waits before failing with `Timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Transport for ChannelEndpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.outboxes.len() as u32
    }

    fn send(&mut self, to: Rank, tag: Tag, data: &[u8]) -> Result<(), TransportError> {
        let outbox = self.outboxes.get(to as usize).ok_or(TransportError::UnknownRank(to))?;
        trace!("rank {} -> {}: {:?} ({} bytes)", self.rank, to, tag, data.len());
        outbox
            .send(Envelope { tag, data: data.to_vec() })
            .map_err(|_| TransportError::Disconnected { peer: to })
    }

    fn recv_into(&mut self, from: Rank, tag: Tag, buf: &mut [u8]) -> Result<usize, TransportError> {
        let inbox = self.inboxes.get(from as usize).ok_or(TransportError::UnknownRank(from))?;
        let envelope = match self.timeout {
            Some(after) => inbox.recv_timeout(after).map_err(|e| match e {
                RecvTimeoutError::Timeout => TransportError::Timeout { peer: from, tag, after },
                RecvTimeoutError::Disconnected => TransportError::Disconnected { peer: from },
            })?,
            None => inbox.recv().map_err(|_| TransportError::Disconnected { peer: from })?,
        };

        if envelope.tag != tag {
            return Err(TransportError::UnexpectedTag { expected: tag, found: envelope.tag as u8 });
        }
        let len = envelope.data.len();
        if len > buf.len() {
            return Err(TransportError::Truncated { capacity: buf.len(), len });
        }
        buf[..len].copy_from_slice(&envelope.data);
        trace!("rank {} <- {}: {:?} ({} bytes)", self.rank, from, tag, len);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pair() -> (ChannelEndpoint, ChannelEndpoint) {
        let mut mesh = ChannelMesh::connect(2);
        let b = mesh.pop().unwrap();
        let a = mesh.pop().unwrap();
        (a, b)
    }

    #[test]
    fn messages_arrive_in_send_order() {
        let (mut a, mut b) = pair();
        assert_eq!((a.rank(), b.rank(), a.size()), (0, 1, 2));
        for i in 0..5u8 {
            a.send(1, Tag::Payload, &[i; 3]).unwrap();
        }
        let mut buf = [0u8; 8];
        for i in 0..5u8 {
            let n = b.recv_into(0, Tag::Payload, &mut buf).unwrap();
            assert_eq!(&buf[..n], &[i; 3]);
        }
    }

    #[test]
    fn peers_are_independent() {
        let mut mesh = ChannelMesh::connect(3);
        let mut c = mesh.pop().unwrap();
        let mut b = mesh.pop().unwrap();
        let mut a = mesh.pop().unwrap();
        a.send(2, Tag::Count, &[1]).unwrap();
        b.send(2, Tag::Count, &[2]).unwrap();
        let mut buf = [0u8; 1];
        c.recv_into(1, Tag::Count, &mut buf).unwrap();
        assert_eq!(buf[0], 2);
        c.recv_into(0, Tag::Count, &mut buf).unwrap();
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn tag_mismatch_and_truncation_are_errors() {
        let (mut a, mut b) = pair();
        a.send(1, Tag::Count, &[0; 4]).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            b.recv_into(0, Tag::Payload, &mut buf),
            Err(TransportError::UnexpectedTag { expected: Tag::Payload, found: 2 })
        ));
        a.send(1, Tag::Payload, &[0; 16]).unwrap();
        assert!(matches!(
            b.recv_into(0, Tag::Payload, &mut buf),
            Err(TransportError::Truncated { capacity: 4, len: 16 })
        ));
    }

    #[test]
    fn unknown_rank_is_rejected() {
        let (mut a, _b) = pair();
        assert!(matches!(a.send(5, Tag::Total, &[]), Err(TransportError::UnknownRank(5))));
    }

    #[test]
    fn timeout_and_disconnect_surface() {
        let (a, mut b) = pair();
        b = b.with_timeout(Some(Duration::from_millis(20)));
        let mut buf = [0u8; 4];
        assert!(matches!(
            b.recv_into(0, Tag::Total, &mut buf),
            Err(TransportError::Timeout { peer: 0, tag: Tag::Total, .. })
        ));
        drop(a);
        assert!(matches!(
            b.recv_into(0, Tag::Total, &mut buf),
            Err(TransportError::Disconnected { peer: 0 })
        ));
    }

    #[test]
    fn rendezvous_channels_block_until_received() {
        let mut mesh = ChannelMesh::connect_bounded(2, Some(0));
        let mut b = mesh.pop().unwrap();
        let mut a = mesh.pop().unwrap();
        let sender = thread::spawn(move || {
            a.send_u32(1, Tag::Total, 3).unwrap();
            a.send_u32(1, Tag::Count, 4).unwrap();
        });
        assert_eq!(b.recv_u32(0, Tag::Total).unwrap(), 3);
        assert_eq!(b.recv_u32(0, Tag::Count).unwrap(), 4);
        sender.join().unwrap();
    }
}
