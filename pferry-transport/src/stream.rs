//! Point-to-point transport over a byte stream.
//!
//! Each message is framed as a one byte tag, a little-endian `u32` length
//! and the payload. A `StreamPeer` only reaches the one rank on the other
//! end of its stream.

use log::{debug, trace};
use pferry_core::Rank;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::{Tag, Transport, TransportError};

const HEADER_LEN: usize = 5;

/// Transport to a single peer rank over a `Read + Write` stream.
pub struct StreamPeer<S> {
    rank: Rank,
    peer: Rank,
    stream: S,
    timeout: Option<Duration>,
}

impl<S: Read + Write> StreamPeer<S> {
    pub fn new(rank: Rank, peer: Rank, stream: S) -> Self {
        Self { rank, peer, stream, timeout: None }
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn check_peer(&self, rank: Rank) -> Result<(), TransportError> {
        if rank == self.peer {
            Ok(())
        } else {
            Err(TransportError::UnknownRank(rank))
        }
    }

    /// Reads and discards `len` payload bytes.
    fn skip(&mut self, len: usize, tag: Tag) -> Result<(), TransportError> {
        let result = {
            let mut payload = (&mut self.stream).take(len as u64);
            io::copy(&mut payload, &mut io::sink())
        };
        let skipped = result.map_err(|e| self.map_read_error(e, tag))?;
        if skipped < len as u64 {
            return Err(TransportError::Disconnected { peer: self.peer });
        }
        Ok(())
    }

    fn map_read_error(&self, err: io::Error, tag: Tag) -> TransportError {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => TransportError::Disconnected { peer: self.peer },
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::Timeout {
                peer: self.peer,
                tag,
                after: self.timeout.unwrap_or_default(),
            },
            _ => TransportError::Io(err),
        }
    }
}

impl StreamPeer<TcpStream> {
    /// Connects to a peer listening at `addr`.
    pub fn connect<A: ToSocketAddrs>(rank: Rank, peer: Rank, addr: A) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        debug!("rank {} connected to rank {} at {:?}", rank, peer, stream.peer_addr().ok());
        Ok(Self::new(rank, peer, stream))
    }

    /// Accepts one connection from a peer on `listener`.
    pub fn accept(rank: Rank, peer: Rank, listener: &TcpListener) -> Result<Self, TransportError> {
        let (stream, addr) = listener.accept()?;
        stream.set_nodelay(true)?;
        debug!("rank {} accepted rank {} from {}", rank, peer, addr);
        Ok(Self::new(rank, peer, stream))
    }

    /// Bounds how long a receive waits before failing with `Timeout`.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.stream.set_read_timeout(timeout)?;
        self.timeout = timeout;
        Ok(())
    }
}

impl<S: Read + Write> Transport for StreamPeer<S> {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        2
    }

    fn send(&mut self, to: Rank, tag: Tag, data: &[u8]) -> Result<(), TransportError> {
        self.check_peer(to)?;
        let len = u32::try_from(data.len())
            .map_err(|_| TransportError::Truncated { capacity: u32::MAX as usize, len: data.len() })?;

        let mut header = [0u8; HEADER_LEN];
        header[0] = tag as u8;
        header[1..].copy_from_slice(&len.to_le_bytes());

        let write = |stream: &mut S| -> io::Result<()> {
            stream.write_all(&header)?;
            stream.write_all(data)?;
            stream.flush()
        };
        write(&mut self.stream).map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                TransportError::Disconnected { peer: to }
            }
            _ => TransportError::Io(e),
        })?;
        trace!("rank {} -> {}: {:?} ({} bytes)", self.rank, to, tag, data.len());
        Ok(())
    }

    fn recv_into(&mut self, from: Rank, tag: Tag, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.check_peer(from)?;

        let mut header = [0u8; HEADER_LEN];
        if let Err(e) = self.stream.read_exact(&mut header) {
            return Err(self.map_read_error(e, tag));
        }
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        // Rejected messages are consumed whole so the next read starts on a header.
        if header[0] != tag as u8 {
            self.skip(len, tag)?;
            return Err(TransportError::UnexpectedTag { expected: tag, found: header[0] });
        }
        if len > buf.len() {
            self.skip(len, tag)?;
            return Err(TransportError::Truncated { capacity: buf.len(), len });
        }
        if let Err(e) = self.stream.read_exact(&mut buf[..len]) {
            return Err(self.map_read_error(e, tag));
        }
        trace!("rank {} <- {}: {:?} ({} bytes)", self.rank, from, tag, len);
        Ok(len)
    }
}
