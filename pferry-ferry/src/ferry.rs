//! The particle ferry: buffered, flow-controlled migration of a declared
//! number of particles from one rank to another.
//!
//! A session is opened on both ends with the same `(to, from)` pair. The
//! source declares the total, pushes particles into a fixed-capacity batch
//! and ships the batch whenever it fills or the total is reached. The
//! destination pulls particles in push order, receiving the next batch each
//! time its local one runs dry.

use log::{debug, log_enabled, warn, Level};
use pferry_core::{
    AttributeLayout, CodecError, KeyWidth, Particle, Precision, Rank, RecordLayout, SpatialKey,
};
use pferry_transport::{Tag, Transport, TransportError};
use std::fmt;
use thiserror::Error;

use crate::verify::{verify_batch, BatchReport, OwnershipRange};

/// Records per batch when not configured otherwise.
pub const DEFAULT_CAPACITY: usize = 2000;

/// Error types raised by a ferry session.
#[derive(Error, Debug)]
pub enum FerryError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("batch capacity must be at least one record")]
    ZeroCapacity,

    #[error("rank {0} cannot ferry particles to itself")]
    SelfTransfer(Rank),

    #[error("rank {rank} is neither source {from} nor destination {to}")]
    NotParticipant { rank: Rank, from: Rank, to: Rank },

    #[error("session from rank {from} to rank {to} is still streaming")]
    SessionOpen { from: Rank, to: Rank },

    #[error("no session is open")]
    NoSession,

    #[error("rank {rank} is the {role} of the open session")]
    WrongRole { rank: Rank, role: Role },

    #[error("all {total} particles of the session have been pushed")]
    TotalExceeded { total: u32 },

    /// A batch header disagrees with the session's declared total or the
    /// batch capacity.
    #[error("rank {from} announced a batch of {count} with {remaining} particles outstanding (capacity {capacity})")]
    CountMismatch { from: Rank, count: usize, remaining: u32, capacity: usize },
}

/// Which end of a session the local rank is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Destination,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Destination => write!(f, "destination"),
        }
    }
}

/// Fixed properties of a ferry, agreed on by every rank in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FerryConfig {
    pub attributes: AttributeLayout,
    /// Records per batch.
    pub capacity: usize,
    pub precision: Precision,
    pub key_width: KeyWidth,
    /// Carry the sequence index in each record.
    pub with_index: bool,
    /// Check every batch against the session's ownership range.
    pub verify: bool,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            attributes: AttributeLayout::default(),
            capacity: DEFAULT_CAPACITY,
            precision: Precision::Double,
            key_width: KeyWidth::Narrow,
            with_index: true,
            verify: false,
        }
    }
}

impl FerryConfig {
    pub fn layout(&self) -> RecordLayout {
        RecordLayout::new(self.attributes, self.precision, self.key_width, self.with_index)
    }
}

/// Running totals over every session a ferry has carried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FerryStats {
    /// Sessions opened on this rank, as either end.
    pub sessions: usize,
    /// Batches shipped.
    pub flushes: usize,
    /// Batches received.
    pub refills: usize,
    pub particles_sent: usize,
    pub particles_received: usize,
    pub bytes_sent: usize,
    pub bytes_received: usize,
    /// Keys found outside the ownership range by batch verification.
    pub key_errors: usize,
    /// Cell ids found outside the ownership range by batch verification.
    pub cell_errors: usize,
    /// Received particles with no index or a non-positive mass.
    pub bad_records: usize,
}

#[derive(Debug, Clone)]
struct Session {
    role: Role,
    to: Rank,
    from: Rank,
    total: u32,
    /// Particles pushed (source) or pulled (destination) so far.
    done: u32,
    ownership: OwnershipRange,
}

impl Session {
    fn is_complete(&self) -> bool {
        self.done == self.total
    }

    fn peer(&self) -> Rank {
        match self.role {
            Role::Source => self.to,
            Role::Destination => self.from,
        }
    }
}

/// Migration endpoint for one rank.
///
/// The ferry owns its transport endpoint and a batch buffer sized once at
/// construction. It carries at most one session at a time.
pub struct Ferry<T: Transport> {
    transport: T,
    config: FerryConfig,
    layout: RecordLayout,
    buf: Vec<u8>,
    /// Records currently held in `buf`.
    filled: usize,
    /// Next record of `buf` to hand out (destination only).
    next: usize,
    session: Option<Session>,
    stats: FerryStats,
}

impl<T: Transport> Ferry<T> {
    pub fn new(transport: T, config: FerryConfig) -> Result<Self, FerryError> {
        if config.capacity == 0 {
            return Err(FerryError::ZeroCapacity);
        }
        let layout = config.layout();
        debug!(
            "rank {}: ferry with {} byte records, {} per batch",
            transport.rank(),
            layout.size(),
            config.capacity
        );
        Ok(Self {
            buf: vec![0u8; config.capacity * layout.size()],
            transport,
            config,
            layout,
            filled: 0,
            next: 0,
            session: None,
            stats: FerryStats::default(),
        })
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn config(&self) -> &FerryConfig {
        &self.config
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn stats(&self) -> &FerryStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Role of the local rank in the open session, if any.
    pub fn role(&self) -> Option<Role> {
        self.session.as_ref().map(|s| s.role)
    }

    /// True when no session is open or the open one has moved its total.
    pub fn is_idle(&self) -> bool {
        self.session.as_ref().map_or(true, Session::is_complete)
    }

    /// True once the current session has moved its declared total.
    pub fn session_complete(&self) -> bool {
        self.session.as_ref().map_or(false, Session::is_complete)
    }

    fn verifying(&self) -> bool {
        self.config.verify || log_enabled!(Level::Trace)
    }

    // --- Session setup ---

    /// Opens a session moving particles from rank `from` to rank `to`.
    ///
    /// Both ranks call this with the same pair. The source passes the number
    /// of particles it will push; the destination's `total` argument is
    /// ignored and the declared total is returned instead. `ownership` is
    /// the range the migrated particles must fall into.
    pub fn open(
        &mut self,
        to: Rank,
        from: Rank,
        total: u32,
        ownership: OwnershipRange,
    ) -> Result<u32, FerryError> {
        if to == from {
            return Err(FerryError::SelfTransfer(to));
        }
        if let Some(session) = &self.session {
            if !session.is_complete() {
                return Err(FerryError::SessionOpen { from: session.from, to: session.to });
            }
        }

        let rank = self.transport.rank();
        let role = if rank == from {
            Role::Source
        } else if rank == to {
            Role::Destination
        } else {
            return Err(FerryError::NotParticipant { rank, from, to });
        };

        self.session = None;
        self.filled = 0;
        self.next = 0;

        let total = match role {
            Role::Source => {
                self.transport.send_u32(to, Tag::Total, total)?;
                total
            }
            Role::Destination => self.transport.recv_u32(from, Tag::Total)?,
        };

        debug!("rank {}: opened {} session {} -> {} for {} particles", rank, role, from, to, total);
        self.session = Some(Session { role, to, from, total, done: 0, ownership });
        self.stats.sessions += 1;
        Ok(total)
    }

    // --- Source side ---

    /// Queues a particle for shipping.
    pub fn push(&mut self, particle: &Particle) -> Result<(), FerryError> {
        self.push_record(particle, None, None)
    }

    /// Queues a particle, replacing its sequence index and spatial key in
    /// the shipped record. The particle itself is not modified.
    pub fn push_relabeled(
        &mut self,
        particle: &Particle,
        seq: u64,
        key: SpatialKey,
    ) -> Result<(), FerryError> {
        self.push_record(particle, Some(seq), Some(key))
    }

    /// Pushes every particle yielded by `particles`.
    pub fn push_all<'a, I>(&mut self, particles: I) -> Result<(), FerryError>
    where
        I: IntoIterator<Item = &'a Particle>,
    {
        for particle in particles {
            self.push(particle)?;
        }
        Ok(())
    }

    fn push_record(
        &mut self,
        particle: &Particle,
        seq: Option<u64>,
        key: Option<SpatialKey>,
    ) -> Result<(), FerryError> {
        let rank = self.transport.rank();
        let session = self.session.as_mut().ok_or(FerryError::NoSession)?;
        if session.role != Role::Source {
            return Err(FerryError::WrongRole { rank, role: session.role });
        }
        if session.is_complete() {
            return Err(FerryError::TotalExceeded { total: session.total });
        }

        let size = self.layout.size();
        let at = self.filled * size;
        if let Err(e) = self.layout.encode(particle, seq, key, &mut self.buf[at..at + size]) {
            return Err(self.abort(e.into()));
        }
        self.filled += 1;
        session.done += 1;

        if self.filled == self.config.capacity || session.is_complete() {
            self.flush()?;
        }
        Ok(())
    }

    /// Ships the buffered records as one count message and one payload.
    fn flush(&mut self) -> Result<(), FerryError> {
        let Some(session) = self.session.as_ref() else {
            return Err(FerryError::NoSession);
        };
        let to = session.to;
        let count = self.filled;
        let bytes = count * self.layout.size();

        if self.verifying() {
            self.check_batch(count, "outgoing")?;
        }

        let sent = self
            .transport
            .send_u32(to, Tag::Count, count as u32)
            .and_then(|_| self.transport.send(to, Tag::Payload, &self.buf[..bytes]));
        if let Err(e) = sent {
            return Err(self.abort(e.into()));
        }

        self.stats.flushes += 1;
        self.stats.particles_sent += count;
        self.stats.bytes_sent += bytes;
        self.filled = 0;
        debug!("rank {}: shipped {} particles ({} bytes) to rank {}", self.transport.rank(), count, bytes, to);

        if self.session_complete() {
            self.log_complete();
        }
        Ok(())
    }

    // --- Destination side ---

    /// Returns the next particle of the session, or `None` once the
    /// declared total has been received.
    pub fn pull(&mut self) -> Result<Option<Particle>, FerryError> {
        let mut particle = Particle::new(&self.config.attributes);
        Ok(self.pull_into(&mut particle)?.then_some(particle))
    }

    /// Decodes the next particle into `out`, reusing its storage. Returns
    /// `false` once the declared total has been received.
    pub fn pull_into(&mut self, out: &mut Particle) -> Result<bool, FerryError> {
        let rank = self.transport.rank();
        let session = self.session.as_ref().ok_or(FerryError::NoSession)?;
        if session.role != Role::Destination {
            return Err(FerryError::WrongRole { rank, role: session.role });
        }
        if session.is_complete() {
            return Ok(false);
        }

        if self.next == self.filled {
            self.refill()?;
        }

        let size = self.layout.size();
        let at = self.next * size;
        if let Err(e) = self.layout.decode_into(&self.buf[at..at + size], out) {
            return Err(self.abort(e.into()));
        }
        self.next += 1;

        // Unindexed layouts carry no index to check.
        let bad_index = self.layout.has_index() && out.indx == 0;
        if self.config.verify && (bad_index || !out.has_positive_mass()) {
            self.stats.bad_records += 1;
            warn!(
                "rank {}: received suspicious particle index={} mass={}",
                rank, out.indx, out.mass
            );
        }

        let complete = match self.session.as_mut() {
            Some(session) => {
                session.done += 1;
                session.is_complete()
            }
            None => false,
        };
        if complete {
            self.log_complete();
        }
        Ok(true)
    }

    /// Pulls every remaining particle of the session.
    pub fn pull_all(&mut self) -> Result<Vec<Particle>, FerryError> {
        let remaining = self
            .session
            .as_ref()
            .map_or(0, |s| (s.total - s.done) as usize);
        let mut out = Vec::with_capacity(remaining);
        while let Some(particle) = self.pull()? {
            out.push(particle);
        }
        Ok(out)
    }

    /// Receives the next batch from the source into the local buffer.
    fn refill(&mut self) -> Result<(), FerryError> {
        let Some(session) = self.session.as_ref() else {
            return Err(FerryError::NoSession);
        };
        let from = session.from;
        let remaining = session.total - session.done;

        let count = match self.transport.recv_u32(from, Tag::Count) {
            Ok(count) => count as usize,
            Err(e) => return Err(self.abort(e.into())),
        };
        if count == 0 || count > self.config.capacity || count > remaining as usize {
            let err = FerryError::CountMismatch {
                from,
                count,
                remaining,
                capacity: self.config.capacity,
            };
            return Err(self.abort(err));
        }

        let bytes = count * self.layout.size();
        let received = match self.transport.recv_into(from, Tag::Payload, &mut self.buf[..bytes]) {
            Ok(n) => n,
            Err(e) => return Err(self.abort(e.into())),
        };
        if received != bytes {
            let err = CodecError::ShortBuffer { expected: bytes, actual: received };
            return Err(self.abort(err.into()));
        }

        self.filled = count;
        self.next = 0;
        self.stats.refills += 1;
        self.stats.particles_received += count;
        self.stats.bytes_received += bytes;
        debug!("rank {}: received {} particles ({} bytes) from rank {}", self.transport.rank(), count, bytes, from);

        if self.verifying() {
            self.check_batch(count, "incoming")?;
        }
        Ok(())
    }

    // --- Diagnostics ---

    /// Verifies the first `count` buffered records against the session's
    /// ownership range. Violations are logged and counted, never fatal.
    fn check_batch(&mut self, count: usize, direction: &str) -> Result<BatchReport, FerryError> {
        let Some(session) = self.session.as_ref() else {
            return Err(FerryError::NoSession);
        };
        let report = verify_batch(&self.buf, count, &self.layout, &session.ownership)?;
        let rank = self.transport.rank();

        if report.key_errors > 0 {
            warn!(
                "rank {}: {} of {} {} keys outside [{:#x}, {:#x}) between ranks {} and {}: min key={:#x}, max key={:#x}",
                rank,
                report.key_errors,
                report.records,
                direction,
                session.ownership.keys.start,
                session.ownership.keys.end,
                session.from,
                session.to,
                report.key_min,
                report.key_max
            );
        }
        if report.cell_errors > 0 {
            warn!(
                "rank {}: {} of {} {} cells outside [{}, {}) between ranks {} and {}: min cell={}, max cell={}",
                rank,
                report.cell_errors,
                report.records,
                direction,
                session.ownership.cells.start,
                session.ownership.cells.end,
                session.from,
                session.to,
                report.cell_min,
                report.cell_max
            );
        }

        self.stats.key_errors += report.key_errors;
        self.stats.cell_errors += report.cell_errors;
        Ok(report)
    }

    fn log_complete(&self) {
        if let Some(session) = &self.session {
            debug!(
                "rank {}: {} session {} -> {} complete ({} particles, peer {})",
                self.transport.rank(),
                session.role,
                session.from,
                session.to,
                session.total,
                session.peer()
            );
        }
    }

    /// Drops the open session after a fatal error so the ferry can be reopened.
    fn abort(&mut self, err: FerryError) -> FerryError {
        if let Some(session) = self.session.take() {
            warn!(
                "rank {}: aborting {} session {} -> {} after {} of {} particles: {}",
                self.transport.rank(),
                session.role,
                session.from,
                session.to,
                session.done,
                session.total,
                err
            );
        }
        self.filled = 0;
        self.next = 0;
        err
    }
}
