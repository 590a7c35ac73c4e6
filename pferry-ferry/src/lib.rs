//! Particle migration between ranks.
//!
//! A [`Ferry`] wraps one rank's transport endpoint and moves particles to or
//! from exactly one peer per session, in fixed-capacity batches of
//! fixed-layout records. Batches can be checked against the spatial
//! ownership range the particles are migrating into; see [`verify_batch`].

mod ferry;
mod verify;

pub use ferry::{Ferry, FerryConfig, FerryError, FerryStats, Role, DEFAULT_CAPACITY};
pub use verify::{verify_batch, BatchReport, OwnershipRange};
