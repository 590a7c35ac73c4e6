//! Particle records for the migration substrate: the particle entity, its
//! spatial keys, and the binary/text encodings shared by the ferry and by
//! checkpoint collaborators.

pub mod codec;
pub mod error;
pub mod key;
pub mod layout;
pub mod particle;
pub mod record;

pub use codec::{Codec, DecodeDefaults};
pub use error::CodecError;
pub use key::{SpatialKey, SpeciesKey};
pub use layout::{AttributeLayout, KeyWidth, Precision};
pub use particle::Particle;
pub use record::{RecordLayout, RecordReader, RecordWriter};

/// Index of one participating process in the transport.
pub type Rank = u32;
