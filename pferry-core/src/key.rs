use serde::{Deserialize, Serialize};
use std::fmt;

/// Space-filling-curve key formed by interleaving the bits of a particle's
/// discretized coordinates. Zero means "not yet assigned".
///
/// Keys carry a leading placeholder bit at position `3 * bits`, so every
/// valid key for a given resolution lies in `[1 << 3*bits, 1 << (3*bits + 1))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SpatialKey(pub u128);

impl SpatialKey {
    pub const UNASSIGNED: SpatialKey = SpatialKey(0);

    /// Largest per-axis resolution whose keys still fit in 128 bits.
    pub const MAX_BITS: u32 = 42;

    /// Largest per-axis resolution whose cell ids still fit in 32 bits.
    pub const MAX_CELL_BITS: u32 = 10;

    /// Builds a Morton key from per-axis cell coordinates at `bits` resolution.
    pub fn interleave(ix: u64, iy: u64, iz: u64, bits: u32) -> Self {
        debug_assert!(bits <= Self::MAX_BITS);
        let mut key: u128 = 1u128 << (3 * bits);
        for b in 0..bits {
            let shift = 3 * b;
            key |= (((ix >> b) & 1) as u128) << (shift + 2);
            key |= (((iy >> b) & 1) as u128) << (shift + 1);
            key |= (((iz >> b) & 1) as u128) << shift;
        }
        SpatialKey(key)
    }

    /// Builds a key from a position inside the cube `[lo, lo + extent)^3`.
    /// Coordinates outside the cube are clamped onto its faces.
    pub fn from_position(pos: &[f64; 3], lo: f64, extent: f64, bits: u32) -> Self {
        let cells = (1u64 << bits) as f64;
        let axis = |x: f64| -> u64 {
            let t = ((x - lo) / extent * cells).floor();
            t.clamp(0.0, cells - 1.0) as u64
        };
        Self::interleave(axis(pos[0]), axis(pos[1]), axis(pos[2]), bits)
    }

    /// Truncates a key at `bits` resolution to its enclosing cell at
    /// `cell_bits` resolution. The result keeps the placeholder bit, so it
    /// lies in `[1 << 3*cell_bits, 1 << (3*cell_bits + 1))`.
    ///
    /// Returns 0 for unassigned keys, when `cell_bits` exceeds `bits`, and
    /// when the truncated key does not fit in a `u32` (a key wider than
    /// `bits`, or `cell_bits` above [`SpatialKey::MAX_CELL_BITS`]).
    pub fn cell(self, bits: u32, cell_bits: u32) -> u32 {
        if self.is_unassigned() || cell_bits > bits || bits > Self::MAX_BITS {
            return 0;
        }
        u32::try_from(self.0 >> (3 * (bits - cell_bits))).unwrap_or(0)
    }

    pub fn is_unassigned(self) -> bool {
        self.0 == 0
    }

    /// Number of significant bits.
    pub fn significant_bits(self) -> u32 {
        128 - self.0.leading_zeros()
    }
}

impl From<u64> for SpatialKey {
    fn from(value: u64) -> Self {
        SpatialKey(value as u128)
    }
}

impl fmt::LowerHex for SpatialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Secondary species label, a small integer pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpeciesKey(pub u16, pub u16);

impl SpeciesKey {
    pub const DEFAULT: SpeciesKey = SpeciesKey(u16::MAX, u16::MAX);

    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }
}

impl Default for SpeciesKey {
    fn default() -> Self {
        Self::DEFAULT
    }
}
