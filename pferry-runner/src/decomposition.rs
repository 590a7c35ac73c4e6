//! Stub spatial decomposition: the key space split into contiguous slabs,
//! one per rank, whose interior boundaries wobble from round to round so
//! that particles near them change owner.

use pferry_core::{Rank, SpatialKey};
use pferry_ferry::OwnershipRange;

#[derive(Debug, Clone)]
pub struct Slabs {
    key_bits: u32,
    cell_bits: u32,
    /// `ranks + 1` ascending boundaries; rank `r` owns `bounds[r]..bounds[r + 1]`.
    bounds: Vec<u128>,
}

impl Slabs {
    /// Slab boundaries for `round`. Round phases cycle through equal slabs,
    /// boundaries pushed up a quarter slab, equal slabs, and pushed down.
    pub fn for_round(ranks: u32, key_bits: u32, cell_bits: u32, round: u32) -> Self {
        let lo = 1u128 << (3 * key_bits);
        let hi = lo << 1;
        let width = (hi - lo) / ranks as u128;
        let quarter = width / 4;

        let mut bounds = Vec::with_capacity(ranks as usize + 1);
        bounds.push(lo);
        for i in 1..ranks as u128 {
            let base = lo + i * width;
            bounds.push(match round % 4 {
                1 => base + quarter,
                3 => base - quarter,
                _ => base,
            });
        }
        bounds.push(hi);

        Self { key_bits, cell_bits, bounds }
    }

    pub fn ranks(&self) -> u32 {
        (self.bounds.len() - 1) as u32
    }

    /// Rank owning `key`. Keys below or above the key space go to the
    /// first or last rank.
    pub fn owner(&self, key: SpatialKey) -> Rank {
        let interior = &self.bounds[1..self.bounds.len() - 1];
        interior.partition_point(|&b| b <= key.0) as Rank
    }

    /// Key and cell ranges held by `rank`.
    pub fn range(&self, rank: Rank) -> OwnershipRange {
        let r = rank as usize;
        let (start, end) = (self.bounds[r], self.bounds[r + 1]);
        let first = SpatialKey(start).cell(self.key_bits, self.cell_bits);
        let last = SpatialKey(end - 1).cell(self.key_bits, self.cell_bits);
        OwnershipRange::new(start..end, first..last + 1)
    }

    /// Key and cell id of a position inside the cube `[lo, lo + extent)^3`.
    pub fn label(&self, pos: &[f64; 3], lo: f64, extent: f64) -> (SpatialKey, u32) {
        let key = SpatialKey::from_position(pos, lo, extent, self.key_bits);
        (key, key.cell(self.key_bits, self.cell_bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slabs_tile_the_key_space() {
        for round in 0..4 {
            let slabs = Slabs::for_round(5, 8, 3, round);
            let full = OwnershipRange::full(8, 3);
            assert_eq!(slabs.range(0).keys.start, full.keys.start);
            assert_eq!(slabs.range(4).keys.end, full.keys.end);
            for r in 0..4 {
                assert_eq!(slabs.range(r).keys.end, slabs.range(r + 1).keys.start);
            }
        }
    }

    #[test]
    fn owners_hold_their_labels() {
        let slabs = Slabs::for_round(3, 6, 2, 1);
        for i in 0..200 {
            let t = i as f64 / 200.0;
            let (key, cell) = slabs.label(&[t, 1.0 - t, t * t], 0.0, 1.0);
            let own = slabs.range(slabs.owner(key));
            assert!(own.owns_key(key));
            assert!(own.owns_cell(cell));
        }
    }

    #[test]
    fn boundaries_move_between_rounds() {
        let even = Slabs::for_round(2, 4, 2, 0);
        let up = Slabs::for_round(2, 4, 2, 1);
        let down = Slabs::for_round(2, 4, 2, 3);
        assert!(up.range(0).keys.end > even.range(0).keys.end);
        assert!(down.range(0).keys.end < even.range(0).keys.end);
        assert_eq!(Slabs::for_round(2, 4, 2, 2).bounds, even.bounds);
    }

    #[test]
    fn extreme_keys_clamp_to_edge_ranks() {
        let slabs = Slabs::for_round(4, 5, 2, 0);
        assert_eq!(slabs.owner(SpatialKey(1)), 0);
        assert_eq!(slabs.owner(SpatialKey(u128::MAX)), 3);
        assert_eq!(slabs.ranks(), 4);
    }
}
