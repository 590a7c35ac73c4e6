//! Ownership invariant checks over batches of in-flight records.

use pferry_core::{CodecError, RecordLayout, SpatialKey};
use std::ops::Range;

/// Half-open spatial key and cell id ranges that migrated particles are
/// expected to fall into. Zero keys and cells are unassigned and always pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipRange {
    pub keys: Range<u128>,
    pub cells: Range<u32>,
}

impl OwnershipRange {
    pub fn new(keys: Range<u128>, cells: Range<u32>) -> Self {
        Self { keys, cells }
    }

    /// The whole valid key space at `key_bits` resolution and the whole cell
    /// space at `cell_bits` resolution, each including the placeholder bit.
    /// Resolutions are capped at [`SpatialKey::MAX_BITS`] and
    /// [`SpatialKey::MAX_CELL_BITS`].
    pub fn full(key_bits: u32, cell_bits: u32) -> Self {
        let key_bits = key_bits.min(SpatialKey::MAX_BITS);
        let cell_bits = cell_bits.min(SpatialKey::MAX_CELL_BITS);
        Self {
            keys: (1u128 << (3 * key_bits))..(1u128 << (3 * key_bits + 1)),
            cells: (1u32 << (3 * cell_bits))..(1u32 << (3 * cell_bits + 1)),
        }
    }

    /// Accepts every assigned key and cell.
    pub fn unbounded() -> Self {
        Self { keys: 0..u128::MAX, cells: 0..u32::MAX }
    }

    pub fn owns_key(&self, key: SpatialKey) -> bool {
        key.is_unassigned() || self.keys.contains(&key.0)
    }

    pub fn owns_cell(&self, cell: u32) -> bool {
        cell == 0 || self.cells.contains(&cell)
    }
}

impl Default for OwnershipRange {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Result of scanning one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Records scanned.
    pub records: usize,
    /// Nonzero keys outside the ownership key range.
    pub key_errors: usize,
    /// Nonzero cell ids outside the ownership cell range.
    pub cell_errors: usize,
    pub key_min: u128,
    pub key_max: u128,
    pub cell_min: u32,
    pub cell_max: u32,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.key_errors == 0 && self.cell_errors == 0
    }

    pub fn violations(&self) -> usize {
        self.key_errors + self.cell_errors
    }
}

/// Scans the first `count` records of `batch`, collecting the key and cell
/// extrema and counting values outside `ownership`.
///
/// This never fails on a violation; it only fails when `batch` holds fewer
/// than `count` records.
pub fn verify_batch(
    batch: &[u8],
    count: usize,
    layout: &RecordLayout,
    ownership: &OwnershipRange,
) -> Result<BatchReport, CodecError> {
    let size = layout.size();
    let needed = count * size;
    if batch.len() < needed {
        return Err(CodecError::ShortBuffer { expected: needed, actual: batch.len() });
    }
    if count == 0 {
        return Ok(BatchReport::default());
    }

    let mut report = BatchReport {
        records: count,
        key_min: u128::MAX,
        cell_min: u32::MAX,
        ..BatchReport::default()
    };

    for record in batch[..needed].chunks_exact(size) {
        let key = layout.read_key(record)?;
        report.key_min = report.key_min.min(key.0);
        report.key_max = report.key_max.max(key.0);
        if !ownership.owns_key(key) {
            report.key_errors += 1;
        }

        let cell = layout.read_cell(record)?;
        report.cell_min = report.cell_min.min(cell);
        report.cell_max = report.cell_max.max(cell);
        if !ownership.owns_cell(cell) {
            report.cell_errors += 1;
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pferry_core::{AttributeLayout, KeyWidth, Particle, Precision};

    fn batch(layout: &RecordLayout, keys: &[u128], cells: &[u32]) -> Vec<u8> {
        let mut buf = vec![0u8; layout.size() * keys.len()];
        for (i, (&key, &cell)) in keys.iter().zip(cells).enumerate() {
            let mut p = Particle::new(layout.attributes()).with_index(i as u64 + 1);
            p.key = SpatialKey(key);
            p.tree = cell;
            let at = i * layout.size();
            layout.encode(&p, None, None, &mut buf[at..at + layout.size()]).unwrap();
        }
        buf
    }

    fn layout() -> RecordLayout {
        RecordLayout::new(AttributeLayout::new(1, 1), Precision::Double, KeyWidth::Narrow, true)
    }

    #[test]
    fn in_range_batch_is_clean() {
        let l = layout();
        let own = OwnershipRange::new(100..200, 10..20);
        let buf = batch(&l, &[100, 150, 199], &[10, 15, 19]);
        let report = verify_batch(&buf, 3, &l, &own).unwrap();
        assert!(report.is_clean());
        assert_eq!((report.key_min, report.key_max), (100, 199));
        assert_eq!((report.cell_min, report.cell_max), (10, 19));
    }

    #[test]
    fn one_stray_key_is_one_violation_bracketed() {
        let l = layout();
        let own = OwnershipRange::new(100..200, 10..20);
        let buf = batch(&l, &[120, 200, 130], &[11, 12, 13]);
        let report = verify_batch(&buf, 3, &l, &own).unwrap();
        assert_eq!(report.key_errors, 1);
        assert_eq!(report.cell_errors, 0);
        assert!(report.key_min <= 200 && 200 <= report.key_max);
        assert_eq!(report.violations(), 1);
    }

    #[test]
    fn unassigned_values_pass() {
        let l = layout();
        let own = OwnershipRange::new(100..200, 10..20);
        let buf = batch(&l, &[0, 150], &[0, 12]);
        let report = verify_batch(&buf, 2, &l, &own).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.key_min, 0);
    }

    #[test]
    fn stray_cells_are_counted_separately() {
        let l = layout();
        let own = OwnershipRange::new(100..200, 10..20);
        let buf = batch(&l, &[150, 150], &[9, 20]);
        let report = verify_batch(&buf, 2, &l, &own).unwrap();
        assert_eq!((report.key_errors, report.cell_errors), (0, 2));
    }

    #[test]
    fn only_counted_records_are_scanned() {
        let l = layout();
        let own = OwnershipRange::new(100..200, 10..20);
        let buf = batch(&l, &[150, 5000], &[12, 12]);
        assert!(verify_batch(&buf, 1, &l, &own).unwrap().is_clean());
        assert!(verify_batch(&buf[..l.size()], 2, &l, &own).is_err());
        assert_eq!(verify_batch(&buf, 0, &l, &own).unwrap(), BatchReport::default());
    }

    #[test]
    fn full_range_caps_oversized_resolutions() {
        assert_eq!(OwnershipRange::full(60, 14), OwnershipRange::full(42, 10));
        assert_eq!(OwnershipRange::full(42, 10).cells.end, 1u32 << 31);
    }

    #[test]
    fn full_range_matches_key_helpers() {
        let own = OwnershipRange::full(10, 3);
        let key = SpatialKey::from_position(&[0.1, 0.2, 0.3], 0.0, 1.0, 10);
        assert!(own.owns_key(key));
        assert!(own.owns_cell(key.cell(10, 3)));
        assert!(!own.owns_key(SpatialKey(1)));
    }
}
