//! Fixed-layout particle records and the bounds-checked writer/reader used
//! to fill and drain them.
//!
//! A record is made of a *body* shared with the persisted codec (mass,
//! position, velocity, combined potential, attributes) followed, for the
//! in-flight form, by a *trailer* holding time-step metadata and identity:
//!
//! | field                     | size     |
//! |---------------------------|----------|
//! | mass                      | P        |
//! | position[3]               | 3P       |
//! | velocity[3]               | 3P       |
//! | combined potential        | P        |
//! | integer attributes[Ni]    | 4 Ni     |
//! | float attributes[Nd]      | P Nd     |
//! | level                     | 4        |
//! | requested dt              | 4        |
//! | scale                     | 4        |
//! | effort                    | 4        |
//! | sequence index (optional) | 8        |
//! | cell id                   | 4        |
//! | spatial key               | 8 or 16  |
//!
//! All fields are native byte order.

use bytes::{Buf, BufMut};

use crate::error::CodecError;
use crate::key::{SpatialKey, SpeciesKey};
use crate::layout::{AttributeLayout, KeyWidth, Precision};
use crate::particle::Particle;

// --- Writer / Reader ---

/// Sequential writer over exactly one record's worth of bytes.
///
/// The record length is checked once on construction; every `put_*` after
/// that stays within the slice as long as callers follow the layout.
pub struct RecordWriter<'a> {
    cursor: &'a mut [u8],
    precision: Precision,
}

impl<'a> RecordWriter<'a> {
    pub fn new(buf: &'a mut [u8], len: usize, precision: Precision) -> Result<Self, CodecError> {
        if buf.len() < len {
            return Err(CodecError::ShortBuffer { expected: len, actual: buf.len() });
        }
        Ok(Self { cursor: &mut buf[..len], precision })
    }

    /// Writes a floating field at the record's precision.
    pub fn put_float(&mut self, v: f64) {
        match self.precision {
            Precision::Single => self.cursor.put_f32_ne(v as f32),
            Precision::Double => self.cursor.put_f64_ne(v),
        }
    }

    pub fn put_floats(&mut self, vs: &[f64]) {
        for &v in vs {
            self.put_float(v);
        }
    }

    pub fn put_i32(&mut self, v: i32) {
        self.cursor.put_i32_ne(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.cursor.put_u32_ne(v);
    }

    pub fn put_f32(&mut self, v: f32) {
        self.cursor.put_f32_ne(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.cursor.put_u64_ne(v);
    }

    pub fn put_key(&mut self, key: SpatialKey, width: KeyWidth) -> Result<(), CodecError> {
        match width {
            KeyWidth::Narrow => {
                let narrow = u64::try_from(key.0)
                    .map_err(|_| CodecError::KeyOverflow { key: key.0, bits: width.bits() })?;
                self.cursor.put_u64_ne(narrow);
            }
            KeyWidth::Wide => self.cursor.put_u128_ne(key.0),
        }
        Ok(())
    }

    /// Bytes left in the record.
    pub fn remaining(&self) -> usize {
        self.cursor.len()
    }
}

/// Sequential reader over exactly one record's worth of bytes.
pub struct RecordReader<'a> {
    cursor: &'a [u8],
    precision: Precision,
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8], len: usize, precision: Precision) -> Result<Self, CodecError> {
        if buf.len() < len {
            return Err(CodecError::ShortBuffer { expected: len, actual: buf.len() });
        }
        Ok(Self { cursor: &buf[..len], precision })
    }

    pub fn get_float(&mut self) -> f64 {
        match self.precision {
            Precision::Single => self.cursor.get_f32_ne() as f64,
            Precision::Double => self.cursor.get_f64_ne(),
        }
    }

    pub fn get_floats(&mut self, out: &mut [f64]) {
        for v in out.iter_mut() {
            *v = self.get_float();
        }
    }

    pub fn get_i32(&mut self) -> i32 {
        self.cursor.get_i32_ne()
    }

    pub fn get_u32(&mut self) -> u32 {
        self.cursor.get_u32_ne()
    }

    pub fn get_f32(&mut self) -> f32 {
        self.cursor.get_f32_ne()
    }

    pub fn get_u64(&mut self) -> u64 {
        self.cursor.get_u64_ne()
    }

    pub fn get_key(&mut self, width: KeyWidth) -> SpatialKey {
        match width {
            KeyWidth::Narrow => SpatialKey(self.cursor.get_u64_ne() as u128),
            KeyWidth::Wide => SpatialKey(self.cursor.get_u128_ne()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.cursor.len()
    }
}

// --- Body (shared with the persisted codec) ---

/// Size of the record body for a layout and precision.
pub fn body_size(attributes: &AttributeLayout, precision: Precision) -> usize {
    let p = precision.width();
    // mass, pos, vel, pot
    8 * p + 4 * attributes.integer + p * attributes.float
}

pub(crate) fn check_attributes(p: &Particle, attributes: &AttributeLayout) -> Result<(), CodecError> {
    if p.fits(attributes) {
        Ok(())
    } else {
        Err(CodecError::AttributeMismatch {
            expected: (attributes.integer, attributes.float),
            found: (p.iattr.len(), p.dattr.len()),
        })
    }
}

pub(crate) fn write_body(w: &mut RecordWriter<'_>, p: &Particle) {
    w.put_float(p.mass);
    w.put_floats(&p.pos);
    w.put_floats(&p.vel);
    w.put_float(p.total_potential());
    for &i in &p.iattr {
        w.put_i32(i);
    }
    w.put_floats(&p.dattr);
}

/// Reads a body into `out`, whose attribute vectors must already be sized.
/// The external potential is reset since it is recomputed after a load.
pub(crate) fn read_body(r: &mut RecordReader<'_>, out: &mut Particle) {
    out.mass = r.get_float();
    r.get_floats(&mut out.pos);
    r.get_floats(&mut out.vel);
    out.pot = r.get_float();
    out.potext = 0.0;
    for i in out.iattr.iter_mut() {
        *i = r.get_i32();
    }
    r.get_floats(&mut out.dattr);
}

// --- In-flight record layout ---

/// Layout of the in-flight record exchanged between ranks. Computed once
/// from the run's attribute counts and the negotiated widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    attributes: AttributeLayout,
    precision: Precision,
    key_width: KeyWidth,
    index_offset: Option<usize>,
    cell_offset: usize,
    key_offset: usize,
    size: usize,
}

impl RecordLayout {
    pub fn new(
        attributes: AttributeLayout,
        precision: Precision,
        key_width: KeyWidth,
        with_index: bool,
    ) -> Self {
        // level, dtreq, scale, effort
        let mut offset = body_size(&attributes, precision) + 4 * 4;
        let index_offset = if with_index {
            let at = offset;
            offset += 8;
            Some(at)
        } else {
            None
        };
        let cell_offset = offset;
        offset += 4;
        let key_offset = offset;
        offset += key_width.width();

        Self {
            attributes,
            precision,
            key_width,
            index_offset,
            cell_offset,
            key_offset,
            size: offset,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn attributes(&self) -> &AttributeLayout {
        &self.attributes
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn key_width(&self) -> KeyWidth {
        self.key_width
    }

    pub fn has_index(&self) -> bool {
        self.index_offset.is_some()
    }

    pub fn index_offset(&self) -> Option<usize> {
        self.index_offset
    }

    pub fn cell_offset(&self) -> usize {
        self.cell_offset
    }

    pub fn key_offset(&self) -> usize {
        self.key_offset
    }

    /// Encodes `p` into the first `size()` bytes of `out`. `seq` and `key`,
    /// when given, replace the particle's own index and key in the record.
    pub fn encode(
        &self,
        p: &Particle,
        seq: Option<u64>,
        key: Option<SpatialKey>,
        out: &mut [u8],
    ) -> Result<(), CodecError> {
        check_attributes(p, &self.attributes)?;
        let mut w = RecordWriter::new(out, self.size, self.precision)?;
        write_body(&mut w, p);
        w.put_u32(p.level);
        w.put_f32(p.dtreq);
        w.put_f32(p.scale);
        w.put_f32(p.effort());
        if self.index_offset.is_some() {
            w.put_u64(seq.unwrap_or(p.indx));
        }
        w.put_u32(p.tree);
        w.put_key(key.unwrap_or(p.key), self.key_width)?;
        debug_assert_eq!(w.remaining(), 0);
        Ok(())
    }

    /// Decodes the first `size()` bytes of `bytes` into `out`, reusing its
    /// attribute storage. Fields not carried on the wire are reset.
    pub fn decode_into(&self, bytes: &[u8], out: &mut Particle) -> Result<(), CodecError> {
        let mut r = RecordReader::new(bytes, self.size, self.precision)?;
        out.conform(&self.attributes);
        read_body(&mut r, out);
        out.acc = [0.0; 3];
        out.level = r.get_u32();
        out.dtreq = r.get_f32();
        out.scale = r.get_f32();
        out.set_effort(r.get_f32());
        out.indx = if self.index_offset.is_some() { r.get_u64() } else { 0 };
        out.tree = r.get_u32();
        out.key = r.get_key(self.key_width);
        out.skey = SpeciesKey::DEFAULT;
        Ok(())
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Particle, CodecError> {
        let mut p = Particle::new(&self.attributes);
        self.decode_into(bytes, &mut p)?;
        Ok(p)
    }

    /// Reads the cell id of the record starting at `record[0]`.
    pub fn read_cell(&self, record: &[u8]) -> Result<u32, CodecError> {
        let end = self.cell_offset + 4;
        let mut field = record
            .get(self.cell_offset..end)
            .ok_or(CodecError::ShortBuffer { expected: end, actual: record.len() })?;
        Ok(field.get_u32_ne())
    }

    /// Reads the spatial key of the record starting at `record[0]`.
    pub fn read_key(&self, record: &[u8]) -> Result<SpatialKey, CodecError> {
        let end = self.key_offset + self.key_width.width();
        let mut field = record
            .get(self.key_offset..end)
            .ok_or(CodecError::ShortBuffer { expected: end, actual: record.len() })?;
        Ok(match self.key_width {
            KeyWidth::Narrow => SpatialKey(field.get_u64_ne() as u128),
            KeyWidth::Wide => SpatialKey(field.get_u128_ne()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(attributes: &AttributeLayout) -> Particle {
        let mut p = Particle::new(attributes)
            .with_state(2.5, [1.0, -2.0, 3.0], [0.5, 0.25, -0.125])
            .with_index(42);
        p.acc = [9.0, 9.0, 9.0];
        p.pot = -1.5;
        p.potext = -0.5;
        p.iattr.iter_mut().enumerate().for_each(|(i, v)| *v = i as i32 * 3 - 1);
        p.dattr.iter_mut().enumerate().for_each(|(i, v)| *v = i as f64 * 0.5);
        p.level = 3;
        p.dtreq = 0.01;
        p.scale = 0.2;
        p.set_effort(4.0);
        p.tree = 77;
        p.key = SpatialKey(0xdead_beef);
        p
    }

    #[test]
    fn table_sizes() {
        let a = AttributeLayout::new(2, 3);
        let l = RecordLayout::new(a, Precision::Double, KeyWidth::Narrow, true);
        assert_eq!(l.size(), 8 * 8 + 2 * 4 + 3 * 8 + 16 + 8 + 4 + 8);
        let l = RecordLayout::new(a, Precision::Single, KeyWidth::Wide, false);
        assert_eq!(l.size(), 8 * 4 + 2 * 4 + 3 * 4 + 16 + 4 + 16);
        assert_eq!(l.index_offset(), None);
        assert_eq!(l.key_offset(), l.cell_offset() + 4);
    }

    #[test]
    fn in_flight_record_keeps_identity() {
        let a = AttributeLayout::new(2, 2);
        let l = RecordLayout::new(a, Precision::Double, KeyWidth::Narrow, true);
        let p = sample(&a);
        let mut buf = vec![0u8; l.size()];
        l.encode(&p, None, None, &mut buf).unwrap();

        let q = l.decode(&buf).unwrap();
        assert_eq!(q.mass, p.mass);
        assert_eq!(q.pos, p.pos);
        assert_eq!(q.pot, -2.0);
        assert_eq!(q.potext, 0.0);
        assert_eq!(q.acc, [0.0; 3]);
        assert_eq!(q.iattr, p.iattr);
        assert_eq!(q.dattr, p.dattr);
        assert_eq!(q.level, 3);
        assert_eq!(q.effort(), 4.0);
        assert_eq!(q.indx, 42);
        assert_eq!(q.tree, 77);
        assert_eq!(q.key, p.key);
        assert_eq!(l.read_key(&buf).unwrap(), p.key);
        assert_eq!(l.read_cell(&buf).unwrap(), 77);
    }

    #[test]
    fn relabel_overrides_index_and_key() {
        let a = AttributeLayout::default();
        let l = RecordLayout::new(a, Precision::Single, KeyWidth::Wide, true);
        let p = sample(&a);
        let mut buf = vec![0u8; l.size()];
        let wide = SpatialKey(1u128 << 100);
        l.encode(&p, Some(9), Some(wide), &mut buf).unwrap();
        let q = l.decode(&buf).unwrap();
        assert_eq!(q.indx, 9);
        assert_eq!(q.key, wide);
    }

    #[test]
    fn narrow_key_overflow_is_rejected() {
        let a = AttributeLayout::default();
        let l = RecordLayout::new(a, Precision::Double, KeyWidth::Narrow, false);
        let mut p = sample(&a);
        p.key = SpatialKey(1u128 << 70);
        let mut buf = vec![0u8; l.size()];
        assert!(matches!(
            l.encode(&p, None, None, &mut buf),
            Err(CodecError::KeyOverflow { bits: 64, .. })
        ));
    }

    #[test]
    fn short_buffers_fail_without_panicking() {
        let a = AttributeLayout::new(1, 1);
        let l = RecordLayout::new(a, Precision::Double, KeyWidth::Narrow, true);
        let p = sample(&a);
        let mut small = vec![0u8; l.size() - 1];
        assert!(matches!(
            l.encode(&p, None, None, &mut small),
            Err(CodecError::ShortBuffer { .. })
        ));
        assert!(matches!(l.decode(&small), Err(CodecError::ShortBuffer { .. })));
        assert!(l.read_key(&small[..l.key_offset()]).is_err());
    }

    #[test]
    fn attribute_mismatch_is_rejected() {
        let l = RecordLayout::new(AttributeLayout::new(2, 0), Precision::Double, KeyWidth::Narrow, true);
        let p = sample(&AttributeLayout::new(1, 0));
        let mut buf = vec![0u8; l.size()];
        assert!(matches!(
            l.encode(&p, None, None, &mut buf),
            Err(CodecError::AttributeMismatch { expected: (2, 0), found: (1, 0) })
        ));
    }
}
