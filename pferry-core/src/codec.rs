//! Persisted particle record codec.
//!
//! The persisted form carries the phase-space state only: an optional
//! sequence index (always 8 bytes, written first), mass, position, velocity,
//! the combined potential and the auxiliary attributes. Acceleration and
//! time-step metadata are transient and never written. Binary records are
//! strict; text records are lenient about attributes.

use std::io::{self, Read, Write};

use crate::error::CodecError;
use crate::layout::{AttributeLayout, Precision};
use crate::particle::Particle;
use crate::record::{body_size, check_attributes, read_body, write_body, RecordReader, RecordWriter};

/// Values assigned to fields that decoding cannot recover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeDefaults {
    /// Multistep rung given to freshly loaded particles.
    pub level: u32,
}

/// Encoder/decoder bound to a run's attribute layout and float precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    attributes: AttributeLayout,
    precision: Precision,
    defaults: DecodeDefaults,
}

impl Codec {
    pub fn new(attributes: AttributeLayout, precision: Precision) -> Self {
        Self { attributes, precision, defaults: DecodeDefaults::default() }
    }

    pub fn with_defaults(mut self, defaults: DecodeDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn attributes(&self) -> &AttributeLayout {
        &self.attributes
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Length of one binary record. Depends only on the layout, the
    /// precision and whether the index is emitted.
    pub fn record_len(&self, with_index: bool) -> usize {
        let index = if with_index { 8 } else { 0 };
        index + body_size(&self.attributes, self.precision)
    }

    // --- Binary ---

    pub fn encode_binary(&self, p: &Particle, with_index: bool) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![0u8; self.record_len(with_index)];
        self.encode_binary_into(p, with_index, &mut out)?;
        Ok(out)
    }

    /// Encodes into the front of `out`, returning the number of bytes written.
    pub fn encode_binary_into(
        &self,
        p: &Particle,
        with_index: bool,
        out: &mut [u8],
    ) -> Result<usize, CodecError> {
        check_attributes(p, &self.attributes)?;
        let len = self.record_len(with_index);
        let mut w = RecordWriter::new(out, len, self.precision)?;
        if with_index {
            w.put_u64(p.indx);
        }
        write_body(&mut w, p);
        Ok(len)
    }

    /// Decodes one record. When the index isn't recorded the particle
    /// takes `seq` instead.
    pub fn decode_binary(&self, bytes: &[u8], with_index: bool, seq: u64) -> Result<Particle, CodecError> {
        let mut p = Particle::new(&self.attributes);
        self.decode_binary_into(bytes, with_index, seq, &mut p)?;
        Ok(p)
    }

    pub fn decode_binary_into(
        &self,
        bytes: &[u8],
        with_index: bool,
        seq: u64,
        out: &mut Particle,
    ) -> Result<(), CodecError> {
        let mut r = RecordReader::new(bytes, self.record_len(with_index), self.precision)?;
        out.conform(&self.attributes);
        out.indx = if with_index { r.get_u64() } else { seq };
        read_body(&mut r, out);
        out.acc = [0.0; 3];
        out.level = self.defaults.level;
        Ok(())
    }

    /// Writes one binary record to a stream.
    pub fn write_binary<W: Write>(&self, p: &Particle, with_index: bool, out: &mut W) -> Result<usize, CodecError> {
        let bytes = self.encode_binary(p, with_index)?;
        out.write_all(&bytes)?;
        Ok(bytes.len())
    }

    /// Reads one binary record from a stream. Returns `None` on a clean end
    /// of stream and `ShortBuffer` when the stream ends mid-record.
    pub fn read_binary<R: Read>(
        &self,
        input: &mut R,
        with_index: bool,
        seq: u64,
    ) -> Result<Option<Particle>, CodecError> {
        let len = self.record_len(with_index);
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match input.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < len {
            return Err(CodecError::ShortBuffer { expected: len, actual: filled });
        }
        self.decode_binary(&buf, with_index, seq).map(Some)
    }

    // --- Text ---

    /// Formats a particle as one whitespace-delimited line (no newline).
    pub fn encode_ascii(&self, p: &Particle, with_index: bool) -> Result<String, CodecError> {
        check_attributes(p, &self.attributes)?;
        let mut fields = Vec::with_capacity(9 + self.attributes.integer + self.attributes.float);
        if with_index {
            fields.push(p.indx.to_string());
        }
        fields.push(format!("{:e}", p.mass));
        fields.extend(p.pos.iter().chain(p.vel.iter()).map(|v| format!("{:e}", v)));
        fields.push(format!("{:e}", p.total_potential()));
        fields.extend(p.iattr.iter().map(|i| i.to_string()));
        fields.extend(p.dattr.iter().map(|d| format!("{:e}", d)));
        Ok(fields.join(" "))
    }

    /// Parses one text line. Missing or unparsable attributes become 0;
    /// missing or unparsable core fields are an error.
    pub fn decode_ascii(&self, line: &str, with_index: bool, seq: u64) -> Result<Particle, CodecError> {
        let mut tokens = line.split_whitespace();
        let mut p = Particle::new(&self.attributes);

        p.indx = if with_index { core_field(&mut tokens, "index")? } else { seq };
        p.mass = core_field(&mut tokens, "mass")?;
        for v in p.pos.iter_mut() {
            *v = core_field(&mut tokens, "pos")?;
        }
        for v in p.vel.iter_mut() {
            *v = core_field(&mut tokens, "vel")?;
        }
        p.pot = core_field(&mut tokens, "pot")?;
        p.level = self.defaults.level;

        for v in p.iattr.iter_mut() {
            *v = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0);
        }
        for v in p.dattr.iter_mut() {
            *v = tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0.0);
        }
        Ok(p)
    }
}

fn core_field<'a, T, I>(tokens: &mut I, field: &'static str) -> Result<T, CodecError>
where
    T: std::str::FromStr,
    I: Iterator<Item = &'a str>,
{
    tokens
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or(CodecError::Ascii { field })
}
