use thiserror::Error;

/// Errors raised while encoding or decoding particle records.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A particle's attribute vectors don't match the negotiated layout.
    #[error("attribute layout mismatch: expected {expected:?} (integer, float), found {found:?}")]
    AttributeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// Fewer bytes available than one record requires.
    #[error("short buffer: record needs {expected} bytes, {actual} available")]
    ShortBuffer { expected: usize, actual: usize },

    /// A spatial key too wide for the negotiated key width.
    #[error("spatial key {key:#x} does not fit in {bits} bits")]
    KeyOverflow { key: u128, bits: u32 },

    /// A core field of a text record is missing or malformed.
    #[error("malformed text record: field '{field}'")]
    Ascii { field: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
