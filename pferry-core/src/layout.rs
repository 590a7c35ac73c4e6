use serde::{Deserialize, Serialize};

/// Number of integer and floating auxiliary attributes carried by every
/// particle in a run. Fixed for the lifetime of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttributeLayout {
    #[serde(default)]
    pub integer: usize,
    #[serde(default)]
    pub float: usize,
}

impl AttributeLayout {
    pub fn new(integer: usize, float: usize) -> Self {
        Self { integer, float }
    }
}

/// Width of floating point fields in an encoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 4-byte floats
    Single,
    /// 8-byte floats
    #[default]
    Double,
}

impl Precision {
    /// Size in bytes of one floating field.
    pub fn width(self) -> usize {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }

    pub fn from_width(width: usize) -> Option<Self> {
        match width {
            4 => Some(Precision::Single),
            8 => Some(Precision::Double),
            _ => None,
        }
    }
}

/// Width of the spatial key on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyWidth {
    /// 8-byte key
    #[default]
    Narrow,
    /// 16-byte key for finer resolution
    Wide,
}

impl KeyWidth {
    pub fn width(self) -> usize {
        match self {
            KeyWidth::Narrow => 8,
            KeyWidth::Wide => 16,
        }
    }

    /// Number of key bits representable at this width.
    pub fn bits(self) -> u32 {
        (self.width() * 8) as u32
    }
}
