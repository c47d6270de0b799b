//! Numeric precision descriptors.
//!
//! A `Precision` is the per-element storage format of a tensor buffer:
//! 8/16/32-bit signed/unsigned integers, IEEE-754 f32, and bf16 (f32 with
//! the low 16 mantissa bits dropped). Immutable, compared by value.

use std::fmt;

/// Element precision of a memory buffer or register lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    F32,
    I32,
    Bf16,
    I16,
    U16,
    I8,
    U8,
}

impl Precision {
    /// Byte width of one element.
    #[inline]
    pub fn size(&self) -> usize {
        match self {
            Precision::F32 | Precision::I32 => 4,
            Precision::Bf16 | Precision::I16 | Precision::U16 => 2,
            Precision::I8 | Precision::U8 => 1,
        }
    }

    /// Whether the format is a floating-point representation.
    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, Precision::F32 | Precision::Bf16)
    }

    /// Whether integer values carry a sign bit. Floats report true.
    #[inline]
    pub fn is_signed(&self) -> bool {
        !matches!(self, Precision::U16 | Precision::U8)
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Precision::F32 => "f32",
            Precision::I32 => "i32",
            Precision::Bf16 => "bf16",
            Precision::I16 => "i16",
            Precision::U16 => "u16",
            Precision::I8 => "i8",
            Precision::U8 => "u8",
        };
        f.write_str(s)
    }
}
