// ── Fixed-width integer codec ──
//
// Every channel value travels as a signed little-endian integer whose
// width is fixed per channel. Decoding reads the leading `width` bytes
// and ignores anything after them; encoding clamps into range first.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to decode a characteristic value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("expected at least {expected} byte(s), got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// An unsupported width was requested (only 1, 2 and 4 bytes exist).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unsupported integer width: {0} byte(s) (expected 1, 2 or 4)")]
pub struct InvalidWidth(pub u8);

/// Wire width of a channel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IntWidth {
    I8,
    I16,
    #[default]
    I32,
}

impl IntWidth {
    /// Number of bytes on the wire.
    pub const fn bytes(self) -> usize {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
        }
    }

    pub const fn min(self) -> i32 {
        match self {
            Self::I8 => i8::MIN as i32,
            Self::I16 => i16::MIN as i32,
            Self::I32 => i32::MIN,
        }
    }

    pub const fn max(self) -> i32 {
        match self {
            Self::I8 => i8::MAX as i32,
            Self::I16 => i16::MAX as i32,
            Self::I32 => i32::MAX,
        }
    }

    /// Clamp `value` into the representable range of this width.
    pub fn clamp(self, value: i32) -> i32 {
        value.clamp(self.min(), self.max())
    }

    /// Returns `true` if `value` is representable without clamping.
    pub fn fits(self, value: i32) -> bool {
        (self.min()..=self.max()).contains(&value)
    }

    /// Encode `value` (clamped) as little-endian bytes of this width.
    pub fn encode(self, value: i32) -> Bytes {
        // Two's complement: the low bytes of an in-range i32 are the
        // narrow encoding.
        let le = self.clamp(value).to_le_bytes();
        Bytes::copy_from_slice(&le[..self.bytes()])
    }

    /// Decode the leading bytes of `raw` as a signed integer of this width.
    pub fn decode(self, raw: &[u8]) -> Result<i32, DecodeError> {
        let truncated = || DecodeError::Truncated {
            expected: self.bytes(),
            actual: raw.len(),
        };
        match self {
            Self::I8 => {
                let [b0, ..] = raw else {
                    return Err(truncated());
                };
                Ok(i32::from(i8::from_le_bytes([*b0])))
            }
            Self::I16 => {
                let [b0, b1, ..] = raw else {
                    return Err(truncated());
                };
                Ok(i32::from(i16::from_le_bytes([*b0, *b1])))
            }
            Self::I32 => {
                let [b0, b1, b2, b3, ..] = raw else {
                    return Err(truncated());
                };
                Ok(i32::from_le_bytes([*b0, *b1, *b2, *b3]))
            }
        }
    }
}

impl TryFrom<u8> for IntWidth {
    type Error = InvalidWidth;

    fn try_from(bytes: u8) -> Result<Self, Self::Error> {
        match bytes {
            1 => Ok(Self::I8),
            2 => Ok(Self::I16),
            4 => Ok(Self::I32),
            other => Err(InvalidWidth(other)),
        }
    }
}

impl From<IntWidth> for u8 {
    fn from(width: IntWidth) -> Self {
        match width {
            IntWidth::I8 => 1,
            IntWidth::I16 => 2,
            IntWidth::I32 => 4,
        }
    }
}

impl fmt::Display for IntWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I8 => f.write_str("i8"),
            Self::I16 => f.write_str("i16"),
            Self::I32 => f.write_str("i32"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encodes_little_endian() {
        assert_eq!(IntWidth::I32.encode(0x0102_0304).as_ref(), &[4, 3, 2, 1]);
        assert_eq!(IntWidth::I16.encode(-2).as_ref(), &[0xFE, 0xFF]);
        assert_eq!(IntWidth::I8.encode(-1).as_ref(), &[0xFF]);
    }

    #[test]
    fn encode_clamps_out_of_range_values() {
        assert_eq!(IntWidth::I8.encode(300).as_ref(), &[0x7F]);
        assert_eq!(IntWidth::I8.encode(-300).as_ref(), &[0x80]);
        assert_eq!(IntWidth::I16.encode(i32::MAX).as_ref(), &[0xFF, 0x7F]);
    }

    #[test]
    fn decode_sign_extends_narrow_widths() {
        assert_eq!(IntWidth::I8.decode(&[0x80]).unwrap(), -128);
        assert_eq!(IntWidth::I16.decode(&[0x00, 0x80]).unwrap(), -32768);
        assert_eq!(IntWidth::I32.decode(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap(), -1);
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        assert_eq!(IntWidth::I8.decode(&[42, 1, 2, 3]).unwrap(), 42);
    }

    #[test]
    fn decode_rejects_short_input() {
        assert_eq!(
            IntWidth::I32.decode(&[1, 2]),
            Err(DecodeError::Truncated {
                expected: 4,
                actual: 2
            })
        );
        assert!(IntWidth::I8.decode(&[]).is_err());
    }

    #[test]
    fn width_round_trips_through_byte_count() {
        for width in [IntWidth::I8, IntWidth::I16, IntWidth::I32] {
            assert_eq!(IntWidth::try_from(u8::from(width)).unwrap(), width);
        }
        assert_eq!(IntWidth::try_from(3), Err(InvalidWidth(3)));
    }

    #[test]
    fn fits_matches_range() {
        assert!(IntWidth::I8.fits(127));
        assert!(!IntWidth::I8.fits(128));
        assert!(IntWidth::I32.fits(i32::MIN));
    }
}
