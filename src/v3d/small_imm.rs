//! The v3d small-immediate encoding.
//!
//! A 6-bit field in the instruction word holds selected constants directly:
//!
//! ```text
//!   0..15   ->  0..15
//!   16..31  -> -16..-1
//!   32..39  ->  1.0, 2.0, 4.0, ... 128.0     (2^0 .. 2^7)
//!   40..47  ->  1/256, 1/128, ... 1/2        (2^-8 .. 2^-1)
//! ```
//!
//! Anything else must be synthesised by the encoder; see
//! [`crate::v3d::encode`].

/// A value representable as a v3d small immediate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmallImmValue {
    Int(i32),
    Float(f32),
}

impl std::fmt::Display for SmallImmValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmallImmValue::Int(i) => write!(f, "{i}"),
            SmallImmValue::Float(x) => write!(f, "{x}"),
        }
    }
}

/// Integers representable directly.
pub fn int_to_opcode_value(v: i32) -> Option<i32> {
    if (-16..=15).contains(&v) {
        Some(v)
    } else {
        None
    }
}

/// Floats representable directly: powers of two from 2^-8 up to 2^7.
pub fn float_to_opcode_value(v: f32) -> Option<f32> {
    for k in 0..8 {
        if v == (1u32 << k) as f32 {
            return Some(v);
        }
    }
    for k in 1..=8u32 {
        if v == 1.0 / (1u32 << k) as f32 {
            return Some(v);
        }
    }
    None
}

/// Encode a small-immediate value into the 6-bit field.
pub fn to_raddr(v: SmallImmValue) -> Option<u8> {
    match v {
        SmallImmValue::Int(i) => {
            int_to_opcode_value(i)?;
            if i >= 0 {
                Some(i as u8)
            } else {
                Some((32 + i) as u8)
            }
        }
        SmallImmValue::Float(f) => {
            for k in 0..8u8 {
                if f == (1u32 << k) as f32 {
                    return Some(32 + k);
                }
            }
            for k in 0..8u8 {
                if f == 1.0 / (1u32 << (8 - k)) as f32 {
                    return Some(40 + k);
                }
            }
            None
        }
    }
}

/// Decode a 6-bit field value back to the constant it denotes.
pub fn from_raddr(code: u8) -> Option<SmallImmValue> {
    match code {
        0..=15 => Some(SmallImmValue::Int(code as i32)),
        16..=31 => Some(SmallImmValue::Int(code as i32 - 32)),
        32..=39 => Some(SmallImmValue::Float((1u32 << (code - 32)) as f32)),
        40..=47 => Some(SmallImmValue::Float(1.0 / (1u32 << (48 - code)) as f32)),
        _ => None,
    }
}
