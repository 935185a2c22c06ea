//! Per-value encoding against a shared exponent.

use crate::BlockFloat;

const EXPONENT_MASK: u32 = 0xff;
const MANTISSA_MASK: u32 = 0x7f_ffff;
const HIDDEN_BIT: u32 = 0x80_0000;
const EXPONENT_BIAS: i32 = 127;

fn biased_exponent(value: f32) -> u32 {
    (value.to_bits() >> 23) & EXPONENT_MASK
}

/// The largest biased exponent in `group`. Zeros and denormals count as 0.
pub fn shared_exponent(group: &[f32]) -> u8 {
    group.iter().map(|&v| biased_exponent(v)).max().unwrap_or(0) as u8
}

/// Encode `value` as `sign | magnitude` in the low `value_bits` bits.
///
/// The 24-bit significand is shifted right by the distance to the shared
/// exponent and rounded half up; values far below the shared exponent and
/// denormals become 0.
pub fn encode_value(value: f32, shared: u8, format: BlockFloat) -> u8 {
    let bits = value.to_bits();
    let exponent = biased_exponent(value);
    if exponent == 0 {
        return 0;
    }
    let significand = (bits & MANTISSA_MASK) | HIDDEN_BIT;
    // One extra bit below the kept mantissa for rounding.
    let shift = (shared as u32).saturating_sub(exponent) + (24 - format.mantissa_bits()) - 1;
    let magnitude = if shift >= 32 {
        0
    } else {
        (((significand >> shift) + 1) >> 1).min(format.max_mantissa())
    };
    if magnitude == 0 {
        return 0;
    }
    let sign = bits >> 31;
    ((sign << format.mantissa_bits()) | magnitude) as u8
}

/// Decode a `sign | magnitude` code: `±m * 2^(shared - 127 - (bits - 1))`.
pub fn decode_value(code: u8, shared: u8, format: BlockFloat) -> f32 {
    let magnitude = code as u32 & format.max_mantissa();
    if shared == 0 || magnitude == 0 {
        return 0.0;
    }
    let scale = shared as i32 - EXPONENT_BIAS - (format.mantissa_bits() as i32 - 1);
    let value = magnitude as f32 * 2f32.powi(scale);
    if (code as u32 >> format.mantissa_bits()) & 1 == 1 {
        -value
    } else {
        value
    }
}
