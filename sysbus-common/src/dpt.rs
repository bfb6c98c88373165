//! KNX DPT 9.001 two-byte float coding.
//!
//! The heating controller reports temperatures and setpoints as 16-bit
//! words using the KNX "2-octet float" layout:
//!
//! ```text
//!  bit 15   14..11    10..0
//!  +-----+----------+-----------+
//!  |  S  | exponent | mantissa  |
//!  +-----+----------+-----------+
//! ```
//!
//! `value = 0.01 * M * 2^E`, where `M` is the 12-bit two's complement
//! number formed by `S` and the 11 mantissa bits.

use crate::error::{Error, Result};

/// Raw word the controller uses for "no valid value".
pub const INVALID: u16 = 0x7FFF;

/// Largest encodable value.
pub const MAX: f64 = 670_760.96;

/// Smallest encodable value.
pub const MIN: f64 = -671_088.64;

/// Decode a DPT 9.001 word. Returns `None` for the invalid marker.
pub fn decode(raw: u16) -> Option<f64> {
    if raw == INVALID {
        return None;
    }

    let exponent = i32::from((raw >> 11) & 0x0F);
    let mut mantissa = i32::from(raw & 0x07FF);
    if raw & 0x8000 != 0 {
        mantissa -= 2048;
    }

    Some(0.01 * f64::from(mantissa) * f64::from(1u32 << exponent))
}

/// Encode a value as a DPT 9.001 word, picking the smallest exponent that
/// keeps the mantissa in range.
pub fn encode(value: f64) -> Result<u16> {
    if !value.is_finite() || !(MIN..=MAX).contains(&value) {
        return Err(Error::ValueRange(format!(
            "{} is outside the DPT 9.001 range [{}, {}]",
            value, MIN, MAX
        )));
    }

    let hundredths = value * 100.0;
    for exponent in 0u16..=15 {
        let mantissa = (hundredths / f64::from(1u32 << exponent)).round() as i32;
        if (-2048..=2047).contains(&mantissa) {
            let sign = if mantissa < 0 { 0x8000 } else { 0 };
            let bits = (mantissa & 0x07FF) as u16;
            return Ok(sign | (exponent << 11) | bits);
        }
    }

    Err(Error::ValueRange(format!(
        "{} cannot be represented as DPT 9.001",
        value
    )))
}
