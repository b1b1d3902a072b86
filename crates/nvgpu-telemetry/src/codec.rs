//! Field value decoding
//!
//! Field query results carry an opaque 8-byte buffer tagged with a value
//! type. This module turns them into `f64` readings, including the packed
//! mantissa/exponent form used by bit-error-rate counters.

use crate::device::{DeviceError, FieldResult};
use thiserror::Error;

/// Value type tags used by the device interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ValueType {
    Double = 0,
    UnsignedInt = 1,
    UnsignedLong = 2,
    UnsignedLongLong = 3,
    SignedLongLong = 4,
    SignedInt = 5,
}

impl ValueType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(ValueType::Double),
            1 => Some(ValueType::UnsignedInt),
            2 => Some(ValueType::UnsignedLong),
            3 => Some(ValueType::UnsignedLongLong),
            4 => Some(ValueType::SignedLongLong),
            5 => Some(ValueType::SignedInt),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

/// Errors decoding a raw field value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported value type: {0}")]
    UnsupportedValueType(u32),

    #[error("truncated buffer: need {needed} bytes, have {available}")]
    TruncatedBuffer { needed: usize, available: usize },

    #[error("value type {0} cannot be read as an unsigned integer")]
    NotAnInteger(u32),

    #[error("field query answered {returned} of {requested} requests")]
    ShortResponse { requested: usize, returned: usize },
}

fn take<const N: usize>(bytes: &[u8]) -> Result<[u8; N], DecodeError> {
    bytes
        .get(..N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(DecodeError::TruncatedBuffer {
            needed: N,
            available: bytes.len(),
        })
}

/// Decode a little-endian tagged value as `f64`.
///
/// Signed 32-bit, unsigned 32-bit, unsigned 64-bit and IEEE-754 double are
/// supported. Signed 64-bit is rejected: its magnitude cannot round-trip
/// through the counters this engine reads.
pub fn decode_f64(tag: u32, bytes: &[u8]) -> Result<f64, DecodeError> {
    match ValueType::from_tag(tag) {
        Some(ValueType::Double) => Ok(f64::from_le_bytes(take::<8>(bytes)?)),
        Some(ValueType::UnsignedInt) => Ok(u32::from_le_bytes(take::<4>(bytes)?) as f64),
        Some(ValueType::SignedInt) => Ok(i32::from_le_bytes(take::<4>(bytes)?) as f64),
        Some(ValueType::UnsignedLong) | Some(ValueType::UnsignedLongLong) => {
            Ok(u64::from_le_bytes(take::<8>(bytes)?) as f64)
        }
        Some(ValueType::SignedLongLong) | None => Err(DecodeError::UnsupportedValueType(tag)),
    }
}

/// Decode an unsigned integer tagged value without going through `f64`
pub fn decode_u64(tag: u32, bytes: &[u8]) -> Result<u64, DecodeError> {
    match ValueType::from_tag(tag) {
        Some(ValueType::UnsignedInt) => Ok(u32::from_le_bytes(take::<4>(bytes)?) as u64),
        Some(ValueType::UnsignedLong) | Some(ValueType::UnsignedLongLong) => {
            Ok(u64::from_le_bytes(take::<8>(bytes)?))
        }
        Some(other) => Err(DecodeError::NotAnInteger(other.tag())),
        None => Err(DecodeError::UnsupportedValueType(tag)),
    }
}

/// Encode a value into the tagged 8-byte form, zero padded
pub fn encode(value_type: ValueType, value: f64) -> [u8; 8] {
    let mut out = [0u8; 8];
    match value_type {
        ValueType::Double => out.copy_from_slice(&value.to_le_bytes()),
        ValueType::UnsignedInt => out[..4].copy_from_slice(&(value as u32).to_le_bytes()),
        ValueType::SignedInt => out[..4].copy_from_slice(&(value as i32).to_le_bytes()),
        ValueType::UnsignedLong | ValueType::UnsignedLongLong => {
            out.copy_from_slice(&(value as u64).to_le_bytes())
        }
        ValueType::SignedLongLong => out.copy_from_slice(&(value as i64).to_le_bytes()),
    }
    out
}

/// Split a packed BER counter into `(mantissa, exponent)`.
///
/// Bits 0-7 hold the exponent, bits 8-11 the mantissa.
pub fn ber_parts(raw: u64) -> (u8, u8) {
    let exponent = (raw & 0xff) as u8;
    let mantissa = ((raw >> 8) & 0xf) as u8;
    (mantissa, exponent)
}

/// `mantissa × 10^(-exponent)`, with mantissa 0 and exponent 0 meaning exactly 0
pub fn ber_value(mantissa: u8, exponent: u8) -> f64 {
    if mantissa == 0 && exponent == 0 {
        return 0.0;
    }
    f64::from(mantissa) / 10f64.powi(i32::from(exponent))
}

/// Decode a packed BER counter
pub fn decode_ber(raw: u64) -> f64 {
    let (mantissa, exponent) = ber_parts(raw);
    ber_value(mantissa, exponent)
}

/// How a field's raw value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpretation {
    /// Plain numeric counter
    Numeric,
    /// Packed mantissa/exponent bit error rate
    BitErrorRate,
    /// Nanosecond counter reported in seconds
    NanosToSeconds,
}

/// Outcome of interpreting one field result
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// A reading to publish
    Value(f64),
    /// The field is absent on this hardware; publish nothing
    NotSupported,
    /// The device returned a per-field error
    Failed(DeviceError),
}

/// Interpret a field result.
///
/// Per-field status is checked before the buffer is touched, so a
/// not-supported field never decodes to a zero reading.
pub fn interpret(result: &FieldResult, interpretation: Interpretation) -> Result<Sample, DecodeError> {
    match result.status {
        Ok(()) => {}
        Err(DeviceError::NotSupported) => return Ok(Sample::NotSupported),
        Err(e) => return Ok(Sample::Failed(e)),
    }

    let value = match interpretation {
        Interpretation::Numeric => decode_f64(result.value_type, &result.value)?,
        Interpretation::BitErrorRate => decode_ber(decode_u64(result.value_type, &result.value)?),
        Interpretation::NanosToSeconds => decode_f64(result.value_type, &result.value)? / 1e9,
    };
    Ok(Sample::Value(value))
}
