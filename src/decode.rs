//! Decoding of raw data-block bytes into typed values.
//!
//! S7 controllers expose data blocks as flat byte arrays; the numeric
//! types in them are big-endian per the S7 convention. The decoder is a
//! pure function from (raw bytes, metric descriptor) to a typed value,
//! so it can be tested without a controller on the wire.

use thiserror::Error;

use crate::config::{MetricConfig, ValueType};
use crate::recipe::RECIPE_METRIC;

/// Decode failures. All of them are per-metric and non-fatal to a cycle.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The transport returned fewer bytes than the type requires.
    #[error("metric '{metric}': need {needed} bytes, got {got}")]
    ShortRead {
        metric: String,
        needed: usize,
        got: usize,
    },

    /// The configured type string is not one the decoder knows.
    /// Unlike a short read this never self-heals.
    #[error("metric '{metric}': unsupported data type '{type_name}'")]
    UnsupportedType { metric: String, type_name: String },
}

/// A decoded value, alive for one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Int(i16),
    Float(f32),
    Bool(bool),
    Text(String),
}

impl DecodedValue {
    /// Numeric representation for publishing to a gauge.
    ///
    /// Text passes through only when it is digits-only; anything else
    /// (including signs, exponents, "inf"/"NaN") is `None`.
    pub fn as_gauge(&self) -> Option<f64> {
        match self {
            DecodedValue::Int(v) => Some(f64::from(*v)),
            DecodedValue::Float(v) => Some(f64::from(*v)),
            DecodedValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            DecodedValue::Text(s) => {
                if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                    s.parse().ok()
                } else {
                    None
                }
            }
        }
    }
}

/// Number of bytes the transport must fetch for a metric.
pub fn read_length(metric: &MetricConfig) -> Result<usize, DecodeError> {
    match &metric.value_type {
        ValueType::Int => Ok(2),
        ValueType::Float => Ok(4),
        ValueType::Bool => Ok(1),
        ValueType::Str => Ok(metric.bytes_to_read),
        ValueType::Other(type_name) => Err(DecodeError::UnsupportedType {
            metric: metric.name.clone(),
            type_name: type_name.clone(),
        }),
    }
}

/// Decode a raw read into a typed value.
pub fn decode(raw: &[u8], metric: &MetricConfig) -> Result<DecodedValue, DecodeError> {
    let needed = read_length(metric)?;
    if raw.len() < needed {
        return Err(DecodeError::ShortRead {
            metric: metric.name.clone(),
            needed,
            got: raw.len(),
        });
    }

    match &metric.value_type {
        ValueType::Int => Ok(DecodedValue::Int(i16::from_be_bytes([raw[0], raw[1]]))),
        ValueType::Float => Ok(DecodedValue::Float(f32::from_be_bytes([
            raw[0], raw[1], raw[2], raw[3],
        ]))),
        ValueType::Bool => {
            let bit = metric.offset.bit;
            Ok(DecodedValue::Bool((raw[0] >> bit) & 1 == 1))
        }
        ValueType::Str => {
            let mut text = clean_string(&raw[..needed]);
            if metric.name == RECIPE_METRIC {
                text = drop_first_char(&text);
            }
            Ok(DecodedValue::Text(text))
        }
        ValueType::Other(type_name) => Err(DecodeError::UnsupportedType {
            metric: metric.name.clone(),
            type_name: type_name.clone(),
        }),
    }
}

/// Decode bytes as ISO-8859-1, keep printable characters, trim padding.
///
/// Every byte maps to exactly one Latin-1 code point, so this never fails
/// on arbitrary controller memory. String fields are space- or NUL-padded
/// and occasionally carry leftover garbage past the terminator.
fn clean_string(raw: &[u8]) -> String {
    let cleaned: String = raw
        .iter()
        .map(|&b| b as char)
        .filter(|&c| is_printable(c))
        .collect();
    cleaned.trim().to_string()
}

/// Printable per the Latin-1 range: graphic ASCII, space, and the high
/// range 0xA1-0xFF minus the soft hyphen. Excludes C0/C1 controls, NUL
/// padding, NBSP.
fn is_printable(c: char) -> bool {
    if c == ' ' || c.is_ascii_graphic() {
        return true;
    }
    ('\u{00a1}'..='\u{00ff}').contains(&c) && c != '\u{00ad}'
}

/// Drop the leading character of a recipe string. The first byte of the
/// field is a non-semantic marker in the controller's fixed format.
fn drop_first_char(s: &str) -> String {
    let mut chars = s.chars();
    chars.next();
    chars.as_str().to_string()
}
