//! Deterministic JSON encoding used for every hash input.
//!
//! The canonical form is the unique byte representation of a value:
//!
//! - UTF-8 JSON with object keys sorted lexicographically by code point
//! - compact separators (no whitespace)
//! - arrays preserve input order
//! - integers are emitted as decimal; floats keep their shortest
//!   round-trip representation and must be finite
//! - strings use strict JSON escaping with `\uXXXX` for all control
//!   characters below U+0020
//!
//! Timestamps never reach this module as native types: they are formatted
//! to RFC 3339 UTC microsecond strings before serialization (see
//! [`crate::time`]), so canonicalization only ever sees strings.
//!
//! Failure is deterministic: the same input value always produces the same
//! [`CanonicalError`].

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Canonicalization profile version recorded in the dcl-config lock.
pub const CANONICALIZATION_VERSION: &str = "1.0";

/// Maximum nesting depth accepted for canonicalization.
pub const MAX_DEPTH: usize = 128;

/// Errors that can occur while producing canonical bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// A non-finite number (`NaN`, `Infinity`) was encountered.
    #[error("invalid value: non-finite numbers cannot be canonicalized")]
    NonFiniteNumber,

    /// The value nests deeper than [`MAX_DEPTH`] levels.
    #[error("invalid value: nesting exceeds {max_depth} levels")]
    MaxDepthExceeded {
        /// The limit that was exceeded.
        max_depth: usize,
    },

    /// The value could not be converted to a JSON tree.
    #[error("invalid value: {message}")]
    Serialize {
        /// Description of the conversion failure.
        message: String,
    },
}

/// Produces the canonical string form of a JSON value.
///
/// Semantically equal values produce byte-identical output regardless of
/// object key insertion order.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value contains a non-finite number or
/// nests deeper than [`MAX_DEPTH`] levels.
pub fn canonical_string(value: &Value) -> Result<String, CanonicalError> {
    let mut output = String::new();
    emit_value(value, &mut output, 0)?;
    Ok(output)
}

/// Produces the canonical UTF-8 bytes of a JSON value.
///
/// # Errors
///
/// Same failure modes as [`canonical_string`].
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    canonical_string(value).map(String::into_bytes)
}

/// Serializes any serde value to a JSON tree and canonicalizes it.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialize`] if the value cannot be represented
/// as JSON, plus the failure modes of [`canonical_string`].
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let tree = serde_json::to_value(value).map_err(|e| CanonicalError::Serialize {
        message: e.to_string(),
    })?;
    canonical_string(&tree)
}

/// Returns true if the input string already is canonical JSON.
#[must_use]
pub fn is_canonical(input: &str) -> bool {
    serde_json::from_str::<Value>(input)
        .ok()
        .and_then(|v| canonical_string(&v).ok())
        .is_some_and(|canonical| canonical == input)
}

fn emit_value(value: &Value, output: &mut String, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }
    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(b) => output.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => emit_number(n, output)?,
        Value::String(s) => emit_string(s, output),
        Value::Array(arr) => {
            output.push('[');
            for (i, item) in arr.iter().enumerate() {
                if i > 0 {
                    output.push(',');
                }
                emit_value(item, output, depth + 1)?;
            }
            output.push(']');
        },
        Value::Object(obj) => emit_object(obj, output, depth)?,
    }
    Ok(())
}

/// Emits a number, keeping the integer/float distinction intact.
///
/// Integers go out as plain decimal. Floats use `serde_json`'s shortest
/// round-trip formatting, which is deterministic for a given bit pattern.
fn emit_number(n: &Number, output: &mut String) -> Result<(), CanonicalError> {
    if let Some(i) = n.as_i64() {
        let _ = write!(output, "{i}");
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        let _ = write!(output, "{u}");
        return Ok(());
    }
    match n.as_f64() {
        Some(f) if f.is_finite() => {
            let _ = write!(output, "{n}");
            Ok(())
        },
        _ => Err(CanonicalError::NonFiniteNumber),
    }
}

/// Emits a string with strict escaping: `"`, `\`, the short escapes for
/// backspace/formfeed/newline/return/tab, and `\uXXXX` for every other
/// control character below U+0020.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\u{0008}' => output.push_str("\\b"),
            '\u{000C}' => output.push_str("\\f"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(output, "\\u{:04x}", c as u32);
            },
            c => output.push(c),
        }
    }
    output.push('"');
}

fn emit_object(
    obj: &Map<String, Value>,
    output: &mut String,
    depth: usize,
) -> Result<(), CanonicalError> {
    let mut sorted_keys: Vec<&String> = obj.keys().collect();
    sorted_keys.sort();

    output.push('{');
    for (i, key) in sorted_keys.iter().enumerate() {
        if i > 0 {
            output.push(',');
        }
        emit_string(key, output);
        output.push(':');
        emit_value(&obj[*key], output, depth + 1)?;
    }
    output.push('}');
    Ok(())
}
