//! Device result to output mapping.
//!
//! | Property kind | Output |
//! |---------------|--------|
//! | Integer, Number | `Integer` (truncated to 32 bits) |
//! | Boolean | `Boolean` |
//! | String | `String` |
//! | Unknown | `Null` (kept, never omitted) |
//!
//! Keys are property names with every `.` rewritten to `_`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::{DeviceResult, PropertyValue};

/// Output value handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    /// Integer.
    Integer(i64),
    /// Boolean.
    Boolean(bool),
    /// String.
    String(String),
    /// Explicit null.
    Null,
}

impl OutputValue {
    /// Whether this is the explicit null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer payload, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean payload, if any.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// String payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Sanitized property name → output value.
pub type PropertyMap = BTreeMap<String, OutputValue>;

/// Rewrite every `.` in a property name to `_`.
pub fn sanitize_name(name: &str) -> String {
    let mut owned = name.to_owned();
    if owned.contains('.') {
        owned = owned.replace('.', "_");
    }
    owned
}

/// Narrow an engine integer the way the host binding always has: the
/// value is cut to 32 bits and wraps.
// FIXME: wide integers wrap and fractional numbers lose precision; kept
// until callers stop depending on the legacy output.
pub fn truncate_integer(value: i64) -> i64 {
    i64::from(value as i32)
}

/// Convert one property value.
pub fn to_output(value: &PropertyValue) -> OutputValue {
    match value {
        PropertyValue::Integer(n) => OutputValue::Integer(truncate_integer(*n)),
        PropertyValue::Number(x) => OutputValue::Integer(truncate_integer(*x as i64)),
        PropertyValue::Boolean(b) => OutputValue::Boolean(*b),
        PropertyValue::String(s) => OutputValue::String(s.clone()),
        PropertyValue::Unknown => OutputValue::Null,
    }
}

/// Map every property of a device result, then close it.
///
/// Properties are visited in engine order; when two names sanitize to the
/// same key the later one wins.
pub fn map_device(device: DeviceResult) -> PropertyMap {
    let mut output = PropertyMap::new();
    for property in device.iter() {
        output.insert(sanitize_name(&property.name), to_output(&property.value));
    }
    device.close();
    output
}
