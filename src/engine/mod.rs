//! Detection engine boundary.
//!
//! The session never looks inside a dataset. It talks to an engine through
//! two traits:
//!
//! ```text
//! AtlasEngine::compile(source) → blob
//! AtlasEngine::open(blob, config, extra) → AtlasHandle
//! AtlasHandle::search(evidence[]) → DeviceResult
//! ```
//!
//! [`json::JsonAtlasEngine`] is the bundled reference engine.

pub mod blob;
pub mod json;

use std::fmt;
use std::io::{Read, Seek};

use serde::{Deserialize, Serialize};

use crate::config::AtlasConfig;
use crate::error::EngineError;
use crate::evidence::EvidenceEntry;

/// Major version of the engine.
///
/// Decides the configuration shape and whether a dataset revision exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    /// Cache-size configuration, no revision metadata.
    V1,
    /// UA/language property toggles, revision metadata, live config.
    V2,
}

impl SchemaVersion {
    /// Major version number.
    pub fn major(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Parse a major version number.
    pub fn from_major(major: u8) -> Option<Self> {
        match major {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            _ => None,
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.major())
    }
}

/// Evidence identifier resolved by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EvidenceId(u16);

impl EvidenceId {
    /// Wrap a raw identifier.
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw identifier.
    pub const fn get(self) -> u16 {
        self.0
    }
}

/// Engine-local property identifier.
pub type PropertyId = u32;

/// Kind of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    /// Signed integer.
    Integer,
    /// Real number.
    Number,
    /// Boolean flag.
    Boolean,
    /// String.
    String,
    /// Anything the engine cannot type.
    Unknown,
}

/// Typed property value as reported by an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Signed integer.
    Integer(i64),
    /// Real number.
    Number(f64),
    /// Boolean flag.
    Boolean(bool),
    /// String.
    String(String),
    /// Untyped or unsupported value.
    Unknown,
}

impl PropertyValue {
    /// Kind of this value.
    pub fn kind(&self) -> PropertyKind {
        match self {
            Self::Integer(_) => PropertyKind::Integer,
            Self::Number(_) => PropertyKind::Number,
            Self::Boolean(_) => PropertyKind::Boolean,
            Self::String(_) => PropertyKind::String,
            Self::Unknown => PropertyKind::Unknown,
        }
    }
}

/// One resolved property of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Engine-local identifier.
    pub id: PropertyId,
    /// Dotted property name (e.g. `device.model`).
    pub name: String,
    /// Typed value.
    pub value: PropertyValue,
}

impl Property {
    /// Create a property.
    pub fn new(id: PropertyId, name: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            id,
            name: name.into(),
            value,
        }
    }
}

/// Extra property declared at open time.
///
/// Declared properties always appear in search results; `Unknown` when the
/// dataset does not resolve them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDecl {
    /// Dotted property name.
    pub name: String,
    /// Expected kind.
    pub kind: PropertyKind,
}

impl PropertyDecl {
    /// Declare a property.
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Properties resolved for one query.
///
/// Produced per search and consumed by [`DeviceResult::close`] once mapped.
/// Never cached or shared across queries.
#[derive(Debug, PartialEq)]
pub struct DeviceResult {
    properties: Vec<Property>,
}

impl DeviceResult {
    /// Wrap resolved properties in engine iteration order.
    pub fn new(properties: Vec<Property>) -> Self {
        Self { properties }
    }

    /// Properties in engine iteration order.
    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter()
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether no property was resolved.
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Look up a property by its dotted name.
    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Release the result. Returns how many properties were held.
    pub fn close(self) -> usize {
        let released = self.properties.len();
        tracing::trace!(released, "device result closed");
        released
    }
}

/// A detection engine able to compile and open datasets.
pub trait AtlasEngine {
    /// Open dataset handle.
    type Handle: AtlasHandle;

    /// Schema version the engine speaks.
    fn schema_version(&self) -> SchemaVersion;

    /// Compile a textual dataset into a blob. The blob's length is its size.
    fn compile<R: Read + Seek>(&self, source: R) -> Result<Vec<u8>, EngineError>;

    /// Open a compiled blob with the given configuration.
    fn open(
        &self,
        blob: &[u8],
        config: &AtlasConfig,
        extra: &[PropertyDecl],
    ) -> Result<Self::Handle, EngineError>;
}

/// An open dataset.
///
/// Evidence id lookups return `None` for evidence the dataset cannot use;
/// callers skip those keys.
pub trait AtlasHandle {
    /// Resolve a header name (case-insensitive).
    fn header_evidence_id(&self, name: &str) -> Option<EvidenceId>;

    /// Identifier of the accept-language category.
    fn accept_language_evidence_id(&self) -> Option<EvidenceId>;

    /// Identifier of the client-side properties category.
    fn client_props_evidence_id(&self) -> Option<EvidenceId>;

    /// Resolve a device from evidence.
    fn search(&self, evidence: &[EvidenceEntry]) -> Result<DeviceResult, EngineError>;

    /// Dataset creation time in epoch seconds.
    fn creation_timestamp(&self) -> i64;

    /// Dataset version string.
    fn data_version(&self) -> String;

    /// Dataset revision (schema v2 only).
    fn data_revision(&self) -> Option<i64>;

    /// Apply configuration to the open dataset.
    fn apply_config(&mut self, config: &AtlasConfig);

    /// Release engine resources. Safe to call twice.
    fn close(&mut self);
}
