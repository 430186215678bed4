//! # device-atlas
//!
//! Session lifecycle and evidence-to-property resolution over a compiled
//! device atlas.
//!
//! A caller configures a session, loads a dataset file, then asks for the
//! properties of the device behind some HTTP evidence (user-agent, client
//! hints, accept-language).
//!
//! ## Architecture
//!
//! ```text
//! caller input → host (shape check) → evidence (EvidenceList, ≤ 26 entries)
//!                                          ↓
//!       AtlasSession ── AtlasEngine::compile/open ── AtlasHandle::search
//!                                          ↓
//!                     DeviceResult → result (PropertyMap, `.` → `_`)
//! ```
//!
//! ## Guarantees
//!
//! - A session holds at most one open handle, always together with its blob
//! - A reload releases the previous dataset before compiling the next one
//! - Metadata reads on an empty session return `None`, never an error
//! - Evidence buffers and device results live for exactly one query

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod host;
pub mod result;
pub mod session;

// Re-exports
pub use config::{ApplyReport, AtlasConfig, OptionValue};
pub use engine::json::{JsonAtlasEngine, JsonAtlasHandle};
pub use engine::{
    AtlasEngine, AtlasHandle, DeviceResult, EvidenceId, Property, PropertyDecl, PropertyId,
    PropertyKind, PropertyValue, SchemaVersion,
};
pub use error::{AtlasError, EngineError};
pub use evidence::{
    build_evidence, build_evidence_with_capacity, EvidenceEntry, EvidenceInput, EvidenceList,
    MAX_EVIDENCE,
};
pub use host::{parse_config_arg, parse_evidence_args, HostValue};
pub use result::{map_device, sanitize_name, OutputValue, PropertyMap};
pub use session::AtlasSession;
