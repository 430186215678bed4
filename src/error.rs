//! Error types for atlas sessions and the engine boundary.
//!
//! Only user input errors, fatal load errors and search failures surface as
//! [`AtlasError`]. An unopenable data file, reads on an unloaded session and
//! unresolvable evidence keys are absorbed into `false`/`None` results.

use std::path::PathBuf;

/// Status reported by a detection engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Reading or seeking the source stream failed.
    #[error("system error: {0}")]
    Sys(String),

    /// The dataset source could not be parsed.
    #[error("dataset syntax error: {0}")]
    Syntax(String),

    /// The blob is truncated or carries an unknown layout.
    #[error("invalid atlas format: {0}")]
    Format(String),

    /// The blob payload does not match its checksum.
    #[error("atlas checksum mismatch: expected {expected:016x}, found {found:016x}")]
    Checksum {
        /// Checksum recorded in the blob header.
        expected: u64,
        /// Checksum computed over the payload.
        found: u64,
    },

    /// The blob was compiled for another schema version.
    #[error("atlas schema version {found} is not supported (engine is v{expected})")]
    Version {
        /// Major version the engine speaks.
        expected: u8,
        /// Major version found in the blob.
        found: u8,
    },

    /// The handle was closed before use.
    #[error("atlas handle is closed")]
    Closed,

    /// An argument handed to the engine was rejected.
    #[error("invalid engine argument: {0}")]
    InvalidArgument(String),
}

/// Caller-facing error for session operations.
#[derive(Debug, thiserror::Error)]
pub enum AtlasError {
    /// Wrong argument shape for a session call.
    #[error("{0}")]
    InvalidArgument(String),

    /// A query was made before any dataset was loaded.
    #[error("data file needs to be loaded")]
    NotLoaded,

    /// Compiling or opening the dataset failed. The session is left empty.
    #[error("error loading {} file", path.display())]
    LoadFailed {
        /// Path that was being loaded.
        path: PathBuf,
        /// Engine status behind the failure.
        #[source]
        source: EngineError,
    },

    /// The engine failed to resolve the evidence.
    #[error("error getting properties")]
    SearchFailed(#[source] EngineError),
}

impl AtlasError {
    /// Build an [`AtlasError::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_failed_names_path() {
        let err = AtlasError::LoadFailed {
            path: PathBuf::from("/data/atlas.json"),
            source: EngineError::Syntax("eof".to_string()),
        };
        assert_eq!(err.to_string(), "error loading /data/atlas.json file");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_messages_match_host_contract() {
        assert_eq!(AtlasError::NotLoaded.to_string(), "data file needs to be loaded");
        assert_eq!(
            AtlasError::SearchFailed(EngineError::Closed).to_string(),
            "error getting properties"
        );
        assert_eq!(
            AtlasError::invalid_argument("only a table is accepted").to_string(),
            "only a table is accepted"
        );
    }
}
