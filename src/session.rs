//! Atlas session: one loaded dataset and its lifecycle.
//!
//! ## States
//!
//! ```text
//!            load_from_file (ok)
//!   Empty ───────────────────────▶ Loaded ──┐ load_from_file (release + reload)
//!     ▲                              │  ▲   │ set_config (v2: live re-apply)
//!     └──────── release / drop ──────┘  └───┘
//! ```
//!
//! The handle and the blob it was opened from live in one `LoadedAtlas`, so
//! they are present or absent together. A reload drops the previous pair
//! before compiling the new file; a session never holds two live handles.
//!
//! Metadata reads on an empty session return `None` instead of failing.
//! Sessions are single-owner: mutation goes through `&mut self`, so
//! concurrent use needs external serialization.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ApplyReport, AtlasConfig, OptionValue};
use crate::engine::{AtlasEngine, AtlasHandle, PropertyDecl, SchemaVersion};
use crate::error::{AtlasError, EngineError};
use crate::evidence::{build_evidence, EvidenceInput};
use crate::host::{parse_config_arg, parse_evidence_args, HostValue};
use crate::result::{map_device, PropertyMap};

/// A loaded dataset: open handle, backing blob and cached metadata.
struct LoadedAtlas<H: AtlasHandle> {
    handle: H,
    blob: Vec<u8>,
    instance_id: Uuid,
    source_path: PathBuf,
    creation: i64,
    version: String,
    revision: Option<i64>,
}

impl<H: AtlasHandle> LoadedAtlas<H> {
    fn close(mut self) {
        self.handle.close();
        debug!(
            instance = %self.instance_id,
            path = %self.source_path.display(),
            blob_bytes = self.blob.len(),
            "atlas released"
        );
    }
}

/// Session over one dataset at a time.
pub struct AtlasSession<E: AtlasEngine> {
    engine: E,
    config: AtlasConfig,
    extra: Vec<PropertyDecl>,
    atlas: Option<LoadedAtlas<E::Handle>>,
}

impl<E: AtlasEngine> AtlasSession<E> {
    /// Empty session with the schema's default configuration.
    pub fn new(engine: E) -> Self {
        let config = AtlasConfig::defaults_for(engine.schema_version());
        Self::with_config(engine, config)
    }

    /// Empty session with a starting configuration.
    ///
    /// A configuration for another schema is replaced by the engine's
    /// defaults.
    pub fn with_config(engine: E, config: AtlasConfig) -> Self {
        let schema = engine.schema_version();
        let config = if config.schema_version() == schema {
            config
        } else {
            warn!(
                engine = %schema,
                config = %config.schema_version(),
                "configuration schema mismatch, using defaults"
            );
            AtlasConfig::defaults_for(schema)
        };
        Self {
            engine,
            config,
            extra: Vec::new(),
            atlas: None,
        }
    }

    /// Declare extra properties passed to the engine at the next open.
    pub fn with_extra_properties(mut self, extra: Vec<PropertyDecl>) -> Self {
        self.extra = extra;
        self
    }

    /// Engine schema version.
    pub fn schema_version(&self) -> SchemaVersion {
        self.engine.schema_version()
    }

    /// The engine behind this session.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Current configuration.
    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    /// Whether a dataset is loaded.
    pub fn is_loaded(&self) -> bool {
        self.atlas.is_some()
    }

    /// Open handle, if loaded.
    pub fn handle(&self) -> Option<&E::Handle> {
        self.atlas.as_ref().map(|atlas| &atlas.handle)
    }

    /// Apply a host mapping of options.
    ///
    /// Fails only when `options` is not a mapping; unknown keys and badly
    /// typed values are skipped.
    pub fn set_config(&mut self, options: &HostValue) -> Result<bool, AtlasError> {
        let entries = parse_config_arg(options)?;
        self.set_options(entries);
        Ok(true)
    }

    /// Apply typed options.
    ///
    /// The new configuration is used at the next open. On schema v2 it is
    /// also pushed into the open dataset.
    pub fn set_options<I, K>(&mut self, entries: I) -> ApplyReport
    where
        I: IntoIterator<Item = (K, Option<OptionValue>)>,
        K: Into<String>,
    {
        let report = self.config.apply(entries);
        if self.schema_version() == SchemaVersion::V2 {
            if let Some(atlas) = self.atlas.as_mut() {
                atlas.handle.apply_config(&self.config);
                debug!(instance = %atlas.instance_id, "configuration re-applied to open atlas");
            }
        }
        report
    }

    /// Load a dataset file, replacing any loaded one.
    ///
    /// Returns `Ok(false)` when the file cannot be opened. Compile or open
    /// failures return [`AtlasError::LoadFailed`]. Either way the session
    /// is empty afterwards.
    pub fn load_from_file(&mut self, path: impl AsRef<Path>) -> Result<bool, AtlasError> {
        let path = path.as_ref();
        self.release();

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "atlas data file not readable");
                return Ok(false);
            }
        };

        let load_failed = |source: EngineError| AtlasError::LoadFailed {
            path: path.to_path_buf(),
            source,
        };

        let blob = self.engine.compile(BufReader::new(file)).map_err(load_failed)?;
        let mut handle = self
            .engine
            .open(&blob, &self.config, &self.extra)
            .map_err(load_failed)?;

        let revision = match self.schema_version() {
            SchemaVersion::V1 => None,
            SchemaVersion::V2 => {
                handle.apply_config(&self.config);
                Some(handle.data_revision().unwrap_or(0))
            }
        };

        let atlas = LoadedAtlas {
            instance_id: Uuid::new_v4(),
            source_path: path.to_path_buf(),
            creation: handle.creation_timestamp(),
            version: handle.data_version(),
            revision,
            handle,
            blob,
        };

        info!(
            instance = %atlas.instance_id,
            path = %path.display(),
            version = %atlas.version,
            created = atlas.creation,
            blob_bytes = atlas.blob.len(),
            "atlas loaded"
        );
        self.atlas = Some(atlas);
        Ok(true)
    }

    /// Resolve properties for typed evidence.
    pub fn get_properties(&self, input: &EvidenceInput) -> Result<PropertyMap, AtlasError> {
        let atlas = self.atlas.as_ref().ok_or(AtlasError::NotLoaded)?;

        let evidence = build_evidence(&atlas.handle, input);
        let device = atlas
            .handle
            .search(evidence.as_slice())
            .map_err(AtlasError::SearchFailed)?;
        let properties = map_device(device);

        debug!(
            evidence = evidence.len(),
            properties = properties.len(),
            "properties resolved"
        );
        Ok(properties)
    }

    /// Resolve properties for host arguments: a user-agent string with
    /// optional client-side properties and accept-language strings, or a
    /// mapping of header-like pairs.
    pub fn get_properties_from_host(&self, args: &[HostValue]) -> Result<PropertyMap, AtlasError> {
        if self.atlas.is_none() {
            return Err(AtlasError::NotLoaded);
        }
        let input = parse_evidence_args(args)?;
        self.get_properties(&input)
    }

    /// Dataset creation time (epoch seconds).
    pub fn creation_timestamp(&self) -> Option<i64> {
        self.atlas.as_ref().map(|atlas| atlas.creation)
    }

    /// Dataset version string.
    pub fn dataset_version(&self) -> Option<&str> {
        self.atlas.as_ref().map(|atlas| atlas.version.as_str())
    }

    /// Dataset revision. `None` when empty or on schema v1.
    pub fn dataset_revision(&self) -> Option<i64> {
        self.atlas.as_ref().and_then(|atlas| atlas.revision)
    }

    /// Path of the loaded data file.
    pub fn source_path(&self) -> Option<&Path> {
        self.atlas.as_ref().map(|atlas| atlas.source_path.as_path())
    }

    /// Size of the compiled blob in bytes.
    pub fn blob_size(&self) -> Option<usize> {
        self.atlas.as_ref().map(|atlas| atlas.blob.len())
    }

    /// Release the loaded dataset. No-op when empty.
    pub fn release(&mut self) {
        if let Some(atlas) = self.atlas.take() {
            atlas.close();
        }
    }

    /// Multi-line diagnostic summary.
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl<E: AtlasEngine> Drop for AtlasSession<E> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<E: AtlasEngine> fmt::Display for AtlasSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let atlas = self.atlas.as_ref();
        let instance = atlas.map_or_else(|| "0x0".to_string(), |a| a.instance_id.to_string());
        let path = atlas.map_or_else(|| "/".to_string(), |a| a.source_path.display().to_string());
        let version = atlas.map_or("/", |a| a.version.as_str());
        let creation = atlas.map_or(0, |a| a.creation);

        writeln!(f)?;
        writeln!(f, "DeviceAtlas instance ({instance})")?;
        writeln!(f, "JSON's loaded in memory: ")?;
        writeln!(f)?;
        writeln!(f, "[")?;
        writeln!(f, "\tpath: {path}")?;
        if self.schema_version() == SchemaVersion::V2 {
            writeln!(f, "\trevision: {}", self.dataset_revision().unwrap_or(0))?;
        }
        match DateTime::<Utc>::from_timestamp(creation, 0).filter(|_| atlas.is_some()) {
            Some(at) => writeln!(f, "\tcreation timestamp: {creation} ({})", at.to_rfc3339())?,
            None => writeln!(f, "\tcreation timestamp: {creation}")?,
        }
        writeln!(f, "\tversion: {version}")?;
        match self.config {
            AtlasConfig::V2 {
                ua_props,
                lang_props,
            } => {
                writeln!(f, "\tuar properties: {ua_props}")?;
                writeln!(f, "\tlang properties: {lang_props}")?;
            }
            AtlasConfig::V1 { cache_size } => {
                writeln!(f, "\tcache size: {cache_size}")?;
            }
        }
        writeln!(f, "]")
    }
}

impl<E: AtlasEngine> fmt::Debug for AtlasSession<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtlasSession")
            .field("schema", &self.schema_version())
            .field("config", &self.config)
            .field("loaded", &self.is_loaded())
            .field("source_path", &self.source_path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::json::JsonAtlasEngine;
    use crate::result::OutputValue;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn dataset(version: &str, created: i64) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "meta": {{ "version": "{version}", "created": {created}, "revision": 4 }},
                "properties": {{ "isRobot": false }},
                "rules": [
                    {{ "evidence": "user-agent", "pattern": "Googlebot",
                       "properties": {{ "isRobot": true, "browser.name": "Googlebot" }} }}
                ]
            }}"#
        )
        .unwrap();
        file
    }

    #[test]
    fn test_new_session_is_empty() {
        let session = AtlasSession::new(JsonAtlasEngine::default());
        assert!(!session.is_loaded());
        assert_eq!(session.creation_timestamp(), None);
        assert_eq!(session.dataset_version(), None);
        assert_eq!(session.dataset_revision(), None);
        assert_eq!(session.source_path(), None);
    }

    #[test]
    fn test_load_and_query() {
        let file = dataset("2.0.0", 1_650_000_000);
        let mut session = AtlasSession::new(JsonAtlasEngine::default());
        assert!(session.load_from_file(file.path()).unwrap());

        assert_eq!(session.dataset_version(), Some("2.0.0"));
        assert_eq!(session.creation_timestamp(), Some(1_650_000_000));
        assert_eq!(session.dataset_revision(), Some(4));
        assert_eq!(session.source_path(), Some(file.path()));

        let props = session
            .get_properties(&EvidenceInput::user_agent("Googlebot/2.1"))
            .unwrap();
        assert_eq!(props["isRobot"], OutputValue::Boolean(true));
        assert_eq!(props["browser_name"], OutputValue::String("Googlebot".into()));
    }

    #[test]
    fn test_query_before_load_fails() {
        let session = AtlasSession::new(JsonAtlasEngine::default());
        let err = session.get_properties(&EvidenceInput::user_agent("ua")).unwrap_err();
        assert!(matches!(err, AtlasError::NotLoaded));

        let err = session.get_properties_from_host(&[json!(42)]).unwrap_err();
        assert!(matches!(err, AtlasError::NotLoaded));
    }

    #[test]
    fn test_missing_file_returns_false() {
        let mut session = AtlasSession::new(JsonAtlasEngine::default());
        assert!(!session.load_from_file("/definitely/not/here.json").unwrap());
        assert!(!session.is_loaded());
    }

    #[test]
    fn test_set_config_requires_mapping() {
        let mut session = AtlasSession::new(JsonAtlasEngine::default());
        assert!(session.set_config(&json!([1, 2])).is_err());
        assert!(session.set_config(&json!({"uaprops": false, "bogus": 1})).unwrap());
        assert!(!session.config().ua_props());
    }

    #[test]
    fn test_with_config_mismatch_falls_back() {
        let session = AtlasSession::with_config(
            JsonAtlasEngine::default(),
            AtlasConfig::V1 { cache_size: 10 },
        );
        assert_eq!(*session.config(), AtlasConfig::defaults_for(SchemaVersion::V2));
    }

    #[test]
    fn test_describe_layout() {
        let session = AtlasSession::new(JsonAtlasEngine::default());
        let text = session.describe();
        assert!(text.starts_with("\nDeviceAtlas instance (0x0)\n"));
        assert!(text.contains("\tpath: /\n"));
        assert!(text.contains("\trevision: 0\n"));
        assert!(text.contains("\tcreation timestamp: 0\n"));
        assert!(text.contains("\tversion: /\n"));
        assert!(text.contains("\tuar properties: true\n"));
        assert!(text.ends_with("\tlang properties: true\n]\n"));

        let v1 = AtlasSession::new(JsonAtlasEngine::new(SchemaVersion::V1));
        let text = v1.describe();
        assert!(!text.contains("revision"));
        assert!(text.contains("\tcache size: 0\n"));
    }

    #[test]
    fn test_describe_loaded() {
        let file = dataset("5.1", 0);
        let mut session = AtlasSession::new(JsonAtlasEngine::default());
        session.load_from_file(file.path()).unwrap();
        let text = session.to_string();
        assert!(!text.contains("(0x0)"));
        assert!(text.contains(&format!("\tpath: {}\n", file.path().display())));
        assert!(text.contains("\tversion: 5.1\n"));
        assert!(text.contains("\trevision: 4\n"));
        assert!(text.contains("\tcreation timestamp: 0 (1970-01-01T00:00:00+00:00)\n"));
    }
}
