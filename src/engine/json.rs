//! Reference engine over JSON datasets.
//!
//! ## Dataset source
//!
//! ```json
//! {
//!   "meta": { "version": "3.2.1", "created": 1700000000, "revision": 12 },
//!   "properties": { "isBrowser": true },
//!   "rules": [
//!     { "evidence": "user-agent", "pattern": "iPhone", "category": "uaprops",
//!       "properties": { "vendor": "Apple", "device.model": "iPhone" } }
//!   ]
//! }
//! ```
//!
//! `properties` are defaults present in every result. Rules run in file
//! order; a rule fires when any evidence entry for its `evidence` matches
//! `pattern`, and its properties override earlier values in place.
//!
//! ## Evidence identifiers
//!
//! | Id | Evidence |
//! |----|----------|
//! | 0 | client-side properties (`clientside`) |
//! | 1 | `accept-language` |
//! | 2.. | entries of [`KNOWN_HEADERS`], in order |

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use xxhash_rust::xxh64::Xxh64;

use super::{
    blob, AtlasEngine, AtlasHandle, DeviceResult, EvidenceId, Property, PropertyDecl, PropertyId,
    PropertyValue, SchemaVersion,
};
use crate::config::AtlasConfig;
use crate::error::EngineError;
use crate::evidence::{EvidenceEntry, ACCEPT_LANGUAGE_KEY, CLIENT_SIDE_KEY};

/// Identifier of the client-side properties category.
pub const CLIENT_PROPS_EVIDENCE: EvidenceId = EvidenceId::new(0);
/// Identifier of the accept-language category.
pub const ACCEPT_LANGUAGE_EVIDENCE: EvidenceId = EvidenceId::new(1);

const FIRST_HEADER_ID: u16 = 2;

/// Header names the engine can use as evidence.
pub const KNOWN_HEADERS: &[&str] = &[
    "user-agent",
    "sec-ch-ua",
    "sec-ch-ua-full-version-list",
    "sec-ch-ua-mobile",
    "sec-ch-ua-model",
    "sec-ch-ua-platform",
    "sec-ch-ua-platform-version",
    "sec-ch-ua-arch",
    "sec-ch-ua-bitness",
    "x-operamini-phone-ua",
    "x-original-user-agent",
    "device-stock-ua",
    "x-device-user-agent",
    "x-skyfire-phone",
    "x-bolt-phone-ua",
    "x-ucbrowser-device-ua",
    "x-ucbrowser-ua",
    "x-wap-profile",
    "profile",
    "x-requested-with",
];

/// Resolve a header name against [`KNOWN_HEADERS`].
pub fn header_id(name: &str) -> Option<EvidenceId> {
    KNOWN_HEADERS
        .iter()
        .position(|h| h.eq_ignore_ascii_case(name))
        .map(|i| EvidenceId::new(FIRST_HEADER_ID + i as u16))
}

/// Property category a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleCategory {
    /// User-agent derived properties.
    #[serde(rename = "uaprops")]
    UaProps,
    /// Language properties.
    #[serde(rename = "lgprops")]
    LangProps,
}

impl RuleCategory {
    fn enabled(self, config: &AtlasConfig) -> bool {
        match self {
            Self::UaProps => config.ua_props(),
            Self::LangProps => config.lang_props(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Source and compiled forms
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DatasetSource {
    meta: SourceMeta,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    rules: Vec<SourceRule>,
}

#[derive(Deserialize)]
struct SourceMeta {
    version: String,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    revision: i64,
}

#[derive(Deserialize)]
struct SourceRule {
    evidence: String,
    pattern: String,
    #[serde(default)]
    category: Option<RuleCategory>,
    #[serde(default)]
    properties: Map<String, Value>,
}

/// Blob payload.
#[derive(Debug, Serialize, Deserialize)]
struct CompiledAtlas {
    version: String,
    created: i64,
    revision: i64,
    names: Vec<String>,
    defaults: Vec<(PropertyId, PropertyValue)>,
    rules: Vec<CompiledRule>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CompiledRule {
    evidence: EvidenceId,
    pattern: String,
    category: Option<RuleCategory>,
    properties: Vec<(PropertyId, PropertyValue)>,
}

#[derive(Default)]
struct NameTable {
    names: Vec<String>,
    ids: BTreeMap<String, PropertyId>,
}

impl NameTable {
    fn intern(&mut self, name: &str) -> PropertyId {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = self.names.len() as PropertyId;
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }
}

fn property_value(value: &Value) -> PropertyValue {
    match value {
        Value::Bool(b) => PropertyValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => PropertyValue::Integer(i),
            (None, Some(x)) => PropertyValue::Number(x),
            (None, None) => PropertyValue::Unknown,
        },
        Value::String(s) => PropertyValue::String(s.clone()),
        Value::Null | Value::Array(_) | Value::Object(_) => PropertyValue::Unknown,
    }
}

fn rule_evidence(name: &str) -> Option<EvidenceId> {
    if name.eq_ignore_ascii_case(ACCEPT_LANGUAGE_KEY) {
        Some(ACCEPT_LANGUAGE_EVIDENCE)
    } else if name.eq_ignore_ascii_case(CLIENT_SIDE_KEY) {
        Some(CLIENT_PROPS_EVIDENCE)
    } else {
        header_id(name)
    }
}

fn compile_dataset(source: DatasetSource) -> Result<CompiledAtlas, EngineError> {
    let mut table = NameTable::default();

    let defaults = source
        .properties
        .iter()
        .map(|(name, value)| (table.intern(name), property_value(value)))
        .collect();

    let mut rules = Vec::with_capacity(source.rules.len());
    for (position, rule) in source.rules.into_iter().enumerate() {
        let evidence = rule_evidence(&rule.evidence).ok_or_else(|| {
            EngineError::Syntax(format!("rule {position}: unknown evidence '{}'", rule.evidence))
        })?;
        Regex::new(&rule.pattern)
            .map_err(|e| EngineError::Syntax(format!("rule {position}: {e}")))?;

        let properties = rule
            .properties
            .iter()
            .map(|(name, value)| (table.intern(name), property_value(value)))
            .collect();

        rules.push(CompiledRule {
            evidence,
            pattern: rule.pattern,
            category: rule.category,
            properties,
        });
    }

    Ok(CompiledAtlas {
        version: source.meta.version,
        created: source.meta.created,
        revision: source.meta.revision,
        names: table.names,
        defaults,
        rules,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime index
// ─────────────────────────────────────────────────────────────────────────────

type Resolved = Vec<(PropertyId, PropertyValue)>;

struct IndexedRule {
    evidence: EvidenceId,
    pattern: Regex,
    category: Option<RuleCategory>,
    properties: Vec<(PropertyId, PropertyValue)>,
}

struct AtlasIndex {
    version: String,
    created: i64,
    revision: i64,
    names: Vec<String>,
    defaults: Resolved,
    rules: Vec<IndexedRule>,
    extra: Vec<PropertyId>,
}

impl AtlasIndex {
    fn build(atlas: CompiledAtlas, extra: &[PropertyDecl]) -> Result<Self, EngineError> {
        let mut rules = Vec::with_capacity(atlas.rules.len());
        for rule in atlas.rules {
            let pattern =
                Regex::new(&rule.pattern).map_err(|e| EngineError::Format(e.to_string()))?;
            rules.push(IndexedRule {
                evidence: rule.evidence,
                pattern,
                category: rule.category,
                properties: rule.properties,
            });
        }

        let mut table = NameTable::default();
        for name in &atlas.names {
            table.intern(name);
        }
        let extra = extra.iter().map(|decl| table.intern(&decl.name)).collect();

        Ok(Self {
            version: atlas.version,
            created: atlas.created,
            revision: atlas.revision,
            names: table.names,
            defaults: atlas.defaults,
            rules,
            extra,
        })
    }

    fn resolve(&self, evidence: &[EvidenceEntry], config: &AtlasConfig) -> Resolved {
        let mut resolved = self.defaults.clone();

        for rule in &self.rules {
            if rule.category.is_some_and(|c| !c.enabled(config)) {
                continue;
            }
            let fired = evidence
                .iter()
                .any(|e| e.id == rule.evidence && rule.pattern.is_match(&e.value));
            if !fired {
                continue;
            }
            for (id, value) in &rule.properties {
                match resolved.iter_mut().find(|(existing, _)| existing == id) {
                    Some(slot) => slot.1 = value.clone(),
                    None => resolved.push((*id, value.clone())),
                }
            }
        }

        for id in &self.extra {
            if !resolved.iter().any(|(existing, _)| existing == id) {
                resolved.push((*id, PropertyValue::Unknown));
            }
        }

        resolved
    }

    fn materialize(&self, resolved: &Resolved) -> DeviceResult {
        DeviceResult::new(
            resolved
                .iter()
                .filter_map(|(id, value)| {
                    self.names
                        .get(*id as usize)
                        .map(|name| Property::new(*id, name.as_str(), value.clone()))
                })
                .collect(),
        )
    }
}

fn evidence_key(evidence: &[EvidenceEntry]) -> u64 {
    let mut hasher = Xxh64::new(0);
    for entry in evidence {
        hasher.update(&entry.id.get().to_le_bytes());
        hasher.update(entry.value.as_bytes());
        hasher.update(&[0xff]);
    }
    hasher.digest()
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine and handle
// ─────────────────────────────────────────────────────────────────────────────

/// Engine compiling and searching JSON datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonAtlasEngine {
    schema: SchemaVersion,
}

impl JsonAtlasEngine {
    /// Engine speaking the given schema version.
    pub fn new(schema: SchemaVersion) -> Self {
        Self { schema }
    }
}

impl Default for JsonAtlasEngine {
    fn default() -> Self {
        Self::new(SchemaVersion::V2)
    }
}

impl AtlasEngine for JsonAtlasEngine {
    type Handle = JsonAtlasHandle;

    fn schema_version(&self) -> SchemaVersion {
        self.schema
    }

    fn compile<R: Read + Seek>(&self, mut source: R) -> Result<Vec<u8>, EngineError> {
        source
            .seek(SeekFrom::Start(0))
            .map_err(|e| EngineError::Sys(e.to_string()))?;
        let mut text = Vec::new();
        source
            .read_to_end(&mut text)
            .map_err(|e| EngineError::Sys(e.to_string()))?;

        let dataset: DatasetSource =
            serde_json::from_slice(&text).map_err(|e| EngineError::Syntax(e.to_string()))?;
        let compiled = compile_dataset(dataset)?;
        tracing::debug!(
            names = compiled.names.len(),
            rules = compiled.rules.len(),
            "dataset compiled"
        );

        blob::encode(self.schema, &compiled)
    }

    fn open(
        &self,
        blob: &[u8],
        config: &AtlasConfig,
        extra: &[PropertyDecl],
    ) -> Result<JsonAtlasHandle, EngineError> {
        if config.schema_version() != self.schema {
            return Err(EngineError::InvalidArgument(format!(
                "{} configuration for a {} engine",
                config.schema_version(),
                self.schema
            )));
        }
        let atlas: CompiledAtlas = blob::decode(blob, self.schema)?;
        let index = AtlasIndex::build(atlas, extra)?;
        Ok(JsonAtlasHandle {
            schema: self.schema,
            index: Some(index),
            config: *config,
            cache: make_cache(config),
        })
    }
}

type SearchCache = RwLock<LruCache<u64, Arc<Resolved>>>;

fn make_cache(config: &AtlasConfig) -> Option<SearchCache> {
    NonZeroUsize::new(config.cache_size() as usize).map(|size| RwLock::new(LruCache::new(size)))
}

/// Open JSON dataset.
pub struct JsonAtlasHandle {
    schema: SchemaVersion,
    index: Option<AtlasIndex>,
    config: AtlasConfig,
    cache: Option<SearchCache>,
}

impl JsonAtlasHandle {
    /// Active configuration.
    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    /// Entries held by the search cache, `None` when caching is off.
    pub fn cache_len(&self) -> Option<usize> {
        self.cache.as_ref().map(|cache| cache.read().len())
    }

    /// Whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.index.is_none()
    }
}

impl AtlasHandle for JsonAtlasHandle {
    fn header_evidence_id(&self, name: &str) -> Option<EvidenceId> {
        header_id(name)
    }

    fn accept_language_evidence_id(&self) -> Option<EvidenceId> {
        Some(ACCEPT_LANGUAGE_EVIDENCE)
    }

    fn client_props_evidence_id(&self) -> Option<EvidenceId> {
        Some(CLIENT_PROPS_EVIDENCE)
    }

    fn search(&self, evidence: &[EvidenceEntry]) -> Result<DeviceResult, EngineError> {
        let index = self.index.as_ref().ok_or(EngineError::Closed)?;

        let resolved = match &self.cache {
            Some(cache) => {
                let key = evidence_key(evidence);
                let cached = cache.write().get(&key).cloned();
                match cached {
                    Some(hit) => hit,
                    None => {
                        let fresh = Arc::new(index.resolve(evidence, &self.config));
                        cache.write().put(key, Arc::clone(&fresh));
                        fresh
                    }
                }
            }
            None => Arc::new(index.resolve(evidence, &self.config)),
        };

        Ok(index.materialize(&resolved))
    }

    fn creation_timestamp(&self) -> i64 {
        self.index.as_ref().map_or(0, |index| index.created)
    }

    fn data_version(&self) -> String {
        self.index
            .as_ref()
            .map(|index| index.version.clone())
            .unwrap_or_default()
    }

    fn data_revision(&self) -> Option<i64> {
        match self.schema {
            SchemaVersion::V1 => None,
            SchemaVersion::V2 => self.index.as_ref().map(|index| index.revision),
        }
    }

    fn apply_config(&mut self, config: &AtlasConfig) {
        if config.schema_version() != self.schema {
            tracing::warn!(schema = %self.schema, "ignoring configuration for another schema");
            return;
        }
        self.config = *config;
        self.cache = make_cache(config);
    }

    fn close(&mut self) {
        if self.index.take().is_some() {
            self.cache = None;
            tracing::debug!("atlas handle closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PropertyKind;
    use std::io::Cursor;

    const DATASET: &str = r#"{
        "meta": { "version": "1.4.2", "created": 1700000000, "revision": 9 },
        "properties": { "isBrowser": false, "displayWidth": 0 },
        "rules": [
            { "evidence": "user-agent", "pattern": "Mozilla",
              "properties": { "isBrowser": true } },
            { "evidence": "user-agent", "pattern": "iPhone", "category": "uaprops",
              "properties": { "vendor": "Apple", "device.model": "iPhone", "displayWidth": 390,
                              "pixelRatio": 3.0, "tags": [] } },
            { "evidence": "accept-language", "pattern": "^fr", "category": "lgprops",
              "properties": { "language": "fr" } },
            { "evidence": "clientside", "pattern": "webgl", "properties": { "webGl": true } }
        ]
    }"#;

    fn open(engine: JsonAtlasEngine, config: AtlasConfig) -> JsonAtlasHandle {
        let blob = engine.compile(Cursor::new(DATASET)).unwrap();
        engine.open(&blob, &config, &[]).unwrap()
    }

    fn evidence(pairs: &[(EvidenceId, &str)]) -> Vec<EvidenceEntry> {
        pairs.iter().map(|(id, v)| EvidenceEntry::new(*id, *v)).collect()
    }

    fn ua(value: &str) -> Vec<EvidenceEntry> {
        evidence(&[(header_id("user-agent").unwrap(), value)])
    }

    #[test]
    fn test_header_ids() {
        assert_eq!(header_id("User-Agent"), Some(EvidenceId::new(2)));
        assert_eq!(header_id("sec-ch-ua"), Some(EvidenceId::new(3)));
        assert_eq!(header_id("x-made-up"), None);
    }

    #[test]
    fn test_compile_is_deterministic() {
        let engine = JsonAtlasEngine::default();
        let a = engine.compile(Cursor::new(DATASET)).unwrap();
        let b = engine.compile(Cursor::new(DATASET)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_compile_rejects_bad_input() {
        let engine = JsonAtlasEngine::default();
        assert!(matches!(engine.compile(Cursor::new("{")), Err(EngineError::Syntax(_))));
        assert!(matches!(
            engine.compile(Cursor::new(r#"{"properties": {}}"#)),
            Err(EngineError::Syntax(_))
        ));

        let bad_regex =
            r#"{"meta":{"version":"1"},"rules":[{"evidence":"user-agent","pattern":"("}]}"#;
        assert!(matches!(engine.compile(Cursor::new(bad_regex)), Err(EngineError::Syntax(_))));

        let bad_header =
            r#"{"meta":{"version":"1"},"rules":[{"evidence":"x-nope","pattern":"a"}]}"#;
        assert!(matches!(engine.compile(Cursor::new(bad_header)), Err(EngineError::Syntax(_))));
    }

    #[test]
    fn test_search_merges_rules_in_order() {
        let handle = open(JsonAtlasEngine::default(), AtlasConfig::defaults_for(SchemaVersion::V2));
        let device = handle
            .search(&ua("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X)"))
            .unwrap();

        let names: Vec<&str> = device.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["displayWidth", "isBrowser", "device.model", "pixelRatio", "tags", "vendor"]
        );
        assert_eq!(device.get("isBrowser"), Some(&PropertyValue::Boolean(true)));
        assert_eq!(device.get("displayWidth"), Some(&PropertyValue::Integer(390)));
        assert_eq!(device.get("pixelRatio"), Some(&PropertyValue::Number(3.0)));
        assert_eq!(device.get("tags"), Some(&PropertyValue::Unknown));
    }

    #[test]
    fn test_special_evidence_categories() {
        let handle = open(JsonAtlasEngine::default(), AtlasConfig::defaults_for(SchemaVersion::V2));
        let device = handle
            .search(&evidence(&[
                (CLIENT_PROPS_EVIDENCE, "bjs.webgl:1"),
                (ACCEPT_LANGUAGE_EVIDENCE, "fr-FR,fr;q=0.9"),
            ]))
            .unwrap();
        assert_eq!(device.get("webGl"), Some(&PropertyValue::Boolean(true)));
        assert_eq!(device.get("language"), Some(&PropertyValue::String("fr".into())));
    }

    #[test]
    fn test_v2_categories_follow_config() {
        let config = AtlasConfig::V2 {
            ua_props: false,
            lang_props: false,
        };
        let mut handle = open(JsonAtlasEngine::default(), config);
        let mut input = ua("iPhone");
        input.push(EvidenceEntry::new(ACCEPT_LANGUAGE_EVIDENCE, "fr"));

        let device = handle.search(&input).unwrap();
        assert_eq!(device.get("vendor"), None);
        assert_eq!(device.get("language"), None);

        handle.apply_config(&AtlasConfig::defaults_for(SchemaVersion::V2));
        let device = handle.search(&input).unwrap();
        assert_eq!(device.get("vendor"), Some(&PropertyValue::String("Apple".into())));
        assert_eq!(device.get("language"), Some(&PropertyValue::String("fr".into())));
    }

    #[test]
    fn test_v1_cache() {
        let engine = JsonAtlasEngine::new(SchemaVersion::V1);
        let handle = open(engine, AtlasConfig::V1 { cache_size: 2 });
        assert_eq!(handle.cache_len(), Some(0));

        let first = handle.search(&ua("iPhone")).unwrap();
        let second = handle.search(&ua("iPhone")).unwrap();
        assert_eq!(first, second);
        assert_eq!(handle.cache_len(), Some(1));

        handle.search(&ua("Android")).unwrap();
        handle.search(&ua("Mozilla")).unwrap();
        assert_eq!(handle.cache_len(), Some(2));

        let uncached = open(engine, AtlasConfig::defaults_for(SchemaVersion::V1));
        assert_eq!(uncached.cache_len(), None);
    }

    #[test]
    fn test_v1_cache_evicts_least_recently_used() {
        let engine = JsonAtlasEngine::new(SchemaVersion::V1);
        let handle = open(engine, AtlasConfig::V1 { cache_size: 2 });
        let cached = |value: &str| {
            handle
                .cache
                .as_ref()
                .unwrap()
                .read()
                .contains(&evidence_key(&ua(value)))
        };

        handle.search(&ua("iPhone")).unwrap();
        handle.search(&ua("Android")).unwrap();
        // A hit makes iPhone the most recent entry.
        handle.search(&ua("iPhone")).unwrap();
        handle.search(&ua("Mozilla")).unwrap();

        assert_eq!(handle.cache_len(), Some(2));
        assert!(cached("iPhone"));
        assert!(cached("Mozilla"));
        assert!(!cached("Android"));
    }

    #[test]
    fn test_revision_only_on_v2() {
        let v2 = open(JsonAtlasEngine::default(), AtlasConfig::defaults_for(SchemaVersion::V2));
        assert_eq!(v2.data_revision(), Some(9));
        assert_eq!(v2.creation_timestamp(), 1_700_000_000);
        assert_eq!(v2.data_version(), "1.4.2");

        let v1 = open(
            JsonAtlasEngine::new(SchemaVersion::V1),
            AtlasConfig::defaults_for(SchemaVersion::V1),
        );
        assert_eq!(v1.data_revision(), None);
    }

    #[test]
    fn test_open_rejects_mismatched_config_and_blob() {
        let engine = JsonAtlasEngine::default();
        let blob = engine.compile(Cursor::new(DATASET)).unwrap();
        let err = engine
            .open(&blob, &AtlasConfig::defaults_for(SchemaVersion::V1), &[])
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        let v1 = JsonAtlasEngine::new(SchemaVersion::V1);
        let err = v1
            .open(&blob, &AtlasConfig::defaults_for(SchemaVersion::V1), &[])
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Version { .. }));
    }

    #[test]
    fn test_extra_properties_always_present() {
        let engine = JsonAtlasEngine::default();
        let blob = engine.compile(Cursor::new(DATASET)).unwrap();
        let extra = [
            PropertyDecl::new("vendor", PropertyKind::String),
            PropertyDecl::new("osVersion", PropertyKind::String),
        ];
        let handle = engine
            .open(&blob, &AtlasConfig::defaults_for(SchemaVersion::V2), &extra)
            .unwrap();

        let device = handle.search(&ua("curl/8.0")).unwrap();
        assert_eq!(device.get("vendor"), Some(&PropertyValue::Unknown));
        assert_eq!(device.get("osVersion"), Some(&PropertyValue::Unknown));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut handle =
            open(JsonAtlasEngine::default(), AtlasConfig::defaults_for(SchemaVersion::V2));
        handle.close();
        handle.close();
        assert!(handle.is_closed());
        assert_eq!(handle.search(&ua("iPhone")).unwrap_err(), EngineError::Closed);
        assert_eq!(handle.data_version(), "");
        assert_eq!(handle.data_revision(), None);
    }
}
