//! Atlas configuration.
//!
//! The option set depends on the engine's schema version:
//!
//! | Schema | Keys | Defaults |
//! |--------|------|----------|
//! | v1 | `cache_size` | `0` (no search cache) |
//! | v2 | `uaprops`, `lgprops` | `true`, `true` |
//!
//! Keys match case-insensitively. Unknown keys and values of the wrong
//! representation are skipped one by one; applying a mapping never fails as
//! a whole. Changes take effect at the next open, except on schema v2 where
//! the session also pushes them into an already open dataset.

use serde::{Deserialize, Serialize};

use crate::engine::SchemaVersion;

/// Key for the v2 user-agent properties toggle.
pub const KEY_UA_PROPS: &str = "uaprops";
/// Key for the v2 language properties toggle.
pub const KEY_LANG_PROPS: &str = "lgprops";
/// Key for the v1 search cache size.
pub const KEY_CACHE_SIZE: &str = "cache_size";

/// Environment variable overriding `uaprops`.
pub const ENV_UA_PROPS: &str = "DATLAS_UAPROPS";
/// Environment variable overriding `lgprops`.
pub const ENV_LANG_PROPS: &str = "DATLAS_LGPROPS";
/// Environment variable overriding `cache_size`.
pub const ENV_CACHE_SIZE: &str = "DATLAS_CACHE_SIZE";

/// Engine configuration, one shape per schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "snake_case")]
pub enum AtlasConfig {
    /// Schema v1.
    V1 {
        /// Entries kept in the engine's search cache (0 disables it).
        cache_size: u32,
    },
    /// Schema v2.
    V2 {
        /// Compute user-agent derived properties.
        ua_props: bool,
        /// Compute language properties.
        lang_props: bool,
    },
}

/// A candidate option value after boundary parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
}

/// Outcome of applying a set of options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Keys that changed the configuration.
    pub accepted: Vec<String>,
    /// Keys skipped as unknown or badly typed.
    pub ignored: Vec<String>,
}

impl AtlasConfig {
    /// Default configuration for a schema version.
    pub fn defaults_for(schema: SchemaVersion) -> Self {
        match schema {
            SchemaVersion::V1 => Self::V1 { cache_size: 0 },
            SchemaVersion::V2 => Self::V2 {
                ua_props: true,
                lang_props: true,
            },
        }
    }

    /// Defaults overridden by `DATLAS_*` environment variables.
    pub fn from_env(schema: SchemaVersion) -> Self {
        Self::from_lookup(schema, |name| std::env::var(name).ok())
    }

    fn from_lookup(schema: SchemaVersion, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::defaults_for(schema);
        let vars: &[(&str, &str)] = match schema {
            SchemaVersion::V1 => &[(ENV_CACHE_SIZE, KEY_CACHE_SIZE)],
            SchemaVersion::V2 => &[(ENV_UA_PROPS, KEY_UA_PROPS), (ENV_LANG_PROPS, KEY_LANG_PROPS)],
        };

        for (var, key) in vars {
            let Some(raw) = lookup(var) else { continue };
            match parse_env_value(&raw) {
                Some(value) if config.set_option(key, value) => {}
                _ => tracing::warn!(
                    var = %var,
                    value = %raw,
                    "ignoring unparsable config override"
                ),
            }
        }
        config
    }

    /// Schema version this configuration belongs to.
    pub fn schema_version(&self) -> SchemaVersion {
        match self {
            Self::V1 { .. } => SchemaVersion::V1,
            Self::V2 { .. } => SchemaVersion::V2,
        }
    }

    /// Keys recognised for this schema.
    pub fn known_keys(&self) -> &'static [&'static str] {
        match self {
            Self::V1 { .. } => &[KEY_CACHE_SIZE],
            Self::V2 { .. } => &[KEY_UA_PROPS, KEY_LANG_PROPS],
        }
    }

    /// Set one option. Returns `false` if the key is unknown for this schema
    /// or the value cannot represent it.
    pub fn set_option(&mut self, key: &str, value: OptionValue) -> bool {
        match self {
            Self::V1 { cache_size } => {
                if !key.eq_ignore_ascii_case(KEY_CACHE_SIZE) {
                    return false;
                }
                match value {
                    OptionValue::Bool(b) => *cache_size = u32::from(b),
                    OptionValue::Int(n) => match u32::try_from(n) {
                        Ok(n) => *cache_size = n,
                        Err(_) => return false,
                    },
                }
                true
            }
            Self::V2 {
                ua_props,
                lang_props,
            } => {
                let slot = if key.eq_ignore_ascii_case(KEY_UA_PROPS) {
                    ua_props
                } else if key.eq_ignore_ascii_case(KEY_LANG_PROPS) {
                    lang_props
                } else {
                    return false;
                };
                *slot = match value {
                    OptionValue::Bool(b) => b,
                    OptionValue::Int(n) => n != 0,
                };
                true
            }
        }
    }

    /// Apply candidate options. `None` marks a value whose representation
    /// is neither boolean nor integer.
    pub fn apply<I, K>(&mut self, entries: I) -> ApplyReport
    where
        I: IntoIterator<Item = (K, Option<OptionValue>)>,
        K: Into<String>,
    {
        let mut report = ApplyReport::default();
        for (key, value) in entries {
            let key = key.into();
            match value {
                Some(value) if self.set_option(&key, value) => report.accepted.push(key),
                _ => report.ignored.push(key),
            }
        }
        if !report.ignored.is_empty() {
            tracing::debug!(ignored = ?report.ignored, "config keys ignored");
        }
        report
    }

    /// Whether user-agent properties are computed. Always true on v1.
    pub fn ua_props(&self) -> bool {
        match self {
            Self::V1 { .. } => true,
            Self::V2 { ua_props, .. } => *ua_props,
        }
    }

    /// Whether language properties are computed. Always true on v1.
    pub fn lang_props(&self) -> bool {
        match self {
            Self::V1 { .. } => true,
            Self::V2 { lang_props, .. } => *lang_props,
        }
    }

    /// Search cache size. Zero on v2.
    pub fn cache_size(&self) -> u32 {
        match self {
            Self::V1 { cache_size } => *cache_size,
            Self::V2 { .. } => 0,
        }
    }
}

fn parse_env_value(raw: &str) -> Option<OptionValue> {
    let raw = raw.trim();
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => Some(OptionValue::Bool(true)),
        "false" | "no" | "off" => Some(OptionValue::Bool(false)),
        _ => raw.parse::<i64>().ok().map(OptionValue::Int),
    }
}
