//! Atlas query tool.
//!
//! Loads a dataset, prints the session summary and the properties resolved
//! for the given evidence.
//!
//! ## Usage
//!
//! ```bash
//! atlas_query <dataset.json> "<user-agent>" [client-props] [accept-language]
//! atlas_query <dataset.json> user-agent="<ua>" sec-ch-ua-mobile="?1" ...
//! ```
//!
//! Arguments containing `=` are read as header pairs; otherwise positional
//! strings are used.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `DATLAS_SCHEMA`: engine schema major version, 1 or 2 (default: 2)
//! - `DATLAS_UAPROPS`, `DATLAS_LGPROPS`: v2 property toggles
//! - `DATLAS_CACHE_SIZE`: v1 search cache size
//! - `RUST_LOG`: Log level filter (default: device_atlas=info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: pretty)

use std::process::ExitCode;

use serde_json::{Map, Value};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use device_atlas::{AtlasConfig, AtlasSession, JsonAtlasEngine, SchemaVersion};

/// Initialize the tracing subscriber with JSON or pretty format
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "device_atlas=info,atlas_query=info".into());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .flatten_event(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

fn schema_from_env() -> SchemaVersion {
    match std::env::var("DATLAS_SCHEMA") {
        Ok(raw) => match raw.trim().parse::<u8>().ok().and_then(SchemaVersion::from_major) {
            Some(schema) => schema,
            None => {
                warn!(value = %raw, "unsupported DATLAS_SCHEMA, using v2");
                SchemaVersion::V2
            }
        },
        Err(_) => SchemaVersion::V2,
    }
}

/// Turn trailing arguments into host arguments.
fn evidence_args(args: &[String]) -> Vec<Value> {
    if !args.is_empty() && args.iter().all(|a| a.contains('=')) {
        let pairs: Map<String, Value> = args
            .iter()
            .filter_map(|a| a.split_once('='))
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        vec![Value::Object(pairs)]
    } else {
        args.iter().map(|a| Value::String(a.clone())).collect()
    }
}

fn main() -> ExitCode {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((path, rest)) = args.split_first() else {
        eprintln!("usage: atlas_query <dataset.json> <user-agent | header=value ...>");
        return ExitCode::from(2);
    };

    let schema = schema_from_env();
    let engine = JsonAtlasEngine::new(schema);
    let mut session = AtlasSession::with_config(engine, AtlasConfig::from_env(schema));

    match session.load_from_file(path) {
        Ok(true) => {}
        Ok(false) => {
            error!(path = %path, "cannot open data file");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!(error = %e, "load failed");
            return ExitCode::FAILURE;
        }
    }
    eprint!("{}", session.describe());

    if rest.is_empty() {
        return ExitCode::SUCCESS;
    }

    match session.get_properties_from_host(&evidence_args(rest)) {
        Ok(properties) => {
            info!(count = properties.len(), "properties resolved");
            match serde_json::to_string_pretty(&properties) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    error!(error = %e, "cannot serialize properties");
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "query failed");
            ExitCode::FAILURE
        }
    }
}
