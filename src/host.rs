//! Boundary parsing of loosely-typed host arguments.
//!
//! A scripting host hands over dynamic values. They are modelled as
//! [`serde_json::Value`] and checked once here, producing either a typed
//! input or a single `InvalidArgument` error.

use serde_json::Value;

use crate::config::OptionValue;
use crate::error::AtlasError;
use crate::evidence::EvidenceInput;

/// Dynamic value received from a host.
pub type HostValue = Value;

/// Message for a non-mapping `set_config` argument.
pub const CONFIG_SHAPE_ERROR: &str = "only a table is accepted";
/// Message for an unsupported `get_properties` argument.
pub const EVIDENCE_SHAPE_ERROR: &str = "only a string or a table are accepted";

/// Parse a `set_config` argument into candidate options.
///
/// Values that are neither boolean nor integer become `None` so the
/// configuration can skip them key by key.
pub fn parse_config_arg(arg: &HostValue) -> Result<Vec<(String, Option<OptionValue>)>, AtlasError> {
    let Value::Object(map) = arg else {
        return Err(AtlasError::invalid_argument(CONFIG_SHAPE_ERROR));
    };

    Ok(map
        .iter()
        .map(|(key, value)| (key.clone(), option_value(value)))
        .collect())
}

fn option_value(value: &Value) -> Option<OptionValue> {
    match value {
        Value::Bool(b) => Some(OptionValue::Bool(*b)),
        Value::Number(n) => n.as_i64().map(OptionValue::Int),
        _ => None,
    }
}

/// Parse `get_properties` arguments.
///
/// Accepted shapes:
/// - `(string [, string [, string]])`: user-agent, client-side properties,
///   accept-language; each position is read only if the previous one was
///   supplied, and skipped unless it is a string.
/// - `(mapping)`: header-like pairs; pairs whose value is not a string are
///   skipped.
pub fn parse_evidence_args(args: &[HostValue]) -> Result<EvidenceInput, AtlasError> {
    match args.first() {
        Some(Value::String(user_agent)) => {
            let mut input = EvidenceInput::user_agent(user_agent.as_str());
            if let Some(Value::String(props)) = args.get(1) {
                input = input.with_client_props(props.as_str());
                if let Some(Value::String(language)) = args.get(2) {
                    input = input.with_accept_language(language.as_str());
                }
            }
            Ok(input)
        }
        Some(Value::Object(map)) => Ok(EvidenceInput::Headers(
            map.iter()
                .filter_map(|(key, value)| value.as_str().map(|v| (key.clone(), v.to_string())))
                .collect(),
        )),
        _ => Err(AtlasError::invalid_argument(EVIDENCE_SHAPE_ERROR)),
    }
}
