//! Typed command arguments

use crate::error::{BridgeError, BridgeResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Decode the params of `command` into `T`
pub fn decode<T: DeserializeOwned>(command: &str, params: &Value) -> BridgeResult<T> {
    serde_json::from_value(params.clone())
        .map_err(|e| BridgeError::invalid_params(command, e.to_string()))
}

/// Downlink to publish: `{topicName, payload}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishArgs {
    pub topic_name: String,
    #[serde(deserialize_with = "payload_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicsArgs {
    pub topics: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BrokerUrlArgs {
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UsernameArgs {
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PasswordArgs {
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FlagArgs {
    #[serde(deserialize_with = "flexible_bool")]
    pub enable: bool,
}

/// Payload bytes: base64 text unless it contains `:`, then the literal text.
/// Byte arrays and JSON objects are taken as they are.
fn payload_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::String(text) if text.contains(':') => Ok(text.into_bytes()),
        Value::String(text) => STANDARD
            .decode(text.trim())
            .map_err(|e| D::Error::custom(format!("payload is not base64: {e}"))),
        Value::Array(items) => items
            .into_iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| D::Error::custom(format!("payload byte {item} out of range")))
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        object @ Value::Object(_) => Ok(object.to_string().into_bytes()),
        other => Err(D::Error::custom(format!("unsupported payload {other}"))),
    }
}

/// Boolean from a JSON bool or one of the usual textual spellings
fn flexible_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Bool(flag) => Ok(flag),
        Value::String(text) => parse_bool(&text)
            .ok_or_else(|| D::Error::custom(format!("'{text}' is not a boolean"))),
        other => Err(D::Error::custom(format!("{other} is not a boolean"))),
    }
}

/// Accepts 1, t, T, TRUE, true, True and their false counterparts
pub fn parse_bool(text: &str) -> Option<bool> {
    match text.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}
