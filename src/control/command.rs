//! Control command decoding
//!
//! A data payload carries a command in one of two shapes. The primary shape is
//! the `controlExecution` node itself; the adapter shape leaves that node
//! empty and packs a base64 JSON array of snake_case records into
//! `relatedNodeId`. Both decode into a [`CommandEnvelope`] and normalize into
//! the same [`ControlCommand`].

use crate::backend::GraphQlRequest;
use crate::error::{BridgeError, BridgeResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};

const CONTROL_SUBSCRIPTION: &str = r#"
subscription SubscrOnControl($topic: String!) {
    listen(topic: $topic) {
        controlExecution: relatedNode {
            ... on ControlExecution {
                id objectId callerId createdAt controller name params
                helperData: helperParams type ack done
            }
        }
        relatedNodeId
    }
}"#;

/// Prefix of the control channel topic, followed by the token id
pub const CONTROL_TOPIC_PREFIX: &str = "controls:";

/// Subscription request for the control channel of `token_id`
pub fn control_subscription(token_id: &str) -> GraphQlRequest {
    GraphQlRequest::new(
        CONTROL_SUBSCRIPTION,
        json!({ "topic": format!("{CONTROL_TOPIC_PREFIX}{token_id}") }),
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelperParams {
    pub enabled: bool,
    pub schema_id: String,
}

/// Remote-invoked unit of work, correlated by `id`
#[derive(Debug, Clone, PartialEq)]
pub struct ControlCommand {
    /// Negative for synthetic (adapter-origin) commands
    pub id: i64,
    pub caller_id: String,
    pub controller: String,
    pub object_id: String,
    pub name: String,
    /// Decoded parameters; a non-JSON params string stays a JSON string
    pub params: Value,
    pub kind: String,
    pub ack: bool,
    pub done: bool,
    pub error: Option<String>,
    pub helper: HelperParams,
}

impl ControlCommand {
    /// Synthetic commands have no backend row to acknowledge
    pub fn is_synthetic(&self) -> bool {
        self.id < 0
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryHelper {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub schema_id: Option<String>,
}

/// `controlExecution` node as the subscription delivers it
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryRecord {
    #[serde(deserialize_with = "flexible_id")]
    pub id: i64,
    #[serde(default)]
    pub object_id: Option<String>,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub controller: Option<String>,
    pub name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub ack: bool,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub helper_data: Option<PrimaryHelper>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdapterHelper {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub schema_id: Option<String>,
}

/// Record of the alternate, snake_case encoding
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterRecord {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub controller: Option<String>,
    #[serde(default)]
    pub object_id: Option<String>,
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub ack: bool,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub helper_params: Option<AdapterHelper>,
    #[serde(default)]
    pub params: Value,
}

/// Command as received, before normalization
#[derive(Debug, Clone)]
pub enum CommandEnvelope {
    Primary(PrimaryRecord),
    Adapter(AdapterRecord),
}

#[derive(Debug, Deserialize)]
struct DataPayload {
    data: Option<ListenData>,
}

#[derive(Debug, Deserialize)]
struct ListenData {
    listen: Option<Listen>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Listen {
    #[serde(default)]
    control_execution: Option<Value>,
    #[serde(default)]
    related_node_id: Option<String>,
}

fn invalid(message: impl Into<String>) -> BridgeError {
    BridgeError::invalid_params("controlExecution", message)
}

impl CommandEnvelope {
    /// Decode a data frame payload `{data: {listen: {controlExecution, relatedNodeId}}}`
    pub fn decode(payload: &Value) -> BridgeResult<Self> {
        let payload: DataPayload =
            serde_json::from_value(payload.clone()).map_err(|e| invalid(e.to_string()))?;
        let listen = payload
            .data
            .and_then(|d| d.listen)
            .ok_or_else(|| invalid("payload has no data.listen"))?;

        // An empty or zero-valued node carries no caller; the command is then
        // in relatedNodeId
        match listen.control_execution.filter(has_caller) {
            Some(node) => serde_json::from_value::<PrimaryRecord>(node)
                .map(CommandEnvelope::Primary)
                .map_err(|e| invalid(e.to_string())),
            None => {
                let encoded = listen
                    .related_node_id
                    .ok_or_else(|| invalid("no controlExecution and no relatedNodeId"))?;
                Self::decode_adapter(&encoded).map(CommandEnvelope::Adapter)
            }
        }
    }

    /// Base64 JSON array of adapter records; the first one is the command
    fn decode_adapter(encoded: &str) -> BridgeResult<AdapterRecord> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| invalid(format!("relatedNodeId is not base64: {e}")))?;
        let records: Vec<AdapterRecord> = serde_json::from_slice(&bytes)
            .map_err(|e| invalid(format!("relatedNodeId is not a command array: {e}")))?;
        records
            .into_iter()
            .next()
            .ok_or_else(|| invalid("relatedNodeId holds an empty command array"))
    }

    /// Single command shape for routing
    pub fn normalize(self) -> ControlCommand {
        match self {
            CommandEnvelope::Primary(record) => {
                let helper = record.helper_data.unwrap_or_default();
                ControlCommand {
                    id: record.id,
                    caller_id: record.caller_id.unwrap_or_default(),
                    controller: record.controller.unwrap_or_default(),
                    object_id: record.object_id.unwrap_or_default(),
                    name: record.name,
                    params: decode_params(record.params),
                    kind: record.kind.unwrap_or_default(),
                    ack: record.ack,
                    done: record.done,
                    error: record.error,
                    helper: HelperParams {
                        enabled: helper.enabled,
                        schema_id: helper.schema_id.unwrap_or_default(),
                    },
                }
            }
            CommandEnvelope::Adapter(record) => {
                let helper = record.helper_params.unwrap_or_default();
                ControlCommand {
                    id: -1,
                    caller_id: record.caller_id.unwrap_or_default(),
                    controller: record.controller.unwrap_or_default(),
                    object_id: record.object_id.unwrap_or_default(),
                    name: record.name,
                    params: decode_params(record.params),
                    kind: record.kind.unwrap_or_default(),
                    ack: record.ack,
                    done: true,
                    error: record.error,
                    helper: HelperParams {
                        enabled: helper.enabled,
                        schema_id: helper.schema_id.unwrap_or_default(),
                    },
                }
            }
        }
    }
}

fn has_caller(node: &Value) -> bool {
    node.get("callerId")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty())
}

/// Params travel as a JSON-encoded string; decode it when it is JSON
fn decode_params(params: Value) -> Value {
    match params {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

/// BigInt ids arrive as numbers or as numeric strings
fn flexible_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| D::Error::custom(format!("id {n} out of range"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("id '{s}' is not an integer"))),
        other => Err(D::Error::custom(format!("unexpected id {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn primary_payload(id: Value, caller_id: &str) -> Value {
        json!({
            "data": {"listen": {
                "controlExecution": {
                    "id": id,
                    "objectId": "obj-1",
                    "callerId": caller_id,
                    "createdAt": "2024-01-01T00:00:00Z",
                    "controller": "ctl-1",
                    "name": "SetTopics",
                    "params": "{\"topics\":\"a/b,c/d\"}",
                    "helperData": {"enabled": true, "schemaId": "schema-1"},
                    "type": "RPC",
                    "ack": false,
                    "done": false
                },
                "relatedNodeId": "WyJDb250cm9sRXhlY3V0aW9uIiwgN10="
            }}
        })
    }

    #[test]
    fn test_primary_command() {
        let envelope = CommandEnvelope::decode(&primary_payload(json!(7), "user-1")).unwrap();
        assert!(matches!(envelope, CommandEnvelope::Primary(_)));

        let command = envelope.normalize();

        assert_eq!(command.id, 7);
        assert_eq!(command.name, "SetTopics");
        assert_eq!(command.caller_id, "user-1");
        assert_eq!(command.object_id, "obj-1");
        assert_eq!(command.kind, "RPC");
        assert_eq!(command.params, json!({"topics": "a/b,c/d"}));
        assert_eq!(
            command.helper,
            HelperParams {
                enabled: true,
                schema_id: "schema-1".to_string()
            }
        );
        assert!(!command.is_synthetic());
    }

    #[test]
    fn test_string_id() {
        let command = CommandEnvelope::decode(&primary_payload(json!("42"), "user-1"))
            .unwrap()
            .normalize();
        assert_eq!(command.id, 42);
    }

    #[test]
    fn test_adapter_command() {
        let records = json!([{
            "id": 99,
            "caller_id": "",
            "controller": "ctl-2",
            "object_id": "obj-2",
            "name": "SendDownlink",
            "type": "RPC",
            "ack": false,
            "done": false,
            "error": null,
            "helper_params": {"enabled": false, "schema_id": "schema-2"},
            "params": {"topicName": "dev/1", "payload": "aGk="}
        }]);
        let payload = json!({
            "data": {"listen": {
                "controlExecution": null,
                "relatedNodeId": STANDARD.encode(records.to_string())
            }}
        });

        let envelope = CommandEnvelope::decode(&payload).unwrap();
        assert!(matches!(envelope, CommandEnvelope::Adapter(_)));
        let command = envelope.normalize();

        assert_eq!(command.id, -1);
        assert!(command.done);
        assert!(command.is_synthetic());
        assert_eq!(command.name, "SendDownlink");
        assert_eq!(command.object_id, "obj-2");
        assert_eq!(command.helper.schema_id, "schema-2");
        assert_eq!(command.params["topicName"], "dev/1");
    }

    #[test]
    fn test_empty_caller_id_takes_adapter_path() {
        let records = json!([{"name": "TestModule"}]);
        let mut payload = primary_payload(json!(5), "");
        payload["data"]["listen"]["relatedNodeId"] = json!(STANDARD.encode(records.to_string()));

        let command = CommandEnvelope::decode(&payload).unwrap().normalize();

        assert_eq!(command.id, -1);
        assert_eq!(command.name, "TestModule");
    }

    #[test]
    fn test_callerless_nodes_fall_back_to_related_node() {
        let encoded = STANDARD.encode(json!([{"name": "TestModule"}]).to_string());
        let nodes = [
            json!({}),
            json!({"id": null, "name": "", "callerId": ""}),
            json!({"id": null, "callerId": null}),
        ];

        for node in nodes {
            let payload = json!({
                "data": {"listen": {"controlExecution": node, "relatedNodeId": encoded}}
            });

            let envelope = CommandEnvelope::decode(&payload)
                .unwrap_or_else(|e| panic!("node {node} should decode: {e}"));
            assert!(matches!(envelope, CommandEnvelope::Adapter(_)));
            let command = envelope.normalize();

            assert_eq!(command.id, -1);
            assert!(command.done);
            assert_eq!(command.name, "TestModule");
        }
    }

    #[test]
    fn test_primary_node_with_bad_id_is_rejected() {
        let payload = primary_payload(json!(null), "user-1");

        assert!(matches!(
            CommandEnvelope::decode(&payload),
            Err(BridgeError::InvalidParams { .. })
        ));
    }

    #[test]
    fn test_malformed_payloads() {
        let cases = [
            json!({}),
            json!({"data": {"listen": null}}),
            json!({"data": {"listen": {"controlExecution": null}}}),
            json!({"data": {"listen": {"controlExecution": null, "relatedNodeId": "%%%"}}}),
            json!({"data": {"listen": {"controlExecution": null,
                "relatedNodeId": STANDARD.encode("[]")}}}),
        ];
        for payload in cases {
            assert!(
                matches!(
                    CommandEnvelope::decode(&payload),
                    Err(BridgeError::InvalidParams { .. })
                ),
                "expected rejection of {payload}"
            );
        }
    }

    #[test]
    fn test_non_json_params_stay_text() {
        assert_eq!(decode_params(json!("plain")), json!("plain"));
        assert_eq!(decode_params(json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_control_subscription_topic() {
        let request = control_subscription("token-9");

        assert_eq!(request.variables, json!({"topic": "controls:token-9"}));
        assert!(request.query.starts_with("subscription SubscrOnControl"));
        assert!(request.query.contains("helperData: helperParams"));
    }
}
