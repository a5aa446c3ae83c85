//! Built-in application schema of the bridge
//!
//! Imported on every (re)start unless `bridge.schema_file` names a
//! replacement. It declares the controls the router dispatches and the
//! properties the runtime reads and writes on the bridge object.

use super::property;
use crate::control::CommandName;
use crate::error::{BridgeError, BridgeResult};
use serde::Serialize;
use serde_json::Value;

pub const SCHEMA_ID: &str = "220fcefa-46d3-4f6b-8081-28e5b4b2824b";
pub const SCHEMA_VERSION: &str = "1.41";
pub const SCHEMA_NAME: &str = "MQTT Bridge";

const GROUP_CREDENTIALS: &str = "Credentials";
const GROUP_HEALTH_CHECK: &str = "HealthCheck";
const STATUS: &str = "Status";
const TIMEOUT: &str = "Timeout";

#[derive(Debug, Serialize)]
struct AppSchema {
    schema: Metadata,
    properties: Vec<PropertyDef>,
    controls: Vec<ControlDef>,
}

#[derive(Debug, Serialize)]
struct Metadata {
    id: &'static str,
    name: &'static str,
    description: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    enabled: bool,
    m_external_id: &'static str,
    m_tags: Vec<&'static str>,
    m_version: &'static str,
}

#[derive(Debug, Serialize)]
struct PropertyDef {
    property: &'static str,
    description: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    group_name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    default_value: Option<&'static str>,
    hidden: bool,
}

impl PropertyDef {
    fn new(property: &'static str, kind: &'static str, group_name: &'static str, description: &'static str) -> Self {
        Self {
            property,
            description,
            kind,
            group_name,
            default_value: None,
            hidden: false,
        }
    }

    fn default_value(mut self, value: &'static str) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// One row per control plus one per argument, sharing the `rpc` name
#[derive(Debug, Serialize)]
struct ControlDef {
    rpc: &'static str,
    argument: &'static str,
    description: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    hidden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    default_value: Option<&'static str>,
}

fn control(
    name: CommandName,
    description: &'static str,
    hidden: bool,
    arguments: &[(&'static str, &'static str, &'static str)],
) -> Vec<ControlDef> {
    let rpc = name.as_str();
    let mut rows = vec![ControlDef {
        rpc,
        argument: rpc,
        description,
        kind: "string",
        hidden,
        default_value: None,
    }];
    rows.extend(arguments.iter().map(|&(argument, kind, description)| ControlDef {
        rpc,
        argument,
        description,
        kind,
        hidden,
        default_value: (kind == "bool").then_some("true"),
    }));
    rows
}

fn build() -> AppSchema {
    let controls = [
        control(
            CommandName::SendDownlink,
            "Send raw message to topic",
            false,
            &[("topicName", "string", "Topic name"), ("payload", "string", "Topic payload")],
        ),
        control(CommandName::Reload, "Reload bridges", false, &[]),
        control(CommandName::TestModule, "Test module", false, &[]),
        control(
            CommandName::SetAutoProvision,
            "Set auto provision",
            true,
            &[("enable", "bool", "Enable")],
        ),
        control(CommandName::SetTopics, "Set topic list", false, &[("topics", "string", "Topic list")]),
        control(CommandName::SetBrokerUrl, "Set broker URL", false, &[("hostname", "string", "Broker URL")]),
        control(CommandName::SetUsername, "Set username", false, &[("username", "string", "Username")]),
        control(CommandName::SetPassword, "Set password", false, &[("password", "string", "Password")]),
    ]
    .into_iter()
    .flatten()
    .collect();

    let properties = vec![
        PropertyDef::new(STATUS, "bool", GROUP_HEALTH_CHECK, "Application online").default_value("true"),
        PropertyDef::new(property::MESSAGE, "string", GROUP_HEALTH_CHECK, "Status message")
            .default_value("1970-01-01T00:00:00Z"),
        PropertyDef::new(TIMEOUT, "int", GROUP_HEALTH_CHECK, "Timeout for offline status").default_value("120"),
        PropertyDef::new(property::BROKER_URL, "string", GROUP_CREDENTIALS, "MQTT broker url"),
        PropertyDef::new(property::USERNAME, "string", GROUP_CREDENTIALS, "MQTT broker username"),
        PropertyDef::new(property::PASSWORD, "string", GROUP_CREDENTIALS, "MQTT broker password"),
        PropertyDef::new(property::TOPICS, "string", GROUP_CREDENTIALS, "MQTT topics"),
        PropertyDef::new(property::AUTO_PROVISION, "bool", GROUP_CREDENTIALS, "Auto Provision"),
        PropertyDef::new(property::CONNECTION_STATE, "string", GROUP_HEALTH_CHECK, "Connection state")
            .default_value("undefined"),
    ];

    AppSchema {
        schema: Metadata {
            id: SCHEMA_ID,
            name: SCHEMA_NAME,
            description: SCHEMA_NAME,
            kind: "application",
            enabled: true,
            m_external_id: SCHEMA_ID,
            m_tags: vec!["application", "mqtt bridge", "app profile"],
            m_version: SCHEMA_VERSION,
        },
        properties,
        controls,
    }
}

/// Schema document as the backend's import expects it
pub fn default_schema() -> BridgeResult<Value> {
    serde_json::to_value(build())
        .map_err(|e| BridgeError::internal(format!("built-in schema: {e}")))
}
