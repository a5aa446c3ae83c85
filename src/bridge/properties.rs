//! Property-change channel of the bridge object
//!
//! Operators may edit the broker properties directly instead of sending a
//! command. When enabled, this channel picks those edits up and reconnects
//! the broker with the new values.

use super::{property, Bridge};
use crate::backend::GraphQlRequest;
use crate::error::{BridgeError, BridgeResult};
use crate::state::{BrokerConnectionParams, TopicSet};
use crate::subscription::PayloadHandler;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Weak;
use tracing::{debug, info, warn};

/// Topic prefix of the property-change subscription
pub const OBJECT_TOPIC_PREFIX: &str = "objects:";

const PROPERTY_SUBSCRIPTION: &str = r#"
subscription SubscrOnObjectProperty($topic: String!) {
    listen(topic: $topic) {
        objectProperty: relatedNode {
            ... on ObjectProperty {
                id
                type
                value
                stealth
                property
                objectId
            }
        }
        relatedNodeId
    }
}"#;

/// Subscription request for property changes visible to `token_id`
pub fn property_subscription(token_id: &str) -> GraphQlRequest {
    GraphQlRequest::new(
        PROPERTY_SUBSCRIPTION,
        json!({ "topic": format!("{OBJECT_TOPIC_PREFIX}{token_id}") }),
    )
}

/// One changed property value
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyChange {
    #[serde(default)]
    pub id: String,
    pub object_id: String,
    pub property: String,
    #[serde(default, deserialize_with = "text_or_null")]
    pub value: String,
}

fn text_or_null<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(text) => text,
        other => other.to_string(),
    })
}

impl PropertyChange {
    /// `params` with this change applied, or `None` when it changes nothing
    pub fn apply_to(&self, params: &BrokerConnectionParams) -> Option<BrokerConnectionParams> {
        let mut next = params.clone();
        match self.property.as_str() {
            property::BROKER_URL => next.url = self.value.clone(),
            property::USERNAME => next.username = self.value.clone(),
            property::PASSWORD => next.password = self.value.clone(),
            property::TOPICS => next.topics = TopicSet::parse(&self.value),
            _ => return None,
        }
        (next != *params).then_some(next)
    }

    /// Decode a data frame payload `{data: {listen: {objectProperty}}}`
    pub fn decode(payload: &Value) -> BridgeResult<Self> {
        let node = payload
            .pointer("/data/listen/objectProperty")
            .filter(|node| !node.is_null())
            .ok_or_else(|| BridgeError::internal("property payload has no objectProperty"))?;
        serde_json::from_value(node.clone())
            .map_err(|e| BridgeError::internal(format!("malformed property payload: {e}")))
    }
}

/// Subscription handler of the property channel
pub struct PropertyChannel {
    bridge: Weak<Bridge>,
}

impl PropertyChannel {
    pub fn new(bridge: Weak<Bridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl PayloadHandler for PropertyChannel {
    async fn handle(&self, payload: Value) -> BridgeResult<()> {
        let change = PropertyChange::decode(&payload)?;
        match self.bridge.upgrade() {
            Some(bridge) => bridge.apply_property_change(change).await,
            None => Ok(()),
        }
    }
}

impl Bridge {
    /// Take over a broker parameter edited on the bridge object
    ///
    /// Changes to other objects, other properties or to the current value are
    /// ignored.
    pub async fn apply_property_change(&self, change: PropertyChange) -> BridgeResult<()> {
        if change.object_id != self.identity.load().object_id {
            debug!(object_id = %change.object_id, "Property change of another object ignored");
            return Ok(());
        }

        // A command may rewrite the parameters between snapshot and swap
        loop {
            let current = self.broker_params.snapshot();
            let Some(next) = change.apply_to(&current.value) else {
                debug!(property = %change.property, "Property change leaves broker parameters as they are");
                return Ok(());
            };
            match self.broker_params.compare_and_swap(current.version, next) {
                Ok(_) => break,
                Err(stale) => debug!(%stale, "Retrying property change"),
            }
        }

        info!(property = %change.property, "Broker property changed, reconnecting");
        if let Err(e) = self.transport_reconnect().await {
            warn!(error = %e, "Transport reconnect after property change failed");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_subscription_topic() {
        let request = property_subscription("tok-9");

        assert_eq!(request.variables["topic"], "objects:tok-9");
        assert!(request.query.contains("SubscrOnObjectProperty"));
    }

    #[test]
    fn test_decode_property_change() {
        let payload = json!({
            "data": {
                "listen": {
                    "objectProperty": {
                        "id": "p1",
                        "objectId": "bridge-obj",
                        "property": "BrokerURL",
                        "value": "tcp://broker:1883",
                        "stealth": false,
                        "type": "string"
                    },
                    "relatedNodeId": "p1"
                }
            }
        });

        let change = PropertyChange::decode(&payload).unwrap();

        assert_eq!(change.object_id, "bridge-obj");
        assert_eq!(change.property, "BrokerURL");
        assert_eq!(change.value, "tcp://broker:1883");
    }

    #[test]
    fn test_decode_non_text_value() {
        let payload = json!({
            "data": {"listen": {"objectProperty": {
                "objectId": "o", "property": "AUTO_PROVISION", "value": true
            }}}
        });

        assert_eq!(PropertyChange::decode(&payload).unwrap().value, "true");
    }

    fn change(property: &str, value: &str) -> PropertyChange {
        PropertyChange {
            id: "p1".to_string(),
            object_id: "bridge-obj".to_string(),
            property: property.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_apply_to_broker_properties() {
        let params = BrokerConnectionParams {
            url: "tcp://broker:1883".to_string(),
            username: "dev".to_string(),
            password: "old".to_string(),
            topics: TopicSet::parse("a/b"),
        };

        let edited = change("Password", "new").apply_to(&params).unwrap();
        assert_eq!(edited.password, "new");
        assert_eq!(edited.url, params.url);

        let edited = change("Topics", "c/#,d").apply_to(&params).unwrap();
        assert_eq!(edited.topics, TopicSet::parse("c/#,d"));
    }

    #[test]
    fn test_apply_to_ignores_no_op_and_foreign_properties() {
        let params = BrokerConnectionParams {
            url: "tcp://broker:1883".to_string(),
            ..Default::default()
        };

        assert_eq!(change("BrokerURL", "tcp://broker:1883").apply_to(&params), None);
        assert_eq!(change("Message", "Alive").apply_to(&params), None);
    }

    #[test]
    fn test_decode_rejects_missing_node() {
        let payload = json!({"data": {"listen": {"objectProperty": null, "relatedNodeId": "x"}}});

        assert!(PropertyChange::decode(&payload).is_err());
    }
}
