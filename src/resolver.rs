//! Broker topic to backend routing key
//!
//! Known gateway topic layouts collapse onto one routing key per gateway.
//! With auto-provisioning on, gateways without a device object get a generic
//! one created on first contact.

use crate::backend::{BackendApi, NewObject};
use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Schema of generic MQTT device objects
pub const GENERIC_DEVICE_SCHEMA_ID: &str = "6a34e442-cc3c-4586-853e-9058e1fd7739";
/// Schema of SENSO8 BLE gateway objects
pub const SENSO8_GATEWAY_SCHEMA_ID: &str = "23035572-f87a-4d00-bfd3-ac68ddafb855";

/// Property holding the routing key of a device object
pub const TOPIC_BASE_PROPERTY: &str = "TopicBase";
/// Property linking a provisioned device to its bridge
pub const BRIDGE_PROPERTY: &str = "BRIDGE";

const MINEW_GATEWAY_PATTERN: &str = r"^(/gw/)(.*)/status$";
const SENSO8_DATA_PATTERN: &str = r"^(SENSO8/nbiot/data/)(.*)$";
const SENSO8_SYS_PATTERN: &str = r"^(SENSO8/nbiot/sys/)(.*)$";

/// Outcome of resolving one topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub routing_key: String,
    /// The topic follows a known device layout
    pub known: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub bridge_object_id: String,
    pub auto_provision: bool,
}

/// Maps inbound topics to routing keys, possibly creating device objects
#[async_trait]
pub trait TopicResolver: Send + Sync {
    async fn resolve(&self, topic: &str, context: &ResolveContext) -> BridgeResult<Resolution>;
}

/// Provisioning target: routing key plus gateway code
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProvisionKey {
    key: String,
    code: String,
}

/// Regex-driven resolver for the known gateway layouts
pub struct PatternTopicResolver {
    backend: Arc<dyn BackendApi>,
    minew_gateway: Regex,
    senso8_data: Regex,
    senso8_sys: Regex,
}

impl PatternTopicResolver {
    pub fn new(backend: Arc<dyn BackendApi>) -> BridgeResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| BridgeError::internal(format!("topic pattern {pattern}: {e}")))
        };
        Ok(Self {
            backend,
            minew_gateway: compile(MINEW_GATEWAY_PATTERN)?,
            senso8_data: compile(SENSO8_DATA_PATTERN)?,
            senso8_sys: compile(SENSO8_SYS_PATTERN)?,
        })
    }

    /// Routing key without provisioning (pure function)
    fn routing_key(&self, topic: &str) -> Resolution {
        let code_of = |re: &Regex| {
            re.captures(topic)
                .and_then(|c| c.get(2))
                .map(|m| m.as_str().to_string())
        };

        if let Some(code) = code_of(&self.senso8_sys).or_else(|| code_of(&self.senso8_data)) {
            return Resolution {
                routing_key: format!("SENSO8/nbiot/data/{code}"),
                known: true,
            };
        }
        if let Some(code) = code_of(&self.minew_gateway) {
            return Resolution {
                routing_key: format!("gw/{code}"),
                known: true,
            };
        }
        Resolution {
            routing_key: topic.to_string(),
            known: false,
        }
    }

    /// Key and code of topics eligible for auto-provisioning (pure function)
    fn provision_key(&self, topic: &str) -> Option<ProvisionKey> {
        [&self.minew_gateway, &self.senso8_data]
            .into_iter()
            .find_map(|re| re.captures(topic))
            .and_then(|c| {
                let prefix = c.get(1)?.as_str();
                let code = c.get(2)?.as_str();
                Some(ProvisionKey {
                    key: format!("{prefix}{code}"),
                    code: code.to_string(),
                })
            })
    }

    /// Find a device object whose routing key is `key`, or create one
    async fn check_or_create_device(
        &self,
        target: &ProvisionKey,
        context: &ResolveContext,
    ) -> BridgeResult<()> {
        if target.code.is_empty() {
            return Err(BridgeError::internal("zero length gateway code"));
        }

        let mut objects = self
            .backend
            .list_objects_by_schema(GENERIC_DEVICE_SCHEMA_ID)
            .await?;
        objects.extend(
            self.backend
                .list_objects_by_schema(SENSO8_GATEWAY_SCHEMA_ID)
                .await?,
        );

        for object in &objects {
            // Objects without the property are simply not a match
            if let Ok(stored) = self
                .backend
                .get_property_value(&object.id, TOPIC_BASE_PROPERTY)
                .await
            {
                if stored == target.key {
                    debug!(object_id = %object.id, key = %target.key, "Device already provisioned");
                    return Ok(());
                }
            }
        }

        info!(code = %target.code, "Creating generic device");
        let label = format!("Generic MQTT Device ({}) #{}", target.key, target.code);
        let object_id = self
            .backend
            .create_object(&NewObject {
                id: Uuid::new_v4().to_string(),
                name: label.clone(),
                description: label,
                schema_id: GENERIC_DEVICE_SCHEMA_ID.to_string(),
                enabled: true,
            })
            .await?;

        if let Err(e) = self
            .backend
            .update_property(&object_id, BRIDGE_PROPERTY, &context.bridge_object_id)
            .await
        {
            warn!(error = %e, %object_id, "Failed to link device to bridge");
        }
        if let Err(e) = self
            .backend
            .update_property(&object_id, TOPIC_BASE_PROPERTY, &target.key)
            .await
        {
            warn!(error = %e, %object_id, "Failed to set device topic base");
        }
        info!(%object_id, "Generic device created");
        Ok(())
    }
}

#[async_trait]
impl TopicResolver for PatternTopicResolver {
    async fn resolve(&self, topic: &str, context: &ResolveContext) -> BridgeResult<Resolution> {
        let resolution = self.routing_key(topic);
        if !context.auto_provision {
            return Ok(resolution);
        }

        match self.provision_key(topic) {
            Some(target) => {
                self.check_or_create_device(&target, context).await?;
                Ok(Resolution {
                    routing_key: target.key,
                    known: true,
                })
            }
            None => Ok(resolution),
        }
    }
}
