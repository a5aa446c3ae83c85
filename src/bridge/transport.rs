//! Broker bind/unbind sequences and uplink forwarding
//!
//! Every sequence takes the transport lock, so a reconnect from the main loop
//! and a restart from a command handler never interleave.

use super::{property, Bridge};
use crate::error::{BridgeError, BridgeResult};
use crate::resolver::{ResolveContext, TOPIC_BASE_PROPERTY};
use crate::state::{BrokerConnectionParams, TopicSet};
use crate::transport::{InboundHandler, InboundMessage};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn, Instrument};

/// Backend command that decodes one uplink payload
pub const DECODE_COMMAND: &str = "DecodePayload";
/// Property group searched for the routing key of a device
pub const ROUTING_GROUP: &str = "Credentials";

impl Bridge {
    /// Connect to the broker with the current parameters
    pub async fn bind_transport(&self) -> BridgeResult<()> {
        let _guard = self.transport_lock.lock().await;
        self.bind_transport_locked().await
    }

    /// Disconnect from the broker
    pub async fn unbind_transport(&self) {
        let _guard = self.transport_lock.lock().await;
        self.unbind_transport_locked().await;
    }

    /// Subscribe every topic of the current set
    pub async fn subscribe_to_topics(&self) -> BridgeResult<()> {
        let _guard = self.transport_lock.lock().await;
        self.subscribe_to_topics_locked().await
    }

    /// Unbind, bind and re-subscribe with the parameters already held
    pub async fn transport_reconnect(&self) -> BridgeResult<()> {
        let span = crate::mqtt_span!(operation = "reconnect");
        async {
            let _guard = self.transport_lock.lock().await;
            self.unbind_transport_locked().await;
            self.bind_transport_locked().await?;
            if self.broker.is_connected() {
                self.subscribe_to_topics_locked().await?;
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Like [`Bridge::transport_reconnect`], re-reading the parameters first
    pub async fn transport_restart(&self) -> BridgeResult<()> {
        let span = crate::mqtt_span!(operation = "restart");
        async {
            let _guard = self.transport_lock.lock().await;
            self.unbind_transport_locked().await;
            self.load_broker_params().await?;
            self.bind_transport_locked().await?;
            if self.broker.is_connected() {
                self.subscribe_to_topics_locked().await?;
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Read the broker parameters from the bridge object and keep them
    pub(super) async fn load_broker_params(&self) -> BridgeResult<BrokerConnectionParams> {
        let object_id = self.identity.load().object_id;
        let backend = &self.backend;

        let url = backend
            .get_property_value(&object_id, property::BROKER_URL)
            .await?;
        let username = backend
            .get_property_value(&object_id, property::USERNAME)
            .await?;
        let password = backend
            .get_property_value(&object_id, property::PASSWORD)
            .await?;
        let topics = backend
            .get_property_value(&object_id, property::TOPICS)
            .await?;

        let params = BrokerConnectionParams {
            url,
            username,
            password,
            topics: TopicSet::parse(&topics),
        };
        self.broker_params.store(params.clone());
        Ok(params)
    }

    async fn bind_transport_locked(&self) -> BridgeResult<()> {
        let params = self.broker_params.load();
        info!(broker = %params.url, "Connecting to broker");
        self.broker
            .connect(&params.url, &params.username, &params.password)
            .await?;

        if self.broker.is_connected() {
            info!(broker = %params.url, "Broker connected");
            self.report_connection_state("connected").await;
        }
        Ok(())
    }

    async fn unbind_transport_locked(&self) {
        self.broker.disconnect().await;
        self.report_connection_state("disconnected").await;
    }

    /// Try every topic; the last failure is returned
    async fn subscribe_to_topics_locked(&self) -> BridgeResult<()> {
        let Some(uplink) = UplinkHandler::new(self.self_ref.clone()) else {
            return Err(BridgeError::internal("bridge is shutting down"));
        };
        let uplink: Arc<dyn InboundHandler> = Arc::new(uplink);

        let topics = self.broker_params.load().topics;
        let mut outcome = Ok(());
        for topic in topics.iter() {
            match self.broker.subscribe(topic, uplink.clone()).await {
                Ok(()) => info!(%topic, "Subscribed to broker topic"),
                Err(e) => {
                    warn!(%topic, error = %e, "Broker subscription failed");
                    outcome = Err(e.into());
                }
            }
        }
        outcome
    }

    async fn report_connection_state(&self, state: &str) {
        if let Err(e) = self.set_own_property(property::CONNECTION_STATE, state).await {
            warn!(error = %e, state, "Failed to report broker connection state");
        }
    }

    /// Resolve one inbound message and hand it to the backend decoder
    pub async fn forward_uplink(&self, message: InboundMessage) -> BridgeResult<()> {
        let limit = self.config.bridge.max_payload_bytes;
        if message.payload.len() > limit {
            warn!(
                topic = %message.topic,
                size = message.payload.len(),
                limit,
                "Uplink payload too large, dropped"
            );
            return Ok(());
        }

        let context = ResolveContext {
            bridge_object_id: self.identity.load().object_id,
            auto_provision: self.auto_provision.enabled(),
        };
        let resolution = self.resolver.resolve(&message.topic, &context).await?;
        debug!(
            topic = %message.topic,
            routing_key = %resolution.routing_key,
            known = resolution.known,
            "Uplink resolved"
        );

        let params = json!({
            "topicName": message.topic,
            "payload": STANDARD.encode(&message.payload),
        });
        self.backend
            .create_stealth_control_by_property(
                DECODE_COMMAND,
                &params,
                ROUTING_GROUP,
                TOPIC_BASE_PROPERTY,
                &resolution.routing_key,
            )
            .await?;
        Ok(())
    }
}

/// Broker handler forwarding every message to the bridge
pub struct UplinkHandler {
    bridge: Weak<Bridge>,
}

impl UplinkHandler {
    /// `None` once the bridge is gone
    pub fn new(bridge: Weak<Bridge>) -> Option<Self> {
        (bridge.strong_count() > 0).then_some(Self { bridge })
    }
}

#[async_trait]
impl InboundHandler for UplinkHandler {
    async fn handle(&self, message: InboundMessage) {
        let Some(bridge) = self.bridge.upgrade() else {
            return;
        };
        let topic = message.topic.clone();
        if let Err(e) = bridge.forward_uplink(message).await {
            warn!(%topic, error = %e, "Uplink forwarding failed");
        }
    }
}
