//! Message broker transport
//!
//! This module provides the broker abstraction the bridge depends on and its
//! MQTT implementation. The trait is the seam for dependency injection; tests
//! use `testing::MockBroker`.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub mod mqtt;

pub use mqtt::{MqttClient, MqttError};

/// Message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Receiver of inbound broker messages
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage);
}

/// Connect/publish/subscribe client over one persistent broker session
///
/// Every blocking operation waits at most the client's fixed wait timeout for
/// the broker's acknowledgment. Reconnection is never automatic: owners poll
/// [`BrokerClient::is_connected`] and rebuild the session themselves.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open a session and wait for the broker to accept it
    async fn connect(&self, url: &str, username: &str, password: &str) -> Result<(), MqttError>;

    /// Publish with at-least-once delivery and wait for the acknowledgment
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;

    /// Subscribe a topic filter and route matching messages to `handler`
    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), MqttError>;

    /// Non-blocking liveness check
    fn is_connected(&self) -> bool;

    /// Best-effort, idempotent session teardown
    async fn disconnect(&self);
}
