//! MQTT bridge runtime
//!
//! Bridges field devices speaking MQTT to a GraphQL object-graph backend.
//!
//! # Overview
//!
//! This crate provides the long-lived pieces of the bridge:
//! - Broker client with acknowledged connect, publish and subscribe
//! - `graphql-ws` subscription client with a pure handshake state machine
//! - Control command routing (acknowledge, dispatch, report)
//! - Supervisors restarting terminated subscriptions after a back-off
//! - The bridge lifecycle tying it all together
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_bridge::state::TopicSet;
//!
//! // The `Topics` property is a comma-separated list of topic filters
//! let mut topics = TopicSet::parse("/gw/+/status, SENSO8/nbiot/#");
//! assert_eq!(topics.len(), 2);
//!
//! // Adding a topic twice is rejected and leaves the set unchanged
//! assert!(topics.add("/gw/+/status").is_err());
//! assert_eq!(topics.to_property_value(), "/gw/+/status,SENSO8/nbiot/#");
//! ```

pub mod backend;
pub mod bridge;
pub mod config;
pub mod control;
pub mod error;
pub mod observability;
pub mod resolver;
pub mod state;
pub mod subscription;
pub mod supervisor;
pub mod testing;
pub mod transport;

pub use backend::{BackendApi, BackendError, HttpBackend};
pub use bridge::{Bridge, BridgeDeps};
pub use config::{BridgeConfig, ConfigError};
pub use control::{CommandHandlers, ControlCommand, ControlRouter};
pub use error::{BridgeError, BridgeResult};
pub use state::{TopicError, TopicSet};
pub use subscription::{SubscriptionClient, SubscriptionError};
pub use supervisor::SubscriptionSupervisor;
pub use transport::mqtt::MqttClient;
pub use transport::BrokerClient;
