//! MQTT implementation of the broker transport
//!
//! The module separates pure functions from I/O operations:
//!
//! - [`connection`] - Pure connection state and option construction
//! - [`message_handler`] - Pure event routing, acknowledgment correlation and
//!   topic filter matching
//! - [`client`] - Impure I/O operations and session coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_bridge::transport::{BrokerClient, MqttClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = MqttClient::new();
//! client.connect("tcp://localhost:1883", "", "").await?;
//! client.publish("devices/alive", b"Alive".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttClient, DEFAULT_WAIT_TIMEOUT};
pub use connection::{configure_mqtt_options, ConnectionState, MqttError, DEFAULT_KEEP_ALIVE};
pub use message_handler::{topic_matches, AckTracker, EventRoute, MessageHandler};
