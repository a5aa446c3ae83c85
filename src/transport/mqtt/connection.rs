//! Pure connection state management for MQTT client
//!
//! This module contains pure functions for connection state management,
//! broker URL handling and option construction.

use rumqttc::{MqttOptions, Transport as RumqttcTransport};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default keep-alive of a bridge broker session
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Session requested, waiting for ConnAck
    Connecting,
    /// Broker accepted the session
    Connected,
    /// No session, with the reason the last one ended
    Disconnected(String),
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected("never connected".to_string())
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("No connection acknowledgment within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Publishing to {topic} failed: {reason}")]
    PublishFailed { topic: String, reason: String },
    #[error("Subscription to {topic} failed: {reason}")]
    SubscriptionFailed { topic: String, reason: String },
    #[error("No broker acknowledgment for {operation} within {timeout:?}")]
    AckTimeout {
        operation: &'static str,
        timeout: Duration,
    },
}

/// Whether the URL scheme asks for a TLS session
fn scheme_uses_tls(scheme: &str) -> Result<bool, ()> {
    match scheme {
        "tcp" | "mqtt" => Ok(false),
        "ssl" | "tls" | "mqtts" => Ok(true),
        _ => Err(()),
    }
}

/// Pure function to build session options from a broker URL and credentials
///
/// Accepts `tcp://`/`mqtt://` (port 1883 by default) and
/// `ssl://`/`tls://`/`mqtts://` (port 8883 by default, rustls).
pub fn configure_mqtt_options(
    client_id: &str,
    broker_url: &str,
    username: &str,
    password: &str,
    keep_alive: Duration,
) -> Result<MqttOptions, MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    let use_tls = scheme_uses_tls(url.scheme())
        .map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = url.port().unwrap_or(if use_tls { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if use_tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if !username.is_empty() {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(keep_alive);
    mqtt_options.set_clean_session(true);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_url_with_port() {
        let options =
            configure_mqtt_options("bridge", "tcp://broker.local:1884", "", "", DEFAULT_KEEP_ALIVE)
                .unwrap();

        assert_eq!(
            options.broker_address(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(options.keep_alive(), DEFAULT_KEEP_ALIVE);
        assert!(options.clean_session());
        assert!(options.credentials().is_none());
    }

    #[test]
    fn test_default_ports() {
        let plain = configure_mqtt_options("b", "mqtt://broker", "", "", DEFAULT_KEEP_ALIVE)
            .unwrap();
        let tls = configure_mqtt_options("b", "ssl://broker", "", "", DEFAULT_KEEP_ALIVE).unwrap();

        assert_eq!(plain.broker_address().1, 1883);
        assert_eq!(tls.broker_address().1, 8883);
    }

    #[test]
    fn test_credentials_are_set_when_username_present() {
        let options =
            configure_mqtt_options("b", "tcp://broker:1883", "dev", "pw", DEFAULT_KEEP_ALIVE)
                .unwrap();

        assert_eq!(
            options.credentials(),
            Some(("dev".to_string(), "pw".to_string()))
        );
    }

    #[test]
    fn test_invalid_urls_are_rejected() {
        for url in ["", "broker:1883", "http://broker:1883", "tcp://"] {
            let result = configure_mqtt_options("b", url, "", "", DEFAULT_KEEP_ALIVE);
            assert!(
                matches!(result, Err(MqttError::InvalidBrokerUrl(_))),
                "expected rejection for {url:?}"
            );
        }
    }

    #[test]
    fn test_default_state_is_disconnected() {
        assert!(matches!(
            ConnectionState::default(),
            ConnectionState::Disconnected(_)
        ));
    }
}
