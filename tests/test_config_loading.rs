//! Configuration file loading tests

use mqtt_bridge::config::{BridgeConfig, ConfigError};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_minimal_file_uses_runtime_defaults() {
    // Arrange
    let file = write_config(
        r#"
[core]
url = "https://core.example.com/graphql"
username = "bridge"
password = "secret"
"#,
    );

    // Act
    let config = BridgeConfig::load_from_file(file.path()).expect("Config should load");

    // Assert
    assert_eq!(config.core_url().unwrap().host_str(), Some("core.example.com"));
    assert_eq!(config.tick_interval(), Duration::from_secs(1));
    assert_eq!(config.alive_interval(), Duration::from_secs(20));
    assert_eq!(config.token_refresh_threshold(), Duration::from_secs(15));
    assert_eq!(config.broker_wait_timeout(), Duration::from_secs(3));
    assert_eq!(config.bridge.max_payload_bytes, 64 * 1024);
    assert!(!config.bridge.watch_properties);
    assert!(config.bridge.schema_file.is_none());
}

#[test]
fn test_bridge_section_overrides() {
    let file = write_config(
        r#"
[core]
url = "http://127.0.0.1:5000/graphql"
username = "bridge"
profile_tags = ["application"]

[bridge]
alive_interval_secs = 60
max_payload_bytes = 1024
watch_properties = true
schema_file = "schema/mqtt-bridge.json"
"#,
    );

    let config = BridgeConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.alive_interval(), Duration::from_secs(60));
    assert_eq!(config.bridge.max_payload_bytes, 1024);
    assert!(config.bridge.watch_properties);
    assert_eq!(
        config.bridge.schema_file.as_deref(),
        Some(std::path::Path::new("schema/mqtt-bridge.json"))
    );
    assert_eq!(config.core.profile_tags, vec!["application".to_string()]);
}

#[test]
fn test_missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();

    let result = BridgeConfig::load_from_file(&dir.path().join("absent.toml"));

    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_invalid_values_are_rejected_on_load() {
    let file = write_config(
        r#"
[core]
url = "ftp://core.example.com"
username = "bridge"
"#,
    );

    let result = BridgeConfig::load_from_file(file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}
