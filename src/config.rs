//! Bridge configuration
//!
//! Configuration is read from a TOML file with serde defaults for every timing
//! knob, then overlaid with the `CONFIG_API_*` environment variables so that
//! deployments can inject backend credentials without touching the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Environment variable overriding `core.username`
pub const ENV_API_USERNAME: &str = "CONFIG_API_USERNAME";
/// Environment variable overriding `core.password`
pub const ENV_API_PASSWORD: &str = "CONFIG_API_PASSWORD";
/// Environment variable overriding `core.url`
pub const ENV_API_URL: &str = "CONFIG_API_URL";

/// Top-level bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub core: CoreSection,
    #[serde(default)]
    pub bridge: BridgeSection,
}

/// Backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreSection {
    /// GraphQL endpoint, also used to derive the subscription socket URL
    #[serde(default = "default_core_url")]
    pub url: String,
    /// Backend login
    #[serde(default)]
    pub username: String,
    /// Backend password (prefer `password_env` outside of development)
    #[serde(default)]
    pub password: String,
    /// Environment variable holding the backend password
    pub password_env: Option<String>,
    /// Access token lifetime requested on bind, in minutes
    #[serde(default = "default_token_ttl_mins")]
    pub token_ttl_mins: u32,
    /// Profile tags sent when requesting an access token
    #[serde(default = "default_profile_tags")]
    pub profile_tags: Vec<String>,
    /// Timeout for every request/response call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for CoreSection {
    fn default() -> Self {
        Self {
            url: default_core_url(),
            username: String::new(),
            password: String::new(),
            password_env: None,
            token_ttl_mins: default_token_ttl_mins(),
            profile_tags: default_profile_tags(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Runtime timing and feature switches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSection {
    /// Main loop tick
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Interval between `Message = Alive` property updates
    #[serde(default = "default_alive_interval")]
    pub alive_interval_secs: u64,
    /// Refresh the access token when it expires within this many seconds
    #[serde(default = "default_token_refresh_threshold")]
    pub token_refresh_threshold_secs: u64,
    /// Delay between failed core bind attempts
    #[serde(default = "default_bind_retry_interval")]
    pub bind_retry_interval_secs: u64,
    /// Back-off before a terminated subscription is restarted
    #[serde(default = "default_subscription_backoff")]
    pub subscription_backoff_secs: u64,
    /// Deadline for every subscription socket read
    #[serde(default = "default_subscription_read_timeout")]
    pub subscription_read_timeout_secs: u64,
    /// Wait for broker acknowledgments (connect, publish, subscribe)
    #[serde(default = "default_broker_wait_timeout")]
    pub broker_wait_timeout_secs: u64,
    /// Inbound broker payloads above this size are dropped
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Also follow property changes of the bridge object
    #[serde(default)]
    pub watch_properties: bool,
    /// Replaces the built-in application schema imported on every (re)start
    pub schema_file: Option<PathBuf>,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            alive_interval_secs: default_alive_interval(),
            token_refresh_threshold_secs: default_token_refresh_threshold(),
            bind_retry_interval_secs: default_bind_retry_interval(),
            subscription_backoff_secs: default_subscription_backoff(),
            subscription_read_timeout_secs: default_subscription_read_timeout(),
            broker_wait_timeout_secs: default_broker_wait_timeout(),
            max_payload_bytes: default_max_payload_bytes(),
            watch_properties: false,
            schema_file: None,
        }
    }
}

fn default_core_url() -> String {
    "http://127.0.0.1:5000/graphql".to_string()
}

fn default_token_ttl_mins() -> u32 {
    5
}

fn default_profile_tags() -> Vec<String> {
    vec![
        "application".to_string(),
        "mqtt bridge".to_string(),
        "app profile".to_string(),
    ]
}

fn default_request_timeout() -> u64 {
    30
}

fn default_tick_interval() -> u64 {
    1
}

fn default_alive_interval() -> u64 {
    20
}

fn default_token_refresh_threshold() -> u64 {
    15
}

fn default_bind_retry_interval() -> u64 {
    1
}

fn default_subscription_backoff() -> u64 {
    5
}

fn default_subscription_read_timeout() -> u64 {
    20
}

fn default_broker_wait_timeout() -> u64 {
    3
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from TOML file, apply environment overrides and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.finish()
    }

    /// Configuration built only from defaults and environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().finish()
    }

    fn finish(mut self) -> Result<Self, ConfigError> {
        self.resolve_env_vars()?;
        self.validate()?;
        Ok(self)
    }

    /// Overlay `CONFIG_API_*` variables and resolve `password_env`
    fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(password_env) = &self.core.password_env {
            self.core.password = Self::get_env_var_required(password_env)?;
        }
        if let Some(username) = Self::get_env_var_optional(ENV_API_USERNAME) {
            self.core.username = username;
        }
        if let Some(password) = Self::get_env_var_optional(ENV_API_PASSWORD) {
            self.core.password = password;
        }
        if let Some(url) = Self::get_env_var_optional(ENV_API_URL) {
            self.core.url = url;
        }
        Ok(())
    }

    fn get_env_var_optional(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|value| !value.is_empty())
    }

    fn get_env_var_required(name: &str) -> Result<String, ConfigError> {
        std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.to_string()))
    }

    /// Check the fields the runtime relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.core_url()?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidConfig(format!(
                "core.url must use http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.core.username.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "core.username is required (or set CONFIG_API_USERNAME)".to_string(),
            ));
        }
        if self.core.token_ttl_mins == 0 {
            return Err(ConfigError::InvalidConfig(
                "core.token_ttl_mins must be positive".to_string(),
            ));
        }

        let intervals = [
            ("tick_interval_secs", self.bridge.tick_interval_secs),
            ("alive_interval_secs", self.bridge.alive_interval_secs),
            ("bind_retry_interval_secs", self.bridge.bind_retry_interval_secs),
            ("subscription_backoff_secs", self.bridge.subscription_backoff_secs),
            (
                "subscription_read_timeout_secs",
                self.bridge.subscription_read_timeout_secs,
            ),
            ("broker_wait_timeout_secs", self.bridge.broker_wait_timeout_secs),
            ("request_timeout_secs", self.core.request_timeout_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::InvalidConfig(format!(
                "{name} must be positive"
            )));
        }
        Ok(())
    }

    /// Parsed backend URL
    pub fn core_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.core.url)
            .map_err(|e| ConfigError::InvalidConfig(format!("core.url '{}': {e}", self.core.url)))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.tick_interval_secs)
    }

    pub fn alive_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.alive_interval_secs)
    }

    pub fn token_refresh_threshold(&self) -> Duration {
        Duration::from_secs(self.bridge.token_refresh_threshold_secs)
    }

    pub fn bind_retry_interval(&self) -> Duration {
        Duration::from_secs(self.bridge.bind_retry_interval_secs)
    }

    pub fn subscription_backoff(&self) -> Duration {
        Duration::from_secs(self.bridge.subscription_backoff_secs)
    }

    pub fn subscription_read_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.subscription_read_timeout_secs)
    }

    pub fn broker_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.bridge.broker_wait_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.core.request_timeout_secs)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[core]
url = "http://localhost:5000/graphql"
username = "bridge"
password = "secret"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
