//! Error taxonomy for the bridge runtime
//!
//! Transport and protocol errors end the current session and are left to the
//! supervisors; application errors are logged and, for commands, answered
//! through the completion report.

use crate::backend::BackendError;
use crate::state::TopicError;
use crate::subscription::SubscriptionError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Broker transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Unknown command: {name}")]
    UnknownCommand { name: String },

    #[error("Invalid parameters for {command}: {message}")]
    InvalidParams { command: String, message: String },

    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BridgeError {
    /// Create unknown command error
    pub fn unknown_command<S: Into<String>>(name: S) -> Self {
        Self::UnknownCommand { name: name.into() }
    }

    /// Create invalid parameters error
    pub fn invalid_params<C: Into<String>, M: Into<String>>(command: C, message: M) -> Self {
        Self::InvalidParams {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the error ends the session it happened in
    ///
    /// Such errors are never retried in place: the session is torn down and
    /// its supervisor (or the main loop) brings up a fresh one.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            BridgeError::Transport(_) => true,
            BridgeError::Subscription(_) => true,
            BridgeError::Backend(e) => e.is_transport(),
            _ => false,
        }
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
