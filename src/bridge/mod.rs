//! Bridge application lifecycle
//!
//! [`Bridge`] owns the shared state and the collaborators of one running
//! bridge: the backend API, the broker client, the topic resolver and the
//! subscription source. Its pieces live in submodules:
//!
//! - [`lifecycle`] - Start, restart, shutdown and the main supervision loop
//! - [`transport`] - Broker bind/unbind sequences and uplink forwarding
//! - [`handlers`] - Side effects of the remote control commands
//! - [`properties`] - Property-change channel of the bridge object
//! - [`schema`] - Built-in application schema

pub mod handlers;
pub mod lifecycle;
pub mod properties;
pub mod schema;
pub mod transport;

use crate::backend::{BackendApi, HttpBackend, HttpBackendConfig};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::resolver::{PatternTopicResolver, TopicResolver};
use crate::state::{AutoProvision, BrokerConnectionParams, Identity, SharedState, TokenStore};
use crate::subscription::{SubscriptionClient, SubscriptionOptions};
use crate::supervisor::SubscriptionSource;
use crate::transport::{BrokerClient, MqttClient};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use properties::{property_subscription, PropertyChange, PropertyChannel};
pub use transport::UplinkHandler;

/// Properties of the bridge object read or written by the runtime
pub mod property {
    pub const BROKER_URL: &str = "BrokerURL";
    pub const USERNAME: &str = "Username";
    pub const PASSWORD: &str = "Password";
    pub const TOPICS: &str = "Topics";
    pub const AUTO_PROVISION: &str = "AUTO_PROVISION";
    pub const CONNECTION_STATE: &str = "ConnectionState";
    pub const MESSAGE: &str = "Message";
}

/// Collaborators injected into a [`Bridge`]
pub struct BridgeDeps {
    pub backend: Arc<dyn BackendApi>,
    pub broker: Arc<dyn BrokerClient>,
    pub resolver: Arc<dyn TopicResolver>,
    pub subscriptions: Arc<dyn SubscriptionSource>,
    pub tokens: Arc<TokenStore>,
}

/// Supervisors started together and stopped together on restart
struct Generation {
    cancel: CancellationToken,
    supervisors: Vec<JoinHandle<u64>>,
}

impl Generation {
    async fn stop(self) {
        self.cancel.cancel();
        for supervisor in self.supervisors {
            if let Err(e) = supervisor.await {
                tracing::warn!(error = %e, "Subscription watcher ended abnormally");
            }
        }
    }
}

/// One running bridge between the broker and the backend
pub struct Bridge {
    config: BridgeConfig,
    backend: Arc<dyn BackendApi>,
    broker: Arc<dyn BrokerClient>,
    resolver: Arc<dyn TopicResolver>,
    subscriptions: Arc<dyn SubscriptionSource>,
    tokens: Arc<TokenStore>,
    broker_params: SharedState<BrokerConnectionParams>,
    identity: SharedState<Identity>,
    auto_provision: AutoProvision,
    /// Serializes the broker bind/unbind sequences
    transport_lock: Mutex<()>,
    /// Current subscription generation; held for the whole of a restart
    generation: Mutex<Option<Generation>>,
    root: CancellationToken,
    self_ref: Weak<Bridge>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, deps: BridgeDeps) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            backend: deps.backend,
            broker: deps.broker,
            resolver: deps.resolver,
            subscriptions: deps.subscriptions,
            tokens: deps.tokens,
            broker_params: SharedState::new(BrokerConnectionParams::default()),
            identity: SharedState::new(Identity::default()),
            auto_provision: AutoProvision::new(false),
            transport_lock: Mutex::new(()),
            generation: Mutex::new(None),
            root: CancellationToken::new(),
            self_ref: self_ref.clone(),
        })
    }

    /// Wire the production collaborators for `config`
    pub fn from_config(config: BridgeConfig) -> BridgeResult<Arc<Self>> {
        let tokens = Arc::new(TokenStore::new());

        let backend: Arc<dyn BackendApi> = Arc::new(HttpBackend::new(
            HttpBackendConfig::from_config(&config)?,
            tokens.clone(),
        )?);
        let broker = Arc::new(MqttClient::with_wait_timeout(config.broker_wait_timeout()));
        let resolver = Arc::new(PatternTopicResolver::new(backend.clone())?);
        let subscriptions = Arc::new(SubscriptionClient::new(
            &config.core_url()?,
            tokens.clone(),
            SubscriptionOptions {
                read_timeout: config.subscription_read_timeout(),
            },
        )?);

        Ok(Self::new(
            config,
            BridgeDeps {
                backend,
                broker,
                resolver,
                subscriptions,
                tokens,
            },
        ))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Root of the cancellation tree; cancelling it stops every loop
    pub fn cancellation_token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn broker_params(&self) -> BrokerConnectionParams {
        self.broker_params.load()
    }

    pub fn identity(&self) -> Identity {
        self.identity.load()
    }

    pub fn auto_provision(&self) -> bool {
        self.auto_provision.enabled()
    }

    fn strong(&self) -> BridgeResult<Arc<Bridge>> {
        self.self_ref
            .upgrade()
            .ok_or_else(|| BridgeError::internal("bridge is shutting down"))
    }

    /// Write a property of the bridge's own object
    async fn set_own_property(&self, property: &str, value: &str) -> BridgeResult<()> {
        let object_id = self.identity.load().object_id;
        self.backend
            .update_property(&object_id, property, value)
            .await?;
        Ok(())
    }
}
