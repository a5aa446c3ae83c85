//! Mock implementations for testing
//!
//! Provides mock BackendApi, BrokerClient, CommandHandlers and
//! SubscriptionSource implementations that record every call and can be
//! switched into failure.

use crate::backend::{
    BackendApi, BackendError, BackendResult, CompletionReport, GraphQlRequest, NewObject,
    ObjectSummary,
};
use crate::control::{
    BrokerUrlArgs, CommandHandlers, ControlCommand, FlagArgs, PasswordArgs, PublishArgs,
    TopicsArgs, UsernameArgs,
};
use crate::error::{BridgeError, BridgeResult};
use crate::state::Credential;
use crate::subscription::{PayloadHandler, SessionEnd, SubscriptionError, SubscriptionSession};
use crate::supervisor::{SessionFactory, SubscriptionSource};
use crate::transport::mqtt::{topic_matches, MqttError};
use crate::transport::{BrokerClient, InboundHandler, InboundMessage};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stealth control created for an uplink
#[derive(Debug, Clone, PartialEq)]
pub struct StealthControl {
    pub name: String,
    pub params: Value,
    pub group: String,
    pub property: String,
    pub value: String,
}

/// Mock backend with an in-memory object graph
#[derive(Debug)]
pub struct MockBackend {
    pub user_id: String,
    pub object_id: String,
    pub token_id: String,
    should_fail: AtomicBool,
    bind_failures: AtomicUsize,
    binds: AtomicUsize,
    refreshes: AtomicUsize,
    events: Mutex<Vec<String>>,
    acks: Mutex<Vec<i64>>,
    reports: Mutex<Vec<CompletionReport>>,
    stealth_controls: Mutex<Vec<StealthControl>>,
    properties: Mutex<HashMap<(String, String), String>>,
    property_updates: Mutex<Vec<(String, String, String)>>,
    objects: Mutex<Vec<(String, ObjectSummary)>>,
    created_objects: Mutex<Vec<NewObject>>,
    imported_schemas: Mutex<Vec<Value>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            user_id: "user-1".to_string(),
            object_id: "bridge-obj".to_string(),
            token_id: "token-1".to_string(),
            should_fail: AtomicBool::new(false),
            bind_failures: AtomicUsize::new(0),
            binds: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            stealth_controls: Mutex::new(Vec::new()),
            properties: Mutex::new(HashMap::new()),
            property_updates: Mutex::new(Vec::new()),
            objects: Mutex::new(Vec::new()),
            created_objects: Mutex::new(Vec::new()),
            imported_schemas: Mutex::new(Vec::new()),
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails
    pub fn with_failure(self) -> Self {
        self.should_fail.store(true, Ordering::SeqCst);
        self
    }

    /// The first `count` binds fail
    pub fn with_bind_failures(self, count: usize) -> Self {
        self.bind_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Bridge object carrying the given broker properties
    pub fn with_broker_properties(self, url: &str, username: &str, password: &str, topics: &str) -> Self {
        let object_id = self.object_id.clone();
        self.set_property(&object_id, "BrokerURL", url);
        self.set_property(&object_id, "Username", username);
        self.set_property(&object_id, "Password", password);
        self.set_property(&object_id, "Topics", topics);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::SeqCst);
    }

    pub fn add_object(&self, schema_id: &str, id: &str, name: &str) {
        locked(&self.objects).push((
            schema_id.to_string(),
            ObjectSummary {
                id: id.to_string(),
                name: name.to_string(),
            },
        ));
    }

    pub fn set_property(&self, object_id: &str, property: &str, value: &str) {
        locked(&self.properties).insert(
            (object_id.to_string(), property.to_string()),
            value.to_string(),
        );
    }

    pub fn property(&self, object_id: &str, property: &str) -> Option<String> {
        locked(&self.properties)
            .get(&(object_id.to_string(), property.to_string()))
            .cloned()
    }

    /// Calls in order, e.g. `ack:7`, `report:7`, `bind`
    pub fn events(&self) -> Vec<String> {
        locked(&self.events).clone()
    }

    pub fn acks(&self) -> Vec<i64> {
        locked(&self.acks).clone()
    }

    pub fn reports(&self) -> Vec<CompletionReport> {
        locked(&self.reports).clone()
    }

    pub fn stealth_controls(&self) -> Vec<StealthControl> {
        locked(&self.stealth_controls).clone()
    }

    pub fn property_updates(&self) -> Vec<(String, String, String)> {
        locked(&self.property_updates).clone()
    }

    pub fn created_objects(&self) -> Vec<NewObject> {
        locked(&self.created_objects).clone()
    }

    pub fn imported_schemas(&self) -> Vec<Value> {
        locked(&self.imported_schemas).clone()
    }

    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn record(&self, event: impl Into<String>) {
        locked(&self.events).push(event.into());
    }

    fn check(&self, operation: &str) -> BackendResult<()> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(BackendError::api(vec![format!("Mock {operation} failure")]));
        }
        Ok(())
    }

    fn credential(&self, serial: usize) -> Credential {
        Credential {
            session_token: format!("session-{serial}"),
            expires_at: chrono::Utc::now().timestamp() + 3600,
            refresh_token: "refresh-1".to_string(),
            token_id: self.token_id.clone(),
        }
    }
}

#[async_trait]
impl BackendApi for MockBackend {
    async fn bind(&self) -> BackendResult<Credential> {
        self.record("bind");
        let serial = self.binds.fetch_add(1, Ordering::SeqCst);
        if self
            .bind_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BackendError::api(vec!["Mock bind failure".to_string()]));
        }
        self.check("bind")?;
        Ok(self.credential(serial))
    }

    async fn refresh_access_token(&self, _current: &Credential) -> BackendResult<Credential> {
        self.record("refresh");
        self.check("refresh")?;
        let serial = self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.credential(1000 + serial))
    }

    async fn ack_control(&self, control_id: i64) -> BackendResult<()> {
        self.record(format!("ack:{control_id}"));
        self.check("ack")?;
        locked(&self.acks).push(control_id);
        Ok(())
    }

    async fn report_control(&self, report: &CompletionReport) -> BackendResult<()> {
        self.record(format!("report:{}", report.control_id));
        self.check("report")?;
        locked(&self.reports).push(report.clone());
        Ok(())
    }

    async fn create_stealth_control_by_property(
        &self,
        name: &str,
        params: &Value,
        group: &str,
        property: &str,
        value: &str,
    ) -> BackendResult<()> {
        self.record(format!("stealth:{name}"));
        self.check("stealth control")?;
        locked(&self.stealth_controls).push(StealthControl {
            name: name.to_string(),
            params: params.clone(),
            group: group.to_string(),
            property: property.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn get_property_value(&self, object_id: &str, property: &str) -> BackendResult<String> {
        self.check("property read")?;
        self.property(object_id, property)
            .ok_or(BackendError::MissingData("property"))
    }

    async fn update_property(&self, object_id: &str, property: &str, value: &str) -> BackendResult<()> {
        self.record(format!("update:{property}"));
        self.check("property update")?;
        locked(&self.property_updates).push((
            object_id.to_string(),
            property.to_string(),
            value.to_string(),
        ));
        self.set_property(object_id, property, value);
        Ok(())
    }

    async fn user_id(&self) -> BackendResult<String> {
        self.check("user id")?;
        Ok(self.user_id.clone())
    }

    async fn profile_object_id(&self) -> BackendResult<String> {
        self.check("profile")?;
        Ok(self.object_id.clone())
    }

    async fn import_schema(&self, schema: &Value) -> BackendResult<String> {
        self.check("schema import")?;
        locked(&self.imported_schemas).push(schema.clone());
        Ok("schema-1".to_string())
    }

    async fn list_objects_by_schema(&self, schema_id: &str) -> BackendResult<Vec<ObjectSummary>> {
        self.check("object list")?;
        Ok(locked(&self.objects)
            .iter()
            .filter(|(schema, _)| schema == schema_id)
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create_object(&self, object: &NewObject) -> BackendResult<String> {
        self.check("object create")?;
        locked(&self.created_objects).push(object.clone());
        self.add_object(&object.schema_id, &object.id, &object.name);
        Ok(object.id.clone())
    }
}

/// Broker call recorded by [`MockBroker`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connect { url: String, username: String },
    Disconnect,
    Subscribe(String),
    Publish { topic: String, payload: Vec<u8> },
}

/// Mock broker client
#[derive(Default)]
pub struct MockBroker {
    connected: AtomicBool,
    should_fail: AtomicBool,
    events: Mutex<Vec<BrokerEvent>>,
    handlers: Mutex<Vec<(String, Arc<dyn InboundHandler>)>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect, publish and subscribe fail
    pub fn with_failure(self) -> Self {
        self.should_fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        locked(&self.events).clone()
    }

    pub fn clear_events(&self) {
        locked(&self.events).clear();
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        locked(&self.handlers)
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Silent connection loss, as a network drop would cause
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Deliver a message to the handlers of matching filters
    pub async fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        let payload = payload.into();
        let targets: Vec<Arc<dyn InboundHandler>> = locked(&self.handlers)
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in targets {
            handler
                .handle(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                })
                .await;
        }
    }

    fn record(&self, event: BrokerEvent) {
        locked(&self.events).push(event);
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn connect(&self, url: &str, username: &str, _password: &str) -> Result<(), MqttError> {
        self.record(BrokerEvent::Connect {
            url: url.to_string(),
            username: username.to_string(),
        });
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(MqttError::ConnectionFailed("Mock connection failure".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed {
                topic: topic.to_string(),
                reason: "Mock publish failure".to_string(),
            });
        }
        self.record(BrokerEvent::Publish {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn InboundHandler>) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        self.record(BrokerEvent::Subscribe(topic.to_string()));
        let mut handlers = locked(&self.handlers);
        handlers.retain(|(filter, _)| filter != topic);
        handlers.push((topic.to_string(), handler));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.record(BrokerEvent::Disconnect);
        self.connected.store(false, Ordering::SeqCst);
        locked(&self.handlers).clear();
    }
}

/// Mock command handlers recording each call as `name` or `name:argument`
#[derive(Debug, Default)]
pub struct MockCommandHandlers {
    calls: Mutex<Vec<String>>,
    should_fail: bool,
}

impl MockCommandHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    fn record(&self, call: String) -> BridgeResult<()> {
        locked(&self.calls).push(call);
        if self.should_fail {
            return Err(BridgeError::internal("Mock handler failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandlers for MockCommandHandlers {
    async fn publish(&self, args: PublishArgs) -> BridgeResult<()> {
        self.record(format!("publish:{}", args.topic_name))
    }

    async fn reload(&self) -> BridgeResult<()> {
        self.record("reload".to_string())
    }

    async fn test_module(&self, command: &ControlCommand) -> BridgeResult<()> {
        self.record(format!("test:{}", command.id))
    }

    async fn set_topics(&self, args: TopicsArgs) -> BridgeResult<()> {
        self.record(format!("set_topics:{}", args.topics))
    }

    async fn set_broker_url(&self, args: BrokerUrlArgs) -> BridgeResult<()> {
        self.record(format!("set_broker_url:{}", args.hostname))
    }

    async fn set_username(&self, args: UsernameArgs) -> BridgeResult<()> {
        self.record(format!("set_username:{}", args.username))
    }

    async fn set_password(&self, _args: PasswordArgs) -> BridgeResult<()> {
        self.record("set_password".to_string())
    }

    async fn set_auto_provision(&self, args: FlagArgs) -> BridgeResult<()> {
        self.record(format!("set_auto_provision:{}", args.enable))
    }
}

/// Subscription source whose sessions run until cancelled
///
/// Handlers are captured so tests can push payloads as if they arrived on the
/// socket.
#[derive(Default)]
pub struct MockSubscriptions {
    state: Arc<MockSubscriptionState>,
}

#[derive(Default)]
struct MockSubscriptionState {
    should_fail: AtomicBool,
    starts: AtomicUsize,
    channels: Mutex<Vec<(GraphQlRequest, Arc<dyn PayloadHandler>)>>,
    sessions: Mutex<Vec<CancellationToken>>,
}

struct MockSessionFactory {
    state: Arc<MockSubscriptionState>,
    request: GraphQlRequest,
}

impl MockSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starting a session fails
    pub fn set_failing(&self, failing: bool) {
        self.state.should_fail.store(failing, Ordering::SeqCst);
    }

    /// Sessions started so far
    pub fn start_count(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    /// Topics of every subscription request handed out
    pub fn topics(&self) -> Vec<String> {
        locked(&self.state.channels)
            .iter()
            .filter_map(|(request, _)| request.variables["topic"].as_str().map(str::to_string))
            .collect()
    }

    /// Sessions that are still running
    pub fn live_sessions(&self) -> usize {
        locked(&self.state.sessions)
            .iter()
            .filter(|cancel| !cancel.is_cancelled())
            .count()
    }

    /// Hand `payload` to the newest handler whose topic starts with `prefix`
    pub async fn deliver(&self, prefix: &str, payload: Value) -> BridgeResult<()> {
        let handler = locked(&self.state.channels)
            .iter()
            .rev()
            .find(|(request, _)| {
                request.variables["topic"]
                    .as_str()
                    .is_some_and(|topic| topic.starts_with(prefix))
            })
            .map(|(_, handler)| handler.clone())
            .ok_or_else(|| BridgeError::internal(format!("no subscription on {prefix}")))?;
        handler.handle(payload).await
    }
}

impl SubscriptionSource for MockSubscriptions {
    fn factory(
        &self,
        request: GraphQlRequest,
        handler: Arc<dyn PayloadHandler>,
    ) -> Arc<dyn SessionFactory> {
        locked(&self.state.channels).push((request.clone(), handler));
        Arc::new(MockSessionFactory {
            state: self.state.clone(),
            request,
        })
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn start(&self, parent: &CancellationToken) -> Result<SubscriptionSession, SubscriptionError> {
        if self.state.should_fail.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Connect("Mock subscription failure".to_string()));
        }
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(query = %self.request.query, "Mock session started");

        let cancel = parent.child_token();
        locked(&self.state.sessions).push(cancel.clone());
        let session_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            session_cancel.cancelled().await;
            SessionEnd::Cancelled
        });
        Ok(SubscriptionSession { cancel, handle })
    }
}
