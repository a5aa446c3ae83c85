//! Impure I/O operations for MQTT client
//!
//! This module owns the rumqttc session: it spawns the event loop and the
//! inbound dispatcher, waits for acknowledgments, and tears the session down.
//! A session never reconnects by itself; the first event loop error ends it.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, DEFAULT_KEEP_ALIVE};
use super::message_handler::{AckKind, AckTracker, EventRoute, HandlerRegistry, MessageHandler};
use crate::transport::{BrokerClient, InboundHandler, InboundMessage};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default wait for broker acknowledgments
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(3);

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const INBOUND_CHANNEL_CAPACITY: usize = 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type SharedAcks = Arc<StdMutex<AckTracker>>;
type SharedHandlers = Arc<RwLock<HandlerRegistry>>;
type PendingAck = oneshot::Receiver<Result<(), String>>;

/// One live broker session
struct Session {
    client: AsyncClient,
    acks: SharedAcks,
    send_gate: Arc<Mutex<()>>,
    cancel: CancellationToken,
    event_loop_handle: JoinHandle<()>,
    dispatch_handle: JoinHandle<()>,
}

/// MQTT broker client with a single identity per bridge instance
pub struct MqttClient {
    client_id: String,
    wait_timeout: Duration,
    keep_alive: Duration,
    state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    handlers: SharedHandlers,
}

impl Default for MqttClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttClient {
    pub fn new() -> Self {
        Self::with_wait_timeout(DEFAULT_WAIT_TIMEOUT)
    }

    pub fn with_wait_timeout(wait_timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Self {
            client_id: format!("mqtt-bridge-{}", Uuid::new_v4()),
            wait_timeout,
            keep_alive: DEFAULT_KEEP_ALIVE,
            state_tx,
            session: Mutex::new(None),
            handlers: Arc::new(RwLock::new(HandlerRegistry::default())),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// Get current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Watch connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Wait for connection confirmation (ConnAck) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(MqttError::ConnectionFailed(reason.clone()));
                    }
                    ConnectionState::Connecting => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailed(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        outcome.unwrap_or(Err(MqttError::ConnectTimeout(timeout)))
    }

    /// Drive the rumqttc event loop until it fails, the broker leaves, or
    /// the session is cancelled
    async fn run_event_loop(
        mut event_loop: EventLoop,
        state_tx: watch::Sender<ConnectionState>,
        acks: SharedAcks,
        inbound_tx: mpsc::Sender<InboundMessage>,
        cancel: CancellationToken,
    ) {
        let end_reason = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break "session closed by client".to_string(),
                event = event_loop.poll() => event,
            };

            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    error!(error = %e, "MQTT event loop error");
                    break e.to_string();
                }
            };

            match MessageHandler::route_mqtt_event(&event) {
                EventRoute::ConnectionAccepted => {
                    info!("MQTT broker accepted the session");
                    state_tx.send_replace(ConnectionState::Connected);
                }
                EventRoute::ConnectionRefused(reason) => {
                    warn!(%reason, "MQTT broker refused the session");
                    break reason;
                }
                EventRoute::MessageReceived { topic, payload } => {
                    debug!(%topic, bytes = payload.len(), "MQTT message received");
                    if inbound_tx
                        .send(InboundMessage { topic, payload })
                        .await
                        .is_err()
                    {
                        break "inbound dispatcher stopped".to_string();
                    }
                }
                EventRoute::PublishSent(pkid) => {
                    lock_acks(&acks).assign(AckKind::Publish, pkid);
                }
                EventRoute::PublishAcknowledged(pkid) => {
                    lock_acks(&acks).resolve(AckKind::Publish, pkid, Ok(()));
                }
                EventRoute::SubscribeSent(pkid) => {
                    lock_acks(&acks).assign(AckKind::Subscribe, pkid);
                }
                EventRoute::SubscriptionConfirmed { packet_id, granted } => {
                    let result = if granted {
                        Ok(())
                    } else {
                        Err("broker rejected the subscription".to_string())
                    };
                    lock_acks(&acks).resolve(AckKind::Subscribe, packet_id, result);
                }
                EventRoute::Disconnected => {
                    info!("MQTT broker closed the session");
                    break "broker closed the session".to_string();
                }
                EventRoute::InfrastructureEvent(event) => {
                    debug!(%event, "MQTT infrastructure event");
                }
                EventRoute::OutgoingEvent => {}
            }
        };

        lock_acks(&acks).fail_all(&end_reason);
        state_tx.send_replace(ConnectionState::Disconnected(end_reason));
        debug!("MQTT event loop stopped");
    }

    /// Feed inbound messages to the handlers of matching filters, in order
    async fn run_dispatcher(mut inbound_rx: mpsc::Receiver<InboundMessage>, handlers: SharedHandlers) {
        while let Some(message) = inbound_rx.recv().await {
            let targets = handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .matching(&message.topic);

            if targets.is_empty() {
                debug!(topic = %message.topic, "No handler for MQTT message");
            }
            for handler in targets {
                handler.handle(message.clone()).await;
            }
        }
    }

    /// Cancel a session and wait briefly for its tasks
    async fn teardown(session: Session, wait_timeout: Duration) {
        // Best-effort DISCONNECT while the event loop still runs
        if !session.event_loop_handle.is_finished() {
            let _ = tokio::time::timeout(wait_timeout, session.client.disconnect()).await;
        }
        session.cancel.cancel();

        let mut event_loop_handle = session.event_loop_handle;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut event_loop_handle)
            .await
            .is_err()
        {
            warn!("MQTT event loop did not stop in time, aborting");
            event_loop_handle.abort();
        }
        // Dispatcher ends once the event loop drops its sender
        let mut dispatch_handle = session.dispatch_handle;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut dispatch_handle)
            .await
            .is_err()
        {
            dispatch_handle.abort();
        }
    }

    /// Clone what a request needs without holding the session lock across I/O
    async fn live_session(&self) -> Result<Requester, MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected);
        }
        let guard = self.session.lock().await;
        guard
            .as_ref()
            .map(|session| Requester {
                client: session.client.clone(),
                acks: session.acks.clone(),
                send_gate: session.send_gate.clone(),
            })
            .ok_or(MqttError::NotConnected)
    }

    /// Wait for the acknowledgment of a request already handed to the client
    async fn await_ack(
        &self,
        rx: PendingAck,
        started: Instant,
        operation: &'static str,
    ) -> Result<Result<(), String>, MqttError> {
        let remaining = self.wait_timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(MqttError::NotConnected),
            Err(_) => Err(MqttError::AckTimeout {
                operation,
                timeout: self.wait_timeout,
            }),
        }
    }
}

fn lock_acks(acks: &SharedAcks) -> std::sync::MutexGuard<'_, AckTracker> {
    acks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handles of the live session used by one request
struct Requester {
    client: AsyncClient,
    acks: SharedAcks,
    send_gate: Arc<Mutex<()>>,
}

#[derive(Debug)]
enum SendFailure {
    Rejected(String),
    QueueFull,
}

/// Take an ack slot and hand the request to the client under `gate`.
///
/// Packet ids are matched to slots in FIFO order, so the slot order must be
/// the order requests enter the client queue. The gate is released before
/// the acknowledgment is awaited.
async fn enqueue_and_send<F, E>(
    gate: &Mutex<()>,
    acks: &SharedAcks,
    kind: AckKind,
    wait: Duration,
    send: F,
) -> Result<PendingAck, SendFailure>
where
    F: std::future::Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    let _gate = gate.lock().await;
    let (ticket, rx) = lock_acks(acks).enqueue(kind);
    match tokio::time::timeout(wait, send).await {
        Ok(Ok(())) => Ok(rx),
        Ok(Err(e)) => {
            lock_acks(acks).cancel(kind, ticket);
            Err(SendFailure::Rejected(e.to_string()))
        }
        Err(_) => {
            lock_acks(acks).cancel(kind, ticket);
            Err(SendFailure::QueueFull)
        }
    }
}

#[async_trait]
impl BrokerClient for MqttClient {
    async fn connect(&self, url: &str, username: &str, password: &str) -> Result<(), MqttError> {
        let mqtt_options =
            configure_mqtt_options(&self.client_id, url, username, password, self.keep_alive)?;

        let mut guard = self.session.lock().await;
        if let Some(previous) = guard.take() {
            Self::teardown(previous, self.wait_timeout).await;
        }

        info!(broker = %url, client_id = %self.client_id, "Connecting to MQTT broker");
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let acks: SharedAcks = Arc::new(StdMutex::new(AckTracker::new()));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        self.state_tx.send_replace(ConnectionState::Connecting);
        let state_rx = self.state_tx.subscribe();

        let event_loop_handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            self.state_tx.clone(),
            acks.clone(),
            inbound_tx,
            cancel.clone(),
        ));
        let dispatch_handle = tokio::spawn(Self::run_dispatcher(inbound_rx, self.handlers.clone()));

        let session = Session {
            client,
            acks,
            send_gate: Arc::new(Mutex::new(())),
            cancel,
            event_loop_handle,
            dispatch_handle,
        };

        match Self::wait_for_connection_confirmation(state_rx, self.wait_timeout).await {
            Ok(()) => {
                *guard = Some(session);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "MQTT connect failed");
                Self::teardown(session, self.wait_timeout).await;
                self.state_tx
                    .send_replace(ConnectionState::Disconnected(e.to_string()));
                Err(e)
            }
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        let started = Instant::now();
        let requester = self.live_session().await?;

        let rx = enqueue_and_send(
            &requester.send_gate,
            &requester.acks,
            AckKind::Publish,
            self.wait_timeout,
            requester
                .client
                .publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        .map_err(|failure| match failure {
            SendFailure::Rejected(reason) => MqttError::PublishFailed {
                topic: topic.to_string(),
                reason,
            },
            SendFailure::QueueFull => MqttError::AckTimeout {
                operation: "publish",
                timeout: self.wait_timeout,
            },
        })?;

        self.await_ack(rx, started, "publish")
            .await?
            .map_err(|reason| MqttError::PublishFailed {
                topic: topic.to_string(),
                reason,
            })?;
        debug!(%topic, "MQTT publish acknowledged");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), MqttError> {
        let started = Instant::now();
        let requester = self.live_session().await?;

        // Register first so retained messages delivered right after SubAck
        // find their handler
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic, handler);

        let subscription_failed = |reason: String| {
            self.handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(topic);
            MqttError::SubscriptionFailed {
                topic: topic.to_string(),
                reason,
            }
        };

        let rx = enqueue_and_send(
            &requester.send_gate,
            &requester.acks,
            AckKind::Subscribe,
            self.wait_timeout,
            requester.client.subscribe(topic, QoS::AtLeastOnce),
        )
        .await
        .map_err(|failure| match failure {
            SendFailure::Rejected(reason) => subscription_failed(reason),
            SendFailure::QueueFull => subscription_failed("request queue full".to_string()),
        })?;

        match self.await_ack(rx, started, "subscribe").await {
            Ok(Ok(())) => {
                info!(%topic, "Subscribed to MQTT topic");
                Ok(())
            }
            Ok(Err(reason)) => Err(subscription_failed(reason)),
            Err(e) => Err(subscription_failed(e.to_string())),
        }
    }

    fn is_connected(&self) -> bool {
        matches!(*self.state_tx.borrow(), ConnectionState::Connected)
    }

    async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        let Some(session) = session else {
            return;
        };

        info!("Disconnecting from MQTT broker");
        Self::teardown(session, self.wait_timeout).await;
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.state_tx.send_replace(ConnectionState::Disconnected(
            "disconnected by client".to_string(),
        ));
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
            session.event_loop_handle.abort();
            session.dispatch_handle.abort();
        }
    }
}
