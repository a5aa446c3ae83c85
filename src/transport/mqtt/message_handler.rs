//! Pure message routing and acknowledgment bookkeeping for MQTT events
//!
//! This module contains the pure routing decision for every event the
//! rumqttc event loop yields, the packet-id correlation that turns broker
//! acknowledgments into per-request completions, and topic filter matching
//! for inbound dispatch.

use crate::transport::InboundHandler;
use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => {
                    EventRoute::ConnectionAccepted
                }
                Packet::ConnAck(ack) => {
                    EventRoute::ConnectionRefused(format!("broker refused session: {:?}", ack.code))
                }
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged(ack.pkid),
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    granted: Self::validate_subscription_success(&suback.return_codes),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishSent(*pkid),
            Event::Outgoing(Outgoing::Subscribe(pkid)) => EventRoute::SubscribeSent(*pkid),
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Validate subscription success from SubAck (pure function)
    pub fn validate_subscription_success(return_codes: &[SubscribeReasonCode]) -> bool {
        !return_codes.is_empty()
            && return_codes
                .iter()
                .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// ConnAck with success code
    ConnectionAccepted,
    /// ConnAck with a refusal code
    ConnectionRefused(String),
    /// Message received on subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// QoS 1 publish left the client with this packet id
    PublishSent(u16),
    /// Broker acknowledged a publish
    PublishAcknowledged(u16),
    /// Subscribe request left the client with this packet id
    SubscribeSent(u16),
    /// Broker answered a subscribe
    SubscriptionConfirmed { packet_id: u16, granted: bool },
    /// MQTT broker disconnected
    Disconnected,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Other outgoing event (handled automatically)
    OutgoingEvent,
}

/// Request kinds that wait for a broker acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Publish,
    Subscribe,
}

pub type AckResult = Result<(), String>;

/// Correlates requests with broker acknowledgments
///
/// rumqttc assigns packet ids inside the event loop, in request order. A
/// waiter is queued before its request is handed to the client; the matching
/// `Outgoing` event moves it to the in-flight map under its packet id, and the
/// acknowledgment resolves it.
#[derive(Debug, Default)]
pub struct AckTracker {
    next_ticket: u64,
    queued: HashMap<AckKind, VecDeque<(u64, oneshot::Sender<AckResult>)>>,
    in_flight: HashMap<(AckKind, u16), oneshot::Sender<AckResult>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the next request of `kind`
    pub fn enqueue(&mut self, kind: AckKind) -> (u64, oneshot::Receiver<AckResult>) {
        let (tx, rx) = oneshot::channel();
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        self.queued.entry(kind).or_default().push_back((ticket, tx));
        (ticket, rx)
    }

    /// Drop a waiter whose request never reached the event loop
    pub fn cancel(&mut self, kind: AckKind, ticket: u64) {
        if let Some(queue) = self.queued.get_mut(&kind) {
            queue.retain(|(t, _)| *t != ticket);
        }
    }

    /// The oldest queued request of `kind` went out as `packet_id`
    pub fn assign(&mut self, kind: AckKind, packet_id: u16) {
        if let Some((_, waiter)) = self.queued.get_mut(&kind).and_then(VecDeque::pop_front) {
            self.in_flight.insert((kind, packet_id), waiter);
        }
    }

    /// Complete the waiter for `packet_id`
    pub fn resolve(&mut self, kind: AckKind, packet_id: u16, result: AckResult) {
        if let Some(waiter) = self.in_flight.remove(&(kind, packet_id)) {
            // The caller may have given up already
            let _ = waiter.send(result);
        }
    }

    /// Fail every pending waiter, used when the session ends
    pub fn fail_all(&mut self, reason: &str) {
        for (_, queue) in self.queued.drain() {
            for (_, waiter) in queue {
                let _ = waiter.send(Err(reason.to_string()));
            }
        }
        for (_, waiter) in self.in_flight.drain() {
            let _ = waiter.send(Err(reason.to_string()));
        }
    }

    pub fn pending(&self) -> usize {
        self.queued.values().map(VecDeque::len).sum::<usize>() + self.in_flight.len()
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards (pure function)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Handlers registered per subscribed topic filter
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<(String, Arc<dyn InboundHandler>)>,
}

impl HandlerRegistry {
    /// Register or replace the handler of a filter
    pub fn insert(&mut self, filter: &str, handler: Arc<dyn InboundHandler>) {
        match self.entries.iter_mut().find(|(f, _)| f == filter) {
            Some(entry) => entry.1 = handler,
            None => self.entries.push((filter.to_string(), handler)),
        }
    }

    pub fn remove(&mut self, filter: &str) {
        self.entries.retain(|(f, _)| f != filter);
    }

    /// Handlers whose filter matches `topic`
    pub fn matching(&self, topic: &str) -> Vec<Arc<dyn InboundHandler>> {
        self.entries
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
