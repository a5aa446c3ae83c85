//! Backend subscription channel
//!
//! - [`protocol`] - Wire frames of the `graphql-ws` sub-protocol
//! - [`state`] - Pure handshake state machine
//! - [`client`] - Socket I/O: handshake, read loop and payload dispatch

pub mod client;
pub mod protocol;
pub mod state;

pub use client::{
    socket_url, PayloadHandler, SessionEnd, SubscriptionClient, SubscriptionLoop,
    SubscriptionOptions, SubscriptionSession,
};
pub use protocol::{Frame, FrameType};
pub use state::{HandshakeState, Step};

use thiserror::Error;

/// Failures up to and including the subscription handshake
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Invalid subscription URL: {0}")]
    Url(String),

    #[error("Subscription socket failed: {0}")]
    Connect(String),

    #[error("Subscription handshake failed: {0}")]
    Handshake(String),

    #[error("Subscription handshake timed out")]
    HandshakeTimeout,

    #[error("No session token to subscribe with")]
    Unbound,

    #[error("Failed to encode subscription frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Subscription cancelled during handshake")]
    Cancelled,
}
