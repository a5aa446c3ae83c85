//! Persistent-socket subscription client
//!
//! [`SubscriptionClient::subscribe`] opens the socket and completes the
//! init/ack/start handshake; every failure up to that point is returned to the
//! caller. The returned [`SubscriptionLoop`] then reads frames until a terminal
//! state and reports why it stopped as a [`SessionEnd`]. Nothing in here retries:
//! restarting is the supervisor's job.

use super::protocol::{Frame, FrameType, SUB_PROTOCOL};
use super::state::{HandshakeState, Step};
use super::SubscriptionError;
use crate::backend::GraphQlRequest;
use crate::error::BridgeResult;
use crate::state::TokenStore;
use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default deadline for one socket read
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Receiver of decoded data payloads
///
/// Invoked concurrently, once per data frame, on its own task.
#[async_trait]
pub trait PayloadHandler: Send + Sync {
    async fn handle(&self, payload: Value) -> BridgeResult<()>;
}

/// Why a subscription loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Cancellation token fired; terminate was sent
    Cancelled,
    /// Server sent `complete`
    Completed,
    /// Server sent `error` or `connection_error`
    ServerError(String),
    /// Socket read failed
    ConnectionError(String),
    /// Malformed or out-of-sequence frame
    ProtocolError(String),
    /// No frame within the read deadline
    Timeout,
    /// Server closed the socket
    Closed,
}

impl SessionEnd {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionEnd::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Deadline for every read, renewed per frame; also bounds the handshake
    pub read_timeout: Duration,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Opens subscription sessions against the backend socket endpoint
#[derive(Clone)]
pub struct SubscriptionClient {
    socket_url: Url,
    tokens: Arc<TokenStore>,
    options: SubscriptionOptions,
}

/// Socket endpoint for a backend URL: `http` becomes `ws`, `https` becomes `wss`
pub fn socket_url(http_url: &Url) -> Result<Url, SubscriptionError> {
    let scheme = match http_url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SubscriptionError::Url(format!(
                "unsupported scheme '{other}' in {http_url}"
            )))
        }
    };

    let mut url = http_url.clone();
    url.set_scheme(scheme)
        .map_err(|_| SubscriptionError::Url(http_url.to_string()))?;
    Ok(url)
}

impl SubscriptionClient {
    pub fn new(
        http_url: &Url,
        tokens: Arc<TokenStore>,
        options: SubscriptionOptions,
    ) -> Result<Self, SubscriptionError> {
        Ok(Self {
            socket_url: socket_url(http_url)?,
            tokens,
            options,
        })
    }

    pub fn socket_url(&self) -> &Url {
        &self.socket_url
    }

    /// Open a session and complete the handshake
    ///
    /// The returned token is a child of `parent`; cancelling either ends the
    /// loop with a terminate frame.
    pub async fn subscribe(
        &self,
        parent: &CancellationToken,
        request: GraphQlRequest,
        handler: Arc<dyn PayloadHandler>,
    ) -> Result<(SubscriptionLoop, CancellationToken), SubscriptionError> {
        let cancel = parent.child_token();
        let read_timeout = self.options.read_timeout;

        let start = Frame::start(&request)?;
        let bearer = self.tokens.bearer().ok_or(SubscriptionError::Unbound)?;

        let uri: tungstenite::http::Uri = self
            .socket_url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| SubscriptionError::Url(e.to_string()))?;
        let ws_request = ClientRequestBuilder::new(uri)
            .with_header("Authorization", format!("Bearer {bearer}"))
            .with_sub_protocol(SUB_PROTOCOL);

        debug!(url = %self.socket_url, "Opening subscription socket");
        let (mut socket, _response) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SubscriptionError::Cancelled),
            connected = tokio::time::timeout(read_timeout, tokio_tungstenite::connect_async(ws_request)) => {
                connected
                    .map_err(|_| SubscriptionError::HandshakeTimeout)?
                    .map_err(|e| SubscriptionError::Connect(e.to_string()))?
            }
        };

        let mut state = HandshakeState::Disconnected.on_open();
        if let Err(e) = send_frame(&mut socket, &Frame::connection_init()).await {
            close_quietly(&mut socket).await;
            return Err(SubscriptionError::Connect(e.to_string()));
        }
        state = state.on_init_sent();

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    terminate(&mut socket).await;
                    return Err(SubscriptionError::Cancelled);
                }
                message = tokio::time::timeout(read_timeout, socket.next()) => message,
            };

            let frame = match message {
                Err(_) => {
                    terminate(&mut socket).await;
                    return Err(SubscriptionError::HandshakeTimeout);
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {
                    return Err(SubscriptionError::Handshake(
                        "socket closed before acknowledgment".to_string(),
                    ));
                }
                Ok(Some(Err(e))) => return Err(SubscriptionError::Connect(e.to_string())),
                Ok(Some(Ok(message))) => match decode_message(message) {
                    Decoded::Frame(frame) => frame,
                    Decoded::Control => continue,
                },
            };

            match state.on_frame(frame) {
                Step::SendStart => break,
                Step::Ignore => continue,
                Step::Fail(reason) => {
                    terminate(&mut socket).await;
                    return Err(SubscriptionError::Handshake(reason));
                }
                Step::Deliver(_) => {
                    terminate(&mut socket).await;
                    return Err(SubscriptionError::Handshake(
                        "payload delivered before start".to_string(),
                    ));
                }
            }
        }

        if let Err(e) = send_frame(&mut socket, &start).await {
            close_quietly(&mut socket).await;
            return Err(SubscriptionError::Connect(e.to_string()));
        }
        let state = state.on_start_sent();
        info!(url = %self.socket_url, "Subscription started");

        let run_loop = SubscriptionLoop {
            socket,
            state,
            handler,
            cancel: cancel.clone(),
            read_timeout,
        };
        Ok((run_loop, cancel))
    }
}

/// Read loop of one established session, consumed by [`SubscriptionLoop::run`]
pub struct SubscriptionLoop {
    socket: Socket,
    state: HandshakeState,
    handler: Arc<dyn PayloadHandler>,
    cancel: CancellationToken,
    read_timeout: Duration,
}

/// Running session: its token and its completion signal
pub struct SubscriptionSession {
    pub cancel: CancellationToken,
    pub handle: JoinHandle<SessionEnd>,
}

impl SubscriptionLoop {
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Run on its own task
    pub fn spawn(self) -> SubscriptionSession {
        let cancel = self.cancel.clone();
        SubscriptionSession {
            cancel,
            handle: tokio::spawn(self.run()),
        }
    }

    /// Read frames until a terminal state
    pub async fn run(mut self) -> SessionEnd {
        let end = self.read_until_end().await;

        match &end {
            SessionEnd::Cancelled => {
                self.state = self.state.on_cancel();
                let _ = send_frame(&mut self.socket, &Frame::stop()).await;
                terminate(&mut self.socket).await;
                self.state = self.state.on_closed();
                info!("Subscription cancelled");
            }
            SessionEnd::Closed => {
                self.state = self.state.on_closed();
                info!("Subscription socket closed by server");
            }
            other => {
                terminate(&mut self.socket).await;
                warn!(reason = ?other, "Subscription ended");
            }
        }
        end
    }

    async fn read_until_end(&mut self) -> SessionEnd {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                message = tokio::time::timeout(self.read_timeout, self.socket.next()) => message,
            };

            let frame = match message {
                Err(_) => {
                    self.state = HandshakeState::Errored;
                    return SessionEnd::Timeout;
                }
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) => return SessionEnd::Closed,
                Ok(Some(Err(e))) => {
                    self.state = HandshakeState::Errored;
                    return SessionEnd::ConnectionError(e.to_string());
                }
                Ok(Some(Ok(message))) => match decode_message(message) {
                    Decoded::Frame(frame) => frame,
                    Decoded::Control => continue,
                },
            };

            let frame_type = frame.as_ref().map(|f| f.frame_type);
            match self.state.on_frame(frame) {
                Step::Deliver(payload) => self.dispatch(payload),
                Step::Ignore => {}
                Step::Fail(reason) => {
                    return match frame_type {
                        Some(FrameType::Complete) => SessionEnd::Completed,
                        Some(FrameType::Error | FrameType::ConnectionError) => {
                            SessionEnd::ServerError(reason)
                        }
                        _ => SessionEnd::ProtocolError(reason),
                    };
                }
                Step::SendStart => {
                    self.state = HandshakeState::Errored;
                    return SessionEnd::ProtocolError("acknowledgment after start".to_string());
                }
            }
        }
    }

    /// Fire-and-forget: the read loop never waits for a handler
    fn dispatch(&self, payload: Value) {
        let handler = self.handler.clone();
        tokio::spawn(async move {
            match AssertUnwindSafe(handler.handle(payload)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Subscription payload handler failed"),
                Err(_) => error!("Subscription payload handler panicked"),
            }
        });
    }
}

enum Decoded {
    /// Text frame; `None` when it does not decode
    Frame(Option<Frame>),
    /// Ping/pong, answered by tungstenite itself
    Control,
}

fn decode_message(message: Message) -> Decoded {
    match message {
        Message::Text(text) => match Frame::decode(text.as_str()) {
            Ok(frame) => Decoded::Frame(Some(frame)),
            Err(e) => {
                debug!(error = %e, "Undecodable subscription frame");
                Decoded::Frame(None)
            }
        },
        Message::Ping(_) | Message::Pong(_) => Decoded::Control,
        _ => Decoded::Frame(None),
    }
}

async fn send_frame(socket: &mut Socket, frame: &Frame) -> Result<(), SubscriptionError> {
    let text = frame.encode()?;
    socket
        .send(Message::text(text))
        .await
        .map_err(|e| SubscriptionError::Connect(e.to_string()))
}

/// Best-effort terminate frame and close
async fn terminate(socket: &mut Socket) {
    let _ = send_frame(socket, &Frame::connection_terminate()).await;
    close_quietly(socket).await;
}

async fn close_quietly(socket: &mut Socket) {
    let _ = tokio::time::timeout(Duration::from_secs(1), socket.close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_url_schemes() {
        let http = Url::parse("http://core.local:5000/graphql").unwrap();
        let https = Url::parse("https://core.example.com/graphql").unwrap();

        assert_eq!(
            socket_url(&http).unwrap().as_str(),
            "ws://core.local:5000/graphql"
        );
        assert_eq!(
            socket_url(&https).unwrap().as_str(),
            "wss://core.example.com/graphql"
        );
    }

    #[test]
    fn test_socket_url_rejects_other_schemes() {
        let ftp = Url::parse("ftp://core.local/graphql").unwrap();
        assert!(matches!(socket_url(&ftp), Err(SubscriptionError::Url(_))));
    }

    #[tokio::test]
    async fn test_subscribe_without_token_is_unbound() {
        let url = Url::parse("http://127.0.0.1:9/graphql").unwrap();
        let client =
            SubscriptionClient::new(&url, Arc::new(TokenStore::new()), SubscriptionOptions::default())
                .unwrap();

        struct Noop;
        #[async_trait]
        impl PayloadHandler for Noop {
            async fn handle(&self, _payload: Value) -> BridgeResult<()> {
                Ok(())
            }
        }

        let result = client
            .subscribe(
                &CancellationToken::new(),
                GraphQlRequest::without_variables("subscription { a }"),
                Arc::new(Noop),
            )
            .await;

        assert!(matches!(result, Err(SubscriptionError::Unbound)));
    }

    #[test]
    fn test_binary_message_is_malformed() {
        assert!(matches!(
            decode_message(Message::binary(vec![1, 2, 3])),
            Decoded::Frame(None)
        ));
        assert!(matches!(
            decode_message(Message::Ping(Default::default())),
            Decoded::Control
        ));
    }
}
