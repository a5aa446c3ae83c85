//! Supervised subscription restart tests against a local `graphql-ws` server
//!
//! A session ended by the server is replaced after the back-off by a new
//! socket that replays the same `start` frame and feeds the same handler.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use mqtt_bridge::backend::GraphQlRequest;
use mqtt_bridge::error::BridgeResult;
use mqtt_bridge::state::{Credential, TokenStore};
use mqtt_bridge::subscription::{PayloadHandler, SubscriptionClient, SubscriptionOptions};
use mqtt_bridge::supervisor::SubscriptionFactory;
use mqtt_bridge::SubscriptionSupervisor;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use url::Url;

type ServerSocket = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

/// Accept every socket on an ephemeral port, in connection order
async fn listen() -> (Url, mpsc::UnboundedReceiver<ServerSocket>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let callback = |_: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
                response
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("graphql-ws"));
                Ok(response)
            };
            let Ok(socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                continue;
            };
            if tx.send(socket).is_err() {
                break;
            }
        }
    });

    let url = Url::parse(&format!("http://127.0.0.1:{port}/graphql")).unwrap();
    (url, rx)
}

fn client(url: &Url) -> SubscriptionClient {
    let tokens = Arc::new(TokenStore::new());
    tokens.replace(Credential {
        session_token: "token-abc".to_string(),
        expires_at: i64::MAX,
        refresh_token: "refresh".to_string(),
        token_id: "token-1".to_string(),
    });
    SubscriptionClient::new(url, tokens, SubscriptionOptions { read_timeout: WAIT }).unwrap()
}

fn request() -> GraphQlRequest {
    GraphQlRequest::new(
        "subscription Listen($topic: String!) { listen(topic: $topic) { relatedNodeId } }",
        json!({"topic": "controls:token-1"}),
    )
}

struct Collect(mpsc::UnboundedSender<Value>);

#[async_trait]
impl PayloadHandler for Collect {
    async fn handle(&self, payload: Value) -> BridgeResult<()> {
        let _ = self.0.send(payload);
        Ok(())
    }
}

async fn recv_frame(server: &mut ServerSocket) -> Option<Value> {
    while let Some(message) = server.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn send(server: &mut ServerSocket, frame: Value) {
    server.send(Message::text(frame.to_string())).await.unwrap();
}

/// Ack the client's init and return its `start` frame
async fn acknowledge(server: &mut ServerSocket) -> Value {
    let init = recv_frame(server).await.unwrap();
    assert_eq!(init["type"], "connection_init");
    send(server, json!({"type": "connection_ack"})).await;
    recv_frame(server).await.unwrap()
}

async fn next_socket(sockets: &mut mpsc::UnboundedReceiver<ServerSocket>) -> ServerSocket {
    tokio::time::timeout(WAIT, sockets.recv())
        .await
        .expect("Client should connect")
        .expect("Acceptor is running")
}

/// End the first session with `end_frame`; the restart must replay the request
async fn restart_replays_request(end_frame: Value) {
    // Arrange
    let (url, mut sockets) = listen().await;
    let (tx, mut payloads) = mpsc::unbounded_channel();
    let root = CancellationToken::new();
    let supervisor = SubscriptionSupervisor::new(
        "control",
        Duration::from_millis(100),
        root.clone(),
        Arc::new(SubscriptionFactory::new(client(&url), request(), Arc::new(Collect(tx)))),
    );

    let starting = tokio::spawn(async move {
        let first = supervisor.start().await;
        (supervisor, first)
    });
    let mut first_socket = next_socket(&mut sockets).await;
    let first_start = acknowledge(&mut first_socket).await;
    let (supervisor, first) = starting.await.unwrap();
    let watcher = supervisor.spawn(first.expect("First session should start"));

    // Act
    send(&mut first_socket, end_frame).await;
    let mut second_socket = next_socket(&mut sockets).await;
    let second_start = acknowledge(&mut second_socket).await;
    send(
        &mut second_socket,
        json!({"id": "1", "type": "data", "payload": {"data": {"n": 2}}}),
    )
    .await;

    // Assert
    assert_eq!(first_start["type"], "start");
    assert_eq!(second_start, first_start);
    assert_eq!(second_start["payload"]["variables"]["topic"], "controls:token-1");

    let delivered = tokio::time::timeout(WAIT, payloads.recv()).await.unwrap().unwrap();
    assert_eq!(delivered["data"]["n"], 2);

    root.cancel();
    let restarts = tokio::time::timeout(WAIT, watcher).await.unwrap().unwrap();
    assert_eq!(restarts, 1);
}

#[tokio::test]
async fn test_completed_subscription_restarts_with_same_request() {
    restart_replays_request(json!({"id": "1", "type": "complete"})).await;
}

#[tokio::test]
async fn test_errored_subscription_restarts_with_same_request() {
    restart_replays_request(json!({"id": "1", "type": "error", "payload": {"message": "denied"}}))
        .await;
}
