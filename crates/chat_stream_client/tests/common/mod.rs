//! In-process WebSocket chat server for integration tests. No mocks: the
//! client under test talks to a real tokio-tungstenite listener.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chat_stream_client::{Client, ClientSettings, ConnectionStatus, ReconnectPolicy};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type ServerSocket = WebSocketStream<TcpStream>;

pub struct TestServer {
    pub url: String,
    /// Completed WebSocket handshakes.
    pub handshakes: Arc<AtomicUsize>,
    /// `token` query parameter seen on each handshake, in order.
    pub tokens: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn seen_tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn settings(&self) -> ClientSettings {
        let mut settings = ClientSettings::new(self.url.parse().unwrap());
        settings.reconnect = ReconnectPolicy {
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
            max_attempts: 3,
        };
        settings.connect_timeout = Duration::from_secs(2);
        settings.idle_timeout = Duration::from_secs(5);
        settings.total_timeout = Duration::from_secs(10);
        settings
    }
}

/// Accept connections forever; `handler(index, socket)` runs for each one.
pub async fn spawn_server<F, Fut>(handler: F) -> TestServer
where
    F: Fn(usize, ServerSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handshakes = Arc::new(AtomicUsize::new(0));
    let tokens = Arc::new(Mutex::new(Vec::new()));

    let server = TestServer {
        url: format!("ws://127.0.0.1:{}/ws", port),
        handshakes: handshakes.clone(),
        tokens: tokens.clone(),
    };

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let tokens = tokens.clone();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let token = req
                    .uri()
                    .query()
                    .and_then(|q| {
                        url::form_urlencoded::parse(q.as_bytes())
                            .find(|(k, _)| k == "token")
                            .map(|(_, v)| v.into_owned())
                    })
                    .unwrap_or_default();
                tokens.lock().unwrap().push(token);
                Ok(resp)
            };
            let Ok(ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
                continue;
            };
            let index = handshakes.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(handler(index, ws));
        }
    });

    server
}

/// Next request frame from the client as JSON, skipping control frames.
pub async fn next_request(ws: &mut ServerSocket) -> Option<serde_json::Value> {
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).ok();
        }
    }
    None
}

pub fn request_id(request: &serde_json::Value) -> String {
    request["request_id"].as_str().unwrap().to_string()
}

pub async fn send_json(ws: &mut ServerSocket, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

pub fn chunk(token: &str, content: &str, conversation_id: Option<i64>) -> serde_json::Value {
    serde_json::json!({
        "type": "chunk",
        "requestId": token,
        "conversationId": conversation_id,
        "content": content,
    })
}

pub fn complete(token: &str, conversation_id: i64) -> serde_json::Value {
    serde_json::json!({
        "type": "complete",
        "requestId": token,
        "conversationId": conversation_id,
    })
}

pub fn error(token: &str, detail: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "error",
        "requestId": token,
        "detail": detail,
    })
}

/// Keep a connection open, draining whatever the client sends.
pub async fn hold_open(mut ws: ServerSocket) {
    while let Some(Ok(_)) = ws.next().await {}
}

/// Poll the client's status every 10ms until `predicate` holds or `timeout`
/// elapses; returns the last status seen.
pub async fn wait_for_status<P>(client: &Client, timeout: Duration, predicate: P) -> ConnectionStatus
where
    P: Fn(&ConnectionStatus) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = client.status().await.unwrap();
        if predicate(&status) || tokio::time::Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll `check` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, check: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
