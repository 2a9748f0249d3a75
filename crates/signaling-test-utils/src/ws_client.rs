//! WebSocket test client speaking the signaling JSON protocol.
//!
//! Replies are matched by `requestId`. Events that arrive while waiting for a
//! reply are buffered and handed out by [`TestClient::next_event`] in arrival
//! order.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long any single wait may take before the test fails.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `<action>:response` with its `data`.
    Ok(Value),
    /// `<action>:error` with its `error` message.
    Err(String),
}

impl Reply {
    /// Unwrap a success payload.
    pub fn data(self) -> Value {
        match self {
            Reply::Ok(data) => data,
            Reply::Err(message) => panic!("expected success, got error: {message}"),
        }
    }

    /// Unwrap an error message.
    pub fn error(self) -> String {
        match self {
            Reply::Err(message) => message,
            Reply::Ok(data) => panic!("expected error, got success: {data}"),
        }
    }
}

/// Signaling client for end-to-end tests.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    events: VecDeque<Value>,
    next_request_id: u64,
}

impl TestClient {
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url)
            .await
            .expect("Failed to connect to signaling server");
        Self {
            ws,
            events: VecDeque::new(),
            next_request_id: 1,
        }
    }

    /// Send `action` with `data` and wait for the matching reply.
    pub async fn request(&mut self, action: &str, data: Value) -> Reply {
        let request_id = format!("req-{}", self.next_request_id);
        self.next_request_id += 1;

        self.send_json(&json!({
            "action": action,
            "requestId": request_id,
            "data": data,
        }))
        .await;

        let frame = self.next_reply(&Value::from(request_id)).await;
        let name = frame["action"].as_str().unwrap_or_default().to_string();
        if name == format!("{action}:response") {
            Reply::Ok(frame["data"].clone())
        } else if name == format!("{action}:error") {
            Reply::Err(frame["error"].as_str().unwrap_or_default().to_string())
        } else {
            panic!("unexpected reply to {action}: {frame}");
        }
    }

    /// Send a request that must succeed and return its `data`.
    pub async fn call(&mut self, action: &str, data: Value) -> Value {
        self.request(action, data).await.data()
    }

    /// Send a raw text frame.
    pub async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("Failed to send frame");
    }

    pub async fn send_binary(&mut self, payload: Vec<u8>) {
        self.ws
            .send(Message::Binary(payload))
            .await
            .expect("Failed to send frame");
    }

    pub async fn send_json(&mut self, value: &Value) {
        self.send_text(&value.to_string()).await;
    }

    /// Next non-event frame (a reply), raw.
    pub async fn next_reply_frame(&mut self) -> Value {
        loop {
            let frame = self.next_frame().await.expect("connection closed");
            if is_event(&frame) {
                self.events.push_back(frame);
            } else {
                return frame;
            }
        }
    }

    async fn next_reply(&mut self, request_id: &Value) -> Value {
        loop {
            let frame = self.next_reply_frame().await;
            if &frame["requestId"] == request_id {
                return frame;
            }
        }
    }

    /// Wait for the next event called `name`.
    ///
    /// Events with other names stay buffered.
    pub async fn next_event(&mut self, name: &str) -> Value {
        if let Some(pos) = self.events.iter().position(|e| e["action"] == name) {
            let event = self.events.remove(pos).expect("position is in range");
            return event["data"].clone();
        }
        loop {
            let frame = self
                .next_frame()
                .await
                .unwrap_or_else(|| panic!("connection closed while waiting for {name}"));
            if frame["action"] == name {
                return frame["data"].clone();
            }
            if is_event(&frame) {
                self.events.push_back(frame);
            }
        }
    }

    /// Next event of any name, buffered first.
    pub async fn next_any_event(&mut self) -> Value {
        if let Some(event) = self.events.pop_front() {
            return event;
        }
        loop {
            let frame = self.next_frame().await.expect("connection closed");
            if is_event(&frame) {
                return frame;
            }
        }
    }

    /// Assert that no `name` event arrives within `wait`.
    pub async fn expect_no_event(&mut self, name: &str, wait: Duration) {
        assert!(
            !self.events.iter().any(|e| e["action"] == name),
            "unexpected buffered {name} event"
        );
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return;
            }
            match tokio::time::timeout(remaining, self.ws.next()).await {
                Err(_) => return,
                Ok(None | Some(Err(_))) => return,
                Ok(Some(Ok(Message::Text(text)))) => {
                    let frame: Value = serde_json::from_str(&text).expect("server sent invalid JSON");
                    assert!(frame["action"] != name, "unexpected {name} event: {frame}");
                    if is_event(&frame) {
                        self.events.push_back(frame);
                    }
                }
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Drain and return every buffered event.
    pub fn take_events(&mut self) -> Vec<Value> {
        self.events.drain(..).collect()
    }

    /// Wait until the server closes the connection.
    ///
    /// Returns `false` if it is still open after `wait`. Reading answers
    /// server Pings, so to trigger an idle timeout sleep without reading first.
    pub async fn wait_for_close(&mut self, wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, self.ws.next()).await {
                Err(_) => return false,
                Ok(None | Some(Err(_)) | Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    /// Close the socket from the client side.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    /// Read the next JSON text frame, or `None` once the socket closes.
    async fn next_frame(&mut self) -> Option<Value> {
        loop {
            let message = tokio::time::timeout(DEFAULT_WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a frame");
            match message {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return None,
                Some(Ok(Message::Text(text))) => {
                    return Some(serde_json::from_str(&text).expect("server sent invalid JSON"));
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

fn is_event(frame: &Value) -> bool {
    frame.get("requestId").is_none()
}
