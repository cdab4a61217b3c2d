//! Legacy HTTP+SSE transport (pre Streamable-HTTP MCP transport revision).
//!
//! The server opens a long-lived `text/event-stream` response per session
//! and emits an initial `endpoint` event carrying the URL (with a
//! `sessionId` query parameter) the peer must POST JSON-RPC messages to.
//! Everything the server sends afterwards travels as `message` SSE events;
//! everything the client sends arrives as ordinary POST bodies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mcp_types::{McpError, Message};
use tokio::sync::mpsc;
use tracing::warn;

use crate::lifecycle::Lifecycle;
use crate::transport::{CloseCallback, ErrorCallback, MessageCallback, SendOptions, Transport};

/// One SSE frame: `event: <name>\ndata: <payload>\n\n`.
fn format_event(event: &str, data: &str) -> String {
    let mut out = String::with_capacity(event.len() + data.len() + 16);
    out.push_str("event: ");
    out.push_str(event);
    out.push('\n');
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Server-side half of the legacy SSE transport: owns the outbound event
/// channel for one session's long-poll response and the callback registry
/// fed by the side-channel POST handler.
pub struct SseServerTransport {
    lifecycle: Arc<Lifecycle>,
    outbound: mpsc::UnboundedSender<String>,
    on_message: StdMutex<Option<MessageCallback>>,
    on_error: StdMutex<Vec<ErrorCallback>>,
    endpoint_sent: AtomicBool,
    post_endpoint: String,
}

impl SseServerTransport {
    /// `post_endpoint` is the absolute or relative URL (already carrying the
    /// `sessionId` query parameter) the peer must POST to.
    pub fn new(post_endpoint: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            lifecycle: Arc::new(Lifecycle::new()),
            outbound: tx,
            on_message: StdMutex::new(None),
            on_error: StdMutex::new(Vec::new()),
            endpoint_sent: AtomicBool::new(false),
            post_endpoint: post_endpoint.into(),
        });
        (transport, rx)
    }

    /// Feeds one POSTed message into the transport's `on_message` callback.
    /// Called by the HTTP-framework-side POST handler; not part of the
    /// `Transport` trait since inbound delivery here rides a side channel
    /// rather than the SSE stream itself.
    pub fn handle_post(&self, message: Message) {
        let guard = self.on_message.lock().expect("on_message lock poisoned");
        if let Some(cb) = guard.as_ref() {
            cb(message);
        }
    }

    fn emit_error(&self, err: McpError) {
        let callbacks = self.on_error.lock().expect("on_error lock poisoned").clone();
        for cb in callbacks {
            cb(McpError::InternalError(err.to_string()));
        }
    }
}

#[async_trait]
impl Transport for SseServerTransport {
    async fn start(&self) -> Result<(), McpError> {
        let outbound = self.outbound.clone();
        let endpoint = self.post_endpoint.clone();
        let sent = &self.endpoint_sent;
        self.lifecycle
            .start(|| async move {
                if sent
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    outbound
                        .send(format_event("endpoint", &endpoint))
                        .map_err(|_| McpError::ConnectionClosed)?;
                }
                Ok(())
            })
            .await
    }

    async fn send(&self, message: Message, _options: Option<SendOptions>) -> Result<(), McpError> {
        self.lifecycle.ensure_operational()?;
        let text = message.to_json_string().map_err(McpError::from)?;
        self.outbound
            .send(format_event("message", &text))
            .map_err(|_| McpError::ConnectionClosed)
    }

    async fn close(&self) -> Result<(), McpError> {
        self.lifecycle.close(|| async { Ok(()) }).await
    }

    fn on_message(&self, callback: MessageCallback) {
        *self.on_message.lock().expect("on_message lock poisoned") = Some(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.on_error.lock().expect("on_error lock poisoned").push(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.lifecycle.register_close_callback(callback);
    }
}

/// Client-side half: connects to the server's SSE stream, learns the POST
/// endpoint from the first `endpoint` event, and relays subsequent
/// `message` events to `on_message`. Outbound `send` POSTs to the learned
/// endpoint via the injected `poster`.
pub struct SseClientTransport {
    lifecycle: Arc<Lifecycle>,
    on_message: StdMutex<Option<MessageCallback>>,
    on_error: StdMutex<Vec<ErrorCallback>>,
    post_endpoint: StdMutex<Option<String>>,
    poster: Arc<dyn Fn(String, String) -> futures::future::BoxFuture<'static, Result<(), McpError>> + Send + Sync>,
}

impl SseClientTransport {
    /// `poster(endpoint, body)` performs the side-channel POST; the caller
    /// supplies it so this crate does not force a particular HTTP client
    /// onto callers who already have one configured (auth headers, proxies).
    pub fn new(
        poster: impl Fn(String, String) -> futures::future::BoxFuture<'static, Result<(), McpError>>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            lifecycle: Arc::new(Lifecycle::new()),
            on_message: StdMutex::new(None),
            on_error: StdMutex::new(Vec::new()),
            post_endpoint: StdMutex::new(None),
            poster: Arc::new(poster),
        })
    }

    /// Feeds one raw SSE frame's `data:` payload, dispatched by event name,
    /// as received off the wire. Called by the caller's SSE-stream reader
    /// loop (this crate doesn't own the GET connection itself, matching the
    /// `send`/`on_message` abstraction the `Transport` trait models).
    pub fn handle_frame(&self, event: &str, data: &str) {
        match event {
            "endpoint" => {
                *self.post_endpoint.lock().expect("endpoint lock poisoned") = Some(data.to_string());
            }
            "message" => match Message::from_json_str(data) {
                Ok(message) => {
                    let guard = self.on_message.lock().expect("on_message lock poisoned");
                    if let Some(cb) = guard.as_ref() {
                        cb(message);
                    }
                }
                Err(err) => {
                    warn!("failed to decode SSE message event: {err}");
                    self.emit_error(McpError::Parse(err));
                }
            },
            other => warn!("ignoring unknown SSE event kind: {other}"),
        }
    }

    fn emit_error(&self, err: McpError) {
        let callbacks = self.on_error.lock().expect("on_error lock poisoned").clone();
        for cb in callbacks {
            cb(McpError::InternalError(err.to_string()));
        }
    }
}

#[async_trait]
impl Transport for SseClientTransport {
    async fn start(&self) -> Result<(), McpError> {
        self.lifecycle.start(|| async { Ok(()) }).await
    }

    async fn send(&self, message: Message, _options: Option<SendOptions>) -> Result<(), McpError> {
        self.lifecycle.ensure_operational()?;
        let endpoint = self
            .post_endpoint
            .lock()
            .expect("endpoint lock poisoned")
            .clone()
            .ok_or_else(|| McpError::InternalError("SSE endpoint event not yet received".into()))?;
        let text = message.to_json_string().map_err(McpError::from)?;
        (self.poster)(endpoint, text).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.lifecycle.close(|| async { Ok(()) }).await
    }

    fn on_message(&self, callback: MessageCallback) {
        *self.on_message.lock().expect("on_message lock poisoned") = Some(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.on_error.lock().expect("on_error lock poisoned").push(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.lifecycle.register_close_callback(callback);
    }
}

/// Splits a buffer of raw SSE bytes into `(event, data)` frames, each
/// terminated by a blank line. Unlike [`crate::ReadBuffer`] this is frame-
/// (not line-) oriented since SSE frames carry multiple fields before the
/// terminating blank line; kept separate rather than overloading
/// `ReadBuffer` with a second framing mode.
pub fn parse_sse_frames(buf: &mut Vec<u8>) -> Vec<(String, String)> {
    let mut frames = Vec::new();
    loop {
        let text = String::from_utf8_lossy(buf);
        let Some(boundary) = text.find("\n\n") else {
            break;
        };
        let frame_text = text[..boundary].to_string();
        let consumed = boundary + 2;
        let mut event = String::from("message");
        let mut data_lines = Vec::new();
        for line in frame_text.split('\n') {
            if let Some(rest) = line.strip_prefix("event:") {
                event = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start().to_string());
            }
        }
        drop(text);
        buf.drain(..consumed);
        if !data_lines.is_empty() {
            frames.push((event, data_lines.join("\n")));
        }
    }
    frames
}

/// Convenience wrapper for callers feeding raw response-body chunks
/// (`Bytes`) from an HTTP client directly into [`parse_sse_frames`].
pub fn append_chunk(buf: &mut Vec<u8>, chunk: &Bytes) {
    buf.extend_from_slice(chunk);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_endpoint_event() {
        let event = format_event("endpoint", "http://localhost/sse?sessionId=abc");
        assert_eq!(event, "event: endpoint\ndata: http://localhost/sse?sessionId=abc\n\n");
    }

    #[test]
    fn parses_frames_split_across_chunks() {
        let mut buf = Vec::new();
        append_chunk(&mut buf, &Bytes::from_static(b"event: endpoint\ndata: http://x/msg\n"));
        assert!(parse_sse_frames(&mut buf).is_empty());
        append_chunk(&mut buf, &Bytes::from_static(b"\nevent: message\ndata: {\"a\":1}\n\n"));
        let frames = parse_sse_frames(&mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0, "endpoint");
        assert_eq!(frames[0].1, "http://x/msg");
        assert_eq!(frames[1].0, "message");
        assert_eq!(frames[1].1, "{\"a\":1}");
    }

    #[tokio::test]
    async fn server_transport_emits_endpoint_on_start() {
        let (transport, mut rx) = SseServerTransport::new("http://localhost/sse?sessionId=abc");
        transport.start().await.unwrap();
        let frame = rx.recv().await.unwrap();
        assert!(frame.starts_with("event: endpoint"));
    }

    #[tokio::test]
    async fn client_dispatches_message_event_after_endpoint() {
        let client = SseClientTransport::new(|_endpoint, _body| {
            Box::pin(async { Ok(()) })
        });
        client.start().await.unwrap();
        client.handle_frame("endpoint", "http://localhost/sse?sessionId=abc");

        let received = Arc::new(StdMutex::new(None));
        let received_clone = received.clone();
        client.on_message(Arc::new(move |msg| {
            *received_clone.lock().unwrap() = Some(msg);
        }));

        client.handle_frame("message", r#"{"jsonrpc":"2.0","method":"ping"}"#);
        assert!(received.lock().unwrap().is_some());
    }
}
