//! End-to-end tests for the protocol engine driven over an in-memory
//! loopback transport pair, exercising request/response correlation,
//! timeouts, cancellation, and capability gating without any real I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcp_protocol::{BoxFuture, CapabilityGate, PermissiveGate, Protocol, RequestOptions};
use mcp_transport::{CloseCallback, ErrorCallback, MessageCallback, SendOptions, Transport};
use mcp_types::{McpError, Message};
use tokio::sync::mpsc;

/// A loopback transport half: messages sent on this side are delivered to
/// the paired half's `on_message` callback.
struct ChannelTransport {
    operational: AtomicBool,
    outbound: mpsc::UnboundedSender<Message>,
    on_message: StdMutex<Option<MessageCallback>>,
    on_error: StdMutex<Vec<ErrorCallback>>,
    on_close: StdMutex<Vec<CloseCallback>>,
}

impl ChannelTransport {
    fn pair() -> (Arc<Self>, Arc<Self>) {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel::<Message>();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel::<Message>();

        let a = Arc::new(Self {
            operational: AtomicBool::new(false),
            outbound: tx_a,
            on_message: StdMutex::new(None),
            on_error: StdMutex::new(Vec::new()),
            on_close: StdMutex::new(Vec::new()),
        });
        let b = Arc::new(Self {
            operational: AtomicBool::new(false),
            outbound: tx_b,
            on_message: StdMutex::new(None),
            on_error: StdMutex::new(Vec::new()),
            on_close: StdMutex::new(Vec::new()),
        });

        let b_for_a = b.clone();
        tokio::spawn(async move {
            while let Some(message) = rx_a.recv().await {
                let guard = b_for_a.on_message.lock().expect("lock poisoned");
                if let Some(cb) = guard.as_ref() {
                    cb(message);
                }
            }
        });
        let a_for_b = a.clone();
        tokio::spawn(async move {
            while let Some(message) = rx_b.recv().await {
                let guard = a_for_b.on_message.lock().expect("lock poisoned");
                if let Some(cb) = guard.as_ref() {
                    cb(message);
                }
            }
        });

        (a, b)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn start(&self) -> Result<(), McpError> {
        self.operational.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: Message, _options: Option<SendOptions>) -> Result<(), McpError> {
        if !self.operational.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionClosed);
        }
        self.outbound.send(message).map_err(|_| McpError::ConnectionClosed)
    }

    async fn close(&self) -> Result<(), McpError> {
        self.operational.store(false, Ordering::SeqCst);
        for cb in self.on_close.lock().expect("lock poisoned").drain(..) {
            cb();
        }
        Ok(())
    }

    fn on_message(&self, callback: MessageCallback) {
        *self.on_message.lock().expect("lock poisoned") = Some(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.on_error.lock().expect("lock poisoned").push(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.on_close.lock().expect("lock poisoned").push(callback);
    }
}

async fn connected_pair() -> (Arc<Protocol>, Arc<Protocol>) {
    let (transport_a, transport_b) = ChannelTransport::pair();
    let protocol_a = Protocol::new(Arc::new(PermissiveGate), false);
    let protocol_b = Protocol::new(Arc::new(PermissiveGate), false);
    protocol_a.connect(transport_a).await.unwrap();
    protocol_b.connect(transport_b).await.unwrap();
    (protocol_a, protocol_b)
}

#[tokio::test]
async fn ping_round_trips_through_builtin_handler() {
    let (client, _server) = connected_pair().await;
    let result: serde_json::Value = client
        .request::<(), _>("ping", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!({}));
}

#[tokio::test]
async fn custom_request_handler_echoes_params() {
    let (client, server) = connected_pair().await;
    server
        .on_request(
            "echo",
            Arc::new(|req, _extra| {
                Box::pin(async move { Ok(req.params.unwrap_or(serde_json::Value::Null)) })
                    as BoxFuture<Result<serde_json::Value, McpError>>
            }),
        )
        .unwrap();

    let result: serde_json::Value = client
        .request("echo", Some(serde_json::json!({"hello": "world"})), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!({"hello": "world"}));
}

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    let (client, _server) = connected_pair().await;
    let err = client
        .request::<(), serde_json::Value>("nonexistent/method", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::MethodNotFound(ref message) if message == "nonexistent/method"));
}

#[tokio::test]
async fn request_times_out_and_notifies_cancellation() {
    let (client, server) = connected_pair().await;

    // A handler that never completes, so the client's deadline is the only
    // thing that resolves the call.
    server
        .on_request(
            "slow",
            Arc::new(|_req, _extra| {
                Box::pin(std::future::pending()) as BoxFuture<Result<serde_json::Value, McpError>>
            }),
        )
        .unwrap();

    let cancelled_seen = Arc::new(AtomicBool::new(false));
    let cancelled_seen_clone = cancelled_seen.clone();
    server.on_notification(
        "notifications/cancelled",
        Arc::new(move |_n| {
            cancelled_seen_clone.store(true, Ordering::SeqCst);
            Box::pin(async {}) as BoxFuture<()>
        }),
    );

    let options = RequestOptions {
        timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let err = client
        .request::<(), serde_json::Value>("slow", None, options)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::RequestTimeout));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(cancelled_seen.load(Ordering::SeqCst));
    assert_eq!(client.outstanding_request_count(), 0);
}

#[tokio::test]
async fn transport_close_fails_outstanding_waiters() {
    let (client, server) = connected_pair().await;
    server
        .on_request(
            "slow",
            Arc::new(|_req, _extra| {
                Box::pin(std::future::pending()) as BoxFuture<Result<serde_json::Value, McpError>>
            }),
        )
        .unwrap();

    let client_clone = client.clone();
    let call = tokio::spawn(async move {
        client_clone
            .request::<(), serde_json::Value>(
                "slow",
                None,
                RequestOptions {
                    timeout: Some(Duration::from_secs(5)),
                    ..Default::default()
                },
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    client.close().await.unwrap();

    let result = call.await.unwrap();
    assert!(matches!(result, Err(McpError::ConnectionClosed)));
}

struct DenyAllGate;
impl CapabilityGate for DenyAllGate {
    fn assert_capability_for_method(&self, method: &str) -> Result<(), McpError> {
        Err(mcp_protocol::missing_capability_error(method, "tools"))
    }
    fn assert_notification_capability(&self, _method: &str) -> Result<(), McpError> {
        Ok(())
    }
    fn assert_request_handler_capability(&self, _method: &str) -> Result<(), McpError> {
        Ok(())
    }
}

#[tokio::test]
async fn strict_capability_gating_blocks_outbound_request_before_touching_transport() {
    let (transport_a, _transport_b) = ChannelTransport::pair();
    let protocol = Protocol::new(Arc::new(DenyAllGate), true);
    protocol.connect(transport_a).await.unwrap();

    let err = protocol
        .request::<(), serde_json::Value>("tools/call", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("tools/call"));
    assert!(err.to_string().contains("tools"));
    assert_eq!(protocol.outstanding_request_count(), 0);
}
