//! Streamable-HTTP transport (C7): a session-oriented bidirectional
//! transport multiplexed over `POST`/`GET`/`DELETE` at a single path, with
//! JSON or SSE response modes and resumable event delivery via an
//! [`crate::EventStore`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use futures::StreamExt;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{body::Bytes, Router};
use dashmap::DashMap;
use mcp_types::{codes, ErrorObject, McpError, Message, RequestId};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event_store::EventStore;
use crate::lifecycle::Lifecycle;
use crate::transport::{CloseCallback, ErrorCallback, MessageCallback, SendOptions, Transport};

/// Stream id reserved for the single standalone GET-initiated SSE channel
/// a session may have open for server-initiated messages.
pub const STANDALONE_GET_STREAM: &str = "_GET_stream";

/// Session id used internally when `session_id_generator` is `None` (spec
/// §6 stateless mode): a single process-wide session serves every request,
/// with no `Mcp-Session-Id` bookkeeping exposed to the peer.
const STATELESS_SESSION_ID: &str = "__stateless__";

const SESSION_ID_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Configuration recognized by the Streamable-HTTP transport (spec §6).
#[derive(Clone)]
pub struct StreamableHttpConfig {
    pub enable_json_response: bool,
    pub enable_dns_rebinding_protection: bool,
    pub allowed_hosts: Option<Vec<String>>,
    pub allowed_origins: Option<Vec<String>>,
    pub event_store: Option<Arc<dyn EventStore>>,
    /// `None` means stateless mode: no session validation is performed and
    /// every POST is handled independently.
    pub session_id_generator: Option<Arc<dyn Fn() -> String + Send + Sync>>,
    pub path: String,
}

impl Default for StreamableHttpConfig {
    fn default() -> Self {
        Self {
            enable_json_response: false,
            enable_dns_rebinding_protection: false,
            allowed_hosts: None,
            allowed_origins: None,
            event_store: None,
            session_id_generator: Some(Arc::new(|| Uuid::new_v4().to_string())),
            path: "/".to_string(),
        }
    }
}

/// A single outstanding per-POST SSE stream, keyed by a fresh `streamId`.
struct ActiveStream {
    sender: mpsc::UnboundedSender<Event>,
}

/// Tracks which request ids a POST batch is still waiting on before the
/// HTTP response for that batch can be finalized.
struct BatchWaiter {
    remaining: std::sync::Mutex<HashSet<RequestId>>,
    notify: Arc<Notify>,
}

struct SessionState {
    id: String,
    initialized: AtomicBool,
    streams: DashMap<String, ActiveStream>,
    request_to_stream: DashMap<RequestId, String>,
    responses: DashMap<RequestId, Message>,
    batches: DashMap<String, BatchWaiter>,
    standalone_get_open: AtomicBool,
    event_store: Option<Arc<dyn EventStore>>,
    enable_json_response: bool,
    lifecycle: Lifecycle,
    on_message: std::sync::Mutex<Option<MessageCallback>>,
    on_error: std::sync::Mutex<Vec<ErrorCallback>>,
}

/// Per-session handle implementing [`Transport`]; this is what a caller
/// hands to a protocol engine instance (one per session) so `send()`
/// routes outbound messages onto the right HTTP stream.
pub struct SessionTransport {
    state: Arc<SessionState>,
}

impl SessionTransport {
    pub fn session_id(&self) -> &str {
        &self.state.id
    }
}

#[async_trait]
impl Transport for SessionTransport {
    async fn start(&self) -> Result<(), McpError> {
        self.state.lifecycle.start(|| async { Ok(()) }).await
    }

    async fn send(&self, message: Message, options: Option<SendOptions>) -> Result<(), McpError> {
        self.state.lifecycle.ensure_operational()?;
        route_outbound(&self.state, message, options).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.state.lifecycle.close(|| async { Ok(()) }).await
    }

    fn on_message(&self, callback: MessageCallback) {
        *self.state.on_message.lock().expect("on_message lock poisoned") = Some(callback);
    }

    fn on_error(&self, callback: ErrorCallback) {
        self.state.on_error.lock().expect("on_error lock poisoned").push(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.state.lifecycle.register_close_callback(callback);
    }
}

async fn route_outbound(
    state: &Arc<SessionState>,
    message: Message,
    options: Option<SendOptions>,
) -> Result<(), McpError> {
    let routing_id = message
        .id()
        .cloned()
        .or_else(|| options.and_then(|o| o.related_request_id));

    match routing_id {
        Some(id) => {
            let Some(stream_id) = state.request_to_stream.get(&id).map(|e| e.clone()) else {
                warn!("no stream registered for outbound message id {id}; dropping");
                return Ok(());
            };
            let is_terminal = matches!(message, Message::Response(_) | Message::Error(_));
            if is_terminal {
                state.responses.insert(id.clone(), message.clone());
            }

            if state.enable_json_response {
                if is_terminal {
                    finalize_if_batch_complete(state, &stream_id, &id);
                }
                return Ok(());
            }

            if let Some(stream) = state.streams.get(&stream_id) {
                let event_id = match &state.event_store {
                    Some(store) => Some(store.store_event(&stream_id, message.clone()).await),
                    None => None,
                };
                let payload = message.to_json_string().map_err(McpError::from)?;
                let mut event = Event::default().event("message").data(payload);
                if let Some(event_id) = event_id {
                    event = event.id(event_id.to_string());
                }
                let _ = stream.sender.send(event);
            }

            if is_terminal {
                finalize_if_batch_complete(state, &stream_id, &id);
            }
            Ok(())
        }
        None => {
            if let Some(stream) = state.streams.get(STANDALONE_GET_STREAM) {
                let event_id = match &state.event_store {
                    Some(store) => Some(store.store_event(STANDALONE_GET_STREAM, message.clone()).await),
                    None => None,
                };
                let payload = message.to_json_string().map_err(McpError::from)?;
                let mut event = Event::default().event("message").data(payload);
                if let Some(event_id) = event_id {
                    event = event.id(event_id.to_string());
                }
                let _ = stream.sender.send(event);
            } else {
                debug!("no standalone GET stream open; dropping server-initiated message");
            }
            Ok(())
        }
    }
}

/// Removes `id` from its batch's outstanding set; if that empties the
/// batch, drops the stream's sender (ending the SSE response, or simply
/// unblocking the JSON-mode POST handler) and notifies the waiter.
fn finalize_if_batch_complete(state: &Arc<SessionState>, stream_id: &str, id: &RequestId) {
    state.request_to_stream.remove(id);
    let Some(batch) = state.batches.get(stream_id) else {
        return;
    };
    let mut remaining = batch.remaining.lock().expect("batch lock poisoned");
    remaining.remove(id);
    if remaining.is_empty() {
        batch.notify.notify_waiters();
        drop(remaining);
        state.streams.remove(stream_id);
    }
}

/// Hook invoked with the [`SessionTransport`] for every newly created
/// session so the caller can connect it to a protocol engine instance.
pub type SessionHook = Arc<dyn Fn(Arc<SessionTransport>) + Send + Sync>;

/// Owns every session's state for one Streamable-HTTP listener. Per-process,
/// per-listener — never a process-wide singleton (design notes §9).
pub struct StreamableHttpServer {
    config: StreamableHttpConfig,
    sessions: DashMap<String, Arc<SessionState>>,
    on_session: SessionHook,
}

impl StreamableHttpServer {
    pub fn new(config: StreamableHttpConfig, on_session: SessionHook) -> Arc<Self> {
        let sessions = DashMap::new();
        // Stateless mode has no initialize-minted session: the single
        // process-wide session is created up front and handed to the
        // caller's hook immediately, so it behaves like any other session
        // from the protocol engine's perspective.
        if config.session_id_generator.is_none() {
            let state = Self::new_session_state(STATELESS_SESSION_ID.to_string(), &config);
            sessions.insert(STATELESS_SESSION_ID.to_string(), state.clone());
            on_session(Arc::new(SessionTransport { state }));
        }
        Arc::new(Self {
            config,
            sessions,
            on_session,
        })
    }

    fn new_session_state(id: String, config: &StreamableHttpConfig) -> Arc<SessionState> {
        Arc::new(SessionState {
            id,
            initialized: AtomicBool::new(false),
            streams: DashMap::new(),
            request_to_stream: DashMap::new(),
            responses: DashMap::new(),
            batches: DashMap::new(),
            standalone_get_open: AtomicBool::new(false),
            event_store: config.event_store.clone(),
            enable_json_response: config.enable_json_response,
            lifecycle: Lifecycle::new(),
            on_message: std::sync::Mutex::new(None),
            on_error: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn mint_session_id(&self) -> String {
        match &self.config.session_id_generator {
            Some(generator) => generator(),
            None => Uuid::new_v4().to_string(),
        }
    }

    /// Resolves the session a non-initialize message should dispatch
    /// through: the header-named session in stateful mode, or the single
    /// process-wide session in stateless mode (spec §6: `null` means no
    /// session validation, not "no session").
    fn resolve_session(&self, headers: &HeaderMap) -> Option<Arc<SessionState>> {
        match &self.config.session_id_generator {
            Some(_) => headers
                .get(SESSION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|id| self.sessions.get(id).map(|e| e.clone())),
            None => self.sessions.get(STATELESS_SESSION_ID).map(|e| e.clone()),
        }
    }

    fn validate_dns_rebinding(&self, headers: &HeaderMap) -> Result<(), Response> {
        if !self.config.enable_dns_rebinding_protection {
            return Ok(());
        }
        if let Some(allowed) = &self.config.allowed_hosts {
            let host = headers
                .get(axum::http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(':').next().unwrap_or(v).to_ascii_lowercase());
            let ok = host
                .as_deref()
                .map(|h| allowed.iter().any(|a| a.eq_ignore_ascii_case(h)))
                .unwrap_or(false);
            if !ok {
                return Err(error_response(StatusCode::FORBIDDEN, codes::INVALID_REQUEST, "Host not allowed"));
            }
        }
        if let Some(allowed) = &self.config.allowed_origins {
            if let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) {
                let ok = allowed.iter().any(|a| a.eq_ignore_ascii_case(origin));
                if !ok {
                    return Err(error_response(StatusCode::FORBIDDEN, codes::INVALID_REQUEST, "Origin not allowed"));
                }
            }
        }
        Ok(())
    }

    fn validate_protocol_version(&self, headers: &HeaderMap) -> Result<(), Response> {
        if let Some(version) = headers.get(PROTOCOL_VERSION_HEADER).and_then(|v| v.to_str().ok()) {
            if !mcp_types::SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    codes::INVALID_REQUEST,
                    "unsupported Mcp-Protocol-Version",
                ));
            }
        }
        Ok(())
    }

    fn session_or_error(&self, headers: &HeaderMap) -> Result<Arc<SessionState>, Response> {
        let Some(session_id) = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) else {
            return Err(error_response(StatusCode::BAD_REQUEST, codes::INVALID_REQUEST, "missing Mcp-Session-Id"));
        };
        self.sessions
            .get(session_id)
            .map(|e| e.clone())
            .ok_or_else(|| error_response(StatusCode::NOT_FOUND, codes::INVALID_REQUEST, "unknown session"))
    }

    async fn handle_post(self: Arc<Self>, headers: HeaderMap, body: Bytes) -> Response {
        // DNS-rebinding and protocol-version checks are independent of
        // session/stateless mode: a stateless deployment behind a reverse
        // proxy still wants them enforced when its own flags ask for it.
        if let Err(resp) = self.validate_dns_rebinding(&headers) {
            return resp;
        }
        if let Err(resp) = self.validate_protocol_version(&headers) {
            return resp;
        }

        if !accept_contains(&headers, "application/json") || !accept_contains(&headers, "text/event-stream") {
            return error_response(StatusCode::NOT_ACCEPTABLE, codes::INVALID_REQUEST, "Accept must include application/json and text/event-stream");
        }
        if !content_type_is_json(&headers) {
            return error_response(StatusCode::UNSUPPORTED_MEDIA_TYPE, codes::INVALID_REQUEST, "Content-Type must be application/json");
        }

        let value: serde_json::Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(_) => return error_response(StatusCode::BAD_REQUEST, codes::PARSE_ERROR, "invalid JSON body"),
        };
        let raw_messages: Vec<serde_json::Value> = match value {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        let messages: Vec<Message> = match raw_messages
            .into_iter()
            .map(Message::from_value)
            .collect::<Result<_, _>>()
        {
            Ok(m) => m,
            Err(_) => return error_response(StatusCode::BAD_REQUEST, codes::PARSE_ERROR, "invalid JSON-RPC message"),
        };

        let has_initialize = messages
            .iter()
            .any(|m| matches!(m, Message::Request(r) if r.method == mcp_types::methods::INITIALIZE));

        let requests: Vec<RequestId> = messages
            .iter()
            .filter_map(|m| match m {
                Message::Request(r) => Some(r.id.clone()),
                _ => None,
            })
            .collect();

        // A notification/response-only batch carries no request id to
        // correlate and needs no session to be dispatched: look up the
        // session on a best-effort basis and fall through without a 400/404
        // when it can't be resolved, per spec §4.7 point 3.
        if requests.is_empty() {
            let session = self.resolve_session(&headers);
            for message in messages {
                if let Some(state) = &session {
                    let guard = state.on_message.lock().expect("on_message lock poisoned");
                    if let Some(cb) = guard.as_ref() {
                        cb(message);
                    }
                }
            }
            return (StatusCode::ACCEPTED, ()).into_response();
        }

        // Re-initializing a session the client already has a handle to is
        // rejected (spec §4.7): `initialize` only makes sense against a
        // session that doesn't exist yet or never completed the handshake.
        if has_initialize {
            if let Some(existing_id) = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) {
                if let Some(entry) = self.sessions.get(existing_id) {
                    if entry.initialized.load(Ordering::SeqCst) {
                        return error_response(StatusCode::BAD_REQUEST, codes::INVALID_REQUEST, "session already initialized");
                    }
                }
            }
        }

        let mut new_session_id: Option<String> = None;
        let state: Arc<SessionState> = if has_initialize {
            match &self.config.session_id_generator {
                Some(_) => {
                    let id = self.mint_session_id();
                    new_session_id = Some(id.clone());
                    let state = Self::new_session_state(id.clone(), &self.config);
                    self.sessions.insert(id, state.clone());
                    let transport = Arc::new(SessionTransport { state: state.clone() });
                    (self.on_session)(transport);
                    state
                }
                // Stateless mode has no per-initialize session to mint: the
                // process-wide session created in `new` is reused, and no
                // Mcp-Session-Id header is ever stamped on the response.
                None => self
                    .sessions
                    .get(STATELESS_SESSION_ID)
                    .map(|e| e.clone())
                    .expect("stateless session is created in StreamableHttpServer::new"),
            }
        } else if self.config.session_id_generator.is_some() {
            match self.session_or_error(&headers) {
                Ok(s) => s,
                Err(resp) => return resp,
            }
        } else {
            self.sessions
                .get(STATELESS_SESSION_ID)
                .map(|e| e.clone())
                .expect("stateless session is created in StreamableHttpServer::new")
        };

        // Dispatch every message to the session's registered handler.
        let dispatch_state = state.clone();
        let dispatch = move |msg: Message| {
            let guard = dispatch_state.on_message.lock().expect("on_message lock poisoned");
            if let Some(cb) = guard.as_ref() {
                cb(msg);
            }
        };

        let stream_id = Uuid::new_v4().to_string();
        let notify = Arc::new(Notify::new());
        state.batches.insert(stream_id.clone(), BatchWaiter {
            remaining: std::sync::Mutex::new(requests.iter().cloned().collect()),
            notify: notify.clone(),
        });
        for id in &requests {
            state.request_to_stream.insert(id.clone(), stream_id.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        if !state.enable_json_response {
            state.streams.insert(stream_id.clone(), ActiveStream { sender: tx });
        }

        for message in messages {
            dispatch(message);
        }

        notify.notified().await;

        if has_initialize {
            state.initialized.store(true, Ordering::SeqCst);
        }

        if state.enable_json_response {
            let mut results: Vec<Message> = Vec::with_capacity(requests.len());
            for id in &requests {
                if let Some((_, msg)) = state.responses.remove(id) {
                    results.push(msg);
                }
            }
            state.batches.remove(&stream_id);
            let body = if results.len() == 1 {
                results[0].to_value()
            } else {
                serde_json::Value::Array(results.iter().map(Message::to_value).collect())
            };
            let response = (
                StatusCode::OK,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                axum::Json(body),
            )
                .into_response();
            return with_session_header(response, &new_session_id);
        }

        drop(rx.is_closed());
        let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
        let response = Sse::new(stream).keep_alive(KeepAlive::default()).into_response();
        with_session_header(response, &new_session_id)
    }

    async fn handle_get(self: Arc<Self>, headers: HeaderMap) -> Response {
        if let Err(resp) = self.validate_dns_rebinding(&headers) {
            return resp;
        }
        if let Err(resp) = self.validate_protocol_version(&headers) {
            return resp;
        }
        if !headers
            .get(axum::http::header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("text/event-stream"))
        {
            return error_response(StatusCode::NOT_ACCEPTABLE, codes::INVALID_REQUEST, "Accept must include text/event-stream");
        }
        let state = match self.session_or_error(&headers) {
            Ok(s) => s,
            Err(resp) => return resp,
        };
        if state
            .standalone_get_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return error_response(StatusCode::CONFLICT, codes::INVALID_REQUEST, "standalone GET stream already open");
        }

        let (tx, rx) = mpsc::unbounded_channel::<Event>();

        if let Some(last_event_id) = headers.get(LAST_EVENT_ID_HEADER).and_then(|v| v.to_str().ok()) {
            if let (Ok(last_id), Some(store)) = (last_event_id.parse::<u64>(), state.event_store.clone()) {
                let tx_for_replay = tx.clone();
                store
                    .replay_events_after(last_id, &move |event| {
                        if let Ok(text) = event.message.to_json_string() {
                            let _ = tx_for_replay.send(Event::default().event("message").id(event.id.to_string()).data(text));
                        }
                    })
                    .await;
            }
        }

        state.streams.insert(STANDALONE_GET_STREAM.to_string(), ActiveStream { sender: tx.clone() });

        // Once the client disconnects, axum drops the SSE body and with it
        // `rx`; `tx.closed()` then resolves so the slot frees up for a
        // reconnect (spec §8.6) instead of staying 409-locked forever.
        let reset_state = state.clone();
        tokio::spawn(async move {
            tx.closed().await;
            reset_state.streams.remove(STANDALONE_GET_STREAM);
            reset_state.standalone_get_open.store(false, Ordering::SeqCst);
        });

        let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
        Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
    }

    async fn handle_delete(self: Arc<Self>, headers: HeaderMap) -> Response {
        if let Err(resp) = self.validate_dns_rebinding(&headers) {
            return resp;
        }
        if let Err(resp) = self.validate_protocol_version(&headers) {
            return resp;
        }
        let state = match self.session_or_error(&headers) {
            Ok(s) => s,
            Err(resp) => return resp,
        };
        self.sessions.remove(&state.id);
        let _ = state.lifecycle.close(|| async { Ok(()) }).await;
        StatusCode::OK.into_response()
    }
}

/// Stamps `Mcp-Session-Id` onto a response when a session was just minted by
/// this request (spec §4.7: the id is returned once, on the initialize POST).
fn with_session_header(mut response: Response, session_id: &Option<String>) -> Response {
    if let Some(id) = session_id {
        if let Ok(value) = axum::http::HeaderValue::from_str(id) {
            response.headers_mut().insert(
                axum::http::HeaderName::from_static(SESSION_ID_HEADER),
                value,
            );
        }
    }
    response
}

fn accept_contains(headers: &HeaderMap, needle: &str) -> bool {
    headers
        .get(axum::http::header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|part| part.trim().starts_with(needle)))
        .unwrap_or(false)
}

fn content_type_is_json(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false)
}

fn error_response(status: StatusCode, code: i64, message: &str) -> Response {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": serde_json::Value::Null,
        "error": ErrorObject::new(code, message),
    });
    (status, axum::Json(body)).into_response()
}

/// Builds the axum `Router` exposing `POST`/`GET`/`DELETE` at the server's
/// configured path.
pub fn streamable_http_router(server: Arc<StreamableHttpServer>) -> Router {
    let path = server.config.path.clone();
    Router::new()
        .route(
            &path,
            post({
                let server = server.clone();
                move |headers: HeaderMap, body: Bytes| {
                    let server = server.clone();
                    async move { server.handle_post(headers, body).await }
                }
            })
            .get({
                let server = server.clone();
                move |headers: HeaderMap| {
                    let server = server.clone();
                    async move { server.handle_get(headers).await }
                }
            })
            .delete({
                let server = server.clone();
                move |headers: HeaderMap| {
                    let server = server.clone();
                    async move { server.handle_delete(headers).await }
                }
            }),
        )
        .layer(tower_http::cors::CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_types::{Implementation, InitializeParams, ClientCapabilities};

    fn init_body() -> Vec<u8> {
        let params = InitializeParams {
            protocol_version: mcp_types::LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation { name: "test".into(), version: "1".into() },
        };
        let msg = Message::request(1_i64, mcp_types::methods::INITIALIZE, Some(serde_json::to_value(params).unwrap()));
        serde_json::to_vec(&msg.to_value()).unwrap()
    }

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                axum::http::HeaderValue::from_str(v).unwrap(),
            );
        }
        headers
    }

    /// A session hook standing in for a connected protocol engine: replies
    /// to every request with an empty success result so `handle_post` can
    /// observe its batch complete instead of waiting on a response that
    /// never arrives. Registration happens synchronously, inside the hook
    /// itself, so it is wired before `handle_post` dispatches the batch.
    fn auto_respond_hook() -> SessionHook {
        Arc::new(|transport: Arc<SessionTransport>| {
            let responder = transport.clone();
            transport.on_message(Arc::new(move |msg| {
                if let Message::Request(r) = msg {
                    let responder = responder.clone();
                    tokio::spawn(async move {
                        let _ = responder.start().await;
                        let _ = responder
                            .send(Message::response(r.id.clone(), serde_json::json!({"ok": true})), None)
                            .await;
                    });
                }
            }));
        })
    }

    #[tokio::test]
    async fn initialize_post_creates_session_and_opens_stream() {
        let captured = Arc::new(std::sync::Mutex::new(None));
        let captured_clone = captured.clone();
        let hook = auto_respond_hook();
        let server = StreamableHttpServer::new(
            StreamableHttpConfig::default(),
            Arc::new(move |transport: Arc<SessionTransport>| {
                *captured_clone.lock().unwrap() = Some(transport.clone());
                hook(transport);
            }),
        );

        let headers = headers_with(&[
            ("accept", "application/json, text/event-stream"),
            ("content-type", "application/json"),
        ]);
        let response = server.clone().handle_post(headers, Bytes::from(init_body())).await;
        assert!(response.status().is_success());
        assert!(response.headers().contains_key(SESSION_ID_HEADER));
        assert!(captured.lock().unwrap().is_some());
        assert_eq!(server.sessions.len(), 1);
    }

    #[tokio::test]
    async fn rejects_wrong_accept_header() {
        let server = StreamableHttpServer::new(StreamableHttpConfig::default(), Arc::new(|_| {}));
        let headers = headers_with(&[("content-type", "application/json")]);
        let response = server.clone().handle_post(headers, Bytes::from(init_body())).await;
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn notification_only_batch_gets_202() {
        let server = StreamableHttpServer::new(StreamableHttpConfig::default(), Arc::new(|_| {}));
        let headers = headers_with(&[
            ("accept", "application/json, text/event-stream"),
            ("content-type", "application/json"),
            ("mcp-session-id", "does-not-matter-for-notifications"),
        ]);
        // Stateless-looking batch: only a notification, no request id.
        let msg = Message::notification("notifications/initialized", None);
        let body = serde_json::to_vec(&msg.to_value()).unwrap();
        let response = server.clone().handle_post(headers, Bytes::from(body)).await;
        // A notification-only batch needs no session to correlate, so an
        // unresolvable Mcp-Session-Id doesn't block the 202.
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn second_standalone_get_is_rejected() {
        let server = StreamableHttpServer::new(StreamableHttpConfig::default(), auto_respond_hook());
        let init_headers = headers_with(&[
            ("accept", "application/json, text/event-stream"),
            ("content-type", "application/json"),
        ]);
        let response = server.clone().handle_post(init_headers, Bytes::from(init_body())).await;
        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .expect("initialize response carries Mcp-Session-Id")
            .to_str()
            .unwrap()
            .to_string();

        let get_headers = headers_with(&[("accept", "text/event-stream"), (SESSION_ID_HEADER, &session_id)]);
        let first = server.clone().handle_get(get_headers.clone()).await;
        assert!(first.status().is_success());

        let second = server.clone().handle_get(get_headers).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn standalone_get_stream_can_reconnect_after_disconnect_with_last_event_id() {
        use crate::event_store::InMemoryEventStore;

        let captured = Arc::new(std::sync::Mutex::new(None));
        let captured_clone = captured.clone();
        let hook = auto_respond_hook();
        let config = StreamableHttpConfig {
            event_store: Some(Arc::new(InMemoryEventStore::new())),
            ..StreamableHttpConfig::default()
        };
        let server = StreamableHttpServer::new(
            config,
            Arc::new(move |transport: Arc<SessionTransport>| {
                *captured_clone.lock().unwrap() = Some(transport.clone());
                hook(transport);
            }),
        );

        let init_headers = headers_with(&[
            ("accept", "application/json, text/event-stream"),
            ("content-type", "application/json"),
        ]);
        let response = server.clone().handle_post(init_headers, Bytes::from(init_body())).await;
        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .expect("initialize response carries Mcp-Session-Id")
            .to_str()
            .unwrap()
            .to_string();

        let get_headers = headers_with(&[("accept", "text/event-stream"), (SESSION_ID_HEADER, &session_id)]);
        let first = server.clone().handle_get(get_headers.clone()).await;
        assert!(first.status().is_success());

        // The server pushes one standalone message while the GET stream is
        // open, recorded by the event store under event id 1.
        let transport = captured.lock().unwrap().clone().expect("session hook ran");
        transport
            .send(Message::notification("notifications/progress", None), None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Simulate the client's connection dropping: dropping the response
        // drops the SSE body, and with it the channel receiver the stream
        // slot is waiting on.
        drop(first);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let reconnect_headers = headers_with(&[
            ("accept", "text/event-stream"),
            (SESSION_ID_HEADER, &session_id),
            (LAST_EVENT_ID_HEADER, "1"),
        ]);
        let reconnected = server.clone().handle_get(reconnect_headers).await;
        assert!(
            reconnected.status().is_success(),
            "reconnect after disconnect should reopen the standalone stream, not 409"
        );
    }

    #[tokio::test]
    async fn stateless_mode_dispatches_a_request_without_session_bookkeeping() {
        let config = StreamableHttpConfig {
            session_id_generator: None,
            enable_json_response: true,
            ..StreamableHttpConfig::default()
        };
        let server = StreamableHttpServer::new(config, auto_respond_hook());

        let headers = headers_with(&[
            ("accept", "application/json, text/event-stream"),
            ("content-type", "application/json"),
        ]);
        let msg = Message::request(1_i64, "ping", None);
        let body = serde_json::to_vec(&msg.to_value()).unwrap();
        let response = server.clone().handle_post(headers, Bytes::from(body)).await;

        assert!(response.status().is_success(), "stateless mode must still serve requests");
        assert!(!response.headers().contains_key(SESSION_ID_HEADER));
    }

    #[tokio::test]
    async fn reinitializing_an_initialized_session_is_rejected() {
        let server = StreamableHttpServer::new(StreamableHttpConfig::default(), auto_respond_hook());
        let init_headers = headers_with(&[
            ("accept", "application/json, text/event-stream"),
            ("content-type", "application/json"),
        ]);
        let response = server.clone().handle_post(init_headers, Bytes::from(init_body())).await;
        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .expect("initialize response carries Mcp-Session-Id")
            .to_str()
            .unwrap()
            .to_string();

        let second_init_headers = headers_with(&[
            ("accept", "application/json, text/event-stream"),
            ("content-type", "application/json"),
            (SESSION_ID_HEADER, &session_id),
        ]);
        let second = server.clone().handle_post(second_init_headers, Bytes::from(init_body())).await;
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_rejects_unsupported_protocol_version() {
        let server = StreamableHttpServer::new(StreamableHttpConfig::default(), auto_respond_hook());
        let init_headers = headers_with(&[
            ("accept", "application/json, text/event-stream"),
            ("content-type", "application/json"),
        ]);
        let response = server.clone().handle_post(init_headers, Bytes::from(init_body())).await;
        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .expect("initialize response carries Mcp-Session-Id")
            .to_str()
            .unwrap()
            .to_string();

        let get_headers = headers_with(&[
            ("accept", "text/event-stream"),
            (SESSION_ID_HEADER, &session_id),
            (PROTOCOL_VERSION_HEADER, "1999-01-01"),
        ]);
        let response = server.clone().handle_get(get_headers).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_rejects_disallowed_host_and_unsupported_protocol_version() {
        let config = StreamableHttpConfig {
            enable_dns_rebinding_protection: true,
            allowed_hosts: Some(vec!["example.com".to_string()]),
            ..StreamableHttpConfig::default()
        };
        let server = StreamableHttpServer::new(config, auto_respond_hook());

        let bad_host_headers = headers_with(&[("host", "evil.com"), (SESSION_ID_HEADER, "does-not-matter")]);
        let response = server.clone().handle_delete(bad_host_headers).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let bad_version_headers = headers_with(&[
            ("host", "example.com"),
            (SESSION_ID_HEADER, "does-not-matter"),
            (PROTOCOL_VERSION_HEADER, "1999-01-01"),
        ]);
        let response = server.clone().handle_delete(bad_version_headers).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
