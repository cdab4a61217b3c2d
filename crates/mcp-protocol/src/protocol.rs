use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use mcp_transport::{ErrorCallback, SendOptions, Transport};
use mcp_types::{
    methods, CancelledNotification, ErrorResponse, McpError, Message, Notification,
    ProgressNotification, ProgressToken, Request, RequestId, Response,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capability::CapabilityGate;
use crate::dispatch::{
    BoxFuture, Dispatch, NotificationHandlerFn, ProgressHandlerFn, RequestExtra, RequestHandlerFn,
    WaiterOutcome,
};

/// Default deadline for `Protocol::request`, per spec §4.8.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Which side of the deadline-vs-cancellation race in `Protocol::request`
/// resolved first.
enum Outcome {
    TimedOut(Result<Result<WaiterOutcome, tokio::sync::oneshot::error::RecvError>, tokio::time::error::Elapsed>),
    Cancelled,
}

/// Per-call overrides for `Protocol::request`.
#[derive(Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub progress: Option<ProgressHandlerFn>,
    /// Hint threaded through to the transport's `send`, used by
    /// Streamable-HTTP to route a reply onto the stream that originated a
    /// still-in-flight request it answers.
    pub related_request_id: Option<RequestId>,
    /// Caller-supplied cancellation signal. Triggering it has the same
    /// observable effect as a timeout: waiter and progress-handler removal,
    /// a best-effort `notifications/cancelled` to the peer, and the call
    /// returning promptly instead of waiting out the deadline.
    pub cancellation: Option<CancellationToken>,
}

/// The protocol engine (C8): request/response correlation, handler
/// dispatch, progress relay, cancellation, timeout supervision, and
/// capability gating, sitting directly on top of one [`Transport`]
/// instance at a time.
pub struct Protocol {
    dispatch: Dispatch,
    transport: StdMutex<Option<Arc<dyn Transport>>>,
    next_id: AtomicI64,
    gate: Arc<dyn CapabilityGate>,
    enforce_strict_capabilities: bool,
    default_timeout: Duration,
    error_sinks: StdMutex<Vec<ErrorCallback>>,
    in_flight: StdMutex<HashMap<RequestId, CancellationToken>>,
}

impl Protocol {
    pub fn new(gate: Arc<dyn CapabilityGate>, enforce_strict_capabilities: bool) -> Arc<Self> {
        let protocol = Arc::new(Self {
            dispatch: Dispatch::new(),
            transport: StdMutex::new(None),
            next_id: AtomicI64::new(1),
            gate,
            enforce_strict_capabilities,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            error_sinks: StdMutex::new(Vec::new()),
            in_flight: StdMutex::new(HashMap::new()),
        });
        protocol.install_builtins();
        protocol
    }

    fn install_builtins(self: &Arc<Self>) {
        self.dispatch.set_request_handler(
            methods::PING,
            Arc::new(|_req, _extra| {
                Box::pin(async { Ok(Value::Object(Default::default())) }) as BoxFuture<Result<Value, McpError>>
            }),
        );

        let this = self.clone();
        self.dispatch.set_notification_handler(
            methods::NOTIFICATIONS_PROGRESS,
            Arc::new(move |notification: Notification| {
                let this = this.clone();
                Box::pin(async move {
                    let Some(params) = notification.params else {
                        return;
                    };
                    let progress: Result<ProgressNotification, _> = serde_json::from_value(params);
                    match progress {
                        Ok(progress) => {
                            if let Some(handler) = this.dispatch.progress_handler(&progress.progress_token)
                            {
                                handler(progress);
                            }
                        }
                        Err(err) => warn!("malformed notifications/progress payload: {err}"),
                    }
                }) as BoxFuture<()>
            }),
        );

        let this = self.clone();
        self.dispatch.set_notification_handler(
            methods::NOTIFICATIONS_CANCELLED,
            Arc::new(move |notification: Notification| {
                let this = this.clone();
                Box::pin(async move {
                    let Some(params) = notification.params else {
                        return;
                    };
                    match serde_json::from_value::<CancelledNotification>(params) {
                        Ok(cancelled) => {
                            let token = this
                                .in_flight
                                .lock()
                                .expect("in_flight lock poisoned")
                                .get(&cancelled.request_id)
                                .cloned();
                            if let Some(token) = token {
                                debug!("cancelling in-flight request {}", cancelled.request_id);
                                token.cancel();
                            }
                        }
                        Err(err) => warn!("malformed notifications/cancelled payload: {err}"),
                    }
                }) as BoxFuture<()>
            }),
        );
    }

    /// Registers a handler for an inbound request method. Checked against
    /// the local capability gate at registration time, per spec §4.8's
    /// `assert_request_handler_capability` hook.
    pub fn on_request(&self, method: impl Into<String>, handler: RequestHandlerFn) -> Result<(), McpError> {
        let method = method.into();
        self.gate.assert_request_handler_capability(&method)?;
        self.dispatch.set_request_handler(method, handler);
        Ok(())
    }

    pub fn on_notification(&self, method: impl Into<String>, handler: NotificationHandlerFn) {
        self.dispatch.set_notification_handler(method.into(), handler);
    }

    fn emit_error(&self, err: McpError) {
        let sinks = self.error_sinks.lock().expect("error sink lock poisoned").clone();
        for sink in sinks {
            sink(McpError::InternalError(err.to_string()));
        }
    }

    pub fn on_error(&self, callback: ErrorCallback) {
        self.error_sinks.lock().expect("error sink lock poisoned").push(callback);
    }

    /// Replaces the engine's transport, wires up its callbacks to this
    /// engine's dispatch loop, and starts it.
    pub async fn connect(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), McpError> {
        let handler_self = self.clone();
        transport.on_message(Arc::new(move |message| {
            let this = handler_self.clone();
            tokio::spawn(async move {
                this.handle_message(message).await;
            });
        }));

        let error_self = self.clone();
        transport.on_error(Arc::new(move |err| {
            error_self.emit_error(err);
        }));

        let close_self = self.clone();
        transport.on_close(Arc::new(move || {
            close_self.dispatch.fail_all_waiters();
        }));

        *self.transport.lock().expect("transport lock poisoned") = Some(transport.clone());
        transport.start().await
    }

    fn current_transport(&self) -> Result<Arc<dyn Transport>, McpError> {
        self.transport
            .lock()
            .expect("transport lock poisoned")
            .clone()
            .ok_or(McpError::ConnectionClosed)
    }

    async fn handle_message(self: Arc<Self>, message: Message) {
        match message {
            Message::Request(req) => self.handle_request(req).await,
            Message::Notification(notification) => self.handle_notification(notification).await,
            Message::Response(response) => self.complete_response(response.id, Ok(response.result)),
            Message::Error(error) => {
                self.complete_response(error.id, Err(McpError::from_error_object(error.error)))
            }
        }
    }

    fn complete_response(&self, id: RequestId, result: Result<Value, McpError>) {
        let outcome = match result {
            Ok(value) => WaiterOutcome::Result(value),
            Err(err) => WaiterOutcome::Error(err),
        };
        match self.dispatch.take_waiter(&id) {
            Some(waiter) => waiter.complete(outcome),
            None => {
                warn!("received response/error for unknown request id {id}");
                self.emit_error(McpError::InternalError(format!(
                    "response for unknown request id {id}"
                )));
            }
        }
    }

    async fn handle_request(self: Arc<Self>, req: Request) {
        let method = req.method.clone();
        let id = req.id.clone();
        let progress_token = req
            .params
            .as_ref()
            .and_then(extract_progress_token);

        let cancellation = CancellationToken::new();
        self.in_flight
            .lock()
            .expect("in_flight lock poisoned")
            .insert(id.clone(), cancellation.clone());

        let handler = self.dispatch.request_handler(&method);
        let extra = RequestExtra {
            progress_token,
            cancellation: cancellation.clone(),
        };

        let outcome = match handler {
            Some(handler) => {
                tokio::select! {
                    result = handler(req, extra) => result,
                    _ = cancellation.cancelled() => Err(McpError::InternalError(format!("request {method} cancelled by peer"))),
                }
            }
            None => Err(McpError::MethodNotFound(method.clone())),
        };

        self.in_flight.lock().expect("in_flight lock poisoned").remove(&id);

        let message = match outcome {
            Ok(value) => Message::Response(Response { id, result: value }),
            Err(err) => {
                self.emit_error(McpError::InternalError(err.to_string()));
                Message::Error(ErrorResponse {
                    id,
                    error: err.to_error_object(),
                })
            }
        };

        if let Err(err) = self.send_message(message, None).await {
            warn!("failed to send response: {err}");
        }
    }

    async fn handle_notification(self: Arc<Self>, notification: Notification) {
        let Some(handler) = self.dispatch.notification_handler(&notification.method) else {
            debug!("no handler for notification {}", notification.method);
            return;
        };
        handler(notification).await;
    }

    async fn send_message(&self, message: Message, options: Option<SendOptions>) -> Result<(), McpError> {
        self.current_transport()?.send(message, options).await
    }

    pub async fn notify(&self, method: impl Into<String>, params: Option<Value>) -> Result<(), McpError> {
        let method = method.into();
        self.gate.assert_notification_capability(&method)?;
        self.send_message(Message::notification(method, params), None).await
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Issues a typed request and awaits its response under a deadline.
    /// On timeout, removes the waiter and progress handler, sends a
    /// best-effort `notifications/cancelled` to the peer, and returns
    /// [`McpError::RequestTimeout`].
    pub async fn request<P, R>(
        self: &Arc<Self>,
        method: &str,
        params: Option<P>,
        options: RequestOptions,
    ) -> Result<R, McpError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if self.enforce_strict_capabilities {
            self.gate.assert_capability_for_method(method)?;
        }

        let id = self.next_request_id();
        let mut params_value = match params {
            Some(p) => Some(serde_json::to_value(p).map_err(McpError::from)?),
            None => None,
        };

        let progress_token = options.progress.as_ref().map(|_| request_id_to_progress_token(&id));
        if let (Some(token), Some(value)) = (&progress_token, &mut params_value) {
            attach_progress_token(value, token);
        } else if let Some(token) = &progress_token {
            let mut object = serde_json::Map::new();
            attach_progress_token_to_map(&mut object, token);
            params_value = Some(Value::Object(object));
        }

        let progress_registration = match (progress_token.clone(), options.progress) {
            (Some(token), Some(handler)) => Some((token, handler)),
            _ => None,
        };

        let rx = self.dispatch.register_waiter(id.clone(), progress_registration);

        let message = Message::Request(Request {
            id: id.clone(),
            method: method.to_string(),
            params: params_value,
        });

        if let Err(err) = self
            .send_message(message, options.related_request_id.map(|r| SendOptions { related_request_id: Some(r) }))
            .await
        {
            self.dispatch.take_waiter(&id);
            return Err(err);
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let outcome = match options.cancellation {
            Some(cancellation) => {
                tokio::select! {
                    result = tokio::time::timeout(timeout, rx) => Outcome::TimedOut(result),
                    _ = cancellation.cancelled() => Outcome::Cancelled,
                }
            }
            None => Outcome::TimedOut(tokio::time::timeout(timeout, rx).await),
        };

        match outcome {
            Outcome::TimedOut(Ok(Ok(WaiterOutcome::Result(value)))) => {
                serde_json::from_value(value).map_err(|err| McpError::InternalError(err.to_string()))
            }
            Outcome::TimedOut(Ok(Ok(WaiterOutcome::Error(err)))) => Err(err),
            Outcome::TimedOut(Ok(Err(_))) => Err(McpError::ConnectionClosed),
            Outcome::TimedOut(Err(_)) => {
                self.dispatch.take_waiter(&id);
                self.send_best_effort_cancelled(&id, "Request timed out").await;
                Err(McpError::RequestTimeout)
            }
            Outcome::Cancelled => {
                self.dispatch.take_waiter(&id);
                self.send_best_effort_cancelled(&id, "Request cancelled by caller").await;
                Err(McpError::ConnectionClosed)
            }
        }
    }

    async fn send_best_effort_cancelled(&self, id: &RequestId, reason: &str) {
        let cancel_params = CancelledNotification {
            request_id: id.clone(),
            reason: Some(reason.to_string()),
        };
        let _ = self
            .notify(
                methods::NOTIFICATIONS_CANCELLED,
                Some(serde_json::to_value(cancel_params).unwrap_or(Value::Null)),
            )
            .await;
    }

    pub fn outstanding_request_count(&self) -> usize {
        self.dispatch.outstanding_count()
    }

    pub async fn close(&self) -> Result<(), McpError> {
        let transport = self.transport.lock().expect("transport lock poisoned").take();
        self.dispatch.fail_all_waiters();
        match transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }
}

/// A progress token minted from a request id shares its integer-or-string
/// shape; reusing the id's value (rather than a separate counter) keeps
/// tokens trivially correlatable back to the request they authorize
/// progress for when reading wire traffic.
fn request_id_to_progress_token(id: &RequestId) -> ProgressToken {
    match id {
        RequestId::Number(n) => ProgressToken::Number(*n),
        RequestId::String(s) => ProgressToken::String(s.clone()),
    }
}

fn extract_progress_token(params: &Value) -> Option<ProgressToken> {
    params
        .get("_meta")
        .and_then(|meta| meta.get("progressToken"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn attach_progress_token(params: &mut Value, token: &ProgressToken) {
    if !params.is_object() {
        *params = Value::Object(Default::default());
    }
    let object = params.as_object_mut().expect("just ensured object");
    attach_progress_token_to_map(object, token);
}

fn attach_progress_token_to_map(object: &mut serde_json::Map<String, Value>, token: &ProgressToken) {
    let meta = object
        .entry("_meta")
        .or_insert_with(|| Value::Object(Default::default()));
    if !meta.is_object() {
        *meta = Value::Object(Default::default());
    }
    meta.as_object_mut()
        .expect("just ensured object")
        .insert("progressToken".to_string(), serde_json::to_value(token).expect("ProgressToken serializes"));
}
