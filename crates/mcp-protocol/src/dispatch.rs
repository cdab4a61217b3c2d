use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use arc_swap::ArcSwap;
use mcp_types::{McpError, Notification, ProgressNotification, ProgressToken, Request, RequestId};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A boxed, `'static` future — the shape every handler signature returns so
/// the dispatch loop can await it uniformly regardless of what async
/// runtime primitives the handler itself used to produce it.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Extra context handed to a request handler alongside its typed params:
/// the progress token the caller attached (if any) and a cancellation
/// token that fires if the peer sends `notifications/cancelled` for this
/// request id before the handler completes.
#[derive(Clone)]
pub struct RequestExtra {
    pub progress_token: Option<ProgressToken>,
    pub cancellation: CancellationToken,
}

pub type RequestHandlerFn =
    Arc<dyn Fn(Request, RequestExtra) -> BoxFuture<Result<Value, McpError>> + Send + Sync>;
pub type NotificationHandlerFn = Arc<dyn Fn(Notification) -> BoxFuture<()> + Send + Sync>;
pub type ProgressHandlerFn = Arc<dyn Fn(ProgressNotification) + Send + Sync>;

/// Outcome delivered to a waiting `request()` call once its response (or
/// error, or timeout, or close) arrives.
pub enum WaiterOutcome {
    Result(Value),
    Error(McpError),
}

/// One outstanding request's waiter. Holds the token of the matching
/// `progress_handlers` entry (if a progress token was supplied) so removing
/// a waiter can remove its progress handler in the same call, honoring the
/// "removal from response_waiters implies removal from progress_handlers"
/// invariant without needing a single compare-and-swap across two
/// independent `ArcSwap` fields.
pub struct Waiter {
    sender: StdMutex<Option<oneshot::Sender<WaiterOutcome>>>,
    pub progress_token: Option<ProgressToken>,
}

impl Waiter {
    /// Completes the waiter exactly once; subsequent calls are no-ops since
    /// `oneshot::Sender::send` consumes itself and a second `take()` finds
    /// nothing.
    pub(crate) fn complete(&self, outcome: WaiterOutcome) {
        if let Some(sender) = self.sender.lock().expect("waiter lock poisoned").take() {
            let _ = sender.send(outcome);
        }
    }
}

/// The four copy-on-write dispatch maps the protocol engine maintains,
/// per spec §4.8/§9: snapshot reads via `ArcSwap::load`, compare-and-swap
/// writes via `ArcSwap::rcu`, so readers dispatching inbound messages never
/// block on a writer registering a new handler or request.
#[derive(Default)]
pub struct Dispatch {
    request_handlers: ArcSwap<HashMap<String, RequestHandlerFn>>,
    notification_handlers: ArcSwap<HashMap<String, NotificationHandlerFn>>,
    response_waiters: ArcSwap<HashMap<RequestId, Arc<Waiter>>>,
    progress_handlers: ArcSwap<HashMap<ProgressToken, ProgressHandlerFn>>,
}

impl Dispatch {
    pub fn new() -> Self {
        Self {
            request_handlers: ArcSwap::from_pointee(HashMap::new()),
            notification_handlers: ArcSwap::from_pointee(HashMap::new()),
            response_waiters: ArcSwap::from_pointee(HashMap::new()),
            progress_handlers: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn set_request_handler(&self, method: impl Into<String>, handler: RequestHandlerFn) {
        let method = method.into();
        self.request_handlers.rcu(|map| {
            let mut next = (**map).clone();
            next.insert(method.clone(), handler.clone());
            next
        });
    }

    pub fn remove_request_handler(&self, method: &str) {
        self.request_handlers.rcu(|map| {
            let mut next = (**map).clone();
            next.remove(method);
            next
        });
    }

    pub fn request_handler(&self, method: &str) -> Option<RequestHandlerFn> {
        self.request_handlers.load().get(method).cloned()
    }

    pub fn set_notification_handler(&self, method: impl Into<String>, handler: NotificationHandlerFn) {
        let method = method.into();
        self.notification_handlers.rcu(|map| {
            let mut next = (**map).clone();
            next.insert(method.clone(), handler.clone());
            next
        });
    }

    pub fn notification_handler(&self, method: &str) -> Option<NotificationHandlerFn> {
        self.notification_handlers.load().get(method).cloned()
    }

    /// Registers a waiter for `id`, optionally under a progress token with
    /// the callback that should receive `notifications/progress` events
    /// correlated to it. The caller must not reuse `id` while its waiter is
    /// live (spec invariant); this only enforces it by construction
    /// (callers mint fresh ids), not by rejecting collisions.
    pub fn register_waiter(
        &self,
        id: RequestId,
        progress: Option<(ProgressToken, ProgressHandlerFn)>,
    ) -> oneshot::Receiver<WaiterOutcome> {
        let (tx, rx) = oneshot::channel();
        let progress_token = progress.as_ref().map(|(token, _)| token.clone());
        let waiter = Arc::new(Waiter {
            sender: StdMutex::new(Some(tx)),
            progress_token,
        });

        self.response_waiters.rcu(|map| {
            let mut next = (**map).clone();
            next.insert(id.clone(), waiter.clone());
            next
        });

        if let Some((token, handler)) = progress {
            self.set_progress_handler(token, handler);
        }

        rx
    }

    /// Overwrites (or installs) the progress callback invoked for `token`.
    pub fn set_progress_handler(&self, token: ProgressToken, handler: ProgressHandlerFn) {
        self.progress_handlers.rcu(|map| {
            let mut next = (**map).clone();
            next.insert(token.clone(), handler.clone());
            next
        });
    }

    pub fn progress_handler(&self, token: &ProgressToken) -> Option<ProgressHandlerFn> {
        self.progress_handlers.load().get(token).cloned()
    }

    /// Atomically (from an observer's perspective) removes the waiter for
    /// `id` and, if it carried one, its progress handler — invariant #2 in
    /// spec §8. Returns the waiter so the caller can complete it exactly
    /// once; a second call for the same id finds nothing and is a no-op.
    pub fn take_waiter(&self, id: &RequestId) -> Option<Arc<Waiter>> {
        let mut taken = None;
        self.response_waiters.rcu(|map| {
            if !map.contains_key(id) {
                taken = None;
                return map.clone();
            }
            let mut next = (**map).clone();
            taken = next.remove(id);
            next
        });
        if let Some(waiter) = &taken {
            if let Some(token) = &waiter.progress_token {
                self.progress_handlers.rcu(|map| {
                    let mut next = (**map).clone();
                    next.remove(token);
                    next
                });
            }
        }
        taken
    }

    pub fn complete_waiter(&self, id: &RequestId, outcome: WaiterOutcome) {
        if let Some(waiter) = self.take_waiter(id) {
            waiter.complete(outcome);
        }
    }

    /// Drains every outstanding waiter, completing each with
    /// `ConnectionClosed` — invoked once the underlying transport closes.
    pub fn fail_all_waiters(&self) {
        let drained = self.response_waiters.swap(Arc::new(HashMap::new()));
        self.progress_handlers.store(Arc::new(HashMap::new()));
        for (_, waiter) in drained.iter() {
            waiter.complete(WaiterOutcome::Error(McpError::ConnectionClosed));
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.response_waiters.load().len()
    }
}
