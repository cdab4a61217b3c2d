use std::sync::Arc;

use async_trait::async_trait;
use mcp_types::{McpError, Message, RequestId};

/// Per-send hints. Streamable-HTTP uses `related_request_id` to route a
/// server-initiated message onto the stream already associated with the
/// request it answers, when that isn't already recoverable from the
/// message's own `id`.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub related_request_id: Option<RequestId>,
}

pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(McpError) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;

/// The capability set every transport implements, independent of how it
/// moves bytes: stdio pipes, SSE long-polling, or Streamable-HTTP.
///
/// This is a trait, not a mandatory base class — per the design notes, the
/// lifecycle state machine in [`crate::lifecycle`] is a shared helper that
/// transports compose with rather than inherit from.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begins any background reader tasks. Idempotent-failure: succeeds
    /// once: a second call fails without side effects.
    async fn start(&self) -> Result<(), McpError>;

    /// Delivers one message. Fails with `ConnectionClosed` when the
    /// transport is not in the `Operational` state.
    async fn send(&self, message: Message, options: Option<SendOptions>) -> Result<(), McpError>;

    /// Transitions the transport toward `Stopped`. Safe to call repeatedly;
    /// close callbacks fire exactly once regardless of how many times this
    /// is called.
    async fn close(&self) -> Result<(), McpError>;

    /// Registers the inbound-message callback. The most recent registration
    /// wins: a transport invokes exactly one subscriber per message.
    fn on_message(&self, callback: MessageCallback);

    /// Registers an asynchronous error sink for non-fatal exceptions.
    /// Additive: every registered callback is invoked.
    fn on_error(&self, callback: ErrorCallback);

    /// Registers a one-shot close observer. Additive: every registered
    /// callback fires exactly once, when the transport reaches `Stopped` (or
    /// a terminal failure state).
    fn on_close(&self, callback: CloseCallback);
}
