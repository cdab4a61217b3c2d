#![forbid(unsafe_code)]
//! The Model Context Protocol engine (C8): request/response correlation,
//! handler dispatch, progress relay, cancellation, timeout supervision,
//! and capability gating on top of one [`mcp_transport::Transport`] at a
//! time.

mod capability;
mod dispatch;
mod protocol;

pub use capability::{missing_capability_error, CapabilityGate, PermissiveGate};
pub use dispatch::{BoxFuture, NotificationHandlerFn, ProgressHandlerFn, RequestExtra, RequestHandlerFn, WaiterOutcome};
pub use protocol::{Protocol, RequestOptions, DEFAULT_REQUEST_TIMEOUT};
