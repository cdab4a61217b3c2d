#![forbid(unsafe_code)]
//! The server-side feature registry (C9): a thread-safe tool/prompt/resource
//! catalogue, the `initialize` handshake, and the request handlers that
//! bridge registry lookups onto an [`mcp_protocol::Protocol`].

mod capability;
mod handlers;
mod registry;
mod server;

pub use capability::ServerCapabilityGate;
pub use mcp_protocol::BoxFuture;
pub use registry::{
    FeatureRegistry, PromptProviderFn, RegisteredPrompt, RegisteredResource, RegisteredTool,
    ResourceReaderFn, ToolHandlerFn,
};
pub use server::Server;
