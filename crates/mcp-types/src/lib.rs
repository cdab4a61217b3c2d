#![forbid(unsafe_code)]
//! Wire types and codecs for the Model Context Protocol: the JSON-RPC 2.0
//! message envelope, capability records, domain types (tools, prompts,
//! resources), and the error taxonomy every other crate in this workspace
//! builds on.

mod capabilities;
mod domain;
mod error;
mod handshake;
mod ids;
mod message;
pub mod methods;
mod version;

pub use capabilities::{
    ClientCapabilities, Implementation, PromptsCapability, ResourcesCapability, RootsCapability,
    ServerCapabilities, ToolsCapability,
};
pub use domain::{
    CallToolParams, CallToolResult, GetPromptParams, GetPromptResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, Prompt, PromptArgument, ReadResourceParams,
    ReadResourceResult, Resource, ResourceUpdatedNotification, Tool,
};
pub use error::{codes, ErrorObject, McpError, Result};
pub use handshake::{CancelledNotification, InitializeParams, InitializeResult, ProgressNotification};
pub use ids::{ProgressToken, RequestId};
pub use message::{ErrorResponse, Message, Notification, Request, Response};
pub use version::{negotiate_protocol_version, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
