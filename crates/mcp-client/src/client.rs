use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use mcp_protocol::{NotificationHandlerFn, Protocol, RequestExtra, RequestHandlerFn, RequestOptions};
use mcp_transport::Transport;
use mcp_types::{
    methods, CallToolParams, CallToolResult, ClientCapabilities, GetPromptParams, GetPromptResult,
    Implementation, InitializeParams, InitializeResult, ListPromptsResult, ListResourcesResult,
    ListToolsResult, McpError, ReadResourceParams, ReadResourceResult, ServerCapabilities,
};
use serde_json::Value;

use crate::capability::ClientCapabilityGate;

/// Result of the `initialize` handshake as recorded by the client: the
/// server's advertised capabilities and implementation info, kept around so
/// callers can inspect what the peer supports without re-issuing the
/// handshake.
#[derive(Clone, Debug, Default)]
pub struct ServerState {
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    pub server_info: Option<Implementation>,
}

/// The client-side half of an MCP connection (C10): drives the
/// `initialize` handshake, exposes typed wrappers around every server
/// method, and lets callers register handlers for server-initiated
/// requests and hooks for arbitrary notifications.
pub struct Client {
    protocol: Arc<Protocol>,
    gate: Arc<ClientCapabilityGate>,
    info: Implementation,
    local_capabilities: ClientCapabilities,
    server_state: StdRwLock<Option<ServerState>>,
}

impl Client {
    pub fn new(info: Implementation, capabilities: ClientCapabilities) -> Arc<Self> {
        let gate = Arc::new(ClientCapabilityGate::new(capabilities.clone()));
        let protocol = Protocol::new(gate.clone(), true);
        Arc::new(Self {
            protocol,
            gate,
            info,
            local_capabilities: capabilities,
            server_state: StdRwLock::new(None),
        })
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    pub async fn connect(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<(), McpError> {
        self.protocol.connect(transport).await
    }

    pub async fn close(&self) -> Result<(), McpError> {
        self.protocol.close().await
    }

    /// Drives the `initialize` handshake: sends `initialize` with this
    /// client's info and capabilities, records the negotiated protocol
    /// version and the server's capabilities, then sends
    /// `notifications/initialized`. Strict capability checks on subsequent
    /// calls see the server's capabilities from this point on.
    pub async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let params = InitializeParams {
            protocol_version: mcp_types::LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.local_capabilities.clone(),
            client_info: self.info.clone(),
        };
        let result: InitializeResult = self
            .protocol
            .request(methods::INITIALIZE, Some(params), RequestOptions::default())
            .await?;

        self.gate.set_remote(result.capabilities.clone());
        *self.server_state.write().expect("server state lock poisoned") = Some(ServerState {
            protocol_version: result.protocol_version.clone(),
            capabilities: result.capabilities.clone(),
            server_info: Some(result.server_info.clone()),
        });

        self.protocol.notify(methods::NOTIFICATIONS_INITIALIZED, None).await?;
        Ok(result)
    }

    /// The server's capabilities and version, as recorded by the most
    /// recent successful [`Client::initialize`] call. `None` before the
    /// handshake completes.
    pub fn server_state(&self) -> Option<ServerState> {
        self.server_state.read().expect("server state lock poisoned").clone()
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        let _: Value = self
            .protocol
            .request::<(), Value>(methods::PING, None, RequestOptions::default())
            .await?;
        Ok(())
    }

    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult, McpError> {
        let params = cursor.map(|cursor| serde_json::json!({ "cursor": cursor }));
        self.protocol
            .request(methods::TOOLS_LIST, params, RequestOptions::default())
            .await
    }

    pub async fn call_tool(&self, name: impl Into<String>, arguments: Value) -> Result<CallToolResult, McpError> {
        let params = CallToolParams {
            name: name.into(),
            arguments,
        };
        self.protocol
            .request(methods::TOOLS_CALL, Some(params), RequestOptions::default())
            .await
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult, McpError> {
        let params = cursor.map(|cursor| serde_json::json!({ "cursor": cursor }));
        self.protocol
            .request(methods::PROMPTS_LIST, params, RequestOptions::default())
            .await
    }

    pub async fn get_prompt(
        &self,
        name: impl Into<String>,
        arguments: Option<Value>,
    ) -> Result<GetPromptResult, McpError> {
        let params = GetPromptParams {
            name: name.into(),
            arguments,
        };
        self.protocol
            .request(methods::PROMPTS_GET, Some(params), RequestOptions::default())
            .await
    }

    pub async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResult, McpError> {
        let params = cursor.map(|cursor| serde_json::json!({ "cursor": cursor }));
        self.protocol
            .request(methods::RESOURCES_LIST, params, RequestOptions::default())
            .await
    }

    pub async fn read_resource(&self, uri: impl Into<String>) -> Result<ReadResourceResult, McpError> {
        let params = ReadResourceParams { uri: uri.into() };
        self.protocol
            .request(methods::RESOURCES_READ, Some(params), RequestOptions::default())
            .await
    }

    pub async fn subscribe_resource(&self, uri: impl Into<String>) -> Result<(), McpError> {
        let params = serde_json::json!({ "uri": uri.into() });
        let _: Value = self
            .protocol
            .request(methods::RESOURCES_SUBSCRIBE, Some(params), RequestOptions::default())
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, uri: impl Into<String>) -> Result<(), McpError> {
        let params = serde_json::json!({ "uri": uri.into() });
        let _: Value = self
            .protocol
            .request(methods::RESOURCES_UNSUBSCRIBE, Some(params), RequestOptions::default())
            .await?;
        Ok(())
    }

    /// Registers a hook invoked whenever the peer sends a notification for
    /// `method` (e.g. `notifications/resources/updated`,
    /// `notifications/tools/list_changed`).
    pub fn on_notification(&self, method: impl Into<String>, handler: NotificationHandlerFn) {
        self.protocol.on_notification(method, handler);
    }

    /// Registers a handler for a server-initiated request (`sampling/createMessage`,
    /// `roots/list`, `elicitation/create`). Fails if this client was not
    /// configured with the corresponding capability.
    pub fn on_request(&self, method: impl Into<String>, handler: RequestHandlerFn) -> Result<(), McpError> {
        self.protocol.on_request(method, handler)
    }
}

/// Convenience re-export so downstream handler closures registered via
/// [`Client::on_request`] can name the extra-context type without reaching
/// into `mcp_protocol` directly.
pub type ClientRequestExtra = RequestExtra;
