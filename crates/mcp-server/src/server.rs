use std::sync::Arc;

use mcp_protocol::{missing_capability_error, BoxFuture, Protocol};
use mcp_transport::Transport;
use mcp_types::{
    methods, negotiate_protocol_version, Implementation, InitializeParams, InitializeResult,
    McpError, Prompt, Resource, ServerCapabilities, Tool,
};
use serde_json::Value;
use tracing::info;

use crate::capability::ServerCapabilityGate;
use crate::handlers;
use crate::registry::{FeatureRegistry, PromptProviderFn, ResourceReaderFn, ToolHandlerFn};

/// The subscriber identity used for `resources/subscribe`. A `Server` drives
/// exactly one [`Protocol`]/transport pair (the client façade mirrors this:
/// one connection per instance), so there is only ever one peer to
/// correlate subscriptions against.
const PEER_SUBSCRIBER: &str = "peer";

/// The server-side half of an MCP connection (C9): owns the feature
/// registry, installs its request/notification handlers onto a
/// [`Protocol`], and drives the `initialize` handshake.
pub struct Server {
    protocol: Arc<Protocol>,
    registry: Arc<FeatureRegistry>,
    gate: Arc<ServerCapabilityGate>,
    info: Implementation,
    capabilities: ServerCapabilities,
}

impl Server {
    pub fn new(info: Implementation, capabilities: ServerCapabilities) -> Arc<Self> {
        let gate = Arc::new(ServerCapabilityGate::new(capabilities.clone()));
        let protocol = Protocol::new(gate.clone(), true);
        let registry = Arc::new(FeatureRegistry::new());
        let server = Arc::new(Self {
            protocol,
            registry,
            gate,
            info,
            capabilities,
        });
        server.install_handlers();
        server
    }

    pub fn registry(&self) -> &Arc<FeatureRegistry> {
        &self.registry
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

    fn install_handlers(self: &Arc<Self>) {
        let this = self.clone();
        self.protocol
            .on_request(methods::INITIALIZE, Arc::new(move |req, _extra| {
                let this = this.clone();
                Box::pin(async move { this.handle_initialize(req.params).await }) as BoxFuture<Result<Value, McpError>>
            }))
            .expect("initialize is never capability-gated");

        self.protocol.on_notification(
            methods::NOTIFICATIONS_INITIALIZED,
            Arc::new(|_n| Box::pin(async {}) as BoxFuture<()>),
        );

        if self.capabilities.tools.is_some() {
            let registry = self.registry.clone();
            self.protocol
                .on_request(methods::TOOLS_LIST, Arc::new(move |req, _extra| {
                    let registry = registry.clone();
                    Box::pin(async move { handlers::list_tools(&registry, req.params).await })
                        as BoxFuture<Result<Value, McpError>>
                }))
                .expect("tools capability already checked by caller");

            let registry = self.registry.clone();
            self.protocol
                .on_request(methods::TOOLS_CALL, Arc::new(move |req, _extra| {
                    let registry = registry.clone();
                    Box::pin(async move { handlers::call_tool(&registry, req.params).await })
                        as BoxFuture<Result<Value, McpError>>
                }))
                .expect("tools capability already checked by caller");
        }

        if self.capabilities.prompts.is_some() {
            let registry = self.registry.clone();
            self.protocol
                .on_request(methods::PROMPTS_LIST, Arc::new(move |req, _extra| {
                    let registry = registry.clone();
                    Box::pin(async move { handlers::list_prompts(&registry, req.params).await })
                        as BoxFuture<Result<Value, McpError>>
                }))
                .expect("prompts capability already checked by caller");

            let registry = self.registry.clone();
            self.protocol
                .on_request(methods::PROMPTS_GET, Arc::new(move |req, _extra| {
                    let registry = registry.clone();
                    Box::pin(async move { handlers::get_prompt(&registry, req.params).await })
                        as BoxFuture<Result<Value, McpError>>
                }))
                .expect("prompts capability already checked by caller");
        }

        if self.capabilities.resources.is_some() {
            let registry = self.registry.clone();
            self.protocol
                .on_request(methods::RESOURCES_LIST, Arc::new(move |req, _extra| {
                    let registry = registry.clone();
                    Box::pin(async move { handlers::list_resources(&registry, req.params).await })
                        as BoxFuture<Result<Value, McpError>>
                }))
                .expect("resources capability already checked by caller");

            let registry = self.registry.clone();
            self.protocol
                .on_request(methods::RESOURCES_READ, Arc::new(move |req, _extra| {
                    let registry = registry.clone();
                    Box::pin(async move { handlers::read_resource(&registry, req.params).await })
                        as BoxFuture<Result<Value, McpError>>
                }))
                .expect("resources capability already checked by caller");

            self.protocol
                .on_request(methods::RESOURCES_TEMPLATES_LIST, Arc::new(move |req, _extra| {
                    Box::pin(async move { handlers::list_resource_templates(req.params).await })
                        as BoxFuture<Result<Value, McpError>>
                }))
                .expect("resources capability already checked by caller");

            if self
                .capabilities
                .resources
                .as_ref()
                .and_then(|r| r.subscribe)
                .unwrap_or(false)
            {
                let registry = self.registry.clone();
                self.protocol
                    .on_request(methods::RESOURCES_SUBSCRIBE, Arc::new(move |req, _extra| {
                        let registry = registry.clone();
                        Box::pin(async move {
                            handlers::subscribe_resource(&registry, PEER_SUBSCRIBER, req.params).await
                        }) as BoxFuture<Result<Value, McpError>>
                    }))
                    .expect("resources capability already checked by caller");

                let registry = self.registry.clone();
                self.protocol
                    .on_request(methods::RESOURCES_UNSUBSCRIBE, Arc::new(move |req, _extra| {
                        let registry = registry.clone();
                        Box::pin(async move {
                            handlers::unsubscribe_resource(&registry, PEER_SUBSCRIBER, req.params).await
                        }) as BoxFuture<Result<Value, McpError>>
                    }))
                    .expect("resources capability already checked by caller");
            }
        }
    }

    async fn handle_initialize(&self, params: Option<Value>) -> Result<Value, McpError> {
        let params: InitializeParams = params
            .ok_or_else(|| McpError::InvalidParams("missing initialize params".to_string()))
            .and_then(|v| serde_json::from_value(v).map_err(|err| McpError::InvalidParams(err.to_string())))?;

        self.gate.set_remote(params.capabilities.clone());
        let protocol_version = negotiate_protocol_version(&params.protocol_version);

        info!(
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            protocol_version,
            "negotiated MCP handshake"
        );

        let result = InitializeResult {
            protocol_version: protocol_version.to_string(),
            capabilities: self.capabilities.clone(),
            server_info: self.info.clone(),
        };
        serde_json::to_value(result).map_err(|err| McpError::InternalError(err.to_string()))
    }

    /// Registers a tool, requiring the server be configured with the
    /// `tools` capability, then notifies the peer that the tool list
    /// changed.
    pub async fn add_tool(&self, tool: Tool, handler: ToolHandlerFn) -> Result<(), McpError> {
        self.require_tools_capability()?;
        self.registry.add_tool(tool, handler);
        self.notify_list_changed(methods::NOTIFICATIONS_TOOLS_LIST_CHANGED).await;
        Ok(())
    }

    pub async fn add_tools(&self, entries: Vec<(Tool, ToolHandlerFn)>) -> Result<(), McpError> {
        self.require_tools_capability()?;
        self.registry.add_tools(entries);
        self.notify_list_changed(methods::NOTIFICATIONS_TOOLS_LIST_CHANGED).await;
        Ok(())
    }

    pub async fn remove_tool(&self, name: &str) -> Result<(), McpError> {
        self.require_tools_capability()?;
        if self.registry.remove_tool(name).is_some() {
            self.notify_list_changed(methods::NOTIFICATIONS_TOOLS_LIST_CHANGED).await;
        }
        Ok(())
    }

    pub async fn add_prompt(&self, prompt: Prompt, provider: PromptProviderFn) -> Result<(), McpError> {
        self.require_prompts_capability()?;
        self.registry.add_prompt(prompt, provider);
        self.notify_list_changed(methods::NOTIFICATIONS_PROMPTS_LIST_CHANGED).await;
        Ok(())
    }

    pub async fn add_prompts(&self, entries: Vec<(Prompt, PromptProviderFn)>) -> Result<(), McpError> {
        self.require_prompts_capability()?;
        self.registry.add_prompts(entries);
        self.notify_list_changed(methods::NOTIFICATIONS_PROMPTS_LIST_CHANGED).await;
        Ok(())
    }

    pub async fn remove_prompt(&self, name: &str) -> Result<(), McpError> {
        self.require_prompts_capability()?;
        if self.registry.remove_prompt(name).is_some() {
            self.notify_list_changed(methods::NOTIFICATIONS_PROMPTS_LIST_CHANGED).await;
        }
        Ok(())
    }

    pub async fn add_resource(&self, resource: Resource, reader: ResourceReaderFn) -> Result<(), McpError> {
        self.require_resources_capability()?;
        self.registry.add_resource(resource, reader);
        self.notify_list_changed(methods::NOTIFICATIONS_RESOURCES_LIST_CHANGED).await;
        Ok(())
    }

    pub async fn add_resources(&self, entries: Vec<(Resource, ResourceReaderFn)>) -> Result<(), McpError> {
        self.require_resources_capability()?;
        self.registry.add_resources(entries);
        self.notify_list_changed(methods::NOTIFICATIONS_RESOURCES_LIST_CHANGED).await;
        Ok(())
    }

    /// Removes a resource. If it had subscribers, emits exactly one
    /// `notifications/resources/updated { uri }` (this server drives a
    /// single peer connection, so "per subscriber" collapses to "once" on
    /// the wire) in addition to the `list_changed` notification, per spec
    /// §4.9/§8 invariant 8.
    pub async fn remove_resource(&self, uri: &str) -> Result<(), McpError> {
        self.require_resources_capability()?;
        if let Some((_, subscribers)) = self.registry.remove_resource(uri) {
            if !subscribers.is_empty() {
                let _ = self
                    .protocol
                    .notify(
                        methods::NOTIFICATIONS_RESOURCES_UPDATED,
                        Some(serde_json::json!({ "uri": uri })),
                    )
                    .await;
            }
            self.notify_list_changed(methods::NOTIFICATIONS_RESOURCES_LIST_CHANGED).await;
        }
        Ok(())
    }

    fn require_tools_capability(&self) -> Result<(), McpError> {
        if self.capabilities.tools.is_none() {
            return Err(missing_capability_error("add_tool", "tools"));
        }
        Ok(())
    }

    fn require_prompts_capability(&self) -> Result<(), McpError> {
        if self.capabilities.prompts.is_none() {
            return Err(missing_capability_error("add_prompt", "prompts"));
        }
        Ok(())
    }

    fn require_resources_capability(&self) -> Result<(), McpError> {
        if self.capabilities.resources.is_none() {
            return Err(missing_capability_error("add_resource", "resources"));
        }
        Ok(())
    }

    /// Mutations dispatch their `list_changed` notification asynchronously
    /// (spec §4.9): the caller observes the registry mutation immediately
    /// and does not block on delivery.
    async fn notify_list_changed(&self, method: &'static str) {
        let protocol = self.protocol.clone();
        tokio::spawn(async move {
            let _ = protocol.notify(method, None).await;
        });
    }
}
