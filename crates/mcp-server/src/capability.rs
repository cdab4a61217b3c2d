use std::sync::RwLock;

use mcp_protocol::{missing_capability_error, CapabilityGate};
use mcp_types::{ClientCapabilities, McpError, ServerCapabilities};

/// The capability gate a [`crate::server::Server`] hands to its
/// [`mcp_protocol::Protocol`]. Checks local capabilities (the ones this
/// server was configured with) against the method-to-capability table in
/// spec §4.8, and remote capabilities (the client's, learned at
/// `initialize`) for the handful of server-initiated methods.
pub struct ServerCapabilityGate {
    local: ServerCapabilities,
    remote: RwLock<ClientCapabilities>,
}

impl ServerCapabilityGate {
    pub fn new(local: ServerCapabilities) -> Self {
        Self {
            local,
            remote: RwLock::new(ClientCapabilities::default()),
        }
    }

    /// Records the client's capabilities once negotiated at `initialize`.
    pub fn set_remote(&self, remote: ClientCapabilities) {
        *self.remote.write().expect("remote capability lock poisoned") = remote;
    }
}

impl CapabilityGate for ServerCapabilityGate {
    fn assert_capability_for_method(&self, method: &str) -> Result<(), McpError> {
        let remote = self.remote.read().expect("remote capability lock poisoned");
        match method {
            "sampling/createMessage" if remote.sampling.is_none() => {
                Err(missing_capability_error(method, "sampling"))
            }
            "roots/list" if remote.roots.is_none() => Err(missing_capability_error(method, "roots")),
            "elicitation/create" if remote.elicitation.is_none() => {
                Err(missing_capability_error(method, "elicitation"))
            }
            _ => Ok(()),
        }
    }

    fn assert_notification_capability(&self, method: &str) -> Result<(), McpError> {
        match method {
            m if m.starts_with("notifications/tools/") && self.local.tools.is_none() => {
                Err(missing_capability_error(method, "tools"))
            }
            m if m.starts_with("notifications/prompts/") && self.local.prompts.is_none() => {
                Err(missing_capability_error(method, "prompts"))
            }
            m if m.starts_with("notifications/resources/") && self.local.resources.is_none() => {
                Err(missing_capability_error(method, "resources"))
            }
            _ => Ok(()),
        }
    }

    fn assert_request_handler_capability(&self, method: &str) -> Result<(), McpError> {
        match method {
            m if m.starts_with("tools/") && self.local.tools.is_none() => {
                Err(missing_capability_error(method, "tools"))
            }
            m if m.starts_with("prompts/") && self.local.prompts.is_none() => {
                Err(missing_capability_error(method, "prompts"))
            }
            m if m.starts_with("resources/") && self.local.resources.is_none() => {
                Err(missing_capability_error(method, "resources"))
            }
            m if m.starts_with("logging/") && self.local.logging.is_none() => {
                Err(missing_capability_error(method, "logging"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_types::ToolsCapability;

    #[test]
    fn registering_tool_handler_requires_tools_capability() {
        let gate = ServerCapabilityGate::new(ServerCapabilities::default());
        assert!(gate.assert_request_handler_capability("tools/call").is_err());

        let gate = ServerCapabilityGate::new(ServerCapabilities {
            tools: Some(ToolsCapability::default()),
            ..Default::default()
        });
        assert!(gate.assert_request_handler_capability("tools/call").is_ok());
    }

    #[test]
    fn outbound_sampling_request_requires_remote_capability() {
        let gate = ServerCapabilityGate::new(ServerCapabilities::default());
        assert!(gate.assert_capability_for_method("sampling/createMessage").is_err());

        gate.set_remote(ClientCapabilities {
            sampling: Some(serde_json::json!({})),
            ..Default::default()
        });
        assert!(gate.assert_capability_for_method("sampling/createMessage").is_ok());
    }

    #[test]
    fn ping_and_initialize_are_always_allowed() {
        let gate = ServerCapabilityGate::new(ServerCapabilities::default());
        assert!(gate.assert_capability_for_method("ping").is_ok());
        assert!(gate.assert_capability_for_method("initialize").is_ok());
    }
}
