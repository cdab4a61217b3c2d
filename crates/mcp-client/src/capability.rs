use std::sync::RwLock;

use mcp_protocol::{missing_capability_error, CapabilityGate};
use mcp_types::{ClientCapabilities, McpError, ServerCapabilities};

/// The capability gate a [`crate::client::Client`] hands to its
/// [`mcp_protocol::Protocol`]: the mirror image of
/// `mcp_server::ServerCapabilityGate`. Checks outbound `tools/*`,
/// `prompts/*`, `resources/*` calls against the server's capabilities
/// (learned at `initialize`), and gates registration of the client-hosted
/// handlers (`sampling/createMessage`, `roots/list`, `elicitation/create`)
/// against the capabilities this client was configured to advertise.
pub struct ClientCapabilityGate {
    local: ClientCapabilities,
    remote: RwLock<ServerCapabilities>,
}

impl ClientCapabilityGate {
    pub fn new(local: ClientCapabilities) -> Self {
        Self {
            local,
            remote: RwLock::new(ServerCapabilities::default()),
        }
    }

    /// Records the server's capabilities once negotiated at `initialize`.
    pub fn set_remote(&self, remote: ServerCapabilities) {
        *self.remote.write().expect("remote capability lock poisoned") = remote;
    }
}

impl CapabilityGate for ClientCapabilityGate {
    fn assert_capability_for_method(&self, method: &str) -> Result<(), McpError> {
        let remote = self.remote.read().expect("remote capability lock poisoned");
        match method {
            m if m.starts_with("tools/") && remote.tools.is_none() => {
                Err(missing_capability_error(method, "tools"))
            }
            m if m.starts_with("prompts/") && remote.prompts.is_none() => {
                Err(missing_capability_error(method, "prompts"))
            }
            m if m.starts_with("resources/") && remote.resources.is_none() => {
                Err(missing_capability_error(method, "resources"))
            }
            _ => Ok(()),
        }
    }

    fn assert_notification_capability(&self, _method: &str) -> Result<(), McpError> {
        Ok(())
    }

    fn assert_request_handler_capability(&self, method: &str) -> Result<(), McpError> {
        match method {
            "sampling/createMessage" if self.local.sampling.is_none() => {
                Err(missing_capability_error(method, "sampling"))
            }
            "roots/list" if self.local.roots.is_none() => Err(missing_capability_error(method, "roots")),
            "elicitation/create" if self.local.elicitation.is_none() => {
                Err(missing_capability_error(method, "elicitation"))
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
    fn tools_call_requires_remote_tools_capability() {
        let gate = ClientCapabilityGate::new(ClientCapabilities::default());
        assert!(gate.assert_capability_for_method("tools/call").is_err());

        gate.set_remote(ServerCapabilities {
            tools: Some(ToolsCapability::default()),
            ..Default::default()
        });
        assert!(gate.assert_capability_for_method("tools/call").is_ok());
    }

    #[test]
    fn registering_sampling_handler_requires_local_sampling_capability() {
        let gate = ClientCapabilityGate::new(ClientCapabilities::default());
        assert!(gate.assert_request_handler_capability("sampling/createMessage").is_err());

        let gate = ClientCapabilityGate::new(ClientCapabilities {
            sampling: Some(serde_json::json!({})),
            ..Default::default()
        });
        assert!(gate.assert_request_handler_capability("sampling/createMessage").is_ok());
    }

    #[test]
    fn ping_and_initialize_are_always_allowed() {
        let gate = ClientCapabilityGate::new(ClientCapabilities::default());
        assert!(gate.assert_capability_for_method("ping").is_ok());
        assert!(gate.assert_capability_for_method("initialize").is_ok());
    }
}
