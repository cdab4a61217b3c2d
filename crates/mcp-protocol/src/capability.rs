use mcp_types::McpError;

/// The three abstract hooks spec §4.8 defines for capability gating. A
/// `Protocol` holds one implementation of this trait and consults it:
///
/// - before sending an outbound request, when `enforce_strict_capabilities`
///   is set (`assert_capability_for_method`, checked against the *remote*
///   peer's advertised capabilities)
/// - when registering a local request handler
///   (`assert_request_handler_capability`, checked against *local*
///   capabilities)
/// - before sending an outbound notification
///   (`assert_notification_capability`, checked against *local*
///   capabilities)
///
/// Client and server façades supply their own implementations backed by
/// whatever capability record they negotiated at `initialize`; this crate
/// only defines the contract and the required-capability table.
pub trait CapabilityGate: Send + Sync {
    fn assert_capability_for_method(&self, method: &str) -> Result<(), McpError>;
    fn assert_notification_capability(&self, method: &str) -> Result<(), McpError>;
    fn assert_request_handler_capability(&self, method: &str) -> Result<(), McpError>;
}

/// A gate that never objects. Suitable before initialization completes, or
/// for embedders that don't need strict enforcement.
pub struct PermissiveGate;

impl CapabilityGate for PermissiveGate {
    fn assert_capability_for_method(&self, _method: &str) -> Result<(), McpError> {
        Ok(())
    }

    fn assert_notification_capability(&self, _method: &str) -> Result<(), McpError> {
        Ok(())
    }

    fn assert_request_handler_capability(&self, _method: &str) -> Result<(), McpError> {
        Ok(())
    }
}

/// Builds the deterministic "method X requires capability Y" message the
/// spec's testable property #9 requires: naming the method and capability
/// without touching the transport.
pub fn missing_capability_error(method: &str, capability: &str) -> McpError {
    McpError::InvalidRequest(format!(
        "method {method} requires capability {capability}, which is not advertised"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_gate_allows_everything() {
        let gate = PermissiveGate;
        assert!(gate.assert_capability_for_method("tools/call").is_ok());
        assert!(gate.assert_notification_capability("notifications/progress").is_ok());
        assert!(gate.assert_request_handler_capability("tools/list").is_ok());
    }

    #[test]
    fn missing_capability_error_names_method_and_capability() {
        let err = missing_capability_error("tools/call", "tools");
        assert!(err.to_string().contains("tools/call"));
        assert!(err.to_string().contains("tools"));
    }
}
