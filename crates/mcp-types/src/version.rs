/// Newest protocol version this runtime speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// All protocol versions this runtime understands, oldest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Negotiates a protocol version for a handshake: the client's requested
/// version if supported, otherwise [`LATEST_PROTOCOL_VERSION`].
pub fn negotiate_protocol_version(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|&&v| v == requested)
        .copied()
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiates_known_version() {
        assert_eq!(negotiate_protocol_version("2024-11-05"), "2024-11-05");
    }

    #[test]
    fn falls_back_to_latest_for_unknown_version() {
        assert_eq!(negotiate_protocol_version("1999-01-01"), LATEST_PROTOCOL_VERSION);
    }
}
