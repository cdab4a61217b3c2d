#![forbid(unsafe_code)]
//! Typed client façade for the Model Context Protocol (C10): drives the
//! `initialize` handshake over one [`mcp_protocol::Protocol`], exposes typed
//! wrappers around every server method, and gates server-initiated request
//! handlers against the capabilities this client advertised.

mod capability;
mod client;

pub use capability::ClientCapabilityGate;
pub use client::{Client, ClientRequestExtra, ServerState};
