#![forbid(unsafe_code)]
//! Pluggable transports for the Model Context Protocol: stdio pipe framing,
//! legacy SSE long-polling, and Streamable-HTTP with resumable event
//! sequencing. All three implement the shared [`Transport`] capability set
//! on top of the common [`lifecycle::Lifecycle`] state machine.

mod event_store;
mod lifecycle;
mod read_buffer;
#[cfg(feature = "sse")]
mod sse;
#[cfg(feature = "stdio")]
mod stdio;
#[cfg(feature = "http")]
mod streamable_http;
mod transport;

pub use event_store::{EventId, EventStore, InMemoryEventStore, StoredEvent};
pub use lifecycle::{Lifecycle, State};
pub use read_buffer::ReadBuffer;
#[cfg(feature = "sse")]
pub use sse::{SseClientTransport, SseServerTransport};
#[cfg(feature = "stdio")]
pub use stdio::{StderrClass, StderrClassifier, StdioTransport, StdioTransportConfig};
#[cfg(feature = "http")]
pub use streamable_http::{streamable_http_router, StreamableHttpConfig, StreamableHttpServer};
pub use transport::{CloseCallback, ErrorCallback, MessageCallback, SendOptions, Transport};
