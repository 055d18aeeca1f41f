//! tunnel-core: shared vocabulary for the tunnel server.
//!
//! Provides the error type, the transport and callback traits that connect the
//! forwarding subsystem to an authenticated SSH-style connection, and an
//! in-process loopback transport.

pub mod error;
pub mod memory;
pub mod transport;

// Re-export commonly used items at crate root.
pub use error::{OpenFailure, TunnelError, TunnelResult};
pub use transport::{
    ByteStream, ChannelKind, ConnectionHandler, Endpoint, IdentifiedChannel, Transport,
};
