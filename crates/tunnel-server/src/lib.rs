//! tunnel-server: server-side port forwarding for SSH-style connections.
//!
//! Given an authenticated connection that exposes channel multiplexing (the
//! [`tunnel_core::Transport`]), lets the peer listen on server ports and
//! receive inbound TCP connections as channels (remote forwards), and bridges
//! peer-opened `direct-tcpip` channels to outbound TCP connections.

pub mod config;
pub mod forwarding;
pub mod policy;
pub mod session;

pub use config::TunnelConfig;
pub use forwarding::{ForwardKey, ForwardingCoordinator, ForwardingSettings, Reaper};
pub use policy::{AllowAll, ForwardAuthorizer, ForwardPolicy, ForwardPolicyEnforcer};
pub use session::TunnelHandler;
