//! Forwarding lifecycle: remote forward listeners, direct-tcpip bridges, and
//! the workers that keep them running.
//!
//! # Submodule Architecture
//!
//! - **[`pump`]**: [`pump::pump`] copies bytes both ways between two streams
//!   until either side closes, then closes both.
//! - **[`reaper`]**: the [`Reaper`] tracks finished-or-running workers and
//!   retires the inactive ones each time it is signalled.
//! - **[`dispatcher`]**: the [`ChannelDispatcher`] owns the transport's
//!   accept call and hands each peer-opened channel to the bridge waiting for
//!   its id.
//! - **[`listener`]**: a [`ForwardListener`] binds one forwarded
//!   address/port and turns every inbound TCP connection into a
//!   `forwarded-tcpip` channel.
//! - **[`bridge`]**: a [`DirectBridge`] connects out for one `direct-tcpip`
//!   request and pumps once its channel arrives.
//! - **[`coordinator`]**: the [`ForwardingCoordinator`] is what the
//!   connection callbacks call into. It owns the forward registry, the
//!   dispatcher and (optionally) the reaper.
//!
//! # Data Flow
//!
//! ```text
//! tcpip-forward
//!   → ForwardingCoordinator::request_forward
//!     → ForwardAuthorizer::check_forward
//!     → ForwardListener::start → accept loop
//!         → Transport::open_channel(forwarded-tcpip) → pump
//!
//! direct-tcpip
//!   → ForwardingCoordinator::request_direct
//!     → ForwardAuthorizer::check_direct
//!     → ChannelDispatcher::expect(channel_id)
//!     → DirectBridge::connect → Reaper::track → DirectBridge::start
//!         → (dispatcher routes channel) → pump → Reaper::signal
//! ```

pub mod bridge;
pub mod coordinator;
pub mod dispatcher;
pub mod listener;
pub mod pump;
pub mod reaper;

pub use bridge::DirectBridge;
pub use coordinator::ForwardingCoordinator;
pub use dispatcher::ChannelDispatcher;
pub use listener::{ForwardKey, ForwardListener};
pub use reaper::{Reaper, Worker};

use std::time::Duration;

/// Runtime knobs for one connection's forwarding subsystem.
#[derive(Debug, Clone)]
pub struct ForwardingSettings {
    /// Read size used by the pump.
    pub chunk_size: usize,
    /// Timeout passed to each `Transport::accept_channel` call.
    pub accept_poll: Duration,
    /// How long a bridge waits for its channel before giving up.
    pub channel_wait: Duration,
    /// Outbound connect timeout for bridges.
    pub connect_timeout: Duration,
    /// How long the dispatcher keeps a channel nobody is waiting for yet.
    pub unclaimed_ttl: Duration,
    /// Maximum live forward listeners.
    pub max_forwards: usize,
    /// Maximum tracked bridges.
    pub max_direct: usize,
    /// Maximum concurrent pumps per forward listener.
    pub max_connections_per_forward: usize,
}

impl Default for ForwardingSettings {
    fn default() -> Self {
        Self {
            chunk_size: pump::DEFAULT_CHUNK_SIZE,
            accept_poll: Duration::from_secs(10),
            channel_wait: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            unclaimed_ttl: Duration::from_secs(30),
            max_forwards: 64,
            max_direct: 256,
            max_connections_per_forward: 128,
        }
    }
}
