//! Connection callbacks for a forwarding-only server.
//!
//! [`TunnelHandler`] is what a transport drives for each authenticated
//! connection. It allows `session` channels but no shells, accepts PTY
//! requests so stock clients stay quiet, and hands every forwarding request
//! to its [`ForwardingCoordinator`].

use crate::config::TunnelConfig;
use crate::forwarding::{ForwardingCoordinator, Reaper};
use crate::policy::ForwardPolicyEnforcer;
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use tunnel_core::{
    ChannelKind, ConnectionHandler, Endpoint, IdentifiedChannel, OpenFailure, Transport,
};

/// Written to the session channel in reply to a shell request.
pub const NO_SHELL_MESSAGE: &str =
    "Welcome to our system.\r\nWe're sorry, but shell access is not permitted.\r\n";

/// Per-connection handler.
pub struct TunnelHandler {
    coordinator: ForwardingCoordinator,
    /// Session channel kept open until disconnect.
    session: Mutex<Option<IdentifiedChannel>>,
}

impl TunnelHandler {
    /// Wrap a coordinator built for this connection.
    pub fn new(coordinator: ForwardingCoordinator) -> Self {
        Self {
            coordinator,
            session: Mutex::new(None),
        }
    }

    /// Build a handler whose coordinator uses the settings and policy from
    /// `config`. Pass a shared `reaper` to report finished bridges to it
    /// instead of spawning one for this connection.
    pub fn from_config(
        transport: Arc<dyn Transport>,
        config: &TunnelConfig,
        reaper: Option<Arc<Reaper>>,
    ) -> Self {
        let authorizer = Arc::new(ForwardPolicyEnforcer::new(config.policy()));
        let coordinator = match reaper {
            Some(reaper) => {
                ForwardingCoordinator::with_reaper(transport, authorizer, config.settings(), reaper)
            }
            None => ForwardingCoordinator::new(transport, authorizer, config.settings()),
        };
        Self::new(coordinator)
    }

    /// Forwarding state of this connection.
    pub fn coordinator(&self) -> &ForwardingCoordinator {
        &self.coordinator
    }

    /// Whether a session channel is being held open.
    pub fn has_session(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl ConnectionHandler for TunnelHandler {
    fn check_channel_request(&self, kind: ChannelKind, channel_id: u32) -> Result<(), OpenFailure> {
        match kind {
            ChannelKind::Session => {
                debug!(channel_id, principal = %self.coordinator.principal(), "session channel accepted");
                Ok(())
            }
            other => {
                info!(channel_id, kind = %other, principal = %self.coordinator.principal(), "channel type refused");
                Err(OpenFailure::AdministrativelyProhibited)
            }
        }
    }

    fn on_pty_request(&self, channel_id: u32) -> bool {
        debug!(channel_id, "pty request accepted");
        true
    }

    fn on_shell_request(&self, mut channel: IdentifiedChannel) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let principal = self.coordinator.principal();
            info!(channel_id = channel.id, %principal, "shell requested, refusing");
            if let Err(e) = channel.stream.write_all(NO_SHELL_MESSAGE.as_bytes()).await {
                warn!(channel_id = channel.id, error = %e, "could not write shell refusal");
            }
            let _ = channel.stream.flush().await;
            *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(channel);
            true
        })
    }

    fn on_forward_request<'a>(&'a self, address: &'a str, port: u16) -> BoxFuture<'a, Option<u16>> {
        Box::pin(async move {
            match self.coordinator.request_forward(address, port).await {
                Ok(bound) => Some(bound),
                Err(e) => {
                    info!(address, port, principal = %self.coordinator.principal(), error = %e, "forward request refused");
                    None
                }
            }
        })
    }

    fn on_cancel_forward<'a>(&'a self, address: &'a str, port: u16) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            // Unknown forwards are already logged by the coordinator.
            let _ = self.coordinator.cancel_forward(address, port).await;
        })
    }

    fn on_direct_request<'a>(
        &'a self,
        channel_id: u32,
        origin: &'a Endpoint,
        destination: &'a Endpoint,
    ) -> BoxFuture<'a, Result<(), OpenFailure>> {
        Box::pin(async move {
            self.coordinator
                .request_direct(channel_id, origin, destination)
                .await
                .map_err(|e| {
                    let reason = e.open_failure();
                    info!(channel_id, %destination, %reason, error = %e, "direct request refused");
                    reason
                })
        })
    }

    fn on_disconnect(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!(principal = %self.coordinator.principal(), "connection closed");
            self.coordinator.shutdown().await;
            let session = self
                .session
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            drop(session);
        })
    }
}
