//! The forwarding coordinator, which the connection callbacks call into.
//!
//! Owns, per connection, the registry of live [`ForwardListener`]s keyed by
//! [`ForwardKey`], the [`ChannelDispatcher`] that routes `direct-tcpip`
//! channels, the list of this connection's [`DirectBridge`]s, and either its
//! own [`Reaper`] or a handle to a shared one.

use super::bridge::DirectBridge;
use super::dispatcher::ChannelDispatcher;
use super::listener::{ForwardKey, ForwardListener};
use super::reaper::Reaper;
use super::ForwardingSettings;
use crate::policy::ForwardAuthorizer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunnel_core::{Endpoint, Transport, TunnelError, TunnelResult};

/// Per-connection forwarding state.
pub struct ForwardingCoordinator {
    transport: Arc<dyn Transport>,
    authorizer: Arc<dyn ForwardAuthorizer>,
    settings: ForwardingSettings,
    /// Live forwards: requested address + bound port to listener.
    forwards: Mutex<HashMap<ForwardKey, ForwardListener>>,
    /// Bridges started by this connection, pruned as they finish.
    bridges: std::sync::Mutex<Vec<Arc<DirectBridge>>>,
    dispatcher: ChannelDispatcher,
    reaper: Arc<Reaper>,
    /// Set when the reaper was spawned by (and dies with) this coordinator.
    owned_reaper: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ForwardingCoordinator {
    /// Create a coordinator with its own reaper task.
    pub fn new(
        transport: Arc<dyn Transport>,
        authorizer: Arc<dyn ForwardAuthorizer>,
        settings: ForwardingSettings,
    ) -> Self {
        let reaper = Arc::new(Reaper::new());
        let handle = reaper.start();
        Self::build(transport, authorizer, settings, reaper, Some(handle))
    }

    /// Create a coordinator that reports finished bridges to a shared,
    /// externally started reaper.
    pub fn with_reaper(
        transport: Arc<dyn Transport>,
        authorizer: Arc<dyn ForwardAuthorizer>,
        settings: ForwardingSettings,
        reaper: Arc<Reaper>,
    ) -> Self {
        Self::build(transport, authorizer, settings, reaper, None)
    }

    fn build(
        transport: Arc<dyn Transport>,
        authorizer: Arc<dyn ForwardAuthorizer>,
        settings: ForwardingSettings,
        reaper: Arc<Reaper>,
        owned_reaper: Option<JoinHandle<()>>,
    ) -> Self {
        let dispatcher =
            ChannelDispatcher::start(transport.clone(), settings.accept_poll, settings.unclaimed_ttl);
        Self {
            transport,
            authorizer,
            settings,
            forwards: Mutex::new(HashMap::new()),
            bridges: std::sync::Mutex::new(Vec::new()),
            dispatcher,
            reaper,
            owned_reaper: std::sync::Mutex::new(owned_reaper),
            closed: AtomicBool::new(false),
        }
    }

    /// Authenticated principal of the underlying connection.
    pub fn principal(&self) -> String {
        self.transport.principal()
    }

    /// Reaper finished bridges are reported to.
    pub fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }

    /// Start a remote forward on `address:port` and return the bound port.
    ///
    /// With `port == 0` the OS picks the port; otherwise the bound port must
    /// equal the requested one. Nothing is registered on failure.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::PermissionDenied`] if the authorizer refuses.
    /// - [`TunnelError::ForwardExists`] if the key is already live.
    /// - [`TunnelError::LimitReached`] at `max_forwards`.
    /// - [`TunnelError::Io`] if binding fails.
    /// - [`TunnelError::PortMismatch`] if the OS bound another port.
    pub async fn request_forward(&self, address: &str, port: u16) -> TunnelResult<u16> {
        let principal = self.transport.principal();
        debug!(address, port, %principal, "forward requested");
        self.ensure_open()?;

        if let Err(reason) = self.authorizer.check_forward(&principal, address, port) {
            info!(address, port, %principal, %reason, "forward request denied");
            return Err(TunnelError::PermissionDenied(reason));
        }

        {
            let forwards = self.forwards.lock().await;
            let key = ForwardKey::new(address, port);
            if port != 0 && forwards.contains_key(&key) {
                warn!(forward = %key, %principal, "forward already registered");
                return Err(TunnelError::ForwardExists(key.to_string()));
            }
            if forwards.len() >= self.settings.max_forwards {
                warn!(%principal, max = self.settings.max_forwards, "forward limit reached");
                return Err(TunnelError::LimitReached(format!(
                    "{} forwards",
                    self.settings.max_forwards
                )));
            }
        }

        let listener = match ForwardListener::start(
            address,
            port,
            self.transport.clone(),
            self.settings.chunk_size,
            self.settings.max_connections_per_forward,
        )
        .await
        {
            Ok(listener) => listener,
            Err(e) => {
                warn!(address, port, %principal, error = %e, "could not start forward");
                return Err(e);
            }
        };

        let bound = listener.bound_port();
        if port != 0 && bound != port {
            listener.stop().await;
            warn!(address, requested = port, bound, %principal, "port mismatch, closing forward");
            return Err(TunnelError::PortMismatch {
                requested: port,
                bound,
            });
        }

        let key = listener.key().clone();
        let mut forwards = self.forwards.lock().await;
        if forwards.contains_key(&key) {
            drop(forwards);
            listener.stop().await;
            warn!(forward = %key, %principal, "forward registered concurrently");
            return Err(TunnelError::ForwardExists(key.to_string()));
        }
        if forwards.len() >= self.settings.max_forwards {
            drop(forwards);
            listener.stop().await;
            warn!(%principal, max = self.settings.max_forwards, "forward limit reached");
            return Err(TunnelError::LimitReached(format!(
                "{} forwards",
                self.settings.max_forwards
            )));
        }
        forwards.insert(key, listener);
        info!(address, port = bound, %principal, "forward opened");
        Ok(bound)
    }

    /// Stop and unregister the forward `address:port`.
    ///
    /// # Errors
    ///
    /// [`TunnelError::ForwardNotFound`] if no such forward is live; the
    /// coordinator is unaffected.
    pub async fn cancel_forward(&self, address: &str, port: u16) -> TunnelResult<()> {
        let principal = self.transport.principal();
        info!(address, port, %principal, "cancel forward requested");

        let key = ForwardKey::new(address, port);
        let listener = self.forwards.lock().await.remove(&key);
        match listener {
            Some(listener) => {
                listener.stop().await;
                info!(forward = %key, %principal, "forward closed");
                Ok(())
            }
            None => {
                warn!(forward = %key, %principal, "could not stop forward: not registered");
                Err(TunnelError::ForwardNotFound(key.to_string()))
            }
        }
    }

    /// Set up a bridge for the `direct-tcpip` channel `channel_id`.
    ///
    /// Connects to `destination` before returning so the peer can be told
    /// the connect failed. On success the bridge is running and will pick up
    /// the channel as soon as the transport delivers it.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::PermissionDenied`] if the authorizer refuses.
    /// - [`TunnelError::LimitReached`] at `max_direct`.
    /// - [`TunnelError::Connect`] if the destination is unreachable.
    pub async fn request_direct(
        &self,
        channel_id: u32,
        origin: &Endpoint,
        destination: &Endpoint,
    ) -> TunnelResult<()> {
        let principal = self.transport.principal();
        self.ensure_open()?;

        if let Err(reason) = self.authorizer.check_direct(&principal, origin, destination) {
            debug!(%origin, %destination, %principal, %reason, "rejected direct connection");
            return Err(TunnelError::PermissionDenied(reason));
        }

        let live = self.active_bridges();
        if live >= self.settings.max_direct {
            warn!(%principal, max = self.settings.max_direct, "direct connection limit reached");
            return Err(TunnelError::LimitReached(format!(
                "{} direct connections",
                self.settings.max_direct
            )));
        }

        debug!(channel_id, %origin, %destination, %principal, "setting up direct connection");
        let channel_rx = self.dispatcher.expect(channel_id);
        let bridge =
            match DirectBridge::connect(channel_id, destination, self.settings.connect_timeout).await {
                Ok(bridge) => bridge,
                Err(e) => {
                    self.dispatcher.forget(channel_id);
                    warn!(channel_id, %origin, %destination, %principal, error = %e, "could not set up direct connection");
                    return Err(e);
                }
            };

        self.reaper.track(bridge.clone());
        self.lock_bridges().push(bridge.clone());
        bridge.start(
            channel_rx,
            self.settings.channel_wait,
            self.settings.chunk_size,
            self.reaper.clone(),
        );
        Ok(())
    }

    /// Keys of the live forwards.
    pub async fn forwards(&self) -> Vec<ForwardKey> {
        self.forwards.lock().await.keys().cloned().collect()
    }

    /// Number of this connection's bridges that are still active.
    pub fn active_bridges(&self) -> usize {
        let mut bridges = self.lock_bridges();
        bridges.retain(|b| b.is_active());
        bridges.len()
    }

    /// Tear down everything this connection started. Idempotent.
    ///
    /// Listeners are stopped and joined. Bridges still waiting for their
    /// channel exit; bridges mid-pump finish when their pump does.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }

        let listeners: Vec<ForwardListener> =
            self.forwards.lock().await.drain().map(|(_, l)| l).collect();
        for listener in &listeners {
            listener.stop().await;
        }

        let bridges = std::mem::take(&mut *self.lock_bridges());
        let owned = self
            .owned_reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if owned.is_some() {
            // Everything the private reaper tracks belongs to this connection.
            self.reaper.shutdown_all().await;
        } else {
            for bridge in &bridges {
                bridge.shutdown(false).await;
            }
        }
        self.dispatcher.stop().await;
        if owned.is_some() {
            self.reaper.close();
        }

        info!(
            forwards = listeners.len(),
            bridges = bridges.len(),
            principal = %self.transport.principal(),
            "forwarding shut down"
        );
    }

    fn ensure_open(&self) -> TunnelResult<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TunnelError::Transport("connection is closing".to_string()));
        }
        Ok(())
    }

    fn lock_bridges(&self) -> MutexGuard<'_, Vec<Arc<DirectBridge>>> {
        self.bridges.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ForwardingCoordinator {
    fn drop(&mut self) {
        let owned = self
            .owned_reaper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if owned.is_some() {
            self.reaper.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AllowAll;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tunnel_core::memory::{self, MemoryPeer};

    const WAIT: Duration = Duration::from_secs(5);

    fn settings() -> ForwardingSettings {
        ForwardingSettings {
            accept_poll: Duration::from_millis(20),
            channel_wait: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            ..ForwardingSettings::default()
        }
    }

    fn coordinator() -> (ForwardingCoordinator, MemoryPeer) {
        let (transport, peer) = memory::pair("alice");
        let coordinator = ForwardingCoordinator::new(transport, Arc::new(AllowAll), settings());
        (coordinator, peer)
    }

    fn free_port() -> u16 {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    }

    /// Echo server answering every read with `prefix` + data.
    async fn echo_server(prefix: &'static [u8]) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ep = Endpoint::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        let mut reply = prefix.to_vec();
                        reply.extend_from_slice(&buf[..n]);
                        if stream.write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        ep
    }

    struct DenyAll;

    impl ForwardAuthorizer for DenyAll {
        fn check_forward(&self, _: &str, _: &str, _: u16) -> Result<(), String> {
            Err("no forwards".to_string())
        }

        fn check_direct(&self, _: &str, _: &Endpoint, _: &Endpoint) -> Result<(), String> {
            Err("no direct".to_string())
        }
    }

    #[tokio::test]
    async fn test_ephemeral_port_is_reported_and_registered() {
        let (coordinator, _peer) = coordinator();
        let port = coordinator.request_forward("127.0.0.1", 0).await.unwrap();
        assert!(port > 0);
        assert_eq!(
            coordinator.forwards().await,
            vec![ForwardKey::new("127.0.0.1", port)]
        );
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_forward_ping_then_cancel() {
        let (coordinator, mut peer) = coordinator();
        let port = coordinator.request_forward("0.0.0.0", 0).await.unwrap();
        assert!(port > 0);

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut forwarded = timeout(WAIT, peer.accept_forwarded()).await.unwrap().unwrap();
        assert_eq!(forwarded.destination, Endpoint::new("0.0.0.0", port));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(WAIT, forwarded.stream.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        let mut rest = Vec::new();
        timeout(WAIT, forwarded.stream.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());

        coordinator.cancel_forward("0.0.0.0", port).await.unwrap();
        assert!(TcpListener::bind(("0.0.0.0", port)).await.is_ok());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_explicit_port_is_honoured() {
        let (coordinator, _peer) = coordinator();
        let wanted = free_port();
        let port = coordinator.request_forward("127.0.0.1", wanted).await.unwrap();
        assert_eq!(port, wanted);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_other_forwards_alive() {
        let (coordinator, mut peer) = coordinator();
        let live = coordinator.request_forward("127.0.0.1", 0).await.unwrap();

        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        assert!(coordinator.request_forward("127.0.0.1", taken_port).await.is_err());
        assert_eq!(coordinator.forwards().await.len(), 1);

        let _client = TcpStream::connect(("127.0.0.1", live)).await.unwrap();
        let forwarded = timeout(WAIT, peer.accept_forwarded()).await.unwrap().unwrap();
        assert_eq!(forwarded.destination, Endpoint::new("127.0.0.1", live));

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_unknown_forward_is_recoverable() {
        let (coordinator, _peer) = coordinator();
        let result = coordinator.cancel_forward("127.0.0.1", 1).await;
        assert!(matches!(result, Err(TunnelError::ForwardNotFound(_))));

        // Still usable afterwards.
        assert!(coordinator.request_forward("127.0.0.1", 0).await.is_ok());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_releases_port() {
        let (coordinator, _peer) = coordinator();
        let port = coordinator.request_forward("127.0.0.1", 0).await.unwrap();

        coordinator.cancel_forward("127.0.0.1", port).await.unwrap();
        assert!(coordinator.forwards().await.is_empty());
        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());

        let again = coordinator.cancel_forward("127.0.0.1", port).await;
        assert!(matches!(again, Err(TunnelError::ForwardNotFound(_))));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let (coordinator, _peer) = coordinator();
        let port = coordinator.request_forward("127.0.0.1", 0).await.unwrap();
        let result = coordinator.request_forward("127.0.0.1", port).await;
        assert!(matches!(result, Err(TunnelError::ForwardExists(_))));
        assert_eq!(coordinator.forwards().await.len(), 1);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_forward_limit() {
        let (transport, _peer) = memory::pair("alice");
        let coordinator = ForwardingCoordinator::new(
            transport,
            Arc::new(AllowAll),
            ForwardingSettings {
                max_forwards: 1,
                ..settings()
            },
        );
        coordinator.request_forward("127.0.0.1", 0).await.unwrap();
        let result = coordinator.request_forward("127.0.0.1", 0).await;
        assert!(matches!(result, Err(TunnelError::LimitReached(_))));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_forward_limit_holds_under_concurrency() {
        let (transport, _peer) = memory::pair("alice");
        let coordinator = ForwardingCoordinator::new(
            transport,
            Arc::new(AllowAll),
            ForwardingSettings {
                max_forwards: 1,
                ..settings()
            },
        );

        let results = tokio::join!(
            coordinator.request_forward("127.0.0.1", 0),
            coordinator.request_forward("127.0.0.1", 0),
            coordinator.request_forward("127.0.0.1", 0),
            coordinator.request_forward("127.0.0.1", 0),
        );
        let results = [results.0, results.1, results.2, results.3];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, TunnelError::LimitReached(_))));
        assert_eq!(coordinator.forwards().await.len(), 1);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_authorizer_denies() {
        let (transport, _peer) = memory::pair("mallory");
        let coordinator = ForwardingCoordinator::new(transport, Arc::new(DenyAll), settings());
        let forward = coordinator.request_forward("127.0.0.1", 0).await;
        assert!(matches!(forward, Err(TunnelError::PermissionDenied(_))));

        let dest = echo_server(b"").await;
        let direct = coordinator
            .request_direct(1, &Endpoint::new("10.0.0.1", 5000), &dest)
            .await;
        assert!(matches!(direct, Err(TunnelError::PermissionDenied(_))));
        assert!(coordinator.forwards().await.is_empty());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_direct_round_trip_and_reap() {
        let (coordinator, peer) = coordinator();
        let dest = echo_server(b"echo:").await;
        let origin = Endpoint::new("10.0.0.1", 5000);

        let id = peer.allocate_id();
        coordinator.request_direct(id, &origin, &dest).await.unwrap();
        assert_eq!(coordinator.active_bridges(), 1);

        let mut stream = peer.deliver(id).await.unwrap();
        stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 7];
        timeout(WAIT, stream.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"echo:hi");

        drop(stream);
        timeout(WAIT, async {
            while coordinator.reaper().tracked() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("finished bridge should be reaped");
        assert_eq!(coordinator.active_bridges(), 0);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_directs_get_their_own_channels() {
        let (coordinator, peer) = coordinator();
        let origin = Endpoint::new("10.0.0.1", 5000);
        let dest_a = echo_server(b"A").await;
        let dest_b = echo_server(b"B").await;

        let id_a = peer.allocate_id();
        let id_b = peer.allocate_id();
        coordinator.request_direct(id_a, &origin, &dest_a).await.unwrap();
        coordinator.request_direct(id_b, &origin, &dest_b).await.unwrap();

        // Delivered in reverse order of the requests.
        let mut stream_b = peer.deliver(id_b).await.unwrap();
        let mut stream_a = peer.deliver(id_a).await.unwrap();

        stream_a.write_all(b"1").await.unwrap();
        stream_b.write_all(b"2").await.unwrap();
        let mut buf = [0u8; 2];
        timeout(WAIT, stream_a.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"A1");
        timeout(WAIT, stream_b.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"B2");

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_timed_out_bridges_release_their_waiters() {
        let (transport, peer) = memory::pair("alice");
        let coordinator = ForwardingCoordinator::new(
            transport,
            Arc::new(AllowAll),
            ForwardingSettings {
                channel_wait: Duration::from_millis(50),
                ..settings()
            },
        );
        let dest = echo_server(b"").await;
        let origin = Endpoint::new("10.0.0.1", 5000);
        for _ in 0..5 {
            coordinator
                .request_direct(peer.allocate_id(), &origin, &dest)
                .await
                .unwrap();
        }

        timeout(WAIT, async {
            while coordinator.active_bridges() > 0 || coordinator.dispatcher.waiting() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed-out bridges should leave no waiters behind");
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_direct_connect_failure() {
        let (coordinator, peer) = coordinator();
        let closed = Endpoint::new("127.0.0.1", free_port());
        let id = peer.allocate_id();
        let result = coordinator
            .request_direct(id, &Endpoint::new("10.0.0.1", 5000), &closed)
            .await;
        assert!(matches!(result, Err(TunnelError::Connect(_))));
        assert_eq!(coordinator.dispatcher.waiting(), 0);
        assert_eq!(coordinator.active_bridges(), 0);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (coordinator, peer) = coordinator();
        let port = coordinator.request_forward("127.0.0.1", 0).await.unwrap();
        let dest = echo_server(b"").await;
        coordinator
            .request_direct(peer.allocate_id(), &Endpoint::new("10.0.0.1", 5000), &dest)
            .await
            .unwrap();

        timeout(WAIT, coordinator.shutdown()).await.unwrap();
        timeout(WAIT, coordinator.shutdown()).await.unwrap();

        assert!(coordinator.forwards().await.is_empty());
        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
        assert!(!coordinator.dispatcher.is_running());
        assert!(coordinator.request_forward("127.0.0.1", 0).await.is_err());
    }

    #[tokio::test]
    async fn test_shared_reaper_survives_coordinator() {
        let reaper = Arc::new(Reaper::new());
        let handle = reaper.start();
        let (transport, _peer) = memory::pair("alice");
        let coordinator = ForwardingCoordinator::with_reaper(
            transport,
            Arc::new(AllowAll),
            settings(),
            reaper.clone(),
        );
        coordinator.shutdown().await;
        drop(coordinator);
        assert!(!handle.is_finished());

        reaper.close();
        timeout(WAIT, handle).await.unwrap().unwrap();
    }
}
