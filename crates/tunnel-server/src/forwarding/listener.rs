//! Remote forward listeners.
//!
//! A [`ForwardListener`] binds the address/port the peer asked for, and for
//! every inbound TCP connection opens a `forwarded-tcpip` channel on the
//! shared transport and pumps between the two.
//!
//! Each listener runs its accept loop in its own spawned task, stopped via
//! [`ForwardListener::stop`] or by dropping the listener.

use super::dispatcher::ACCEPT_ERROR_BACKOFF;
use super::pump::pump;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunnel_core::{ChannelKind, Endpoint, Transport, TunnelResult};

/// Registry key of a forward: the address the peer asked for and the port
/// actually bound.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardKey {
    pub address: String,
    pub port: u16,
}

impl ForwardKey {
    /// Build a key from the peer's address spelling and a port.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for ForwardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// One bound remote forward and its accept loop.
pub struct ForwardListener {
    /// Requested address with the bound port.
    key: ForwardKey,
    /// What the OS actually bound.
    local_addr: SocketAddr,
    /// Sending or dropping stops the accept loop.
    cancel_tx: Mutex<Option<mpsc::Sender<()>>>,
    /// Accept loop task, taken by [`ForwardListener::stop`].
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ForwardListener {
    /// Bind `address:port` and spawn the accept loop.
    ///
    /// # Arguments
    ///
    /// * `address` - Address as requested by the peer. `""` and `"*"` bind
    ///   all IPv4 interfaces; the key keeps the requested spelling.
    /// * `port` - Requested port, `0` for an OS-assigned one.
    /// * `transport` - Connection on which forwarded channels are opened.
    /// * `chunk_size` - Pump read size.
    /// * `max_connections` - Concurrent pumps allowed for this listener.
    ///
    /// # Errors
    ///
    /// Returns the bind error (address in use, permission denied, ...).
    pub async fn start(
        address: &str,
        port: u16,
        transport: Arc<dyn Transport>,
        chunk_size: usize,
        max_connections: usize,
    ) -> TunnelResult<Self> {
        let bind_target = Endpoint::new(os_bind_host(address), port).connect_target();
        let tcp_listener = match TcpListener::bind(&bind_target).await {
            Ok(l) => l,
            Err(e) => {
                warn!(addr = %bind_target, error = %e, "forward bind failed");
                return Err(e.into());
            }
        };
        let local_addr = tcp_listener.local_addr()?;
        let key = ForwardKey::new(address, local_addr.port());

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let permits = Arc::new(Semaphore::new(max_connections.max(1)));

        info!(forward = %key, bound = %local_addr, "forward listener started");

        let loop_key = key.clone();
        let handle = tokio::spawn(async move {
            Self::accept_loop(tcp_listener, cancel_rx, &loop_key, transport, chunk_size, permits).await;
            debug!(forward = %loop_key, "accept loop ended");
        });

        Ok(Self {
            key,
            local_addr,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Registry key: requested address and bound port.
    pub fn key(&self) -> &ForwardKey {
        &self.key
    }

    /// The port the OS bound.
    pub fn bound_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Socket address the OS bound, e.g. `0.0.0.0:P` for a wildcard request.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the accept loop is still running.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop accepting, close the bound socket and wait for the accept loop to
    /// exit. Idempotent; pumps already running finish on their own.
    pub async fn stop(&self) {
        let cancel_tx = self
            .cancel_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = cancel_tx {
            let _ = tx.try_send(());
            info!(forward = %self.key, "forward listener stopping");
        }

        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(forward = %self.key, error = %e, "accept loop did not exit cleanly");
            }
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        mut cancel_rx: mpsc::Receiver<()>,
        key: &ForwardKey,
        transport: Arc<dyn Transport>,
        chunk_size: usize,
        permits: Arc<Semaphore>,
    ) {
        let destination = Endpoint::new(key.address.clone(), key.port);

        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    debug!(forward = %key, "accept loop cancelled");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let Ok(permit) = permits.clone().try_acquire_owned() else {
                                warn!(forward = %key, %peer, "connection limit reached, dropping inbound connection");
                                continue;
                            };
                            debug!(forward = %key, %peer, "inbound connection accepted");

                            let transport = transport.clone();
                            let destination = destination.clone();
                            tokio::spawn(async move {
                                let _permit = permit;
                                Self::serve_connection(stream, peer, destination, transport, chunk_size).await;
                            });
                        }
                        Err(e) => Self::pause_after_accept_error(key, &e).await,
                    }
                }
            }
        }
    }

    /// Log a failed accept and back off before the next one.
    async fn pause_after_accept_error(key: &ForwardKey, error: &std::io::Error) {
        warn!(forward = %key, %error, "accept failed");
        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
    }

    /// Open the forwarded channel for one inbound connection and pump.
    async fn serve_connection(
        stream: TcpStream,
        peer: SocketAddr,
        destination: Endpoint,
        transport: Arc<dyn Transport>,
        chunk_size: usize,
    ) {
        let origin = Endpoint::from(peer);
        let channel = match transport
            .open_channel(ChannelKind::ForwardedTcpip, &origin, &destination)
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                warn!(%peer, forward = %destination, error = %e, "could not open forwarded channel, dropping connection");
                return;
            }
        };

        let channel_id = channel.id;
        debug!(channel_id, %peer, principal = %transport.principal(), "tunnelling");
        let stats = pump(stream, channel.stream, chunk_size).await;
        debug!(
            channel_id,
            %peer,
            to_peer = stats.a_to_b,
            from_peer = stats.b_to_a,
            end = ?stats.end,
            "tunnel ended"
        );
    }
}

/// Host handed to the OS for binding.
fn os_bind_host(address: &str) -> &str {
    match address {
        "" | "*" => "0.0.0.0",
        other => other,
    }
}
