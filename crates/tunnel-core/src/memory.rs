//! In-process loopback transport.
//!
//! [`pair`] returns the server half ([`MemoryTransport`], handed to the
//! forwarding subsystem) and the remote-peer half ([`MemoryPeer`], driven by
//! tests and the demo). Channels are `tokio::io::duplex` pairs and both halves
//! draw ids from one shared counter.

use crate::error::{OpenFailure, TunnelError, TunnelResult};
use crate::transport::{ChannelKind, ConnectionHandler, Endpoint, IdentifiedChannel, Transport};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Buffer size of each in-memory channel, per direction.
const CHANNEL_BUFFER: usize = 64 * 1024;

/// Depth of the peer → server accept queue.
const ACCEPT_QUEUE: usize = 64;

/// State shared by both halves.
struct Shared {
    principal: String,
    next_id: AtomicU32,
    connected: AtomicBool,
    deny_forwarded: AtomicBool,
}

impl Shared {
    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A server-originated channel as seen by the peer.
#[derive(Debug)]
pub struct ForwardedChannel {
    pub id: u32,
    pub kind: ChannelKind,
    /// Where the forwarded connection came from.
    pub origin: Endpoint,
    /// The forward (address, port) the connection arrived on.
    pub destination: Endpoint,
    pub stream: DuplexStream,
}

/// Server half of a loopback connection.
pub struct MemoryTransport {
    shared: Arc<Shared>,
    incoming: Mutex<mpsc::Receiver<IdentifiedChannel>>,
    forwarded_tx: mpsc::UnboundedSender<ForwardedChannel>,
}

/// Remote-peer half of a loopback connection.
pub struct MemoryPeer {
    shared: Arc<Shared>,
    incoming_tx: Option<mpsc::Sender<IdentifiedChannel>>,
    forwarded_rx: mpsc::UnboundedReceiver<ForwardedChannel>,
}

/// Create a connected transport/peer pair authenticated as `principal`.
pub fn pair(principal: impl Into<String>) -> (Arc<MemoryTransport>, MemoryPeer) {
    let shared = Arc::new(Shared {
        principal: principal.into(),
        next_id: AtomicU32::new(0),
        connected: AtomicBool::new(true),
        deny_forwarded: AtomicBool::new(false),
    });
    let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_QUEUE);
    let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();

    let transport = Arc::new(MemoryTransport {
        shared: shared.clone(),
        incoming: Mutex::new(incoming_rx),
        forwarded_tx,
    });
    let peer = MemoryPeer {
        shared,
        incoming_tx: Some(incoming_tx),
        forwarded_rx,
    };
    (transport, peer)
}

impl Transport for MemoryTransport {
    fn accept_channel(&self, timeout: Duration) -> BoxFuture<'_, TunnelResult<Option<IdentifiedChannel>>> {
        Box::pin(async move {
            let mut incoming = self.incoming.lock().await;
            match tokio::time::timeout(timeout, incoming.recv()).await {
                Ok(Some(channel)) => Ok(Some(channel)),
                Ok(None) => Err(TunnelError::Transport("connection closed".to_string())),
                Err(_) => Ok(None),
            }
        })
    }

    fn open_channel<'a>(
        &'a self,
        kind: ChannelKind,
        origin: &'a Endpoint,
        destination: &'a Endpoint,
    ) -> BoxFuture<'a, TunnelResult<IdentifiedChannel>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(TunnelError::Transport("connection closed".to_string()));
            }
            if self.shared.deny_forwarded.load(Ordering::Relaxed) {
                return Err(TunnelError::ChannelOpen(OpenFailure::AdministrativelyProhibited));
            }

            let id = self.shared.next_id();
            let (local, remote) = tokio::io::duplex(CHANNEL_BUFFER);
            self.forwarded_tx
                .send(ForwardedChannel {
                    id,
                    kind,
                    origin: origin.clone(),
                    destination: destination.clone(),
                    stream: remote,
                })
                .map_err(|_| TunnelError::Transport("peer went away".to_string()))?;

            debug!(channel_id = id, %kind, %origin, %destination, "loopback channel opened");
            Ok(IdentifiedChannel::new(id, local))
        })
    }

    fn principal(&self) -> String {
        self.shared.principal.clone()
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }
}

impl MemoryPeer {
    /// Reserve a channel id for a peer-opened channel.
    pub fn allocate_id(&self) -> u32 {
        self.shared.next_id()
    }

    /// Push the server half of channel `id` into the accept queue and return
    /// the peer half.
    pub async fn deliver(&self, id: u32) -> TunnelResult<DuplexStream> {
        let tx = self
            .incoming_tx
            .as_ref()
            .ok_or_else(|| TunnelError::Transport("connection closed".to_string()))?;
        let (local, remote) = tokio::io::duplex(CHANNEL_BUFFER);
        tx.send(IdentifiedChannel::new(id, remote))
            .await
            .map_err(|_| TunnelError::Transport("server went away".to_string()))?;
        Ok(local)
    }

    /// Run a full `direct-tcpip` open: ask the handler, then deliver the
    /// channel if it agreed.
    pub async fn open_direct(
        &self,
        handler: &dyn ConnectionHandler,
        origin: &Endpoint,
        destination: &Endpoint,
    ) -> TunnelResult<(u32, DuplexStream)> {
        let id = self.allocate_id();
        handler
            .on_direct_request(id, origin, destination)
            .await
            .map_err(TunnelError::ChannelOpen)?;
        let stream = self.deliver(id).await?;
        Ok((id, stream))
    }

    /// Next server-originated channel, or `None` once the server half is gone.
    pub async fn accept_forwarded(&mut self) -> Option<ForwardedChannel> {
        self.forwarded_rx.recv().await
    }

    /// Refuse (or stop refusing) server-originated channels.
    pub fn set_deny_forwarded(&self, deny: bool) {
        self.shared.deny_forwarded.store(deny, Ordering::Relaxed);
    }

    /// Tear the connection down. Pending accepts on the server half fail once
    /// the queue is drained.
    pub fn disconnect(&mut self) {
        self.shared.connected.store(false, Ordering::Relaxed);
        self.incoming_tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_accept_times_out() {
        let (transport, _peer) = pair("alice");
        let result = transport.accept_channel(Duration::from_millis(20)).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_deliver_and_accept() {
        let (transport, peer) = pair("alice");
        let id = peer.allocate_id();
        let mut remote = peer.deliver(id).await.unwrap();

        let mut channel = transport
            .accept_channel(Duration::from_secs(1))
            .await
            .unwrap()
            .expect("channel should be queued");
        assert_eq!(channel.id, id);

        remote.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        channel.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_open_channel_reaches_peer() {
        let (transport, mut peer) = pair("alice");
        let origin = Endpoint::new("10.0.0.7", 50000);
        let destination = Endpoint::new("0.0.0.0", 8080);

        let channel = transport
            .open_channel(ChannelKind::ForwardedTcpip, &origin, &destination)
            .await
            .unwrap();
        let forwarded = peer.accept_forwarded().await.unwrap();
        assert_eq!(forwarded.id, channel.id);
        assert_eq!(forwarded.kind, ChannelKind::ForwardedTcpip);
        assert_eq!(forwarded.origin, origin);
        assert_eq!(forwarded.destination, destination);
    }

    #[tokio::test]
    async fn test_denied_forwarded_channel() {
        let (transport, peer) = pair("alice");
        peer.set_deny_forwarded(true);
        let ep = Endpoint::new("127.0.0.1", 1);
        let result = transport
            .open_channel(ChannelKind::ForwardedTcpip, &ep, &ep)
            .await;
        assert!(matches!(
            result,
            Err(TunnelError::ChannelOpen(OpenFailure::AdministrativelyProhibited))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_fails_accept() {
        let (transport, mut peer) = pair("alice");
        peer.disconnect();
        assert!(!transport.is_connected());
        let result = transport.accept_channel(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TunnelError::Transport(_))));
    }

    #[test]
    fn test_principal() {
        let (transport, _peer) = pair("bob");
        assert_eq!(transport.principal(), "bob");
    }
}
