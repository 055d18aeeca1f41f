//! `direct-tcpip` bridges.
//!
//! A [`DirectBridge`] connects to the requested destination while the
//! channel-open request is still pending, so an unreachable destination can be
//! refused. Once started it waits for its channel (routed by the
//! [`super::ChannelDispatcher`]), pumps until either side closes, marks
//! itself inactive and signals the [`Reaper`].

use super::pump::pump;
use super::reaper::{next_worker_id, Reaper, Worker};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tunnel_core::{Endpoint, IdentifiedChannel, TunnelError, TunnelResult};

/// Lifecycle of a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connected,
    WaitingForChannel,
    Bridging,
    Done,
}

/// One pending or running `direct-tcpip` bridge.
pub struct DirectBridge {
    /// Reaper worker id.
    id: u64,
    channel_id: u32,
    destination: Endpoint,
    /// Cleared when the task finishes or on shutdown.
    active: AtomicBool,
    state: Mutex<BridgeState>,
    /// Wakes the task while it waits for its channel.
    stop: Notify,
    /// Outbound socket, taken by [`DirectBridge::start`].
    socket: Mutex<Option<TcpStream>>,
    /// Set by [`DirectBridge::start`], taken by a joining shutdown.
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DirectBridge {
    /// Open the outbound connection for channel `channel_id`.
    ///
    /// # Errors
    ///
    /// [`TunnelError::Connect`] if `destination` cannot be reached within
    /// `connect_timeout`.
    pub async fn connect(
        channel_id: u32,
        destination: &Endpoint,
        connect_timeout: Duration,
    ) -> TunnelResult<Arc<Self>> {
        let target = destination.connect_target();
        let socket = match tokio::time::timeout(connect_timeout, TcpStream::connect(&target)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return Err(TunnelError::Connect(format!("{target}: {e}"))),
            Err(_) => return Err(TunnelError::Connect(format!("{target}: timed out"))),
        };
        debug!(channel_id, %destination, "bridge connected");

        Ok(Arc::new(Self {
            id: next_worker_id(),
            channel_id,
            destination: destination.clone(),
            active: AtomicBool::new(true),
            state: Mutex::new(BridgeState::Connected),
            stop: Notify::new(),
            socket: Mutex::new(Some(socket)),
            handle: Mutex::new(None),
        }))
    }

    /// Spawn the bridge task.
    ///
    /// # Arguments
    ///
    /// * `channel_rx` - Receives the channel once the dispatcher routes it.
    /// * `channel_wait` - Give up if the channel has not arrived by then.
    /// * `chunk_size` - Pump read size.
    /// * `reaper` - Signalled when the bridge finishes.
    pub fn start(
        self: &Arc<Self>,
        channel_rx: oneshot::Receiver<IdentifiedChannel>,
        channel_wait: Duration,
        chunk_size: usize,
        reaper: Arc<Reaper>,
    ) {
        let Some(socket) = self.socket.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            warn!(channel_id = self.channel_id, "bridge already started");
            return;
        };

        let bridge = self.clone();
        let handle = tokio::spawn(async move {
            bridge.run(socket, channel_rx, channel_wait, chunk_size).await;
            reaper.signal();
        });
        *self.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Id of the `direct-tcpip` channel this bridge serves.
    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    /// Where the outbound connection goes.
    pub fn destination(&self) -> &Endpoint {
        &self.destination
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BridgeState {
        *self.lock_state()
    }

    /// `false` once the bridge has finished or been told to stop.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Mark the bridge inactive and, if `join`, wait for its task.
    ///
    /// A bridge that is already pumping is not interrupted: the task ends
    /// when the pump does, and a joining caller blocks until then.
    pub async fn shutdown(&self, join: bool) {
        if self.active.swap(false, Ordering::Relaxed) {
            debug!(channel_id = self.channel_id, "shutting down bridge");
        }
        self.stop.notify_one();

        if join {
            let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    warn!(channel_id = self.channel_id, error = %e, "bridge task did not exit cleanly");
                }
            }
        }
    }

    async fn run(
        &self,
        socket: TcpStream,
        channel_rx: oneshot::Receiver<IdentifiedChannel>,
        channel_wait: Duration,
        chunk_size: usize,
    ) {
        let channel_id = self.channel_id;
        self.set_state(BridgeState::WaitingForChannel);

        let channel = tokio::select! {
            _ = self.stop.notified() => {
                debug!(channel_id, "bridge stopped before its channel arrived");
                None
            }
            result = tokio::time::timeout(channel_wait, channel_rx) => match result {
                Ok(Ok(channel)) => Some(channel),
                Ok(Err(_)) => {
                    warn!(channel_id, "channel dispatcher went away");
                    None
                }
                Err(_) => {
                    warn!(channel_id, wait_secs = channel_wait.as_secs(), "gave up waiting for channel");
                    None
                }
            },
        };

        match channel {
            Some(channel) if self.is_active() => {
                self.set_state(BridgeState::Bridging);
                let peer = socket.peer_addr().ok();
                debug!(channel_id, destination = %self.destination, ?peer, "tunnelling");
                let stats = pump(socket, channel.stream, chunk_size).await;
                debug!(
                    channel_id,
                    to_destination = stats.b_to_a,
                    from_destination = stats.a_to_b,
                    end = ?stats.end,
                    "tunnel ended"
                );
            }
            _ => {
                debug!(channel_id, "bridge closing without tunnelling");
            }
        }

        self.set_state(BridgeState::Done);
        self.active.store(false, Ordering::Relaxed);
    }

    fn set_state(&self, state: BridgeState) {
        *self.lock_state() = state;
    }

    fn lock_state(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Worker for DirectBridge {
    fn worker_id(&self) -> u64 {
        self.id
    }

    fn is_active(&self) -> bool {
        DirectBridge::is_active(self)
    }

    fn shutdown(&self, join: bool) -> BoxFuture<'_, ()> {
        Box::pin(DirectBridge::shutdown(self, join))
    }
}
