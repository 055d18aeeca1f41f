//! Routing of peer-opened channels to the bridges waiting for them.
//!
//! The transport's accept call is destructive and connection-wide: whoever
//! calls it gets the next channel, whatever its id. The dispatcher is the only
//! caller. Bridges register the id they expect with [`ChannelDispatcher::expect`]
//! and receive their channel through a oneshot. A channel that arrives before
//! its bridge registers is parked for `unclaimed_ttl`, then closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunnel_core::{IdentifiedChannel, Transport};

/// Pause after an accept error before accepting again.
pub(super) const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Routes {
    waiters: HashMap<u32, oneshot::Sender<IdentifiedChannel>>,
    unclaimed: HashMap<u32, (Instant, IdentifiedChannel)>,
}

struct DispatchState {
    routes: Mutex<Routes>,
    unclaimed_ttl: Duration,
}

impl DispatchState {
    fn lock(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, channel: IdentifiedChannel) {
        let channel_id = channel.id;
        let mut routes = self.lock();
        let waiter = routes.waiters.remove(&channel_id);
        match waiter {
            Some(tx) => {
                drop(routes);
                if tx.send(channel).is_err() {
                    debug!(channel_id, "waiter went away, closing channel");
                } else {
                    debug!(channel_id, "channel routed");
                }
            }
            None => {
                debug!(channel_id, "no waiter yet, parking channel");
                routes.unclaimed.insert(channel_id, (Instant::now(), channel));
            }
        }
    }

    fn prune(&self) {
        let ttl = self.unclaimed_ttl;
        let expired: Vec<u32> = {
            let mut routes = self.lock();
            let ids: Vec<u32> = routes
                .unclaimed
                .iter()
                .filter(|(_, (parked_at, _))| parked_at.elapsed() >= ttl)
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                routes.unclaimed.remove(id);
            }
            // Bridges that gave up (stopped or timed out) dropped their receiver.
            routes.waiters.retain(|channel_id, tx| {
                let abandoned = tx.is_closed();
                if abandoned {
                    debug!(channel_id = *channel_id, "dropping abandoned waiter");
                }
                !abandoned
            });
            ids
        };
        for channel_id in expired {
            warn!(channel_id, "unclaimed channel expired, closing");
        }
    }

    fn clear(&self) {
        let mut routes = self.lock();
        routes.waiters.clear();
        routes.unclaimed.clear();
    }
}

/// Single owner of a transport's accept call.
pub struct ChannelDispatcher {
    state: Arc<DispatchState>,
    cancel_tx: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelDispatcher {
    /// Spawn the dispatch loop over `transport`.
    ///
    /// # Arguments
    ///
    /// * `accept_poll` - Timeout for each accept call.
    /// * `unclaimed_ttl` - How long a channel with no waiter is kept.
    pub fn start(transport: Arc<dyn Transport>, accept_poll: Duration, unclaimed_ttl: Duration) -> Self {
        let state = Arc::new(DispatchState {
            routes: Mutex::new(Routes::default()),
            unclaimed_ttl,
        });
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);

        let loop_state = state.clone();
        let handle = tokio::spawn(async move {
            Self::dispatch_loop(&loop_state, transport, accept_poll, cancel_rx).await;
            loop_state.clear();
            debug!("dispatch loop ended");
        });

        Self {
            state,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Register interest in channel `channel_id`.
    ///
    /// If the channel is already parked it is handed over immediately. The
    /// receiver errors if the dispatcher stops first.
    pub fn expect(&self, channel_id: u32) -> oneshot::Receiver<IdentifiedChannel> {
        let (tx, rx) = oneshot::channel();
        let mut routes = self.state.lock();
        let parked = routes.unclaimed.remove(&channel_id);
        match parked {
            Some((_, channel)) => {
                drop(routes);
                debug!(channel_id, "claimed parked channel");
                let _ = tx.send(channel);
            }
            None => {
                if routes.waiters.insert(channel_id, tx).is_some() {
                    warn!(channel_id, "replaced an existing waiter");
                }
            }
        }
        rx
    }

    /// Drop interest in `channel_id`.
    pub fn forget(&self, channel_id: u32) {
        self.state.lock().waiters.remove(&channel_id);
    }

    /// Number of registered waiters.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Number of parked channels.
    pub fn unclaimed(&self) -> usize {
        self.state.lock().unclaimed.len()
    }

    /// Whether the dispatch loop is still running.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the dispatch loop and wait for it. Idempotent.
    pub async fn stop(&self) {
        let cancel_tx = self
            .cancel_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = cancel_tx {
            let _ = tx.try_send(());
        }
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn dispatch_loop(
        state: &DispatchState,
        transport: Arc<dyn Transport>,
        accept_poll: Duration,
        mut cancel_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = cancel_rx.recv() => {
                    debug!("dispatch loop cancelled");
                    break;
                }
                result = transport.accept_channel(accept_poll) => match result {
                    Ok(Some(channel)) => state.route(channel),
                    Ok(None) => {}
                    Err(e) => {
                        if !transport.is_connected() {
                            info!(error = %e, "transport closed, dispatcher exiting");
                            break;
                        }
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
            state.prune();
        }
    }
}

impl Drop for ChannelDispatcher {
    fn drop(&mut self) {
        if let Some(handle) = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
