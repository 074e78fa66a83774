//! Single-flight send wrapper.

use super::state::{ChannelEvent, ChannelState};
use super::Channel;
use crate::error::{Result, RpcError};
use crate::packet::Packet;
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lets at most one `send` reach the wrapped channel at a time.
///
/// Waiting senders queue on a fair mutex, so they go out in the order they
/// arrived. Once the wrapped channel closes or faults, every queued send
/// fails with [`RpcError::Cancelled`].
pub struct QueueChannel {
    inner: Arc<dyn Channel>,
    send_lock: Mutex<()>,
    shutdown: CancellationToken,
    queued: AtomicUsize,
}

impl QueueChannel {
    pub fn new(inner: Arc<dyn Channel>) -> Self {
        let shutdown = CancellationToken::new();
        if inner.state().is_terminal() {
            shutdown.cancel();
        } else {
            tokio::spawn(watch_inner(inner.subscribe(), shutdown.clone()));
        }
        Self {
            inner,
            send_lock: Mutex::new(()),
            shutdown,
            queued: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<dyn Channel> {
        &self.inner
    }

    /// Sends waiting behind the one in flight.
    pub fn queued_sends(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

impl Drop for QueueChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn watch_inner(mut events: broadcast::Receiver<ChannelEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(ChannelEvent::Closed | ChannelEvent::Faulted) | Err(broadcast::error::RecvError::Closed) => {
                debug!("Wrapped channel ended, cancelling queued sends");
                shutdown.cancel();
                return;
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

struct QueuedGuard<'a>(&'a AtomicUsize);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Channel for QueueChannel {
    fn state(&self) -> ChannelState {
        self.inner.state()
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.subscribe()
    }

    async fn open(&self, ct: &CancellationToken) -> Result<()> {
        self.inner.open(ct).await
    }

    async fn close(&self, ct: &CancellationToken) -> Result<()> {
        self.shutdown.cancel();
        self.inner.close(ct).await
    }

    async fn send(&self, packet: Packet, ct: &CancellationToken) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(RpcError::Cancelled);
        }

        self.queued.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedGuard(&self.queued);
        let _turn = tokio::select! {
            guard = self.send_lock.lock() => guard,
            _ = self.shutdown.cancelled() => return Err(RpcError::Cancelled),
            _ = ct.cancelled() => return Err(RpcError::Cancelled),
        };
        drop(queued);

        if self.shutdown.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        self.inner.send(packet, ct).await
    }

    async fn receive(&self, ct: &CancellationToken) -> Result<Packet> {
        self.inner.receive(ct).await
    }

    fn bound_object(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.bound_object()
    }

    fn set_bound_object(&self, value: Option<Arc<dyn Any + Send + Sync>>) {
        self.inner.set_bound_object(value);
    }
}
