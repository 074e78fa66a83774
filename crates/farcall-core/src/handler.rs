//! Request/response correlation and inbound dispatch over one channel.
//!
//! # Concurrency
//!
//! One receive loop runs per channel lifetime. It never blocks on handler
//! code: replies to local requests complete a waiting oneshot, cancel
//! requests trip a token, and everything else is dispatched on its own task.
//! Replies can therefore complete out of order; correlation is by
//! `request_id` only.

use crate::channel::{Channel, ChannelEvent, ChannelState};
use crate::config::{HandlerConfig, HandlerOptions};
use crate::error::{Result, RpcError};
use crate::packet::Packet;
use crate::rpc_packet::RpcPacket;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// What an inbound handler produces: a reply, or `None` for no reply.
pub type HandlerFuture = BoxFuture<'static, Result<Option<RpcPacket>>>;

type Callback = Arc<dyn Fn(RpcPacket, CancellationToken) -> HandlerFuture + Send + Sync>;
type Predicate = Arc<dyn Fn(&RpcPacket) -> bool + Send + Sync>;

struct Claimant {
    predicate: Predicate,
    callback: Callback,
}

struct LoopHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Turns a [`Channel`] into a request/response endpoint.
///
/// Cloning is cheap and every clone drives the same handler.
#[derive(Clone)]
pub struct RpcHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    channel: Arc<dyn Channel>,
    options: HandlerOptions,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<RpcPacket>>>,
    inbound: Mutex<HashMap<Uuid, CancellationToken>>,
    claimants: RwLock<Vec<Claimant>>,
    fallback: RwLock<Option<Callback>>,
    lifetime: CancellationToken,
    receive_loop: Mutex<Option<LoopHandle>>,
}

fn boxed<F, Fut>(callback: F) -> Callback
where
    F: Fn(RpcPacket, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<RpcPacket>>> + Send + 'static,
{
    Arc::new(move |packet, ct| -> HandlerFuture { Box::pin(callback(packet, ct)) })
}

impl RpcHandler {
    /// Attach to `channel`. The receive loop starts whenever the channel
    /// reports `Opened`, including right away if it already is.
    pub fn new(channel: Arc<dyn Channel>, options: HandlerOptions) -> Self {
        let inner = Arc::new(HandlerInner {
            channel,
            options,
            pending: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            claimants: RwLock::new(Vec::new()),
            fallback: RwLock::new(None),
            lifetime: CancellationToken::new(),
            receive_loop: Mutex::new(None),
        });

        let events = inner.channel.subscribe();
        tokio::spawn(watch_channel(
            Arc::downgrade(&inner),
            events,
            inner.lifetime.clone(),
        ));
        if inner.channel.state() == ChannelState::Opened {
            inner.start_loop();
        }
        Self { inner }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.inner.channel
    }

    pub fn options(&self) -> &HandlerOptions {
        &self.inner.options
    }

    /// Register a handler for inbound packets matching `predicate`.
    ///
    /// Handlers are consulted in registration order; the first match wins.
    pub fn handle<P, F, Fut>(&self, predicate: P, callback: F)
    where
        P: Fn(&RpcPacket) -> bool + Send + Sync + 'static,
        F: Fn(RpcPacket, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<RpcPacket>>> + Send + 'static,
    {
        self.inner
            .claimants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Claimant {
                predicate: Arc::new(predicate),
                callback: boxed(callback),
            });
    }

    /// Handler for inbound packets no registered handler claims.
    pub fn set_fallback<F, Fut>(&self, callback: F)
    where
        F: Fn(RpcPacket, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<RpcPacket>>> + Send + 'static,
    {
        *self
            .inner
            .fallback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(boxed(callback));
    }

    /// Send without waiting for a reply.
    pub async fn send(&self, packet: &RpcPacket, ct: &CancellationToken) -> Result<()> {
        self.inner.send(packet, ct).await
    }

    /// Send `packet` and wait for the reply carrying its `request_id`.
    ///
    /// `Exception` and `Error` replies come back as
    /// [`RpcError::ServerException`] and [`RpcError::Remote`]. Cancelling `ct`
    /// sends a best-effort `CancelRequest` before returning
    /// [`RpcError::Cancelled`]; running out of `answer_timeout` returns
    /// [`RpcError::Timeout`] and leaves the peer alone.
    pub async fn request(&self, packet: RpcPacket, ct: &CancellationToken) -> Result<RpcPacket> {
        let request_id = packet.request_id();
        let (tx, rx) = oneshot::channel();
        self.inner.lock_pending().insert(request_id, tx);
        let _pending = PendingGuard {
            inner: &self.inner,
            request_id,
        };

        self.send(&packet, ct).await?;

        let timeout = self.inner.options.answer_timeout;
        tokio::select! {
            reply = rx => match reply {
                Ok(reply) => reply.into_result(),
                // Dropped by cancel_pending.
                Err(_) => Err(RpcError::Cancelled),
            },
            _ = ct.cancelled() => {
                debug!("Request {} cancelled", request_id);
                self.send_cancel(request_id).await;
                Err(RpcError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                debug!("Request {} timed out after {:?}", request_id, timeout);
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    async fn send_cancel(&self, request_id: Uuid) {
        let cancel = RpcPacket::cancel(request_id);
        let ct = CancellationToken::new();
        match tokio::time::timeout(HandlerConfig::CANCEL_SEND_TIMEOUT, self.send(&cancel, &ct)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Could not send cancel for {}: {}", request_id, e),
            Err(_) => debug!("Timed out sending cancel for {}", request_id),
        }
    }

    /// Local requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.lock_pending().len()
    }

    /// Inbound requests currently being handled.
    pub fn inbound_count(&self) -> usize {
        self.inner.lock_inbound().len()
    }

    pub fn is_receiving(&self) -> bool {
        self.inner
            .receive_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|running| !running.token.is_cancelled() && !running.task.is_finished())
    }

    /// Stop the receive loop (bounded wait), cancel inbound work and fail
    /// every pending request.
    pub async fn dispose(&self) {
        self.inner.lifetime.cancel();
        self.inner.stop_loop().await;
        self.inner.cancel_pending();
    }
}

struct PendingGuard<'a> {
    inner: &'a HandlerInner,
    request_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.lock_pending().remove(&self.request_id);
    }
}

impl Drop for HandlerInner {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

impl HandlerInner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<RpcPacket>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_inbound(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, packet: &RpcPacket, ct: &CancellationToken) -> Result<()> {
        self.channel.send(Packet::new(packet.encode()), ct).await
    }

    fn start_loop(self: &Arc<Self>) {
        let mut slot = self
            .receive_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = slot.as_ref() {
            if !running.token.is_cancelled() && !running.task.is_finished() {
                return;
            }
        }
        if self.lifetime.is_cancelled() {
            return;
        }
        let token = self.lifetime.child_token();
        let task = tokio::spawn(receive_loop(
            Arc::downgrade(self),
            self.channel.clone(),
            token.clone(),
        ));
        *slot = Some(LoopHandle { token, task });
        debug!("Receive loop started");
    }

    /// Signal the loop to stop without waiting for it.
    fn halt_loop(&self) -> Option<JoinHandle<()>> {
        let running = self
            .receive_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        running.token.cancel();
        Some(running.task)
    }

    async fn stop_loop(&self) {
        let Some(task) = self.halt_loop() else {
            return;
        };
        let abort = task.abort_handle();
        if tokio::time::timeout(HandlerConfig::DISPOSE_TIMEOUT, task)
            .await
            .is_err()
        {
            warn!(
                "Receive loop did not stop within {:?}, aborting",
                HandlerConfig::DISPOSE_TIMEOUT
            );
            abort.abort();
        }
    }

    fn cancel_pending(&self) {
        let drained: Vec<_> = self.lock_pending().drain().collect();
        if !drained.is_empty() {
            debug!("Cancelling {} pending requests", drained.len());
        }
    }

    fn callback_for(&self, packet: &RpcPacket) -> Option<Callback> {
        let claimants = self.claimants.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(claimant) = claimants.iter().find(|c| (c.predicate)(packet)) {
            return Some(claimant.callback.clone());
        }
        self.fallback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn on_packet(self: &Arc<Self>, packet: Packet) {
        let rpc = match RpcPacket::decode(&packet.data) {
            Ok(rpc) => rpc,
            Err(e) => {
                warn!("Dropping undecodable packet: {}", e);
                return;
            }
        };
        let request_id = rpc.request_id();

        if let Some(waiter) = self.lock_pending().remove(&request_id) {
            // The requester may have given up already.
            let _ = waiter.send(rpc);
            return;
        }

        if let RpcPacket::CancelRequest { request_id } = rpc {
            if let Some(token) = self.lock_inbound().get(&request_id) {
                debug!("Peer cancelled request {}", request_id);
                token.cancel();
            }
            return;
        }

        if rpc.is_reply() {
            debug!(
                "Dropping {} for unknown request {}",
                rpc.kind().name(),
                request_id
            );
            return;
        }

        // Registered before the task starts so an early cancel finds it.
        let ct = self.lifetime.child_token();
        self.lock_inbound().insert(request_id, ct.clone());
        tokio::spawn(dispatch(self.clone(), rpc, ct));
    }
}

async fn dispatch(inner: Arc<HandlerInner>, rpc: RpcPacket, ct: CancellationToken) {
    let request_id = rpc.request_id();
    let kind = rpc.kind();
    let one_way = rpc.is_one_way();

    let outcome = match inner.callback_for(&rpc) {
        Some(callback) => match tokio::spawn(callback(rpc, ct)).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(RpcError::Other(format!(
                "handler panicked while processing {}",
                kind.name()
            ))),
            Err(_) => Err(RpcError::Cancelled),
        },
        None => Err(RpcError::UnexpectedPacket(kind.name())),
    };
    inner.lock_inbound().remove(&request_id);

    let reply = match outcome {
        Ok(reply) if !one_way => reply,
        Err(err) if !one_way => Some(RpcPacket::failure(request_id, &err)),
        Err(err) => {
            debug!("One-way {} failed: {}", kind.name(), err);
            None
        }
        Ok(_) => None,
    };

    if let Some(reply) = reply {
        if let Err(e) = inner.send(&reply, &inner.lifetime).await {
            debug!("Could not reply to {}: {}", request_id, e);
        }
    }
}

async fn receive_loop(weak: Weak<HandlerInner>, channel: Arc<dyn Channel>, token: CancellationToken) {
    loop {
        let packet = match channel.receive(&token).await {
            Ok(packet) => packet,
            Err(_) if token.is_cancelled() => break,
            Err(e) if e.is_transport() || matches!(e, RpcError::InvalidState { .. }) => {
                debug!("Receive loop ending: {}", e);
                break;
            }
            Err(e) => {
                warn!("Dropping unreadable frame: {}", e);
                continue;
            }
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.on_packet(packet);
    }
    debug!("Receive loop stopped");
}

async fn watch_channel(
    weak: Weak<HandlerInner>,
    mut events: broadcast::Receiver<ChannelEvent>,
    lifetime: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = lifetime.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let state = match event {
            Ok(ChannelEvent::Opened) => ChannelState::Opened,
            Ok(ChannelEvent::Faulted) => ChannelState::Faulted,
            Ok(ChannelEvent::Closed) => ChannelState::Closed,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => inner.channel.state(),
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match state {
            ChannelState::Opened => inner.start_loop(),
            ChannelState::Faulted => {
                inner.cancel_pending();
                drop(inner.halt_loop());
            }
            ChannelState::Closed => {
                inner.cancel_pending();
                inner.stop_loop().await;
            }
            _ => {}
        }
    }
}
