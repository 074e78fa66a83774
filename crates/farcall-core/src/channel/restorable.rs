//! Self-healing channel built from a prioritized list of channel factories.

use super::queue::QueueChannel;
use super::state::{BoundSlot, ChannelEvent, ChannelState, StateMachine};
use super::stream::TcpChannel;
use super::Channel;
use crate::config::RestorableOptions;
use crate::error::{Result, RpcError};
use crate::packet::Packet;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ChannelState::*;

/// Produces a channel to try. `Ok(None)` means "nothing to offer right now"
/// and is not counted as a failure.
pub type ChannelFactory = Arc<
    dyn Fn(CancellationToken) -> BoxFuture<'static, Result<Option<Arc<dyn Channel>>>> + Send + Sync,
>;

/// Wrap an async closure as a [`ChannelFactory`].
pub fn channel_factory<F, Fut>(factory: F) -> ChannelFactory
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Arc<dyn Channel>>>> + Send + 'static,
{
    Arc::new(
        move |ct| -> BoxFuture<'static, Result<Option<Arc<dyn Channel>>>> {
            Box::pin(factory(ct))
        },
    )
}

/// Factory for a TCP channel that dials `addr` each time it is asked.
pub fn tcp_factory(addr: impl Into<String>) -> ChannelFactory {
    let addr: String = addr.into();
    channel_factory(move |_ct| {
        let addr = addr.clone();
        async move {
            let channel: Arc<dyn Channel> = Arc::new(TcpChannel::connect_tcp(addr));
            Ok(Some(channel))
        }
    })
}

/// A channel that survives the loss of its connection.
///
/// `open` walks the factory list in order and keeps the first channel that
/// opens, wrapped in a [`QueueChannel`]. If that channel later faults, this
/// channel raises `Faulted` and, with `auto_reopen`, immediately enters
/// `Opening` again and keeps walking the list (sleeping `reopen_interval`
/// between passes) until a connection succeeds or `close` is called.
///
/// Unlike [`BaseChannel`](super::BaseChannel), it may be opened again after
/// being closed or faulted.
pub struct RestorableChannel {
    shared: Arc<Shared>,
}

struct Shared {
    factories: Vec<ChannelFactory>,
    options: RestorableOptions,
    machine: StateMachine,
    current: Mutex<Option<Arc<QueueChannel>>>,
    next_factory: AtomicUsize,
    lifetime: Mutex<CancellationToken>,
    bound: BoundSlot,
}

impl RestorableChannel {
    pub fn new(factories: Vec<ChannelFactory>, options: RestorableOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                factories,
                options,
                machine: StateMachine::new(),
                current: Mutex::new(None),
                next_factory: AtomicUsize::new(0),
                lifetime: Mutex::new(CancellationToken::new()),
                bound: BoundSlot::default(),
            }),
        }
    }

    pub fn options(&self) -> &RestorableOptions {
        &self.shared.options
    }

    /// The connection currently in use, if any.
    pub fn current(&self) -> Option<Arc<QueueChannel>> {
        self.shared.current_channel()
    }

    fn connected(&self, operation: &'static str) -> Result<Arc<QueueChannel>> {
        let state = self.shared.machine.state();
        if state != Opened {
            return Err(RpcError::InvalidState { operation, state });
        }
        self.shared
            .current_channel()
            .ok_or(RpcError::InvalidState { operation, state })
    }
}

impl Drop for RestorableChannel {
    fn drop(&mut self) {
        self.shared.lifetime().cancel();
    }
}

impl Shared {
    fn lifetime(&self) -> CancellationToken {
        self.lifetime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn renew_lifetime(&self) -> CancellationToken {
        let mut slot = self.lifetime.lock().unwrap_or_else(PoisonError::into_inner);
        slot.cancel();
        *slot = CancellationToken::new();
        slot.clone()
    }

    fn current_channel(&self) -> Option<Arc<QueueChannel>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// One pass over the factory list.
    async fn connect_pass(&self, ct: &CancellationToken) -> Result<Arc<dyn Channel>> {
        let count = self.factories.len();
        if count == 0 {
            return Err(RpcError::NoChannel);
        }
        let start = if self.options.reset_on_success {
            0
        } else {
            self.next_factory.load(Ordering::SeqCst) % count
        };

        let mut errors = Vec::new();
        for offset in 0..count {
            if ct.is_cancelled() {
                return Err(RpcError::Cancelled);
            }
            let index = (start + offset) % count;
            let channel = match (self.factories[index])(ct.clone()).await {
                Ok(Some(channel)) => channel,
                Ok(None) => continue,
                Err(err) => {
                    debug!("Channel factory {} failed: {}", index, err);
                    errors.push(err);
                    continue;
                }
            };
            match channel.open(ct).await {
                Ok(()) => {
                    self.next_factory.store(index, Ordering::SeqCst);
                    return Ok(channel);
                }
                Err(err) => {
                    debug!("Channel from factory {} failed to open: {}", index, err);
                    errors.push(err);
                }
            }
        }

        if ct.is_cancelled() {
            Err(RpcError::Cancelled)
        } else if errors.is_empty() {
            Err(RpcError::NoChannel)
        } else {
            Err(RpcError::ConnectFailed(errors))
        }
    }

    /// Make `channel` current unless `lifetime` ended meanwhile.
    fn install(self: &Arc<Self>, channel: Arc<dyn Channel>, lifetime: &CancellationToken) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if lifetime.is_cancelled() {
            return false;
        }
        let queue = Arc::new(QueueChannel::new(channel));
        let events = queue.subscribe();
        *current = Some(queue.clone());
        tokio::spawn(watch_connection(
            self.clone(),
            queue,
            events,
            lifetime.clone(),
        ));
        true
    }

    /// Settle an open that `close` interrupted.
    fn unwind_open(&self) {
        if self.machine.transition(&[Opening], Closing) {
            debug!("Open interrupted by close");
            self.machine.transition(&[Closing], Closed);
        }
    }

    async fn on_fault(self: &Arc<Self>, queue: &Arc<QueueChannel>, lifetime: &CancellationToken) {
        {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            match current.as_ref() {
                Some(active) if Arc::ptr_eq(active, queue) => *current = None,
                _ => return,
            }
        }
        if !self.machine.transition(&[Opened], Faulted) {
            return;
        }
        warn!("Connection lost");
        if self.options.auto_reopen && !lifetime.is_cancelled() {
            self.reopen(lifetime).await;
        }
    }

    async fn reopen(self: &Arc<Self>, lifetime: &CancellationToken) {
        if !self.machine.transition(&[Faulted], Opening) {
            return;
        }
        loop {
            match self.connect_pass(lifetime).await {
                Ok(channel) => {
                    if !self.install(channel.clone(), lifetime) {
                        let _ = channel.close(&CancellationToken::new()).await;
                        break;
                    }
                    if self.machine.transition(&[Opening], Opened) {
                        info!("Connection restored");
                    }
                    return;
                }
                Err(_) if lifetime.is_cancelled() => break,
                Err(err) => warn!("Reconnect attempt failed: {}", err),
            }
            tokio::select! {
                _ = lifetime.cancelled() => break,
                _ = tokio::time::sleep(self.options.reopen_interval) => {}
            }
        }
        self.unwind_open();
    }
}

async fn watch_connection(
    shared: Arc<Shared>,
    queue: Arc<QueueChannel>,
    mut events: broadcast::Receiver<ChannelEvent>,
    lifetime: CancellationToken,
) {
    if queue.state() != Faulted {
        loop {
            let event = tokio::select! {
                _ = lifetime.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(ChannelEvent::Faulted) => break,
                Ok(ChannelEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return,
                Err(broadcast::error::RecvError::Lagged(_)) if queue.state() == Faulted => break,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }
    }
    shared.on_fault(&queue, &lifetime).await;
}

#[async_trait]
impl Channel for RestorableChannel {
    fn state(&self) -> ChannelState {
        self.shared.machine.state()
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.machine.subscribe()
    }

    async fn open(&self, ct: &CancellationToken) -> Result<()> {
        let shared = &self.shared;
        match shared.machine.state() {
            Opening | Opened => return Ok(()),
            Closing => {
                return Err(RpcError::InvalidState {
                    operation: "open",
                    state: Closing,
                })
            }
            Created | Closed | Faulted => {}
        }

        let lifetime = shared.renew_lifetime();
        if !shared
            .machine
            .transition(&[Created, Closed, Faulted], Opening)
        {
            return match shared.machine.state() {
                Opening | Opened => Ok(()),
                state => Err(RpcError::InvalidState {
                    operation: "open",
                    state,
                }),
            };
        }

        let attempt = lifetime.child_token();
        let result = tokio::select! {
            result = shared.connect_pass(&attempt) => result,
            _ = ct.cancelled() => {
                attempt.cancel();
                Err(RpcError::Cancelled)
            }
        };

        match result {
            Ok(channel) => {
                if !shared.install(channel.clone(), &lifetime) {
                    let _ = channel.close(&CancellationToken::new()).await;
                    shared.unwind_open();
                    return Err(RpcError::Cancelled);
                }
                if shared.machine.transition(&[Opening], Opened) {
                    Ok(())
                } else {
                    Err(RpcError::Cancelled)
                }
            }
            Err(_) if lifetime.is_cancelled() => {
                shared.unwind_open();
                Err(RpcError::Cancelled)
            }
            Err(err) => {
                warn!("Could not open channel: {}", err);
                shared.machine.transition(&[Opening], Faulted);
                Err(err)
            }
        }
    }

    async fn close(&self, ct: &CancellationToken) -> Result<()> {
        let shared = &self.shared;
        shared.lifetime().cancel();
        loop {
            match shared.machine.state() {
                Closed | Faulted => return Ok(()),
                // The cancelled opener unwinds to Closed or, if it won the
                // race, to Opened.
                Opening => {
                    tokio::select! {
                        _ = shared.machine.wait_for(|s| s != Opening) => {}
                        _ = ct.cancelled() => return Err(RpcError::Cancelled),
                    }
                }
                Closing => {
                    tokio::select! {
                        _ = shared.machine.wait_for(|s| s != Closing) => {}
                        _ = ct.cancelled() => return Err(RpcError::Cancelled),
                    }
                }
                state @ (Created | Opened) => {
                    if !shared.machine.transition(&[state], Closing) {
                        continue;
                    }
                    let current = shared
                        .current
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    if let Some(channel) = current {
                        if let Err(err) = channel.close(ct).await {
                            warn!("Close failed: {}", err);
                            shared.machine.transition(&[Closing], Faulted);
                            return Err(err);
                        }
                    }
                    shared.machine.transition(&[Closing], Closed);
                    return Ok(());
                }
            }
        }
    }

    async fn send(&self, packet: Packet, ct: &CancellationToken) -> Result<()> {
        self.connected("send")?.send(packet, ct).await
    }

    async fn receive(&self, ct: &CancellationToken) -> Result<Packet> {
        self.connected("receive")?.receive(ct).await
    }

    fn bound_object(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.shared.bound.get()
    }

    fn set_bound_object(&self, value: Option<Arc<dyn Any + Send + Sync>>) {
        self.shared.bound.set(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StreamChannel;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    fn duplex_factory(
        peers: mpsc::UnboundedSender<DuplexStream>,
        calls: Arc<AtomicUsize>,
    ) -> ChannelFactory {
        channel_factory(move |_ct| {
            calls.fetch_add(1, Ordering::SeqCst);
            let peers = peers.clone();
            async move {
                let (local, remote) = tokio::io::duplex(4096);
                let _ = peers.send(remote);
                let channel: Arc<dyn Channel> = Arc::new(StreamChannel::from_stream(local));
                Ok(Some(channel))
            }
        })
    }

    fn failing_factory(calls: Arc<AtomicUsize>) -> ChannelFactory {
        channel_factory(move |_ct| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RpcError::transport("unreachable")) }
        })
    }

    fn empty_factory(calls: Arc<AtomicUsize>) -> ChannelFactory {
        channel_factory(move |_ct| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
    }

    fn fast_options() -> RestorableOptions {
        RestorableOptions::new().with_reopen_interval(Duration::from_millis(20))
    }

    async fn next_event(events: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within timeout")
            .unwrap()
    }

    /// Break the live connection: drop the peer end and let a receive see EOF.
    async fn kill_connection(channel: &RestorableChannel, peer: DuplexStream) {
        drop(peer);
        let err = channel.receive(&CancellationToken::new()).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_open_skips_failing_factories() {
        let (peers, _peer_rx) = mpsc::unbounded_channel();
        let failed = Arc::new(AtomicUsize::new(0));
        let empty = Arc::new(AtomicUsize::new(0));
        let good = Arc::new(AtomicUsize::new(0));
        let channel = RestorableChannel::new(
            vec![
                failing_factory(failed.clone()),
                empty_factory(empty.clone()),
                duplex_factory(peers, good.clone()),
            ],
            fast_options(),
        );

        channel.open(&CancellationToken::new()).await.unwrap();
        assert_eq!(channel.state(), Opened);
        assert!(channel.current().is_some());
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(empty.load(Ordering::SeqCst), 1);
        assert_eq!(good.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_factories_failing_aggregates_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let channel = RestorableChannel::new(
            vec![failing_factory(calls.clone()), failing_factory(calls.clone())],
            fast_options(),
        );
        match channel.open(&CancellationToken::new()).await {
            Err(RpcError::ConnectFailed(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate failure, got {other:?}"),
        }
        assert_eq!(channel.state(), Faulted);

        let channel = RestorableChannel::new(vec![empty_factory(calls)], fast_options());
        assert!(matches!(
            channel.open(&CancellationToken::new()).await,
            Err(RpcError::NoChannel)
        ));
    }

    #[tokio::test]
    async fn test_fault_reopens_with_event_order() {
        let (peers, mut peer_rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let channel = RestorableChannel::new(vec![duplex_factory(peers, calls.clone())], fast_options());
        let mut events = channel.subscribe();

        channel.open(&CancellationToken::new()).await.unwrap();
        let first_peer = peer_rx.recv().await.unwrap();
        kill_connection(&channel, first_peer).await;

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(next_event(&mut events).await);
        }
        assert_eq!(
            seen,
            vec![
                ChannelEvent::Opening,
                ChannelEvent::Opened,
                ChannelEvent::Faulted,
                ChannelEvent::Opening,
                ChannelEvent::Opened
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(channel.state(), Opened);

        let _second_peer = peer_rx.recv().await.unwrap();
        channel.close(&CancellationToken::new()).await.unwrap();
        assert_eq!(channel.state(), Closed);
    }

    #[tokio::test]
    async fn test_fault_without_auto_reopen_stays_faulted() {
        let (peers, mut peer_rx) = mpsc::unbounded_channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let channel = RestorableChannel::new(
            vec![duplex_factory(peers, calls.clone())],
            fast_options().with_auto_reopen(false),
        );
        let mut events = channel.subscribe();

        channel.open(&CancellationToken::new()).await.unwrap();
        kill_connection(&channel, peer_rx.recv().await.unwrap()).await;

        assert_eq!(next_event(&mut events).await, ChannelEvent::Opening);
        assert_eq!(next_event(&mut events).await, ChannelEvent::Opened);
        assert_eq!(next_event(&mut events).await, ChannelEvent::Faulted);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(channel.state(), Faulted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Unlike a base channel, an explicit open starts over.
        channel.open(&CancellationToken::new()).await.unwrap();
        assert_eq!(channel.state(), Opened);
    }

    #[tokio::test]
    async fn test_close_stops_reconnect_loop() {
        let (peers, mut peer_rx) = mpsc::unbounded_channel();
        let good = Arc::new(AtomicUsize::new(0));
        let failing = Arc::new(AtomicUsize::new(0));

        // Succeeds once, then only the failing factory answers.
        let once = {
            let inner = duplex_factory(peers, good.clone());
            let used = Arc::new(AtomicUsize::new(0));
            channel_factory(move |ct| {
                let first = used.fetch_add(1, Ordering::SeqCst) == 0;
                let inner = inner.clone();
                async move {
                    if first {
                        inner(ct).await
                    } else {
                        Err(RpcError::transport("gone"))
                    }
                }
            })
        };
        let channel = RestorableChannel::new(
            vec![once, failing_factory(failing.clone())],
            fast_options(),
        );
        let mut events = channel.subscribe();
        channel.open(&CancellationToken::new()).await.unwrap();
        kill_connection(&channel, peer_rx.recv().await.unwrap()).await;

        while next_event(&mut events).await != ChannelEvent::Faulted {}
        assert_eq!(next_event(&mut events).await, ChannelEvent::Opening);
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(failing.load(Ordering::SeqCst) >= 2);

        channel.close(&CancellationToken::new()).await.unwrap();
        assert_eq!(channel.state(), Closed);
        let attempts = failing.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(failing.load(Ordering::SeqCst), attempts);
    }

    #[tokio::test]
    async fn test_close_while_opening_waits_for_open_to_unwind() {
        let hanging = channel_factory(|ct: CancellationToken| async move {
            ct.cancelled().await;
            Err(RpcError::Cancelled)
        });
        let channel = Arc::new(RestorableChannel::new(vec![hanging], fast_options()));
        let mut events = channel.subscribe();

        let opener = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.open(&CancellationToken::new()).await })
        };
        assert_eq!(next_event(&mut events).await, ChannelEvent::Opening);

        channel.close(&CancellationToken::new()).await.unwrap();
        assert_eq!(channel.state(), Closed);
        assert!(opener.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(next_event(&mut events).await, ChannelEvent::Closing);
        assert_eq!(next_event(&mut events).await, ChannelEvent::Closed);
        assert!(events.try_recv().is_err());
    }

    async fn reconnect_calls(reset_on_success: bool) -> usize {
        let (peers, mut peer_rx) = mpsc::unbounded_channel();
        let empty = Arc::new(AtomicUsize::new(0));
        let good = Arc::new(AtomicUsize::new(0));
        let channel = RestorableChannel::new(
            vec![empty_factory(empty.clone()), duplex_factory(peers, good)],
            fast_options().with_reset_on_success(reset_on_success),
        );
        let mut events = channel.subscribe();

        channel.open(&CancellationToken::new()).await.unwrap();
        kill_connection(&channel, peer_rx.recv().await.unwrap()).await;
        loop {
            if next_event(&mut events).await == ChannelEvent::Faulted {
                break;
            }
        }
        assert_eq!(next_event(&mut events).await, ChannelEvent::Opening);
        assert_eq!(next_event(&mut events).await, ChannelEvent::Opened);
        empty.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_reset_on_success_controls_starting_factory() {
        assert_eq!(reconnect_calls(true).await, 2);
        assert_eq!(reconnect_calls(false).await, 1);
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let channel = RestorableChannel::new(Vec::new(), fast_options());
        let err = channel
            .send(Packet::new(bytes::Bytes::new()), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::InvalidState { state: Created, .. }));
    }
}
