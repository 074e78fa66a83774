//! Client-side handles to remote instances.
//!
//! A session keeps one [`RemoteInstance`] per remote instance id, behind a
//! ref counter. Every [`Proxy`] holds one reference; dropping the proxy hands
//! that reference back to its session, and the `ReleaseInstance` round trip
//! happens only once the last proxy for the id is gone.

use crate::call_target::{CallTarget, MethodOutcome};
use crate::codec;
use crate::config::HandlerConfig;
use crate::error::{Result, RpcError};
use crate::handler::RpcHandler;
use crate::registry::Counted;
use crate::rpc_packet::{EventId, MethodId, PropertyId, RpcPacket};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub type EventCallback = Arc<dyn Fn(&[Bytes]) + Send + Sync>;

pub(crate) type ProxyCounter = Counted<RemoteInstance>;

fn unexpected(reply: RpcPacket) -> RpcError {
    RpcError::UnexpectedPacket(reply.kind().name())
}

/// Call target that forwards every operation to the peer.
pub struct RemoteInstance {
    instance_id: Uuid,
    handler: RpcHandler,
    // Held across the Subscribe/Unsubscribe round trip.
    subscribers: Mutex<HashMap<EventId, Vec<(u64, EventCallback)>>>,
    next_subscription: AtomicU64,
}

impl RemoteInstance {
    pub fn new(instance_id: Uuid, handler: RpcHandler) -> Self {
        Self {
            instance_id,
            handler,
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Add a local subscriber; the first one for `event_id` subscribes remotely.
    pub async fn subscribe(&self, event_id: EventId, callback: EventCallback, ct: &CancellationToken) -> Result<u64> {
        let mut subscribers = self.subscribers.lock().await;
        let first = subscribers.get(&event_id).map_or(true, Vec::is_empty);
        if first {
            self.attach_event(event_id, ct).await?;
        }
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        subscribers.entry(event_id).or_default().push((id, callback));
        Ok(id)
    }

    /// Remove a local subscriber; the last one for `event_id` unsubscribes remotely.
    pub async fn unsubscribe(&self, event_id: EventId, id: u64, ct: &CancellationToken) -> Result<bool> {
        let mut subscribers = self.subscribers.lock().await;
        let Some(list) = subscribers.get_mut(&event_id) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|(subscription, _)| *subscription != id);
        if list.len() == before {
            return Ok(false);
        }
        if list.is_empty() {
            subscribers.remove(&event_id);
            self.detach_event(event_id, ct).await?;
        }
        Ok(true)
    }

    pub async fn subscriber_count(&self, event_id: EventId) -> usize {
        self.subscribers
            .lock()
            .await
            .get(&event_id)
            .map_or(0, Vec::len)
    }

    /// Hand an inbound event to the local subscribers.
    pub async fn deliver(&self, event_id: EventId, args: &[Bytes]) {
        let callbacks: Vec<EventCallback> = match self.subscribers.lock().await.get(&event_id) {
            Some(list) => list.iter().map(|(_, callback)| callback.clone()).collect(),
            None => {
                debug!(
                    "No subscribers for event {} on {}",
                    event_id, self.instance_id
                );
                return;
            }
        };
        for callback in callbacks {
            callback(args);
        }
    }
}

#[async_trait]
impl CallTarget for RemoteInstance {
    async fn invoke_method(
        &self,
        method_id: MethodId,
        args: Vec<Bytes>,
        one_way: bool,
        ct: &CancellationToken,
    ) -> Result<MethodOutcome> {
        let call = RpcPacket::method_call(self.instance_id, method_id, args, one_way);
        if one_way {
            self.handler.send(&call, ct).await?;
            return Ok(MethodOutcome::none());
        }
        match self.handler.request(call, ct).await? {
            RpcPacket::MethodResult { result, args, .. } => Ok(MethodOutcome {
                result,
                out_args: args,
            }),
            other => Err(unexpected(other)),
        }
    }

    async fn get_property(&self, property_id: PropertyId, ct: &CancellationToken) -> Result<Option<Bytes>> {
        match self
            .handler
            .request(RpcPacket::get_property(self.instance_id, property_id), ct)
            .await?
        {
            RpcPacket::PropertyValue { value, .. } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn set_property(
        &self,
        property_id: PropertyId,
        value: Option<Bytes>,
        ct: &CancellationToken,
    ) -> Result<()> {
        match self
            .handler
            .request(RpcPacket::set_property(self.instance_id, property_id, value), ct)
            .await?
        {
            RpcPacket::Success { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn attach_event(&self, event_id: EventId, ct: &CancellationToken) -> Result<()> {
        match self
            .handler
            .request(RpcPacket::subscribe(self.instance_id, event_id), ct)
            .await?
        {
            RpcPacket::Success { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn detach_event(&self, event_id: EventId, ct: &CancellationToken) -> Result<()> {
        match self
            .handler
            .request(RpcPacket::unsubscribe(self.instance_id, event_id), ct)
            .await?
        {
            RpcPacket::Success { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Release the remote instance. Runs once, when the last proxy is gone.
    fn dispose(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No runtime to release remote instance {}; it stays alive until the session ends",
                self.instance_id
            );
            return;
        };
        let handler = self.handler.clone();
        let instance_id = self.instance_id;
        runtime.spawn(async move {
            let ct = CancellationToken::new();
            let release = handler.request(RpcPacket::release_instance(instance_id), &ct);
            match tokio::time::timeout(HandlerConfig::RELEASE_TIMEOUT, release).await {
                Ok(Ok(_)) => debug!("Released remote instance {}", instance_id),
                Ok(Err(e)) => warn!("Failed to release remote instance {}: {}", instance_id, e),
                Err(_) => warn!("Timed out releasing remote instance {}", instance_id),
            }
        });
    }
}

/// Handle returned by [`Proxy::subscribe`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a subscription does not unsubscribe"]
pub struct EventSubscription {
    event_id: EventId,
    id: u64,
}

impl EventSubscription {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }
}

/// One local reference to a remote instance.
///
/// Cloning takes another reference. Dropping gives it back; the remote
/// instance is released once every proxy for its id has been dropped.
pub struct Proxy {
    counter: ProxyCounter,
    dropped_tx: mpsc::UnboundedSender<ProxyCounter>,
}

impl Proxy {
    pub(crate) fn new(counter: ProxyCounter, dropped_tx: mpsc::UnboundedSender<ProxyCounter>) -> Self {
        Self { counter, dropped_tx }
    }

    pub fn instance_id(&self) -> Uuid {
        self.counter.value().instance_id()
    }

    pub fn remote(&self) -> &RemoteInstance {
        self.counter.value()
    }

    /// Live local references to this remote instance.
    pub fn ref_count(&self) -> usize {
        self.counter.count()
    }

    pub async fn invoke(&self, method_id: MethodId, args: Vec<Bytes>, ct: &CancellationToken) -> Result<MethodOutcome> {
        self.remote().invoke_method(method_id, args, false, ct).await
    }

    /// Fire-and-forget call: no reply, no remote errors.
    pub async fn invoke_one_way(&self, method_id: MethodId, args: Vec<Bytes>, ct: &CancellationToken) -> Result<()> {
        self.remote()
            .invoke_method(method_id, args, true, ct)
            .await
            .map(|_| ())
    }

    /// Invoke and decode the result; a missing result decodes as `null`.
    pub async fn call<R: DeserializeOwned>(
        &self,
        method_id: MethodId,
        args: Vec<Bytes>,
        ct: &CancellationToken,
    ) -> Result<R> {
        let outcome = self.invoke(method_id, args, ct).await?;
        match outcome.result {
            Some(result) => codec::decode(&result),
            None => codec::decode(b"null"),
        }
    }

    pub async fn get_property(&self, property_id: PropertyId, ct: &CancellationToken) -> Result<Option<Bytes>> {
        self.remote().get_property(property_id, ct).await
    }

    pub async fn set_property(
        &self,
        property_id: PropertyId,
        value: Option<Bytes>,
        ct: &CancellationToken,
    ) -> Result<()> {
        self.remote().set_property(property_id, value, ct).await
    }

    pub async fn subscribe<F>(&self, event_id: EventId, callback: F, ct: &CancellationToken) -> Result<EventSubscription>
    where
        F: Fn(&[Bytes]) + Send + Sync + 'static,
    {
        let id = self.remote().subscribe(event_id, Arc::new(callback), ct).await?;
        Ok(EventSubscription { event_id, id })
    }

    pub async fn unsubscribe(&self, subscription: EventSubscription, ct: &CancellationToken) -> Result<()> {
        self.remote()
            .unsubscribe(subscription.event_id, subscription.id, ct)
            .await
            .map(|_| ())
    }

    pub async fn subscriber_count(&self, event_id: EventId) -> usize {
        self.remote().subscriber_count(event_id).await
    }
}

impl Clone for Proxy {
    fn clone(&self) -> Self {
        self.counter.add_ref();
        Self {
            counter: self.counter.clone(),
            dropped_tx: self.dropped_tx.clone(),
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Err(mpsc::error::SendError(counter)) = self.dropped_tx.send(self.counter.clone()) {
            // Session gone.
            counter.release();
        }
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.instance_id() == other.instance_id()
    }
}

impl Eq for Proxy {}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("instance_id", &self.instance_id())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, StreamChannel};
    use crate::config::HandlerOptions;
    use crate::refcount::RefCounter;
    use std::sync::Mutex as StdMutex;
    use tokio::io::duplex;

    /// A client handler wired to a server handler that records every
    /// request kind and answers with `Success`.
    async fn recording_pair() -> (RpcHandler, RpcHandler, Arc<StdMutex<Vec<RpcPacket>>>) {
        let (a, b) = duplex(64 * 1024);
        let client_channel: Arc<dyn Channel> = Arc::new(StreamChannel::from_stream(a));
        let server_channel: Arc<dyn Channel> = Arc::new(StreamChannel::from_stream(b));
        let client = RpcHandler::new(client_channel.clone(), HandlerOptions::default());
        let server = RpcHandler::new(server_channel.clone(), HandlerOptions::default());
        let ct = CancellationToken::new();
        client_channel.open(&ct).await.unwrap();
        server_channel.open(&ct).await.unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let record = seen.clone();
        server.set_fallback(move |packet, _ct| {
            record.lock().unwrap().push(packet.clone());
            async move {
                match packet {
                    RpcPacket::MethodCall { request_id, .. } => Ok(Some(RpcPacket::method_result(
                        request_id,
                        Some(codec::encode(&42)?),
                        None,
                    ))),
                    RpcPacket::GetProperty { request_id, .. } => {
                        Ok(Some(RpcPacket::property_value(request_id, None)))
                    }
                    other => Ok(Some(RpcPacket::success(other.request_id()))),
                }
            }
        });
        (client, server, seen)
    }

    fn kinds(seen: &StdMutex<Vec<RpcPacket>>) -> Vec<&'static str> {
        seen.lock().unwrap().iter().map(|p| p.kind().name()).collect()
    }

    #[tokio::test]
    async fn test_subscriptions_collapse_to_one_remote_subscribe() {
        let (client, _server, seen) = recording_pair().await;
        let remote = RemoteInstance::new(Uuid::new_v4(), client);
        let ct = CancellationToken::new();

        let first = remote.subscribe(1, Arc::new(|_: &[Bytes]| {}), &ct).await.unwrap();
        let second = remote.subscribe(1, Arc::new(|_: &[Bytes]| {}), &ct).await.unwrap();
        assert_eq!(kinds(&seen), vec!["SubscribeForEvent"]);
        assert_eq!(remote.subscriber_count(1).await, 2);

        assert!(remote.unsubscribe(1, first, &ct).await.unwrap());
        assert_eq!(kinds(&seen), vec!["SubscribeForEvent"]);
        assert!(remote.unsubscribe(1, second, &ct).await.unwrap());
        assert!(!remote.unsubscribe(1, second, &ct).await.unwrap());
        assert_eq!(
            kinds(&seen),
            vec!["SubscribeForEvent", "UnsubscribeFromEvent"]
        );
    }

    #[tokio::test]
    async fn test_deliver_reaches_subscribers_of_that_event_only() {
        let (client, _server, _seen) = recording_pair().await;
        let remote = RemoteInstance::new(Uuid::new_v4(), client);
        let ct = CancellationToken::new();
        let hits = Arc::new(StdMutex::new(Vec::new()));

        for event_id in [1, 2] {
            let hits = hits.clone();
            remote
                .subscribe(
                    event_id,
                    Arc::new(move |args: &[Bytes]| hits.lock().unwrap().push((event_id, args.len()))),
                    &ct,
                )
                .await
                .unwrap();
        }
        remote.deliver(2, &[Bytes::from_static(b"1")]).await;
        remote.deliver(3, &[]).await;
        assert_eq!(*hits.lock().unwrap(), vec![(2, 1)]);
    }

    #[tokio::test]
    async fn test_proxy_calls_and_releases_on_last_drop() {
        let (client, _server, seen) = recording_pair().await;
        let instance_id = Uuid::new_v4();
        let counter: ProxyCounter = Arc::new(RefCounter::new(
            Arc::new(RemoteInstance::new(instance_id, client)),
            |remote: &Arc<RemoteInstance>| remote.dispose(),
        ));
        let (dropped_tx, mut dropped_rx) = mpsc::unbounded_channel();
        let proxy = Proxy::new(counter.clone(), dropped_tx);
        let ct = CancellationToken::new();

        let answer: i32 = proxy.call(1, vec![], &ct).await.unwrap();
        assert_eq!(answer, 42);
        assert_eq!(proxy.get_property(1, &ct).await.unwrap(), None);

        let copy = proxy.clone();
        assert_eq!(proxy, copy);
        assert_eq!(counter.count(), 2);

        drop(copy);
        dropped_rx.recv().await.unwrap().release();
        assert_eq!(counter.count(), 1);
        drop(proxy);
        dropped_rx.recv().await.unwrap().release();
        assert!(counter.is_disposed());

        for _ in 0..200 {
            if kinds(&seen).contains(&"ReleaseInstance") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let seen = seen.lock().unwrap();
        let releases: Vec<_> = seen
            .iter()
            .filter_map(|p| match p {
                RpcPacket::ReleaseInstance { instance_id, .. } => Some(*instance_id),
                _ => None,
            })
            .collect();
        assert_eq!(releases, vec![instance_id]);
    }

    #[tokio::test]
    async fn test_dropped_proxy_releases_directly_without_session() {
        let (client, _server, _seen) = recording_pair().await;
        let counter: ProxyCounter = Arc::new(RefCounter::new(
            Arc::new(RemoteInstance::new(Uuid::new_v4(), client)),
            |_: &Arc<RemoteInstance>| {},
        ));
        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
        drop(dropped_rx);

        drop(Proxy::new(counter.clone(), dropped_tx));
        assert!(counter.is_disposed());
    }

    #[tokio::test]
    async fn test_one_way_call_sends_without_waiting() {
        let (client, _server, seen) = recording_pair().await;
        let remote = RemoteInstance::new(Uuid::new_v4(), client);
        let outcome = remote
            .invoke_method(9, vec![], true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, MethodOutcome::none());
        for _ in 0..200 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(seen.lock().unwrap()[0].is_one_way());
    }
}
