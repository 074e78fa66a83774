//! One logical connection between two peers.
//!
//! A session owns the [`RpcHandler`] for its channel and the registries
//! that give instance ids meaning on this connection:
//!
//! - `adapters`: server side, instance id -> local call target
//! - `proxies`: client side, instance id -> [`RemoteInstance`]
//! - `session_instances`: targets shared with `ShareWithin::Session`
//! - `instances`: unshared targets, keyed by object identity
//!
//! Host- and process-shared targets live in tables owned by the
//! [`ServiceHost`] and the [`RpcRuntime`](crate::runtime::RpcRuntime).
//! Instance ids are minted per session, so the same host-shared object has
//! a different id in every session that holds it.

use crate::call_target::{CallTarget, EventListener, ListenerId};
use crate::channel::Channel;
use crate::config::HandlerOptions;
use crate::error::{Result, RpcError};
use crate::events::EventContext;
use crate::handler::RpcHandler;
use crate::host::{HostInner, ServiceHost};
use crate::interface::InterfaceId;
use crate::proxy::{Proxy, ProxyCounter, RemoteInstance};
use crate::registry::{InstanceTable, ShareWithin, SharedTarget};
use crate::rpc_packet::{EventId, RpcPacket};
use bytes::Bytes;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

enum Role {
    Server { host: Weak<HostInner> },
    Client,
}

struct AdapterEntry {
    target: SharedTarget,
    // One per registration the peer has not released yet.
    registrations: usize,
    listener: Option<ListenerId>,
    subscribed: Arc<Mutex<HashSet<EventId>>>,
}

struct PropertyEntry {
    value: Arc<dyn Any + Send + Sync>,
    password: Option<String>,
}

/// A session. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    handler: RpcHandler,
    role: Role,
    session_instances: InstanceTable<InterfaceId>,
    instances: InstanceTable<usize>,
    adapters: Mutex<HashMap<Uuid, AdapterEntry>>,
    proxies: InstanceTable<Uuid, RemoteInstance>,
    properties: Mutex<HashMap<String, PropertyEntry>>,
    events_tx: mpsc::UnboundedSender<RpcPacket>,
    dropped_tx: mpsc::UnboundedSender<ProxyCounter>,
    lifetime: CancellationToken,
    disposed: AtomicBool,
}

/// Weak handle to a session, passed to session-aware call targets.
#[derive(Clone)]
pub struct SessionRef {
    id: Uuid,
    inner: Weak<SessionInner>,
}

impl SessionRef {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The session, unless it has been dropped.
    pub fn session(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRef").field("id", &self.id).finish()
    }
}

impl Session {
    /// Server side of `channel`, resolving services through `host`.
    pub fn server(channel: Arc<dyn Channel>, host: &ServiceHost, options: HandlerOptions) -> Self {
        Self::build(
            channel,
            Role::Server {
                host: host.downgrade(),
            },
            options,
        )
    }

    /// Client side of `channel`.
    pub fn client(channel: Arc<dyn Channel>, options: HandlerOptions) -> Self {
        Self::build(channel, Role::Client, options)
    }

    fn build(channel: Arc<dyn Channel>, role: Role, options: HandlerOptions) -> Self {
        let handler = RpcHandler::new(channel, options);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
        let lifetime = CancellationToken::new();

        let inner = Arc::new(SessionInner {
            id: Uuid::new_v4(),
            handler,
            role,
            session_instances: InstanceTable::new(),
            instances: InstanceTable::new(),
            adapters: Mutex::new(HashMap::new()),
            proxies: InstanceTable::new(),
            properties: Mutex::new(HashMap::new()),
            events_tx,
            dropped_tx,
            lifetime: lifetime.clone(),
            disposed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner.handler.set_fallback(move |packet, ct| {
            let session = weak.upgrade();
            async move {
                match session {
                    Some(session) => session.dispatch(packet, &ct).await,
                    None => Err(RpcError::SessionUnavailable),
                }
            }
        });
        tokio::spawn(forward_events(
            inner.handler.clone(),
            events_rx,
            lifetime.clone(),
        ));
        tokio::spawn(release_dropped_proxies(dropped_rx, lifetime));

        let session = Self { inner };
        session
            .channel()
            .set_bound_object(Some(Arc::new(session.session_ref())));
        debug!("Session {} created", session.id());
        session
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn handler(&self) -> &RpcHandler {
        &self.inner.handler
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        self.inner.handler.channel()
    }

    /// The host serving this session, for server sessions whose host is alive.
    pub fn host(&self) -> Option<ServiceHost> {
        match &self.inner.role {
            Role::Server { host } => host.upgrade().map(ServiceHost::from_inner),
            Role::Client => None,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self.inner.role, Role::Server { .. })
    }

    pub fn session_ref(&self) -> SessionRef {
        self.inner.session_ref()
    }

    /// Expose `target` under an instance id in this session.
    ///
    /// Takes over the caller's reference. Registering a counter that is
    /// already registered returns its existing id, drops the extra
    /// reference and counts one more registration of that id.
    pub fn register_instance(&self, target: SharedTarget) -> Uuid {
        self.inner.register_instance(target)
    }

    /// Drop one registration of `instance_id`; the adapter goes away with
    /// the last one. Unknown ids are ignored.
    pub async fn release_instance(&self, instance_id: Uuid) -> bool {
        self.inner.release_instance(instance_id).await
    }

    /// A proxy for a remote instance id, sharing state with every other
    /// proxy for the same id.
    pub fn get_proxy(&self, instance_id: Uuid) -> Result<Proxy> {
        self.inner.get_proxy(instance_id)
    }

    /// Ask the peer for an instance of `interface_id` and wrap it in a proxy.
    ///
    /// The peer counts every `GetInstance` that hands out an id. When the id
    /// is already backed by a live local proxy, the extra registration is
    /// given back right away so the peer's count stays one per proxy entry.
    pub async fn acquire_remote(&self, interface_id: InterfaceId, ct: &CancellationToken) -> Result<Proxy> {
        let instance_id = match self
            .inner
            .handler
            .request(RpcPacket::get_instance(interface_id), ct)
            .await?
        {
            RpcPacket::ServiceInstance { instance_id, .. } => instance_id,
            other => return Err(RpcError::UnexpectedPacket(other.kind().name())),
        };
        let (proxy, created) = self.inner.proxy_for(instance_id)?;
        if !created {
            debug!("Instance {} already proxied, returning extra registration", instance_id);
            if let Err(e) = self
                .inner
                .handler
                .request(RpcPacket::release_instance(instance_id), ct)
                .await
            {
                warn!("Failed to return extra registration of {}: {}", instance_id, e);
            }
        }
        Ok(proxy)
    }

    pub fn adapter_count(&self) -> usize {
        self.inner.lock_adapters().len()
    }

    pub fn proxy_count(&self) -> usize {
        self.inner.proxies.len()
    }

    pub fn session_instance_count(&self) -> usize {
        self.inner.session_instances.len()
    }

    /// Store a value in the session's property bag.
    ///
    /// An entry written with a password can only be replaced with the same
    /// password.
    pub fn set_property<T: Any + Send + Sync>(&self, name: &str, value: T, password: Option<&str>) -> Result<()> {
        let mut properties = self.inner.lock_properties();
        if let Some(existing) = properties.get(name) {
            check_password(name, existing, password)?;
        }
        properties.insert(
            name.to_string(),
            PropertyEntry {
                value: Arc::new(value),
                password: password.map(str::to_string),
            },
        );
        Ok(())
    }

    pub fn property<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.inner
            .lock_properties()
            .get(name)
            .and_then(|entry| entry.value.clone().downcast::<T>().ok())
    }

    pub fn remove_property(&self, name: &str, password: Option<&str>) -> Result<bool> {
        let mut properties = self.inner.lock_properties();
        match properties.get(name) {
            Some(existing) => {
                check_password(name, existing, password)?;
                properties.remove(name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Release everything this session holds and stop its handler.
    ///
    /// Best effort: a failing step is logged and the remaining steps still run.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<(Uuid, AdapterEntry)> = self.inner.lock_adapters().drain().collect();
        for (instance_id, entry) in entries {
            self.inner.retire_adapter(instance_id, entry).await;
        }
        self.inner.lock_properties().clear();
        self.inner.lifetime.cancel();
        self.inner.handler.dispose().await;
        debug!("Session {} disposed", self.id());
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("server", &self.is_server())
            .field("adapters", &self.adapter_count())
            .field("proxies", &self.proxy_count())
            .finish()
    }
}

fn check_password(name: &str, entry: &PropertyEntry, password: Option<&str>) -> Result<()> {
    match &entry.password {
        Some(expected) if password != Some(expected.as_str()) => Err(RpcError::PropertyProtected(name.to_string())),
        _ => Ok(()),
    }
}

/// Object identity of a target, for the unshared-instance table.
fn identity(target: &Arc<dyn CallTarget>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

/// A reference to an adapter held for the duration of one inbound call.
struct AdapterLease {
    target: SharedTarget,
    subscribed: Arc<Mutex<HashSet<EventId>>>,
}

impl AdapterLease {
    fn target(&self) -> &Arc<dyn CallTarget> {
        self.target.value()
    }

    fn subscribed(&self) -> std::sync::MutexGuard<'_, HashSet<EventId>> {
        self.subscribed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AdapterLease {
    fn drop(&mut self) {
        self.target.release();
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

impl SessionInner {
    fn session_ref(self: &Arc<Self>) -> SessionRef {
        SessionRef {
            id: self.id,
            inner: Arc::downgrade(self),
        }
    }

    fn lock_adapters(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, AdapterEntry>> {
        self.adapters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_properties(&self) -> std::sync::MutexGuard<'_, HashMap<String, PropertyEntry>> {
        self.properties.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_instance(self: &Arc<Self>, target: SharedTarget) -> Uuid {
        let mut adapters = self.lock_adapters();
        let existing = adapters
            .iter()
            .find(|(_, entry)| Arc::ptr_eq(&entry.target, &target))
            .map(|(instance_id, _)| *instance_id);
        if let Some(instance_id) = existing {
            if let Some(entry) = adapters.get_mut(&instance_id) {
                entry.registrations += 1;
            }
            drop(adapters);
            target.release();
            return instance_id;
        }

        let instance_id = Uuid::new_v4();
        let subscribed = Arc::new(Mutex::new(HashSet::new()));
        let listener = target
            .value()
            .event_emitter()
            .map(|emitter| emitter.add_listener(self.event_forwarder(instance_id, subscribed.clone())));
        adapters.insert(
            instance_id,
            AdapterEntry {
                target: target.clone(),
                registrations: 1,
                listener,
                subscribed,
            },
        );
        drop(adapters);

        target.value().attach_session(&self.session_ref());
        debug!("Registered instance {} in session {}", instance_id, self.id);
        instance_id
    }

    /// Listener that forwards a target's events to this session's peer.
    fn event_forwarder(&self, instance_id: Uuid, subscribed: Arc<Mutex<HashSet<EventId>>>) -> EventListener {
        let session_id = self.id;
        let events_tx = self.events_tx.clone();
        Arc::new(move |event_id: EventId, args: &[Bytes]| {
            if !subscribed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&event_id)
            {
                return;
            }
            if let Some(context) = EventContext::current() {
                if !context.allows(session_id) {
                    return;
                }
            }
            // Fails only once the session is gone.
            let _ = events_tx.send(RpcPacket::event_data(instance_id, event_id, args.to_vec()));
        })
    }

    async fn release_instance(self: &Arc<Self>, instance_id: Uuid) -> bool {
        let entry = {
            let mut adapters = self.lock_adapters();
            let Some(entry) = adapters.get_mut(&instance_id) else {
                debug!("Release of unknown instance {} ignored", instance_id);
                return false;
            };
            entry.registrations -= 1;
            if entry.registrations > 0 {
                debug!(
                    "Instance {} still registered {} times in session {}",
                    instance_id, entry.registrations, self.id
                );
                return true;
            }
            adapters.remove(&instance_id)
        };
        if let Some(entry) = entry {
            self.retire_adapter(instance_id, entry).await;
        }
        true
    }

    /// Tear down an adapter entry already removed from the table.
    async fn retire_adapter(self: &Arc<Self>, instance_id: Uuid, entry: AdapterEntry) {
        let target = entry.target.value();
        if let (Some(listener), Some(emitter)) = (entry.listener, target.event_emitter()) {
            emitter.remove_listener(listener);
        }

        let subscribed: Vec<EventId> = entry
            .subscribed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let ct = CancellationToken::new();
        for event_id in subscribed {
            if let Err(e) = target.detach_event(event_id, &ct).await {
                warn!(
                    "Failed to detach event {} of instance {}: {}",
                    event_id, instance_id, e
                );
            }
        }

        target.detach_session(&self.session_ref());
        entry.target.release();
        debug!("Released instance {} in session {}", instance_id, self.id);
    }

    fn lease(&self, instance_id: Uuid) -> Result<AdapterLease> {
        let adapters = self.lock_adapters();
        let entry = adapters
            .get(&instance_id)
            .ok_or(RpcError::InstanceNotFound(instance_id))?;
        entry
            .target
            .try_add_ref()
            .ok_or(RpcError::InstanceNotFound(instance_id))?;
        Ok(AdapterLease {
            target: entry.target.clone(),
            subscribed: entry.subscribed.clone(),
        })
    }

    /// Find or create the target for `interface_id` per its sharing policy.
    fn resolve(&self, interface_id: InterfaceId) -> Result<SharedTarget> {
        let host = match &self.role {
            Role::Server { host } => host.upgrade().ok_or(RpcError::SessionUnavailable)?,
            Role::Client => return Err(RpcError::ServiceNotAvailable(interface_id)),
        };
        let registration = host
            .registration(interface_id)
            .ok_or(RpcError::ServiceNotAvailable(interface_id))?;

        match registration.share_within {
            ShareWithin::None => {
                let target = registration.create()?;
                self.instances.acquire(identity(&target), || Ok(target))
            }
            ShareWithin::Session => self
                .session_instances
                .acquire(interface_id, || registration.create()),
            ShareWithin::Host => host
                .host_instances()
                .acquire(interface_id, || registration.create()),
            ShareWithin::Process => host
                .runtime()
                .process_instances()
                .acquire(interface_id, || registration.create()),
        }
    }

    fn get_proxy(&self, instance_id: Uuid) -> Result<Proxy> {
        self.proxy_for(instance_id).map(|(proxy, _)| proxy)
    }

    /// A proxy for `instance_id`, and whether a new proxy entry was created.
    fn proxy_for(&self, instance_id: Uuid) -> Result<(Proxy, bool)> {
        let mut created = false;
        let counter = self.proxies.acquire(instance_id, || {
            created = true;
            Ok(Arc::new(RemoteInstance::new(instance_id, self.handler.clone())))
        })?;
        Ok((Proxy::new(counter, self.dropped_tx.clone()), created))
    }

    async fn dispatch(self: &Arc<Self>, packet: RpcPacket, ct: &CancellationToken) -> Result<Option<RpcPacket>> {
        match packet {
            RpcPacket::GetInstance {
                request_id,
                instance_id: Some(instance_id),
                ..
            } => {
                if self.lock_adapters().contains_key(&instance_id) {
                    Ok(Some(RpcPacket::service_instance(request_id, instance_id)))
                } else {
                    Err(RpcError::InstanceNotFound(instance_id))
                }
            }
            RpcPacket::GetInstance {
                request_id,
                interface_id,
                instance_id: None,
            } => {
                let target = self.resolve(interface_id)?;
                let instance_id = self.register_instance(target);
                Ok(Some(RpcPacket::service_instance(request_id, instance_id)))
            }
            RpcPacket::ReleaseInstance {
                request_id,
                instance_id,
            } => {
                self.release_instance(instance_id).await;
                Ok(Some(RpcPacket::success(request_id)))
            }
            RpcPacket::MethodCall {
                request_id,
                one_way,
                instance_id,
                method_id,
                args,
            } => {
                let lease = self.lease(instance_id)?;
                let outcome = lease
                    .target()
                    .invoke_method(method_id, args, one_way, ct)
                    .await?;
                if one_way {
                    return Ok(None);
                }
                Ok(Some(RpcPacket::method_result(
                    request_id,
                    outcome.result,
                    outcome.out_args,
                )))
            }
            RpcPacket::GetProperty {
                request_id,
                instance_id,
                property_id,
            } => {
                let lease = self.lease(instance_id)?;
                let value = lease.target().get_property(property_id, ct).await?;
                Ok(Some(RpcPacket::property_value(request_id, value)))
            }
            RpcPacket::SetProperty {
                request_id,
                instance_id,
                property_id,
                value,
            } => {
                let lease = self.lease(instance_id)?;
                lease.target().set_property(property_id, value, ct).await?;
                Ok(Some(RpcPacket::success(request_id)))
            }
            RpcPacket::SubscribeForEvent {
                request_id,
                instance_id,
                event_id,
            } => {
                let lease = self.lease(instance_id)?;
                if !lease.subscribed().contains(&event_id) {
                    lease.target().attach_event(event_id, ct).await?;
                    lease.subscribed().insert(event_id);
                }
                Ok(Some(RpcPacket::success(request_id)))
            }
            RpcPacket::UnsubscribeFromEvent {
                request_id,
                instance_id,
                event_id,
            } => {
                let lease = self.lease(instance_id)?;
                let was_subscribed = lease.subscribed().remove(&event_id);
                if was_subscribed {
                    lease.target().detach_event(event_id, ct).await?;
                }
                Ok(Some(RpcPacket::success(request_id)))
            }
            RpcPacket::EventData {
                instance_id,
                event_id,
                args,
                ..
            } => {
                match self.proxies.get(&instance_id) {
                    Some(proxy) => proxy.value().deliver(event_id, &args).await,
                    None => debug!("Event {} for unknown proxy {} dropped", event_id, instance_id),
                }
                Ok(None)
            }
            other => Err(RpcError::UnexpectedPacket(other.kind().name())),
        }
    }
}

/// Sends events queued by adapter listeners, in the order they were raised.
async fn forward_events(
    handler: RpcHandler,
    mut events_rx: mpsc::UnboundedReceiver<RpcPacket>,
    lifetime: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            _ = lifetime.cancelled() => break,
            packet = events_rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        if let Err(e) = handler.send(&packet, &lifetime).await {
            debug!("Dropping event: {}", e);
        }
    }
}

/// Gives back the references of dropped proxies.
async fn release_dropped_proxies(mut dropped_rx: mpsc::UnboundedReceiver<ProxyCounter>, lifetime: CancellationToken) {
    loop {
        tokio::select! {
            _ = lifetime.cancelled() => break,
            counter = dropped_rx.recv() => match counter {
                Some(counter) => {
                    counter.release();
                }
                None => return,
            },
        }
    }
    dropped_rx.close();
    while let Ok(counter) = dropped_rx.try_recv() {
        counter.release();
    }
}
