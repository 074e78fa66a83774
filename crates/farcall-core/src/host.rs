//! Service host: registered services, host-shared instances and the
//! sessions of every accepted channel.
//!
//! # Thread Safety
//!
//! Each accepted connection gets its own session and watcher task. The
//! service table sits behind an `RwLock`; sessions and the listener handle
//! behind plain mutexes that are never held across an await.

use crate::call_target::CallTarget;
use crate::channel::{Channel, ChannelEvent, ChannelState, StreamChannel};
use crate::config::{HandlerOptions, HostConfig};
use crate::error::{Result, RpcError};
use crate::interface::{Interface, InterfaceId};
use crate::registry::{InstanceTable, ServiceRegistration, ShareWithin};
use crate::runtime::RpcRuntime;
use crate::session::Session;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Hosts services for remote sessions. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct ServiceHost {
    inner: Arc<HostInner>,
}

pub(crate) struct HostInner {
    runtime: Arc<RpcRuntime>,
    services: RwLock<HashMap<InterfaceId, ServiceRegistration>>,
    host_instances: InstanceTable<InterfaceId>,
    sessions: Mutex<HashMap<Uuid, Session>>,
    server: Mutex<Option<ServerHandle>>,
}

/// Listener task of a started host. Dropping stops it.
struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    fn shutdown(&mut self) -> Option<tokio::task::JoinHandle<()>> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task_handle.take()
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.shutdown() {
            handle.abort();
        }
    }
}

impl ServiceHost {
    /// Host on the process-wide runtime.
    pub fn new() -> Self {
        Self::with_runtime(RpcRuntime::global())
    }

    pub fn with_runtime(runtime: Arc<RpcRuntime>) -> Self {
        Self {
            inner: Arc::new(HostInner {
                runtime,
                services: RwLock::new(HashMap::new()),
                host_instances: InstanceTable::new(),
                sessions: Mutex::new(HashMap::new()),
                server: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<HostInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<HostInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn runtime(&self) -> &Arc<RpcRuntime> {
        &self.inner.runtime
    }

    /// Make `I` available to sessions of this host.
    ///
    /// `factory` builds the adapter whenever the sharing policy calls for a
    /// new instance. Registering the same interface twice fails.
    pub fn register_service<I, T, F>(&self, share_within: ShareWithin, factory: F) -> Result<()>
    where
        I: Interface,
        T: CallTarget + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        let interface_id = I::interface_id();
        let registration = ServiceRegistration {
            interface_id,
            name: I::NAME,
            share_within,
            factory: Arc::new(move || -> Result<Arc<dyn CallTarget>> { Ok(Arc::new(factory()?)) }),
        };

        let mut services = self
            .inner
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(&interface_id) {
            return Err(RpcError::AlreadyRegistered(I::NAME.to_string()));
        }
        services.insert(interface_id, registration);
        info!("Registered service {} ({:?})", I::NAME, share_within);
        Ok(())
    }

    pub fn is_registered<I: Interface>(&self) -> bool {
        self.inner.registration(I::interface_id()).is_some()
    }

    /// Serve a session over `channel`, opening it first if it is still `Created`.
    ///
    /// The session is destroyed when the channel closes or faults.
    pub async fn accept(&self, channel: Arc<dyn Channel>) -> Result<Session> {
        let events = channel.subscribe();
        let session = Session::server(channel.clone(), self, HandlerOptions::default());

        if channel.state() == ChannelState::Created {
            if let Err(e) = channel.open(&CancellationToken::new()).await {
                session.dispose().await;
                return Err(e);
            }
        }
        let state = channel.state();
        if state.is_terminal() {
            session.dispose().await;
            return Err(RpcError::InvalidState {
                operation: "accept",
                state,
            });
        }

        self.inner
            .lock_sessions()
            .insert(session.id(), session.clone());
        tokio::spawn(watch_session(self.downgrade(), session.id(), events));
        info!("Session {} created", session.id());
        Ok(session)
    }

    /// Listen for TCP connections on `addr` and return the bound address.
    pub async fn start(&self, addr: &str) -> Result<SocketAddr> {
        if self.local_addr().is_some() {
            return Err(RpcError::Other("service host is already listening".into()));
        }
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let mut server = self.inner.server.lock().unwrap_or_else(PoisonError::into_inner);
        if server.is_some() {
            return Err(RpcError::Other("service host is already listening".into()));
        }
        let task_handle = tokio::spawn(accept_loop(self.downgrade(), listener, shutdown_rx));
        *server = Some(ServerHandle {
            addr: local,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        });

        info!("Service host listening on {}", local);
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|server| server.addr)
    }

    /// Stop listening and destroy every session.
    pub async fn stop(&self) {
        let server = self
            .inner
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut server) = server {
            if let Some(task) = server.shutdown() {
                let _ = task.await;
            }
            info!("Service host on {} stopped", server.addr);
        }

        let session_ids: Vec<Uuid> = self.inner.lock_sessions().keys().copied().collect();
        for session_id in session_ids {
            self.inner.destroy_session(session_id).await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.session_count()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.lock_sessions().values().cloned().collect()
    }

    pub fn host_instance_count(&self) -> usize {
        self.inner.host_instances.len()
    }
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServiceHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHost")
            .field("addr", &self.local_addr())
            .field("sessions", &self.session_count())
            .field("host_instances", &self.host_instance_count())
            .finish()
    }
}

impl HostInner {
    pub(crate) fn registration(&self, interface_id: InterfaceId) -> Option<ServiceRegistration> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&interface_id)
            .cloned()
    }

    pub(crate) fn host_instances(&self) -> &InstanceTable<InterfaceId> {
        &self.host_instances
    }

    pub(crate) fn runtime(&self) -> &Arc<RpcRuntime> {
        &self.runtime
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    async fn destroy_session(&self, session_id: Uuid) {
        let Some(session) = self.lock_sessions().remove(&session_id) else {
            return;
        };
        session.dispose().await;
        if !session.channel().state().is_terminal() {
            if let Err(e) = session.channel().close(&CancellationToken::new()).await {
                debug!("Closing channel of session {} failed: {}", session_id, e);
            }
        }
        info!("Session {} destroyed", session_id);
    }
}

async fn watch_session(host: Weak<HostInner>, session_id: Uuid, mut events: broadcast::Receiver<ChannelEvent>) {
    loop {
        match events.recv().await {
            Ok(ChannelEvent::Closed | ChannelEvent::Faulted) => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {
                let Some(inner) = host.upgrade() else {
                    return;
                };
                let terminal = inner
                    .lock_sessions()
                    .get(&session_id)
                    .map_or(true, |session| session.channel().state().is_terminal());
                if terminal {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    if let Some(inner) = host.upgrade() {
        inner.destroy_session(session_id).await;
    }
}

async fn accept_loop(host: Weak<HostInner>, listener: TcpListener, mut shutdown_rx: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("Service host shutting down");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let Some(inner) = host.upgrade() else {
                            break;
                        };
                        let current = inner.session_count();
                        if current >= HostConfig::MAX_CONNECTIONS {
                            warn!(
                                "Rejecting connection from {}: at max capacity ({})",
                                peer_addr,
                                HostConfig::MAX_CONNECTIONS
                            );
                            continue;
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not disable Nagle for {}: {}", peer_addr, e);
                        }

                        let host = ServiceHost::from_inner(inner);
                        tokio::spawn(async move {
                            debug!("Connection from {}", peer_addr);
                            let channel: Arc<dyn Channel> = Arc::new(StreamChannel::from_stream(stream));
                            if let Err(e) = host.accept(channel).await {
                                debug!("Connection {} ended: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }
}
