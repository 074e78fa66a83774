//! The generic surface every remotable object is reached through.
//!
//! Server-side adapters implement [`CallTarget`] over a concrete service;
//! the client-side [`RemoteInstance`](crate::proxy::RemoteInstance)
//! implements it by forwarding over the wire. Method, property and event ids
//! are small integers both sides agree on, normally declaration order.

use crate::error::Result;
use crate::rpc_packet::{EventId, MethodId, PropertyId};
use crate::session::SessionRef;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Return value and out-arguments of one method invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodOutcome {
    pub result: Option<Bytes>,
    pub out_args: Option<Vec<Bytes>>,
}

impl MethodOutcome {
    /// Outcome of a method with no return value.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn value(result: Bytes) -> Self {
        Self {
            result: Some(result),
            out_args: None,
        }
    }

    pub fn with_out_args(mut self, out_args: Vec<Bytes>) -> Self {
        self.out_args = Some(out_args);
        self
    }
}

#[async_trait]
pub trait CallTarget: Send + Sync {
    async fn invoke_method(
        &self,
        method_id: MethodId,
        args: Vec<Bytes>,
        one_way: bool,
        ct: &CancellationToken,
    ) -> Result<MethodOutcome>;

    async fn get_property(&self, property_id: PropertyId, ct: &CancellationToken) -> Result<Option<Bytes>>;

    async fn set_property(
        &self,
        property_id: PropertyId,
        value: Option<Bytes>,
        ct: &CancellationToken,
    ) -> Result<()>;

    async fn attach_event(&self, event_id: EventId, ct: &CancellationToken) -> Result<()>;

    async fn detach_event(&self, event_id: EventId, ct: &CancellationToken) -> Result<()>;

    /// Where this target raises its events, if it has any.
    fn event_emitter(&self) -> Option<&EventEmitter> {
        None
    }

    /// Called when a session starts referring to this target.
    fn attach_session(&self, _session: &SessionRef) {}

    /// Called when a session stops referring to this target.
    fn detach_session(&self, _session: &SessionRef) {}

    /// Called once, when the last reference to this target is released.
    fn dispose(&self) {}
}

pub type EventListener = Arc<dyn Fn(EventId, &[Bytes]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out point for a target's events.
///
/// Listeners run synchronously on the thread that raises the event, which is
/// what lets them observe the raiser's ambient
/// [`EventContext`](crate::events::EventContext).
#[derive(Default)]
pub struct EventEmitter {
    listeners: Mutex<Vec<(ListenerId, EventListener)>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: EventListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Raise `event_id` to every listener.
    pub fn event_triggered(&self, event_id: EventId, args: &[Bytes]) {
        let listeners: Vec<EventListener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event_id, args);
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
