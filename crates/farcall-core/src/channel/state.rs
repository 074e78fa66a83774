//! Channel lifecycle states, the events raised on transitions, and the
//! compare-and-set helper every channel implementation drives them through.

use crate::config::ChannelConfig;
use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl ChannelState {
    /// The event raised on entering this state, if any.
    pub fn event(self) -> Option<ChannelEvent> {
        match self {
            ChannelState::Created => None,
            ChannelState::Opening => Some(ChannelEvent::Opening),
            ChannelState::Opened => Some(ChannelEvent::Opened),
            ChannelState::Closing => Some(ChannelEvent::Closing),
            ChannelState::Closed => Some(ChannelEvent::Closed),
            ChannelState::Faulted => Some(ChannelEvent::Faulted),
        }
    }

    /// `Closed` or `Faulted`: no further transition happens without a new open.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Faulted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

/// Current state plus the event stream for one channel.
///
/// The state lives in a `watch` so callers can await a change; every
/// successful transition publishes exactly one [`ChannelEvent`] while the
/// state is still locked, so subscribers observe events in transition order.
#[derive(Debug)]
pub struct StateMachine {
    state: watch::Sender<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ChannelState::Created);
        let (events, _) = broadcast::channel(ChannelConfig::EVENT_CAPACITY);
        Self { state, events }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Move to `to` if the current state is one of `from`.
    ///
    /// Returns `false`, without raising an event, when the state did not match.
    pub fn transition(&self, from: &[ChannelState], to: ChannelState) -> bool {
        self.state.send_if_modified(|current| {
            if !from.contains(current) || *current == to {
                return false;
            }
            debug!("Channel state {:?} -> {:?}", current, to);
            *current = to;
            if let Some(event) = to.event() {
                // No subscribers is fine.
                let _ = self.events.send(event);
            }
            true
        })
    }

    /// Wait until the state satisfies `pred`, returning the state seen.
    pub async fn wait_for(&self, pred: impl Fn(ChannelState) -> bool) -> ChannelState {
        let mut rx = self.state.subscribe();
        let seen = match rx.wait_for(|state| pred(*state)).await {
            Ok(state) => *state,
            // The sender lives in `self`, so this only happens mid-drop.
            Err(_) => self.state(),
        };
        seen
    }
}

/// Slot for the arbitrary object a caller may bind to a channel.
#[derive(Default)]
pub struct BoundSlot {
    value: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl BoundSlot {
    pub fn get(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, value: Option<Arc<dyn Any + Send + Sync>>) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

impl std::fmt::Debug for BoundSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundSlot")
            .field("bound", &self.get().is_some())
            .finish()
    }
}
