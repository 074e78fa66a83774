//! Ambient event routing.
//!
//! Code raising an event from inside a service can restrict which sessions
//! receive it without threading a parameter through the service:
//!
//! ```ignore
//! EventContext::exclude_sessions([caller]).scope(async {
//!     emitter.event_triggered(COMPUTED, &args);
//! }).await;
//! ```
//!
//! The context is read when the event fires, not when the session
//! subscribed. Async code uses [`EventContext::scope`] (task-local); sync
//! code uses [`EventContext::enter`], whose guard restores the previous
//! context when dropped, including during unwinding.

use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use uuid::Uuid;

tokio::task_local! {
    static TASK_CONTEXT: EventContext;
}

thread_local! {
    static THREAD_CONTEXT: RefCell<Option<EventContext>> = const { RefCell::new(None) };
}

/// Which sessions an event raised under this context may reach.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    include: Option<HashSet<Uuid>>,
    exclude: Option<HashSet<Uuid>>,
}

impl EventContext {
    /// Deliver only to these sessions.
    pub fn include_sessions(sessions: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            include: Some(sessions.into_iter().collect()),
            exclude: None,
        }
    }

    /// Deliver to everyone but these sessions.
    pub fn exclude_sessions(sessions: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            include: None,
            exclude: Some(sessions.into_iter().collect()),
        }
    }

    pub fn and_exclude(mut self, sessions: impl IntoIterator<Item = Uuid>) -> Self {
        self.exclude
            .get_or_insert_with(HashSet::new)
            .extend(sessions);
        self
    }

    pub fn allows(&self, session_id: Uuid) -> bool {
        if let Some(include) = &self.include {
            if !include.contains(&session_id) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.contains(&session_id) {
                return false;
            }
        }
        true
    }

    /// Run `fut` with this context in effect for the current task.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        TASK_CONTEXT.scope(self, fut).await
    }

    /// Make this context current on this thread until the guard drops.
    pub fn enter(self) -> EventContextGuard {
        let previous = THREAD_CONTEXT.with(|slot| slot.replace(Some(self)));
        EventContextGuard {
            previous,
            _not_send: PhantomData,
        }
    }

    /// The innermost context in effect, if any.
    pub fn current() -> Option<EventContext> {
        THREAD_CONTEXT
            .with(|slot| slot.borrow().clone())
            .or_else(|| TASK_CONTEXT.try_with(Clone::clone).ok())
    }
}

/// Restores the previous thread context on drop.
#[must_use = "the context is only in effect while the guard is alive"]
pub struct EventContextGuard {
    previous: Option<EventContext>,
    // Tied to the thread whose slot it restores.
    _not_send: PhantomData<*const ()>,
}

impl Drop for EventContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        THREAD_CONTEXT.with(|slot| *slot.borrow_mut() = previous);
    }
}
