//! Create-if-absent instance tables and service registrations.
//!
//! Every shared instance lives in a table keyed by what it is shared on
//! (interface id for session/host/process sharing, object identity for
//! unshared instances, instance id for client proxies). A table entry holds
//! no reference of its own: each `acquire` hands the caller one reference,
//! and the entry removes itself when the last one is released.

use crate::call_target::CallTarget;
use crate::error::Result;
use crate::interface::InterfaceId;
use crate::refcount::RefCounter;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// How widely one service instance is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShareWithin {
    /// A new instance for every `GetInstance`.
    None,
    /// One instance per session.
    Session,
    /// One instance per service host, shared by all of its sessions.
    Host,
    /// One instance per runtime, shared by every host using it.
    Process,
}

/// A ref-counted call target.
pub type Counted<T> = Arc<RefCounter<Arc<T>>>;

/// A ref-counted server-side call target.
pub type SharedTarget = Counted<dyn CallTarget>;

pub type TargetFactory = Arc<dyn Fn() -> Result<Arc<dyn CallTarget>> + Send + Sync>;

/// A service a host can hand out.
#[derive(Clone)]
pub struct ServiceRegistration {
    pub interface_id: InterfaceId,
    pub name: &'static str,
    pub share_within: ShareWithin,
    pub factory: TargetFactory,
}

impl ServiceRegistration {
    pub fn create(&self) -> Result<Arc<dyn CallTarget>> {
        (self.factory)()
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("interface_id", &self.interface_id)
            .field("name", &self.name)
            .field("share_within", &self.share_within)
            .finish()
    }
}

/// Wrap a target in a fresh counter that disposes it at zero.
pub fn counted(target: Arc<dyn CallTarget>) -> SharedTarget {
    Arc::new(RefCounter::new(target, |target: &Arc<dyn CallTarget>| {
        target.dispose()
    }))
}

/// Table of shared targets, one per key.
pub struct InstanceTable<K, T: ?Sized = dyn CallTarget> {
    entries: Arc<Mutex<HashMap<K, Counted<T>>>>,
}

impl<K, T> InstanceTable<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    T: CallTarget + ?Sized + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Take a reference to the entry for `key`, creating it with `factory`
    /// if there is none or the existing one is already being disposed.
    ///
    /// The returned counter carries one reference owned by the caller.
    pub fn acquire<F>(&self, key: K, factory: F) -> Result<Counted<T>>
    where
        F: FnOnce() -> Result<Arc<T>>,
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&key) {
            if existing.try_add_ref().is_some() {
                return Ok(existing.clone());
            }
        }

        let target = factory()?;
        let table = Arc::downgrade(&self.entries);
        let removal_key = key.clone();
        let counter = Arc::new(RefCounter::new(target, move |target: &Arc<T>| {
            if let Some(table) = table.upgrade() {
                let mut entries = table.lock().unwrap_or_else(PoisonError::into_inner);
                // A replacement may already sit under this key.
                if entries.get(&removal_key).is_some_and(|entry| entry.is_disposed()) {
                    entries.remove(&removal_key);
                    debug!("Removed released instance {:?}", removal_key);
                }
            }
            target.dispose();
        }));
        entries.insert(key, counter.clone());
        Ok(counter)
    }

    /// The live entry for `key`, without taking a reference.
    pub fn get(&self, key: &K) -> Option<Counted<T>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|entry| !entry.is_disposed())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, T> Default for InstanceTable<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
    T: CallTarget + ?Sized + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_target::MethodOutcome;
    use crate::error::RpcError;
    use crate::rpc_packet::{EventId, MethodId, PropertyId};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct Tracked {
        disposals: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CallTarget for Tracked {
        async fn invoke_method(
            &self,
            method_id: MethodId,
            _args: Vec<Bytes>,
            _one_way: bool,
            _ct: &CancellationToken,
        ) -> Result<MethodOutcome> {
            Err(RpcError::MethodNotFound(method_id))
        }

        async fn get_property(&self, property_id: PropertyId, _ct: &CancellationToken) -> Result<Option<Bytes>> {
            Err(RpcError::PropertyNotFound(property_id))
        }

        async fn set_property(
            &self,
            property_id: PropertyId,
            _value: Option<Bytes>,
            _ct: &CancellationToken,
        ) -> Result<()> {
            Err(RpcError::PropertyNotFound(property_id))
        }

        async fn attach_event(&self, event_id: EventId, _ct: &CancellationToken) -> Result<()> {
            Err(RpcError::EventNotFound(event_id))
        }

        async fn detach_event(&self, event_id: EventId, _ct: &CancellationToken) -> Result<()> {
            Err(RpcError::EventNotFound(event_id))
        }

        fn dispose(&self) {
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked(disposals: &Arc<AtomicUsize>, created: &Arc<AtomicUsize>) -> Result<Arc<dyn CallTarget>> {
        created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Tracked {
            disposals: disposals.clone(),
        }))
    }

    #[test]
    fn test_acquire_shares_until_last_release() {
        let table: InstanceTable<&'static str> = InstanceTable::new();
        let disposals = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));

        let first = table.acquire("calc", || tracked(&disposals, &created)).unwrap();
        let second = table.acquire("calc", || tracked(&disposals, &created)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.count(), 2);
        assert_eq!(created.load(Ordering::SeqCst), 1);

        first.release();
        assert_eq!(table.len(), 1);
        assert_eq!(disposals.load(Ordering::SeqCst), 0);

        second.release();
        assert!(table.is_empty());
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acquire_after_disposal_creates_fresh_entry() {
        let table: InstanceTable<u32> = InstanceTable::new();
        let disposals = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));

        let first = table.acquire(1, || tracked(&disposals, &created)).unwrap();
        first.release();
        let second = table.acquire(1, || tracked(&disposals, &created)).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(table.get(&1).map(|entry| entry.count()), Some(1));
    }

    #[test]
    fn test_failed_factory_leaves_no_entry() {
        let table: InstanceTable<u32> = InstanceTable::new();
        let result = table.acquire(7, || Err(RpcError::Other("no backend".into())));
        assert!(result.is_err());
        assert!(table.is_empty());
        assert!(table.get(&7).is_none());
    }

    #[test]
    fn test_concurrent_acquire_and_release() {
        const THREADS: usize = 16;
        let table: Arc<InstanceTable<&'static str>> = Arc::new(InstanceTable::new());
        let disposals = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let anchor = table.acquire("calc", || tracked(&disposals, &created)).unwrap();

        let threads: Vec<_> = (0..THREADS)
            .map(|_| {
                let table = table.clone();
                let disposals = disposals.clone();
                let created = created.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let entry = table.acquire("calc", || tracked(&disposals, &created)).unwrap();
                        entry.release();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(anchor.count(), 1);
        anchor.release();
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_counted_disposes_once() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let shared = counted(tracked(&disposals, &created).unwrap());
        shared.add_ref();
        shared.release();
        shared.release();
        shared.release();
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }
}
