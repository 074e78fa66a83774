//! Explicit reference counting with a dispose-once callback.
//!
//! Remote instances are shared between peers that cannot see each other's
//! ownership, so their lifetime is tracked by hand: every holder takes a
//! reference, and whoever drops the count to zero runs the disposer.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

type Disposer<T> = Box<dyn FnOnce(&T) + Send>;

/// A value with an atomic reference count and a disposer that runs exactly
/// once, on the release that takes the count to zero.
///
/// A new counter starts at one reference, owned by its creator.
pub struct RefCounter<T> {
    value: T,
    count: AtomicUsize,
    disposed: AtomicBool,
    on_dispose: Mutex<Option<Disposer<T>>>,
}

impl<T> RefCounter<T> {
    pub fn new(value: T, on_dispose: impl FnOnce(&T) + Send + 'static) -> Self {
        Self {
            value,
            count: AtomicUsize::new(1),
            disposed: AtomicBool::new(false),
            on_dispose: Mutex::new(Some(Box::new(on_dispose))),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Take another reference and return the new count.
    ///
    /// Callers must already hold a reference; use [`try_add_ref`](Self::try_add_ref)
    /// when the counter may have reached zero concurrently.
    pub fn add_ref(&self) -> usize {
        let previous = self.count.fetch_add(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "add_ref on a released counter");
        previous + 1
    }

    /// Take a reference unless the count already reached zero.
    pub fn try_add_ref(&self) -> Option<usize> {
        let mut current = self.count.load(Ordering::SeqCst);
        loop {
            if current == 0 || self.is_disposed() {
                return None;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference and return the remaining count; disposes at zero.
    pub fn release(&self) -> usize {
        let mut current = self.count.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                warn!("release on a counter that is already at zero");
                return 0;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let remaining = current - 1;
        if remaining == 0 {
            self.dispose();
        }
        remaining
    }

    fn dispose(&self) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let disposer = self
            .on_dispose
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(disposer) = disposer {
            disposer(&self.value);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RefCounter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCounter")
            .field("value", &self.value)
            .field("count", &self.count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn counted() -> (Arc<RefCounter<&'static str>>, Arc<AtomicUsize>) {
        let disposals = Arc::new(AtomicUsize::new(0));
        let seen = disposals.clone();
        let counter = Arc::new(RefCounter::new("service", move |value: &&str| {
            assert_eq!(*value, "service");
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        (counter, disposals)
    }

    #[test]
    fn test_disposes_on_last_release() {
        let (counter, disposals) = counted();
        assert_eq!(counter.count(), 1);
        assert_eq!(counter.add_ref(), 2);
        assert_eq!(counter.release(), 1);
        assert_eq!(disposals.load(Ordering::SeqCst), 0);
        assert_eq!(counter.release(), 0);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
        assert!(counter.is_disposed());
    }

    #[test]
    fn test_release_past_zero_is_harmless() {
        let (counter, disposals) = counted();
        counter.release();
        assert_eq!(counter.release(), 0);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_try_add_ref_fails_after_disposal() {
        let (counter, _) = counted();
        assert_eq!(counter.try_add_ref(), Some(2));
        counter.release();
        counter.release();
        assert_eq!(counter.try_add_ref(), None);
    }

    #[test]
    fn test_concurrent_releases_dispose_once() {
        const HOLDERS: usize = 64;
        let (counter, disposals) = counted();
        for _ in 1..HOLDERS {
            counter.add_ref();
        }

        let threads: Vec<_> = (0..HOLDERS)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    counter.release();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(counter.count(), 0);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }
}
