//! Locks around the connection table and its entries
//!
//! With the `lock_tracking` feature each lock remembers its most recent holders, and warns when
//! waiting for it or holding it takes longer than a millisecond.

use std::{
    ops::{Deref, DerefMut},
    sync::{self, PoisonError, TryLockError},
};
#[cfg(feature = "lock_tracking")]
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

#[cfg(feature = "lock_tracking")]
use tracing::warn;

#[cfg(feature = "lock_tracking")]
const LONG_LOCK: Duration = Duration::from_millis(1);
#[cfg(feature = "lock_tracking")]
const MAX_OWNERS: usize = 20;

/// A mutex whose lock calls name what the lock is taken for
#[derive(Debug)]
pub(crate) struct Mutex<T> {
    inner: sync::Mutex<Slot<T>>,
}

#[derive(Debug)]
struct Slot<T> {
    value: T,
    /// Most recent first
    #[cfg(feature = "lock_tracking")]
    owners: VecDeque<(&'static str, Duration)>,
}

impl<T> Mutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: sync::Mutex::new(Slot {
                value,
                #[cfg(feature = "lock_tracking")]
                owners: VecDeque::with_capacity(MAX_OWNERS),
            }),
        }
    }

    /// Block until the lock is acquired for `purpose`
    pub(crate) fn lock(&self, purpose: &'static str) -> MutexGuard<'_, T> {
        #[cfg(feature = "lock_tracking")]
        let requested = Instant::now();
        let guard = self.inner.lock().unwrap_or_else(poisoned);
        #[cfg(feature = "lock_tracking")]
        {
            let waited = requested.elapsed();
            if waited > LONG_LOCK {
                warn!(purpose, ?waited, owners = ?guard.owners, "slow to acquire lock");
            }
        }
        MutexGuard::new(guard, purpose)
    }

    /// Acquire the lock for `purpose` unless another thread holds it
    pub(crate) fn try_lock(&self, purpose: &'static str) -> Option<MutexGuard<'_, T>> {
        let guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(e)) => poisoned(e),
        };
        Some(MutexGuard::new(guard, purpose))
    }
}

/// A thread panicked while holding the lock, so the value may be half-updated
fn poisoned<G>(e: PoisonError<G>) -> G {
    panic!("{e}")
}

pub(crate) struct MutexGuard<'a, T> {
    guard: sync::MutexGuard<'a, Slot<T>>,
    #[cfg(feature = "lock_tracking")]
    acquired: Instant,
    #[cfg(feature = "lock_tracking")]
    purpose: &'static str,
}

impl<'a, T> MutexGuard<'a, T> {
    #[cfg_attr(not(feature = "lock_tracking"), allow(unused_variables))]
    fn new(guard: sync::MutexGuard<'a, Slot<T>>, purpose: &'static str) -> Self {
        Self {
            guard,
            #[cfg(feature = "lock_tracking")]
            acquired: Instant::now(),
            #[cfg(feature = "lock_tracking")]
            purpose,
        }
    }
}

#[cfg(feature = "lock_tracking")]
impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let held = self.acquired.elapsed();
        if held > LONG_LOCK {
            warn!(purpose = self.purpose, ?held, "lock held too long");
        }
        let owners = &mut self.guard.owners;
        owners.truncate(MAX_OWNERS - 1);
        owners.push_front((self.purpose, held));
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard.value
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard.value
    }
}
