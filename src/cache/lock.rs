use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

/// Lock access that keeps serving after a panic poisoned the lock.
///
/// Cache contents are disposable, so a poisoned guard is taken over and a
/// warning is emitted instead of propagating the panic to every caller.
pub(crate) trait RwLockExt<T> {
    fn read_or_recover(&self, op: &'static str) -> RwLockReadGuard<'_, T>;
    fn write_or_recover(&self, op: &'static str) -> RwLockWriteGuard<'_, T>;
}

pub(crate) trait MutexExt<T> {
    fn lock_or_recover(&self, op: &'static str) -> MutexGuard<'_, T>;
}

impl<T> RwLockExt<T> for RwLock<T> {
    fn read_or_recover(&self, op: &'static str) -> RwLockReadGuard<'_, T> {
        self.read()
            .unwrap_or_else(|poisoned| recovered(poisoned, op, "rwlock.read"))
    }

    fn write_or_recover(&self, op: &'static str) -> RwLockWriteGuard<'_, T> {
        self.write()
            .unwrap_or_else(|poisoned| recovered(poisoned, op, "rwlock.write"))
    }
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_or_recover(&self, op: &'static str) -> MutexGuard<'_, T> {
        self.lock()
            .unwrap_or_else(|poisoned| recovered(poisoned, op, "mutex.lock"))
    }
}

fn recovered<G>(poisoned: PoisonError<G>, op: &'static str, lock_kind: &'static str) -> G {
    warn!(
        target = "vitae::cache::lock",
        op,
        lock_kind,
        result = "poisoned_recovered",
        "Recovered from poisoned cache lock; contents may be stale"
    );
    poisoned.into_inner()
}
