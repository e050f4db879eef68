use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn read_guard<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                lock_kind = "rwlock.read",
                "recovered from poisoned cache lock; state may lag a panicked writer"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn write_guard<'a, T>(lock: &'a RwLock<T>, op: &'static str) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                lock_kind = "rwlock.write",
                "recovered from poisoned cache lock; state may lag a panicked writer"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn mutex_guard<'a, T>(lock: &'a Mutex<T>, op: &'static str) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                lock_kind = "mutex.lock",
                "recovered from poisoned cache lock; state may lag a panicked writer"
            );
            poisoned.into_inner()
        }
    }
}
