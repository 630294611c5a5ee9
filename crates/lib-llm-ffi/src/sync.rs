//! Small synchronization helpers.

use std::sync::{Mutex, MutexGuard};

/// Helper trait to recover from poisoned mutexes.
///
/// A panic while holding one of the bridge's bookkeeping locks must not turn
/// every later close or cancel into a panic as well, so the data is used
/// as-is after logging.
pub(crate) trait RecoverMutex<T> {
    fn lock_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> RecoverMutex<T> for Mutex<T> {
    fn lock_recover(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Mutex was poisoned, recovering data");
            poisoned.into_inner()
        })
    }
}
