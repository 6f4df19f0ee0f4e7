//! Small synchronization helpers shared across the runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Global counter for worker identifiers reported in device info.
static WORKER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique worker id for a scheduler or bus worker task.
pub(crate) fn next_worker_id() -> u64 {
    WORKER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// The runtime's short critical sections only mutate self-consistent queue
/// and table state, so continuing past a poisoned lock is safe and keeps
/// worker tasks alive.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ids_are_unique() {
        let a = next_worker_id();
        let b = next_worker_id();
        assert_ne!(a, b);
    }

    #[test]
    fn lock_recovers_from_poison() {
        let mutex = std::sync::Arc::new(Mutex::new(7u32));
        let clone = std::sync::Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison the lock");
        })
        .join();
        assert_eq!(*lock(&mutex), 7);
    }
}
