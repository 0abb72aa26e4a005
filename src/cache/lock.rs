use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock `lock`, recovering the guard if a previous holder panicked.
///
/// Store state is only mutated inside a batch, and a panicking batch is rolled
/// back before its guard drops, so a recovered guard holds the last
/// fully-applied state.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned store lock"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn recovers_poisoned_mutex() {
        let lock = Mutex::new(7_u32);

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("first lock");
            panic!("poison");
        }));
        assert!(result.is_err());
        assert!(lock.is_poisoned());

        let mut guard = mutex_lock(&lock, "cache::lock", "test");
        *guard += 1;
        assert_eq!(*guard, 8);
    }
}
