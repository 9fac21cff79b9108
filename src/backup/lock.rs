use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Process-wide archive operation lock.
///
/// Every mutating archive operation (backup create, restore, version save,
/// version restore, scheduled run) holds this lock for its full duration so
/// only one archive mutation runs at a time. Read paths never take it.
#[derive(Clone, Debug, Default)]
pub struct OpLock {
    inner: Arc<Mutex<()>>,
}

impl OpLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the lock can be taken, recovering a poisoned mutex.
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn serializes_concurrent_holders() {
        let lock = OpLock::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let active = active.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    let _guard = lock.acquire();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_the_same_mutex() {
        let lock = OpLock::new();
        let clone = lock.clone();

        let _guard = lock.acquire();
        let other = std::thread::spawn(move || clone.inner.try_lock().is_err());
        assert!(other.join().unwrap());
    }
}
