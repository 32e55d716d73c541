use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use crate::core::error::Result;
use crate::optimizer::benchmark::Executable;

/// Bounded cache of compiled trials, keyed by a hash of (source, target arch).
pub struct TrialCache {
    entries: Mutex<LruCache<u64, Executable>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl TrialCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Returns the cached executable or compiles it. Compilation runs outside the lock,
    /// so two racing misses may both compile; the later insert wins.
    pub fn get_or_compile<F>(&self, key: u64, compile: F) -> Result<Executable>
    where
        F: FnOnce() -> Result<Executable>,
    {
        if let Some(exe) = self.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(exe.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let exe = compile()?;
        self.lock().put(key, exe.clone());
        Ok(exe)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<u64, Executable>> {
        // A panic while holding the lock leaves the cache structurally intact.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TuneError;

    fn exe(handle: u64) -> Executable {
        Executable { handle, arch: "sm_86".into(), kernel_name: "k".into(), instruction_count: 1 }
    }

    #[test]
    fn test_hits_and_eviction() {
        let cache = TrialCache::new(2);
        cache.get_or_compile(1, || Ok(exe(1))).unwrap();
        cache.get_or_compile(2, || Ok(exe(2))).unwrap();
        assert_eq!(cache.get_or_compile(1, || Ok(exe(99))).unwrap().handle, 1);
        // key 2 is least recently used and gets evicted
        cache.get_or_compile(3, || Ok(exe(3))).unwrap();
        assert_eq!(cache.get_or_compile(2, || Ok(exe(22))).unwrap().handle, 22);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 4);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let cache = TrialCache::new(4);
        let err = cache.get_or_compile(7, || Err(TuneError::CompileFailure("bad".into())));
        assert!(err.is_err());
        assert!(cache.is_empty());
    }
}
