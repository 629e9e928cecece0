//! Time-bounded cache for expensive external lookups (weather observations).

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Default time-to-live for cached observations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// TTL-bounded map from a key to a cloned value.
///
/// `get` returns the stored value only while `now - stored_at < timeout`.
/// Expired entries are dropped lazily on lookup.
pub struct ObservationCache<T> {
    timeout: Duration,
    entries: Mutex<HashMap<String, (Instant, T)>>,
}

impl<T: Clone> ObservationCache<T> {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((stored_at, obj)) if stored_at.elapsed() < self.timeout => Some(obj.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn store(&self, key: &str, obj: T) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), (Instant::now(), obj));
    }

    /// Return the cached value or compute, cache, and return a fresh one.
    /// Errors from `fetch` are returned uncached.
    pub fn get_or_try_insert<E>(&self, key: &str, fetch: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let fresh = fetch()?;
        self.store(key, fresh.clone());
        Ok(fresh)
    }
}

impl<T: Clone> Default for ObservationCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_entry_is_returned() {
        let cache = ObservationCache::new();
        cache.store("PAFA", 12.5);
        assert_eq!(cache.get("PAFA"), Some(12.5));
        assert_eq!(cache.get("PANC"), None);
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let cache = ObservationCache::with_timeout(Duration::ZERO);
        cache.store("PAFA", 12.5);
        assert_eq!(cache.get("PAFA"), None);
    }

    #[test]
    fn test_get_or_try_insert_fetches_once() {
        let cache = ObservationCache::new();
        let mut calls = 0;
        for _ in 0..3 {
            let v: Result<f64, ()> = cache.get_or_try_insert("k", || {
                calls += 1;
                Ok(1.0)
            });
            assert_eq!(v, Ok(1.0));
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_fetch_error_not_cached() {
        let cache: ObservationCache<f64> = ObservationCache::new();
        let r: Result<f64, &str> = cache.get_or_try_insert("k", || Err("offline"));
        assert_eq!(r, Err("offline"));
        assert_eq!(cache.get("k"), None);
    }
}
