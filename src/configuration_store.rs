//! A thread-safe in-memory cache for the currently active experiment list. [`ExperimentCache`]
//! provides concurrent access for readers (bucketing) and writers (the fetcher and the poller
//! thread).
use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::{
    clock::{Clock, SystemClock},
    experiment::{ConfigSource, Experiment},
};

/// A cached experiment list together with the time it was fetched.
///
/// Entries are immutable and replaced completely, so a reader holding an `Arc<CacheEntry>` sees a
/// consistent snapshot.
#[derive(Debug)]
pub struct CacheEntry {
    pub experiments: Arc<Vec<Experiment>>,
    pub source: ConfigSource,
    pub fetched_at: DateTime<Utc>,
}

/// `ExperimentCache` holds at most one [`CacheEntry`] and knows when it goes stale.
pub struct ExperimentCache {
    entry: RwLock<Option<Arc<CacheEntry>>>,
    ttl: Duration,
    clock: Box<dyn Clock + Send + Sync>,
}

impl ExperimentCache {
    /// Default time-to-live of a cache entry.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

    /// Create an empty cache with the default TTL and the system clock.
    pub fn new() -> Self {
        ExperimentCache::with_clock(Self::DEFAULT_TTL, SystemClock)
    }

    pub fn with_clock(ttl: Duration, clock: impl Clock + Send + Sync + 'static) -> Self {
        ExperimentCache {
            entry: RwLock::new(None),
            ttl,
            clock: Box::new(clock),
        }
    }

    /// Get the cached entry regardless of its age. Returns `None` if nothing was stored yet.
    pub fn get(&self) -> Option<Arc<CacheEntry>> {
        // self.entry.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen. Still,
        // using .ok()? here to not crash the app.
        let entry = self.entry.read().ok()?;
        entry.clone()
    }

    /// Get the cached entry if it is younger than the TTL.
    pub fn get_fresh(&self) -> Option<Arc<CacheEntry>> {
        let entry = self.get()?;
        let age = self.clock.now().signed_duration_since(entry.fetched_at);
        // A negative age (clock moved backwards) counts as fresh.
        match age.to_std() {
            Ok(age) if age >= self.ttl => None,
            _ => Some(entry),
        }
    }

    /// Replace the cached list, stamping it with the current time. Returns the new entry.
    pub fn set(&self, experiments: Vec<Experiment>, source: ConfigSource) -> Arc<CacheEntry> {
        // Constructing new value before requesting the lock to minimize lock span.
        let entry = Arc::new(CacheEntry {
            experiments: Arc::new(experiments),
            source,
            fetched_at: self.clock.now(),
        });

        if let Ok(mut slot) = self.entry.write() {
            *slot = Some(entry.clone());
        }
        entry
    }

    /// Drop the cached entry, forcing the next read to fetch.
    pub fn clear(&self) {
        if let Ok(mut slot) = self.entry.write() {
            *slot = None;
        }
    }
}

impl Default for ExperimentCache {
    fn default() -> Self {
        ExperimentCache::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::ExperimentCache;
    use crate::{
        clock::test_clock::ManualClock,
        experiment::{fallback_experiments, ConfigSource},
    };

    #[test]
    fn can_set_entry_from_another_thread() {
        let cache = Arc::new(ExperimentCache::new());

        assert!(cache.get().is_none());

        {
            let cache = cache.clone();
            let _ = std::thread::spawn(move || {
                cache.set(fallback_experiments(), ConfigSource::Fallback);
            })
            .join();
        }

        assert!(cache.get().is_some());
    }

    #[test]
    fn entry_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new());
        let cache = ExperimentCache::with_clock(Duration::from_secs(300), clock.clone());

        cache.set(fallback_experiments(), ConfigSource::EdgeConfig);
        assert!(cache.get_fresh().is_some());

        clock.advance(Duration::from_secs(299));
        assert!(cache.get_fresh().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(cache.get_fresh().is_none());
        // Stale entries are still readable.
        assert_eq!(cache.get().unwrap().source, ConfigSource::EdgeConfig);
    }

    #[test]
    fn clear_drops_entry() {
        let cache = ExperimentCache::new();
        cache.set(fallback_experiments(), ConfigSource::Fallback);

        cache.clear();

        assert!(cache.get().is_none());
    }
}
