//! Tier cache in front of the snapshot store.
//!
//! The cache is never authoritative: every failure is reported as a
//! [`CacheError`], which the loader logs and treats as a miss.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use thiserror::Error;

use strata_core::models::{Priority, Snapshot};

/// Cache key: one tier of one project, optionally scoped to a phase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TierKey {
    pub project_id: String,
    pub phase_id: Option<i64>,
    pub priority: Priority,
}

impl TierKey {
    pub fn new(project_id: impl Into<String>, phase_id: Option<i64>, priority: Priority) -> Self {
        Self {
            project_id: project_id.into(),
            phase_id,
            priority,
        }
    }
}

/// A tier as held by the cache; shared between cache and readers.
pub type CachedTier = Arc<Vec<Snapshot>>;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The backend could not be reached. The in-process cache never returns
    /// this; it is for remote implementations of [`TierCache`].
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache invalidation rejected: {0}")]
    Invalidation(String),
}

pub trait TierCache: Send + Sync {
    fn get(&self, key: &TierKey) -> Result<Option<CachedTier>, CacheError>;

    fn put(&self, key: TierKey, tier: CachedTier) -> Result<(), CacheError>;

    /// Drop every cached phase of `priority` for `project_id`.
    fn invalidate(&self, project_id: &str, priority: Priority) -> Result<(), CacheError>;
}

/// In-process cache on `moka`, bounded by entry count and TTL.
#[derive(Clone)]
pub struct MokaTierCache {
    inner: Cache<TierKey, CachedTier>,
}

impl MokaTierCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .support_invalidation_closures()
            .build();
        Self { inner }
    }
}

impl std::fmt::Debug for MokaTierCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaTierCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

impl TierCache for MokaTierCache {
    fn get(&self, key: &TierKey) -> Result<Option<CachedTier>, CacheError> {
        Ok(self.inner.get(key))
    }

    fn put(&self, key: TierKey, tier: CachedTier) -> Result<(), CacheError> {
        self.inner.insert(key, tier);
        Ok(())
    }

    fn invalidate(&self, project_id: &str, priority: Priority) -> Result<(), CacheError> {
        let project_id = project_id.to_string();
        self.inner
            .invalidate_entries_if(move |key, _| {
                key.priority == priority && key.project_id == project_id
            })
            .map(|_| ())
            .map_err(|e| CacheError::Invalidation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn snapshot(project: &str, seq: i64, priority: Priority) -> Snapshot {
        Snapshot {
            snapshot_id: seq,
            project_id: project.to_string(),
            phase_id: None,
            sequence_number: seq,
            priority,
            content_type: "code".to_string(),
            token_count: 1,
            content: json!({ "seq": seq }),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn put_then_get_returns_the_tier() {
        let cache = MokaTierCache::new(16, Duration::from_secs(60));
        let key = TierKey::new("P", None, Priority::Critical);
        cache
            .put(key.clone(), Arc::new(vec![snapshot("P", 1, Priority::Critical)]))
            .unwrap();

        let hit = cache.get(&key).unwrap().unwrap();
        assert_eq!(hit.len(), 1);
        assert!(cache
            .get(&TierKey::new("P", Some(1), Priority::Critical))
            .unwrap()
            .is_none());
    }

    #[test]
    fn invalidate_drops_all_phases_of_one_tier() {
        let cache = MokaTierCache::new(16, Duration::from_secs(60));
        let tier = Arc::new(vec![snapshot("P", 1, Priority::High)]);
        for phase in [None, Some(1), Some(2)] {
            cache
                .put(TierKey::new("P", phase, Priority::High), tier.clone())
                .unwrap();
        }
        let low = TierKey::new("P", None, Priority::Low);
        let other = TierKey::new("Q", None, Priority::High);
        cache.put(low.clone(), tier.clone()).unwrap();
        cache.put(other.clone(), tier.clone()).unwrap();

        cache.invalidate("P", Priority::High).unwrap();

        for phase in [None, Some(1), Some(2)] {
            assert!(cache
                .get(&TierKey::new("P", phase, Priority::High))
                .unwrap()
                .is_none());
        }
        assert!(cache.get(&low).unwrap().is_some());
        assert!(cache.get(&other).unwrap().is_some());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = MokaTierCache::new(16, Duration::from_millis(20));
        let key = TierKey::new("P", None, Priority::Medium);
        cache.put(key.clone(), Arc::new(Vec::new())).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get(&key).unwrap().is_none());
    }
}
