//! Priority-aware context loading.
//!
//! `load_for_instance` waits only on the CRITICAL tier. HIGH, MEDIUM, and LOW
//! are fetched afterwards by a tracked background task that warms the cache
//! and forwards each tier through [`BackgroundTiers`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use strata_core::models::{FullContext, NewSnapshot, Priority, Snapshot};
use strata_core::{ContextError, ContextResult, Database};

use crate::cache::{CachedTier, MokaTierCache, TierCache, TierKey};
use crate::config::Config;
use crate::registry::InstanceRegistry;

/// Run a blocking store call on tokio's blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> ContextResult<T>
where
    F: FnOnce() -> ContextResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ContextError::store(format!("store task failed: {}", e)))?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// Critical tier returned; the rest is streaming in the background.
    Streaming,
    /// Critical tier returned; background loading is disabled.
    CriticalOnly,
}

/// Result of [`PriorityLoader::load_for_instance`].
#[derive(Debug, Serialize)]
pub struct LoadedContext {
    pub critical_context: Vec<Snapshot>,
    pub project_id: String,
    pub phase_id: Option<i64>,
    pub instance_id: String,
    pub instance_created: bool,
    pub status: LoadStatus,
    pub load_time_ms: u64,
    #[serde(skip)]
    pub background: Option<BackgroundTiers>,
}

/// One deferred tier delivered by the background task.
#[derive(Debug, Clone, Serialize)]
pub struct TierBatch {
    pub priority: Priority,
    pub snapshots: Vec<Snapshot>,
}

/// Receiving end of the background tier stream, in HIGH, MEDIUM, LOW order.
#[derive(Debug)]
pub struct BackgroundTiers {
    rx: mpsc::Receiver<TierBatch>,
}

impl BackgroundTiers {
    /// Next tier, or `None` once the stream is finished or cancelled.
    pub async fn next(&mut self) -> Option<TierBatch> {
        self.rx.recv().await
    }

    pub async fn collect(mut self) -> Vec<TierBatch> {
        let mut batches = Vec::new();
        while let Some(batch) = self.next().await {
            batches.push(batch);
        }
        batches
    }
}

/// Store plus optional cache, shared by the caller path and background tasks.
#[derive(Clone)]
struct TierSource {
    db: Database,
    cache: Option<Arc<dyn TierCache>>,
    /// Bumped after every write; a read that overlaps a write re-invalidates
    /// whatever it just cached.
    writes: Arc<AtomicU64>,
}

impl TierSource {
    /// Cache first, store on miss or cache failure.
    async fn fetch(&self, key: TierKey) -> ContextResult<CachedTier> {
        if let Some(cache) = &self.cache {
            match cache.get(&key) {
                Ok(Some(tier)) => {
                    debug!(
                        project_id = %key.project_id,
                        priority = %key.priority,
                        "tier cache hit"
                    );
                    return Ok(tier);
                }
                Ok(None) => {}
                Err(e) => warn!(project_id = %key.project_id, error = %e, "tier cache read failed"),
            }
        }
        self.read_store(key).await
    }

    /// Read from the store and write the result back to the cache.
    async fn read_store(&self, key: TierKey) -> ContextResult<CachedTier> {
        let seen = self.writes.load(Ordering::SeqCst);
        let db = self.db.clone();
        let query = key.clone();
        let rows = blocking(move || {
            db.select_snapshots(&query.project_id, query.priority, query.phase_id)
        })
        .await?;
        let tier = Arc::new(rows);

        if let Some(cache) = &self.cache {
            let (project_id, priority) = (key.project_id.clone(), key.priority);
            if let Err(e) = cache.put(key, Arc::clone(&tier)) {
                warn!(error = %e, "tier cache write failed");
            } else if self.writes.load(Ordering::SeqCst) != seen {
                self.invalidate(&project_id, priority);
            }
        }
        Ok(tier)
    }

    fn invalidate(&self, project_id: &str, priority: Priority) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate(project_id, priority) {
                warn!(%project_id, %priority, error = %e, "cache invalidation failed");
            }
        }
    }
}

#[derive(Clone)]
pub struct PriorityLoader {
    source: TierSource,
    registry: InstanceRegistry,
    background_tiers: bool,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl PriorityLoader {
    /// Loader without a cache, streaming deferred tiers in the background.
    pub fn new(db: Database, registry: InstanceRegistry) -> Self {
        Self {
            source: TierSource {
                db,
                cache: None,
                writes: Arc::new(AtomicU64::new(0)),
            },
            registry,
            background_tiers: true,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(db: Database, registry: InstanceRegistry, config: &Config) -> Self {
        let loader = Self::new(db, registry).with_background_tiers(config.background_tiers);
        if config.cache.enabled {
            loader.with_cache(Arc::new(MokaTierCache::new(
                config.cache.max_entries,
                config.cache_ttl(),
            )))
        } else {
            loader
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn TierCache>) -> Self {
        self.source.cache = Some(cache);
        self
    }

    pub fn with_background_tiers(mut self, enabled: bool) -> Self {
        self.background_tiers = enabled;
        self
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Register the instance and return the CRITICAL tier.
    pub async fn load_for_instance(
        &self,
        instance_id: &str,
        project_id: &str,
        phase_id: Option<i64>,
    ) -> ContextResult<LoadedContext> {
        let started = Instant::now();

        let registry = self.registry.clone();
        let (iid, pid) = (instance_id.to_string(), project_id.to_string());
        let instance_created = blocking(move || registry.register(&iid, &pid, phase_id)).await?;

        let critical = self
            .source
            .fetch(TierKey::new(project_id, phase_id, Priority::Critical))
            .await?;

        let tokens: i64 = critical.iter().map(|s| s.token_count).sum();
        if tokens > 0 {
            let registry = self.registry.clone();
            let iid = instance_id.to_string();
            if let Err(e) = blocking(move || registry.add_tokens(&iid, tokens)).await {
                warn!(%instance_id, error = %e, "could not record token usage");
            }
        }

        let (status, background) = if self.background_tiers {
            (
                LoadStatus::Streaming,
                Some(self.spawn_deferred(project_id.to_string(), phase_id)),
            )
        } else {
            (LoadStatus::CriticalOnly, None)
        };

        let load_time_ms = started.elapsed().as_millis() as u64;
        debug!(
            %instance_id,
            %project_id,
            critical = critical.len(),
            load_time_ms,
            "critical context loaded"
        );

        Ok(LoadedContext {
            critical_context: Arc::unwrap_or_clone(critical),
            project_id: project_id.to_string(),
            phase_id,
            instance_id: instance_id.to_string(),
            instance_created,
            status,
            load_time_ms,
            background,
        })
    }

    /// Every tier read from the store, written back to the cache.
    pub async fn get_full_context(
        &self,
        project_id: &str,
        phase_id: Option<i64>,
    ) -> ContextResult<FullContext> {
        let mut full = FullContext::default();
        for priority in Priority::ALL {
            let key = TierKey::new(project_id, phase_id, priority);
            let tier = self.source.read_store(key).await?;
            *full.tier_mut(priority) = Arc::unwrap_or_clone(tier);
        }
        Ok(full)
    }

    /// A single tier, served from the cache when possible.
    pub async fn get_tier(
        &self,
        project_id: &str,
        phase_id: Option<i64>,
        priority: Priority,
    ) -> ContextResult<Vec<Snapshot>> {
        let key = TierKey::new(project_id, phase_id, priority);
        let tier = self.source.fetch(key).await?;
        Ok(Arc::unwrap_or_clone(tier))
    }

    /// Append a snapshot and drop the cached copies of its tier.
    pub async fn store_context(&self, snapshot: NewSnapshot) -> ContextResult<i64> {
        let db = self.source.db.clone();
        let project_id = snapshot.project_id.clone();
        let priority = snapshot.priority;
        let snapshot_id = blocking(move || db.insert_snapshot(&snapshot)).await?;

        self.source.writes.fetch_add(1, Ordering::SeqCst);
        self.source.invalidate(&project_id, priority);
        Ok(snapshot_id)
    }

    /// Cancel background tier loads and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Wait for background tier loads without cancelling them.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let finished = tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok();
        self.tracker.reopen();
        finished
    }

    fn spawn_deferred(&self, project_id: String, phase_id: Option<i64>) -> BackgroundTiers {
        let (tx, rx) = mpsc::channel(Priority::DEFERRED.len());
        let source = self.source.clone();
        let token = self.shutdown.child_token();

        self.tracker.spawn(async move {
            for priority in Priority::DEFERRED {
                let key = TierKey::new(project_id.as_str(), phase_id, priority);
                let fetched = tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(%project_id, "background tier load cancelled");
                        return;
                    }
                    fetched = source.fetch(key) => fetched,
                };
                match fetched {
                    Ok(tier) => {
                        let batch = TierBatch {
                            priority,
                            snapshots: Arc::unwrap_or_clone(tier),
                        };
                        // A dropped receiver is fine; the cache is still warmed.
                        let _ = tx.send(batch).await;
                    }
                    Err(e) => {
                        warn!(%project_id, %priority, error = %e, "background tier load failed");
                    }
                }
            }
        });

        BackgroundTiers { rx }
    }
}

impl std::fmt::Debug for PriorityLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityLoader")
            .field("cache", &self.source.cache.is_some())
            .field("background_tiers", &self.background_tiers)
            .field("pending_tasks", &self.tracker.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use serde_json::json;
    use strata_core::models::CreateProjectInput;

    struct BrokenCache;

    impl TierCache for BrokenCache {
        fn get(&self, _: &TierKey) -> Result<Option<CachedTier>, CacheError> {
            Err(CacheError::Unavailable("offline".to_string()))
        }
        fn put(&self, _: TierKey, _: CachedTier) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("offline".to_string()))
        }
        fn invalidate(&self, _: &str, _: Priority) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("offline".to_string()))
        }
    }

    fn loader() -> PriorityLoader {
        let db = Database::open_memory().unwrap();
        db.create_project(&CreateProjectInput::new("P").with_id("P"))
            .unwrap();
        let registry = InstanceRegistry::new(db.clone());
        PriorityLoader::new(db, registry)
    }

    async fn store(loader: &PriorityLoader, priority: Priority, n: i64) -> i64 {
        loader
            .store_context(NewSnapshot::new("P", json!({ "n": n })).priority(priority))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn critical_load_returns_only_critical_rows() {
        let loader = loader();
        store(&loader, Priority::Critical, 1).await;
        store(&loader, Priority::High, 2).await;
        store(&loader, Priority::Critical, 3).await;

        let loaded = loader.load_for_instance("I", "P", None).await.unwrap();
        assert!(loaded.instance_created);
        assert_eq!(loaded.critical_context.len(), 2);
        assert!(loaded
            .critical_context
            .iter()
            .all(|s| s.priority == Priority::Critical));
        assert_eq!(loaded.status, LoadStatus::Streaming);
    }

    #[tokio::test]
    async fn background_stream_yields_deferred_tiers_in_order() {
        let loader = loader();
        store(&loader, Priority::Low, 1).await;
        store(&loader, Priority::High, 2).await;
        store(&loader, Priority::Medium, 3).await;

        let mut loaded = loader.load_for_instance("I", "P", None).await.unwrap();
        let batches = loaded.background.take().unwrap().collect().await;
        let order: Vec<Priority> = batches.iter().map(|b| b.priority).collect();
        assert_eq!(order, Priority::DEFERRED.to_vec());
        assert!(batches.iter().all(|b| b.snapshots.len() == 1));
    }

    #[tokio::test]
    async fn disabled_background_returns_critical_only() {
        let loader = loader().with_background_tiers(false);
        let loaded = loader.load_for_instance("I", "P", None).await.unwrap();
        assert_eq!(loaded.status, LoadStatus::CriticalOnly);
        assert!(loaded.background.is_none());
    }

    #[tokio::test]
    async fn critical_tokens_are_added_to_the_instance() {
        let loader = loader();
        loader
            .store_context(
                NewSnapshot::new("P", json!({})).priority(Priority::Critical).token_count(40),
            )
            .await
            .unwrap();
        loader.load_for_instance("I", "P", None).await.unwrap();
        let instance = loader.registry().get("I").unwrap().unwrap();
        assert_eq!(instance.current_token_usage, 40);
    }

    #[tokio::test]
    async fn store_invalidates_cached_tier() {
        let cache = Arc::new(MokaTierCache::new(64, Duration::from_secs(60)));
        let loader = loader().with_cache(cache);
        store(&loader, Priority::High, 1).await;
        assert_eq!(loader.get_tier("P", None, Priority::High).await.unwrap().len(), 1);

        store(&loader, Priority::High, 2).await;
        assert_eq!(loader.get_tier("P", None, Priority::High).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failing_cache_falls_back_to_store() {
        let loader = loader().with_cache(Arc::new(BrokenCache));
        store(&loader, Priority::Critical, 1).await;

        let loaded = loader.load_for_instance("I", "P", None).await.unwrap();
        assert_eq!(loaded.critical_context.len(), 1);
        let full = loader.get_full_context("P", None).await.unwrap();
        assert_eq!(full.len(), 1);
    }

    #[tokio::test]
    async fn unknown_project_fails_registration() {
        let loader = loader();
        let err = loader.load_for_instance("I", "ghost", None).await.unwrap_err();
        assert!(matches!(err, ContextError::Validation(_)));
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_streams() {
        let cache = Arc::new(MokaTierCache::new(64, Duration::from_secs(60)));
        let loader = loader().with_cache(cache.clone());
        for priority in Priority::ALL {
            store(&loader, priority, 1).await;
        }

        // Current-thread runtime: the deferred task has not been polled yet,
        // so it observes the cancellation before its first fetch.
        let mut loaded = loader.load_for_instance("I", "P", None).await.unwrap();
        assert_eq!(loaded.critical_context.len(), 1);
        loader.shutdown().await;

        let batches = loaded.background.take().unwrap().collect().await;
        assert!(batches.len() < Priority::DEFERRED.len());
        assert!(batches.is_empty());
        for priority in Priority::DEFERRED {
            assert!(cache.get(&TierKey::new("P", None, priority)).unwrap().is_none());
        }
    }
}
