//! Tracks live worker instances: registration, heartbeats, token counters.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strata_core::models::{Instance, RegisterInstanceInput};
use strata_core::{ContextError, ContextResult, Database};

use crate::env;

/// Identity of the host process, stamped onto every registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    pub hostname: String,
    pub process_id: u32,
}

impl HostInfo {
    pub fn detect() -> Self {
        Self {
            hostname: env::hostname(),
            process_id: std::process::id(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceRegistry {
    db: Database,
    host: HostInfo,
}

impl InstanceRegistry {
    pub fn new(db: Database) -> Self {
        Self::with_host(db, HostInfo::detect())
    }

    pub fn with_host(db: Database, host: HostInfo) -> Self {
        Self { db, host }
    }

    pub fn host(&self) -> &HostInfo {
        &self.host
    }

    /// Upsert an `active` row. Returns `true` when the instance is new.
    pub fn register(
        &self,
        instance_id: &str,
        project_id: &str,
        phase_id: Option<i64>,
    ) -> ContextResult<bool> {
        self.db.upsert_instance(&RegisterInstanceInput {
            instance_id: instance_id.to_string(),
            project_id: project_id.to_string(),
            phase_id,
            hostname: self.host.hostname.clone(),
            process_id: i64::from(self.host.process_id),
        })
    }

    /// Refresh the heartbeat. Failures are logged, never returned; the result
    /// says whether an active row was touched.
    pub fn heartbeat(&self, instance_id: &str) -> bool {
        match self.db.update_heartbeat(instance_id) {
            Ok(true) => true,
            Ok(false) => {
                debug!(%instance_id, "heartbeat skipped: instance missing or completed");
                false
            }
            Err(e) => {
                warn!(%instance_id, error = %e, "heartbeat failed");
                false
            }
        }
    }

    pub fn clear_tokens(&self, instance_id: &str) -> ContextResult<bool> {
        self.db.clear_tokens(instance_id)
    }

    pub fn add_tokens(&self, instance_id: &str, tokens: i64) -> ContextResult<bool> {
        self.db.add_token_usage(instance_id, tokens)
    }

    pub fn complete(&self, instance_id: &str) -> ContextResult<bool> {
        self.db.mark_completed(instance_id)
    }

    pub fn get(&self, instance_id: &str) -> ContextResult<Option<Instance>> {
        self.db.get_instance(instance_id)
    }

    pub fn list_project_instances(&self, project_id: &str) -> ContextResult<Vec<Instance>> {
        self.db.list_project_instances(project_id)
    }

    /// Complete every active instance silent for longer than `threshold`.
    pub fn reap_stale(&self, threshold: Duration) -> ContextResult<usize> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| ContextError::validation(format!("stale threshold out of range: {}", e)))?;
        let cutoff = Utc::now()
            .checked_sub_signed(threshold)
            .ok_or_else(|| {
                ContextError::validation("stale threshold reaches before the supported date range")
            })?;
        self.db.reap_stale_instances(cutoff)
    }

    /// Sweep stale instances every `interval` until `token` is cancelled.
    pub fn spawn_reaper(
        &self,
        interval: Duration,
        threshold: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("instance reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let sweeper = registry.clone();
                        let sweep =
                            tokio::task::spawn_blocking(move || sweeper.reap_stale(threshold));
                        match sweep.await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(error = %e, "reaper sweep failed"),
                            Err(e) => warn!(error = %e, "reaper sweep panicked"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::models::{CreateProjectInput, InstanceStatus};

    fn registry() -> InstanceRegistry {
        let db = Database::open_memory().unwrap();
        db.create_project(&CreateProjectInput::new("P").with_id("P"))
            .unwrap();
        InstanceRegistry::with_host(
            db,
            HostInfo {
                hostname: "test-host".to_string(),
                process_id: 7,
            },
        )
    }

    #[test]
    fn register_stamps_host_identity() {
        let registry = registry();
        assert!(registry.register("I", "P", Some(2)).unwrap());
        let instance = registry.get("I").unwrap().unwrap();
        assert_eq!(instance.hostname, "test-host");
        assert_eq!(instance.process_id, 7);
        assert_eq!(instance.phase_id, Some(2));
    }

    #[test]
    fn heartbeat_on_unknown_instance_is_not_an_error() {
        let registry = registry();
        assert!(!registry.heartbeat("ghost"));
    }

    #[test]
    fn reap_with_zero_threshold_completes_active_instances() {
        let registry = registry();
        registry.register("I", "P", None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.reap_stale(Duration::ZERO).unwrap(), 1);
        assert_eq!(
            registry.get("I").unwrap().unwrap().status,
            InstanceStatus::Completed
        );
        assert!(!registry.heartbeat("I"));
    }

    #[test]
    fn huge_threshold_is_a_validation_error() {
        let registry = registry();
        registry.register("I", "P", None).unwrap();
        let err = registry
            .reap_stale(Duration::from_secs(9_000_000_000_000))
            .unwrap_err();
        assert!(matches!(err, ContextError::Validation(_)));
        assert_eq!(
            registry.get("I").unwrap().unwrap().status,
            InstanceStatus::Active
        );
    }

    #[tokio::test]
    async fn reaper_task_sweeps_and_stops_on_cancel() {
        let registry = registry();
        registry.register("I", "P", None).unwrap();

        let token = CancellationToken::new();
        let handle = registry.spawn_reaper(
            Duration::from_millis(10),
            Duration::ZERO,
            token.clone(),
        );

        let mut completed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if registry.get("I").unwrap().unwrap().status == InstanceStatus::Completed {
                completed = true;
                break;
            }
        }
        token.cancel();
        handle.await.unwrap();
        assert!(completed);
    }
}
