use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use super::projects::project_exists_in;
use super::{invalid_text, parse_timestamp, timestamp, Database};
use crate::error::{ContextError, ContextResult};
use crate::models::{Instance, InstanceStatus, RegisterInstanceInput};

const INSTANCE_COLUMNS: &str = "instance_id, project_id, phase_id, hostname, process_id, \
     current_token_usage, status, last_heartbeat";

impl Database {
    /// Insert an active instance, or reactivate and refresh an existing one.
    ///
    /// Returns `true` when a new row was created.
    pub fn upsert_instance(&self, input: &RegisterInstanceInput) -> ContextResult<bool> {
        if input.instance_id.trim().is_empty() {
            return Err(ContextError::validation("instance_id must not be empty"));
        }
        let now = timestamp(Utc::now());

        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if !project_exists_in(&tx, &input.project_id)? {
                return Err(ContextError::validation(format!(
                    "unknown project '{}'",
                    input.project_id
                )));
            }

            let existed: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM active_instances WHERE instance_id = ?1)",
                params![input.instance_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO active_instances
                    (instance_id, project_id, phase_id, hostname, process_id,
                     status, current_token_usage, last_heartbeat)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active', 0, ?6)
                 ON CONFLICT(instance_id) DO UPDATE SET
                    status = 'active',
                    last_heartbeat = excluded.last_heartbeat",
                params![
                    input.instance_id,
                    input.project_id,
                    input.phase_id,
                    input.hostname,
                    input.process_id,
                    now,
                ],
            )?;
            tx.commit()?;

            if existed {
                debug!(instance_id = %input.instance_id, "instance refreshed");
            } else {
                info!(
                    instance_id = %input.instance_id,
                    project_id = %input.project_id,
                    "instance registered"
                );
            }
            Ok(!existed)
        })
    }

    /// Refresh the heartbeat of an active instance. Completed instances are
    /// left untouched; returns whether a row was updated.
    pub fn update_heartbeat(&self, instance_id: &str) -> ContextResult<bool> {
        let now = timestamp(Utc::now());
        self.with_connection(|conn| {
            let updated = conn.execute(
                "UPDATE active_instances SET last_heartbeat = ?2
                 WHERE instance_id = ?1 AND status = 'active'",
                params![instance_id, now],
            )?;
            Ok(updated == 1)
        })
    }

    /// Reset the token counter. Snapshots are not touched.
    pub fn clear_tokens(&self, instance_id: &str) -> ContextResult<bool> {
        self.with_connection(|conn| {
            let updated = conn.execute(
                "UPDATE active_instances SET current_token_usage = 0 WHERE instance_id = ?1",
                params![instance_id],
            )?;
            Ok(updated == 1)
        })
    }

    pub fn add_token_usage(&self, instance_id: &str, tokens: i64) -> ContextResult<bool> {
        self.with_connection(|conn| {
            let updated = conn.execute(
                "UPDATE active_instances
                 SET current_token_usage = current_token_usage + ?2
                 WHERE instance_id = ?1",
                params![instance_id, tokens],
            )?;
            Ok(updated == 1)
        })
    }

    pub fn mark_completed(&self, instance_id: &str) -> ContextResult<bool> {
        self.with_connection(|conn| {
            let updated = conn.execute(
                "UPDATE active_instances SET status = 'completed' WHERE instance_id = ?1",
                params![instance_id],
            )?;
            Ok(updated == 1)
        })
    }

    pub fn get_instance(&self, instance_id: &str) -> ContextResult<Option<Instance>> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM active_instances WHERE instance_id = ?1",
                INSTANCE_COLUMNS
            );
            Ok(conn
                .query_row(&sql, params![instance_id], row_to_instance)
                .optional()?)
        })
    }

    /// Instances of a project, most recent heartbeat first.
    pub fn list_project_instances(&self, project_id: &str) -> ContextResult<Vec<Instance>> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM active_instances WHERE project_id = ?1
                 ORDER BY last_heartbeat DESC, instance_id",
                INSTANCE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let instances = stmt
                .query_map(params![project_id], row_to_instance)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(instances)
        })
    }

    /// Mark active instances whose last heartbeat is older than `cutoff` as
    /// completed. Returns how many were reaped.
    pub fn reap_stale_instances(&self, cutoff: DateTime<Utc>) -> ContextResult<usize> {
        let cutoff = timestamp(cutoff);
        self.with_connection(|conn| {
            let reaped = conn.execute(
                "UPDATE active_instances SET status = 'completed'
                 WHERE status = 'active' AND last_heartbeat < ?1",
                params![cutoff],
            )?;
            if reaped > 0 {
                info!(reaped, "stale instances marked completed");
            }
            Ok(reaped)
        })
    }
}

fn row_to_instance(row: &Row) -> rusqlite::Result<Instance> {
    let status: String = row.get(6)?;
    let last_heartbeat: String = row.get(7)?;
    Ok(Instance {
        instance_id: row.get(0)?,
        project_id: row.get(1)?,
        phase_id: row.get(2)?,
        hostname: row.get(3)?,
        process_id: row.get(4)?,
        current_token_usage: row.get(5)?,
        status: InstanceStatus::from_str(&status)
            .ok_or_else(|| invalid_text(6, format!("unknown instance status '{}'", status)))?,
        last_heartbeat: parse_timestamp(7, &last_heartbeat)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CreateProjectInput;

    fn setup() -> Database {
        let db = Database::open_memory().unwrap();
        db.create_project(&CreateProjectInput::new("P").with_id("P"))
            .unwrap();
        db
    }

    fn input(id: &str) -> RegisterInstanceInput {
        RegisterInstanceInput {
            instance_id: id.to_string(),
            project_id: "P".to_string(),
            phase_id: None,
            hostname: "box".to_string(),
            process_id: 42,
        }
    }

    #[test]
    fn upsert_twice_keeps_one_active_row() {
        let db = setup();
        assert!(db.upsert_instance(&input("I")).unwrap());
        let first = db.get_instance("I").unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!db.upsert_instance(&input("I")).unwrap());

        let instances = db.list_project_instances("P").unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].status, InstanceStatus::Active);
        assert!(instances[0].last_heartbeat > first.last_heartbeat);
    }

    #[test]
    fn upsert_reactivates_completed_instance() {
        let db = setup();
        db.upsert_instance(&input("I")).unwrap();
        db.mark_completed("I").unwrap();
        db.upsert_instance(&input("I")).unwrap();
        assert_eq!(
            db.get_instance("I").unwrap().unwrap().status,
            InstanceStatus::Active
        );
    }

    #[test]
    fn unknown_project_is_rejected() {
        let db = setup();
        let mut bad = input("I");
        bad.project_id = "ghost".to_string();
        let err = db.upsert_instance(&bad).unwrap_err();
        assert!(matches!(err, ContextError::Validation(_)));
        assert!(db.get_instance("I").unwrap().is_none());
    }

    #[test]
    fn heartbeat_skips_completed_instances() {
        let db = setup();
        db.upsert_instance(&input("I")).unwrap();
        assert!(db.update_heartbeat("I").unwrap());

        db.mark_completed("I").unwrap();
        assert!(!db.update_heartbeat("I").unwrap());
        assert!(!db.update_heartbeat("missing").unwrap());
    }

    #[test]
    fn token_usage_accumulates_and_clears() {
        let db = setup();
        db.upsert_instance(&input("I")).unwrap();
        db.add_token_usage("I", 120).unwrap();
        db.add_token_usage("I", 30).unwrap();
        assert_eq!(db.get_instance("I").unwrap().unwrap().current_token_usage, 150);

        assert!(db.clear_tokens("I").unwrap());
        assert_eq!(db.get_instance("I").unwrap().unwrap().current_token_usage, 0);
        assert!(!db.clear_tokens("missing").unwrap());
    }

    #[test]
    fn reaper_only_touches_stale_active_rows() {
        let db = setup();
        db.upsert_instance(&input("old")).unwrap();
        db.upsert_instance(&input("done")).unwrap();
        db.mark_completed("done").unwrap();

        // Nothing is older than a cutoff in the past.
        let reaped = db
            .reap_stale_instances(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(reaped, 0);

        let reaped = db
            .reap_stale_instances(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(
            db.get_instance("old").unwrap().unwrap().status,
            InstanceStatus::Completed
        );
    }
}
