use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use tracing::debug;

use super::projects::project_exists_in;
use super::{invalid_text, parse_timestamp, timestamp, Database};
use crate::error::{ContextError, ContextResult};
use crate::models::{NewSnapshot, Priority, Snapshot};

const SNAPSHOT_COLUMNS: &str = "snapshot_id, project_id, phase_id, sequence_number, priority, \
     content_type, token_count, content, metadata, created_at";

impl Database {
    /// Append a snapshot and return its id.
    ///
    /// The sequence number is read and written inside one immediate
    /// transaction, so concurrent writers for a project are serialized and the
    /// later committer always gets the larger number.
    pub fn insert_snapshot(&self, input: &NewSnapshot) -> ContextResult<i64> {
        if input.content_type.trim().is_empty() {
            return Err(ContextError::validation("content_type must not be empty"));
        }
        let content = input.content.to_string();
        let metadata = input.metadata.as_ref().map(Value::to_string);
        let token_count = input.effective_token_count();
        let now = timestamp(Utc::now());

        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if !project_exists_in(&tx, &input.project_id)? {
                return Err(ContextError::validation(format!(
                    "unknown project '{}'",
                    input.project_id
                )));
            }

            let sequence_number: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence_number), 0) + 1
                 FROM context_snapshots WHERE project_id = ?1",
                params![input.project_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO context_snapshots
                    (project_id, phase_id, sequence_number, content_type, priority,
                     token_count, content, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    input.project_id,
                    input.phase_id,
                    sequence_number,
                    input.content_type,
                    input.priority.as_str(),
                    token_count,
                    content,
                    metadata,
                    now,
                ],
            )?;
            let snapshot_id = tx.last_insert_rowid();
            tx.commit()?;

            debug!(
                snapshot_id,
                sequence_number,
                project_id = %input.project_id,
                priority = %input.priority,
                "snapshot stored"
            );
            Ok(snapshot_id)
        })
    }

    /// Snapshots of one tier in ascending sequence order.
    ///
    /// With a phase, rows of that phase and phase-less rows match; without
    /// one, only phase-less rows match.
    pub fn select_snapshots(
        &self,
        project_id: &str,
        priority: Priority,
        phase_id: Option<i64>,
    ) -> ContextResult<Vec<Snapshot>> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM context_snapshots
                 WHERE project_id = ?1 AND priority = ?2
                   AND (phase_id = ?3 OR phase_id IS NULL)
                 ORDER BY sequence_number ASC",
                SNAPSHOT_COLUMNS
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let snapshots = stmt
                .query_map(
                    params![project_id, priority.as_str(), phase_id],
                    row_to_snapshot,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(snapshots)
        })
    }

    pub fn count_snapshots(
        &self,
        project_id: &str,
        priority: Priority,
        phase_id: Option<i64>,
    ) -> ContextResult<usize> {
        self.with_connection(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM context_snapshots
                 WHERE project_id = ?1 AND priority = ?2
                   AND (phase_id = ?3 OR phase_id IS NULL)",
                params![project_id, priority.as_str(), phase_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    /// Every snapshot of a project, all tiers and phases, in sequence order.
    pub fn list_snapshots(&self, project_id: &str) -> ContextResult<Vec<Snapshot>> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM context_snapshots WHERE project_id = ?1
                 ORDER BY sequence_number ASC",
                SNAPSHOT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let snapshots = stmt
                .query_map(params![project_id], row_to_snapshot)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(snapshots)
        })
    }

    pub fn get_snapshot(&self, snapshot_id: i64) -> ContextResult<Snapshot> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM context_snapshots WHERE snapshot_id = ?1",
                SNAPSHOT_COLUMNS
            );
            conn.query_row(&sql, params![snapshot_id], row_to_snapshot)
                .optional()?
                .ok_or_else(|| ContextError::not_found(format!("snapshot {}", snapshot_id)))
        })
    }
}

fn row_to_snapshot(row: &Row) -> rusqlite::Result<Snapshot> {
    let priority: String = row.get(4)?;
    let content: String = row.get(7)?;
    let metadata: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;

    Ok(Snapshot {
        snapshot_id: row.get(0)?,
        project_id: row.get(1)?,
        phase_id: row.get(2)?,
        sequence_number: row.get(3)?,
        priority: Priority::from_str(&priority)
            .ok_or_else(|| invalid_text(4, format!("unknown priority '{}'", priority)))?,
        content_type: row.get(5)?,
        token_count: row.get(6)?,
        content: parse_json(7, &content)?,
        metadata: metadata.map(|m| parse_json(8, &m)).transpose()?,
        created_at: parse_timestamp(9, &created_at)?,
    })
}

fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<Value> {
    serde_json::from_str(raw).map_err(|e| invalid_text(idx, e.to_string()))
}
