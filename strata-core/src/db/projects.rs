use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{parse_timestamp, timestamp, Database};
use crate::error::{ContextError, ContextResult};
use crate::models::{CreateProjectInput, Project};

const PROJECT_COLUMNS: &str = "project_id, name, description, total_units, created_at";

impl Database {
    /// Create a project, or return the existing one when the id is taken.
    ///
    /// Returns the project id and whether a row was inserted.
    pub fn create_project(&self, input: &CreateProjectInput) -> ContextResult<(String, bool)> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(ContextError::validation("project name must not be empty"));
        }
        let project_id = match input.project_id.as_deref().map(str::trim) {
            Some("") => return Err(ContextError::validation("project_id must not be empty")),
            Some(id) => id.to_string(),
            None => format!("proj_{}", Uuid::new_v4().simple()),
        };
        let now = timestamp(Utc::now());

        self.with_connection(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO projects (project_id, name, description, total_units, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(project_id) DO NOTHING",
                params![project_id, name, input.description, input.total_units, now],
            )?;
            if inserted == 1 {
                info!(%project_id, name, "project created");
            } else {
                debug!(%project_id, "project already exists");
            }
            Ok((project_id, inserted == 1))
        })
    }

    pub fn get_project(&self, project_id: &str) -> ContextResult<Option<Project>> {
        self.with_connection(|conn| {
            let sql = format!("SELECT {} FROM projects WHERE project_id = ?1", PROJECT_COLUMNS);
            Ok(conn
                .query_row(&sql, params![project_id], row_to_project)
                .optional()?)
        })
    }

    pub fn project_exists(&self, project_id: &str) -> ContextResult<bool> {
        self.with_connection(|conn| Ok(project_exists_in(conn, project_id)?))
    }

    pub fn list_projects(&self) -> ContextResult<Vec<Project>> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {} FROM projects ORDER BY created_at, project_id",
                PROJECT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let projects = stmt
                .query_map([], row_to_project)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(projects)
        })
    }
}

pub(super) fn project_exists_in(conn: &Connection, project_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM projects WHERE project_id = ?1)",
        params![project_id],
        |row| row.get(0),
    )
}

fn row_to_project(row: &Row) -> rusqlite::Result<Project> {
    let created_at: String = row.get(4)?;
    Ok(Project {
        project_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        total_units: row.get(3)?,
        created_at: parse_timestamp(4, &created_at)?,
    })
}
