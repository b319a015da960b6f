pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    project_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    total_units INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS context_snapshots (
    snapshot_id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL REFERENCES projects(project_id),
    phase_id INTEGER,
    sequence_number INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    priority TEXT NOT NULL CHECK (priority IN ('CRITICAL', 'HIGH', 'MEDIUM', 'LOW')),
    token_count INTEGER NOT NULL DEFAULT 0,
    content TEXT NOT NULL CHECK (json_valid(content)),
    metadata TEXT CHECK (metadata IS NULL OR json_valid(metadata)),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS active_instances (
    instance_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(project_id),
    phase_id INTEGER,
    hostname TEXT NOT NULL,
    process_id INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'completed')),
    current_token_usage INTEGER NOT NULL DEFAULT 0,
    last_heartbeat TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshots_tier
    ON context_snapshots(project_id, priority, phase_id);
CREATE INDEX IF NOT EXISTS idx_instances_project ON active_instances(project_id);

-- Sequence numbers never repeat within a project
CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_sequence
    ON context_snapshots(project_id, sequence_number);
"#;

/// Pragmas applied to every pooled connection.
pub fn connection_pragmas(busy_timeout_ms: u128) -> String {
    format!(
        "PRAGMA busy_timeout = {};\nPRAGMA journal_mode = WAL;\nPRAGMA foreign_keys = ON;",
        busy_timeout_ms
    )
}
