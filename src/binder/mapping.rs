use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::write_json_atomic;

/// `{ "<absolute dir>": "<project_id>" }` kept in a JSON side file.
///
/// Advisory only: an unreadable file is treated as empty and rewritten on
/// the next `record`.
#[derive(Debug, Clone)]
pub struct MappingFile {
    path: PathBuf,
}

impl MappingFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> BTreeMap<String, String> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not read project mappings");
                return BTreeMap::new();
            }
        };
        serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "corrupt project mappings ignored");
            BTreeMap::new()
        })
    }

    pub fn get(&self, dir: &str) -> Option<String> {
        self.load().remove(dir)
    }

    /// Point `dir` at `project_id`. A no-op when it already does.
    pub fn record(&self, dir: &str, project_id: &str) -> std::io::Result<()> {
        let mut mappings = self.load();
        if mappings.get(dir).map(String::as_str) == Some(project_id) {
            return Ok(());
        }
        mappings.insert(dir.to_string(), project_id.to_string());
        write_json_atomic(&self.path, &mappings)
    }
}
