//! Directory to project binding.
//!
//! Resolution order, first hit wins:
//! 1. an explicit project id that exists in the store
//! 2. the persistent directory mapping, if its project still exists
//! 3. the id derived from the directory path, created on demand

mod mapping;
mod session_file;

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use strata_core::models::CreateProjectInput;
use strata_core::{ContextResult, Database};

pub use mapping::MappingFile;
pub use session_file::{SessionFile, SessionRecord};

/// The narrow store surface the binder needs.
pub trait ProjectCatalog {
    fn project_exists(&self, project_id: &str) -> ContextResult<bool>;

    /// Create the project unless it exists; returns whether it was inserted.
    fn create_project(&self, input: &CreateProjectInput) -> ContextResult<(String, bool)>;
}

impl ProjectCatalog for Database {
    fn project_exists(&self, project_id: &str) -> ContextResult<bool> {
        Database::project_exists(self, project_id)
    }

    fn create_project(&self, input: &CreateProjectInput) -> ContextResult<(String, bool)> {
        Database::create_project(self, input)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Explicit,
    Mapping,
    Derived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub project_id: String,
    /// The project row was inserted by this resolution.
    pub created: bool,
    pub source: ResolutionSource,
    /// Explicit id that was passed but not found in the store.
    pub rejected_explicit: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProjectBinder<C = Database> {
    catalog: C,
    mappings: MappingFile,
}

impl<C: ProjectCatalog> ProjectBinder<C> {
    pub fn new(catalog: C, mapping_path: impl Into<PathBuf>) -> Self {
        Self {
            catalog,
            mappings: MappingFile::new(mapping_path),
        }
    }

    pub fn mappings(&self) -> &MappingFile {
        &self.mappings
    }

    pub fn resolve(&self, cwd: &Path, explicit: Option<&str>) -> ContextResult<Resolution> {
        let cwd = normalize_path(&std::path::absolute(cwd)?);
        let mut rejected_explicit = None;

        if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
            if self.catalog.project_exists(id)? {
                return Ok(Resolution {
                    project_id: id.to_string(),
                    created: false,
                    source: ResolutionSource::Explicit,
                    rejected_explicit: None,
                });
            }
            warn!(project_id = %id, "explicit project not found, falling back to auto-detection");
            rejected_explicit = Some(id.to_string());
        }

        let key = cwd.to_string_lossy().to_string();
        if let Some(mapped) = self.mappings.get(&key) {
            if self.catalog.project_exists(&mapped)? {
                debug!(project_id = %mapped, "project resolved from directory mapping");
                return Ok(Resolution {
                    project_id: mapped,
                    created: false,
                    source: ResolutionSource::Mapping,
                    rejected_explicit,
                });
            }
            debug!(project_id = %mapped, "mapped project no longer exists");
        }

        let derived = derive_project_id(&cwd);
        let input = CreateProjectInput::new(directory_name(&cwd))
            .with_id(&derived)
            .with_description(format!("Auto-created for {}", key));
        let (project_id, created) = self.catalog.create_project(&input)?;

        if let Err(e) = self.mappings.record(&key, &project_id) {
            warn!(
                path = %self.mappings.path().display(),
                error = %e,
                "could not update project mappings"
            );
        }

        Ok(Resolution {
            project_id,
            created,
            source: ResolutionSource::Derived,
            rejected_explicit,
        })
    }
}

/// `proj_<basename>_<first 8 hex of sha256(absolute path)>`. The path is
/// normalized first, so every spelling of a directory maps to one id.
pub fn derive_project_id(dir: &Path) -> String {
    let dir = normalize_path(dir);
    let dir = dir.as_path();
    let digest = format!("{:x}", Sha256::digest(dir.to_string_lossy().as_bytes()));
    format!("proj_{}_{}", directory_name(dir), &digest[..8])
}

/// Lexical normalization: drops `.` and trailing separators, folds `..`
/// into its parent. Symlinks are not resolved.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out
}

fn directory_name(dir: &Path) -> String {
    dir.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string())
}

/// Write JSON through a temp file and rename, so readers never see a torn file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;

    let temp_path = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)
}
