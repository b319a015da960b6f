//! Core library for Strata.
//!
//! This crate provides the context models and the durable snapshot store,
//! independent of any front end (CLI, loader, cache).
//!
//! # Usage
//!
//! ```no_run
//! use strata_core::db::Database;
//! use strata_core::models::*;
//!
//! let db = Database::open_default()?;
//! db.migrate()?;
//!
//! let (project_id, _) = db.create_project(&CreateProjectInput::new("demo"))?;
//! db.insert_snapshot(&NewSnapshot::new(&project_id, serde_json::json!({"step": 1})))?;
//! let critical = db.select_snapshots(&project_id, Priority::Critical, None)?;
//! # Ok::<(), strata_core::ContextError>(())
//! ```

pub mod db;
pub mod error;
pub mod models;

// Re-export commonly used types at crate root
pub use db::{Database, DatabaseOptions};
pub use error::{ContextError, ContextResult, ErrorKind};
