//! Strata: a priority-tiered context store for long-running agent sessions.
//!
//! The durable store lives in [`strata_core`]. This crate layers the
//! session-facing pieces on top of it:
//!
//! - [`loader`]: serves the CRITICAL tier synchronously and streams the rest
//! - [`registry`]: tracks live worker instances
//! - [`binder`]: maps a working directory to a stable project id
//! - [`session`]: the initialize / finalize entry point CLI wrappers use
//! - [`archive`]: turns execution transcripts into decision snapshots

pub mod archive;
pub mod binder;
pub mod cache;
pub mod config;
pub mod env;
pub mod loader;
pub mod registry;
pub mod session;

pub use strata_core::{db, error, models};
pub use strata_core::{ContextError, ContextResult, Database, DatabaseOptions, ErrorKind};

pub use config::Config;
pub use loader::{LoadedContext, PriorityLoader};
pub use registry::InstanceRegistry;
pub use session::SessionFacade;
