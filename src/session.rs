//! Session facade: the single entry point CLI wrappers call around a command.

use std::io::Read;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use strata_core::models::{InstanceStatus, NewSnapshot, Priority};
use strata_core::{ContextResult, Database};

use crate::binder::{ProjectBinder, Resolution, SessionFile, SessionRecord};
use crate::config::Config;
use crate::env::Environment;
use crate::loader::{blocking, LoadedContext, PriorityLoader};
use crate::registry::InstanceRegistry;

/// Outcome of [`SessionFacade::initialize`].
#[derive(Debug, Serialize)]
pub struct SessionStart {
    pub project_id: String,
    pub instance_id: String,
    pub project_created: bool,
    pub instance_created: bool,
    /// Explicit project id that did not resolve.
    pub rejected_project_id: Option<String>,
    pub context: LoadedContext,
}

pub struct SessionFacade {
    binder: ProjectBinder,
    loader: PriorityLoader,
    session_file: SessionFile,
    env: Environment,
    output_read_limit: usize,
}

impl SessionFacade {
    pub fn new(db: Database, config: &Config, env: Environment) -> Self {
        let registry = InstanceRegistry::new(db.clone());
        Self {
            binder: ProjectBinder::new(db.clone(), config.mapping_file()),
            loader: PriorityLoader::from_config(db, registry, config),
            session_file: SessionFile::new(config.session_file()),
            env,
            output_read_limit: config.output_read_limit,
        }
    }

    /// Open the configured store and detect the calling environment.
    pub fn from_config(config: &Config) -> ContextResult<Self> {
        let db = config.open_database()?;
        Ok(Self::new(db, config, Environment::detect()?))
    }

    pub fn loader(&self) -> &PriorityLoader {
        &self.loader
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Resolve the project for the working directory, record the prompt,
    /// then create or reuse the shell's instance and load its critical tier.
    pub async fn initialize(
        &self,
        prompt: &str,
        explicit_project_id: Option<&str>,
    ) -> ContextResult<SessionStart> {
        let binder = self.binder.clone();
        let cwd = self.env.cwd.clone();
        let explicit = explicit_project_id.map(str::to_string);
        let resolution: Resolution =
            blocking(move || binder.resolve(&cwd, explicit.as_deref())).await?;
        let project_id = resolution.project_id.clone();

        let previous = self.session_file.read();
        let reusable = match &previous {
            Some(record) if self.owns(record, &project_id) => {
                let registry = self.loader.registry().clone();
                let iid = record.instance_id.clone();
                let instance = blocking(move || registry.get(&iid)).await?;
                instance.map_or(false, |i| i.status == InstanceStatus::Active)
            }
            _ => false,
        };
        let (instance_id, started_at) = match previous.filter(|_| reusable) {
            Some(record) => (record.instance_id, record.started_at),
            None => (self.new_instance_id(), Utc::now().to_rfc3339()),
        };

        let cwd = self.env.cwd.to_string_lossy().to_string();
        if !prompt.trim().is_empty() {
            let payload = json!({
                "prompt": prompt,
                "timestamp": Utc::now().to_rfc3339(),
                "host": self.env.hostname,
                "cwd": cwd,
            });
            self.loader
                .store_context(
                    NewSnapshot::new(&project_id, payload)
                        .priority(Priority::Medium)
                        .content_type("prompt"),
                )
                .await?;
        }

        let context = self
            .loader
            .load_for_instance(&instance_id, &project_id, None)
            .await?;

        let record = SessionRecord {
            project_id: project_id.clone(),
            instance_id: instance_id.clone(),
            started_at,
            hostname: self.env.hostname.clone(),
            pid: self.env.session_pid,
            cwd,
        };
        if let Err(e) = self.session_file.write(&record) {
            warn!(
                path = %self.session_file.path().display(),
                error = %e,
                "could not write session file"
            );
        }

        info!(
            %project_id,
            %instance_id,
            project_created = resolution.created,
            instance_created = context.instance_created,
            "session initialized"
        );

        Ok(SessionStart {
            project_id,
            instance_id,
            project_created: resolution.created,
            instance_created: context.instance_created,
            rejected_project_id: resolution.rejected_explicit,
            context,
        })
    }

    /// Record the command's prompt and (truncated) output as a HIGH snapshot.
    pub async fn finalize(
        &self,
        project_id: &str,
        instance_id: &str,
        prompt: &str,
        output_path: Option<&Path>,
    ) -> ContextResult<i64> {
        let registry = self.loader.registry().clone();
        let iid = instance_id.to_string();
        if let Err(e) = blocking(move || Ok(registry.heartbeat(&iid))).await {
            warn!(%instance_id, error = %e, "heartbeat task failed");
        }

        let mut payload = Map::new();
        payload.insert("prompt".to_string(), Value::from(prompt));
        if let Some(output) = output_path.and_then(|p| self.read_output(p)) {
            payload.insert("output".to_string(), Value::from(output));
        }
        payload.insert("timestamp".to_string(), Value::from(Utc::now().to_rfc3339()));
        payload.insert("host".to_string(), Value::from(self.env.hostname.as_str()));
        payload.insert(
            "cwd".to_string(),
            Value::from(self.env.cwd.to_string_lossy().to_string()),
        );

        let snapshot_id = self
            .loader
            .store_context(
                NewSnapshot::new(project_id, Value::Object(payload))
                    .priority(Priority::High)
                    .content_type("session"),
            )
            .await?;
        debug!(%project_id, %instance_id, snapshot_id, "session finalized");
        Ok(snapshot_id)
    }

    /// Complete the current instance and forget the session. Returns the
    /// instance that was ended, if any.
    pub async fn end_session(&self) -> ContextResult<Option<String>> {
        let ended = match self.session_file.read() {
            Some(record) => {
                let registry = self.loader.registry().clone();
                let iid = record.instance_id.clone();
                blocking(move || registry.complete(&iid)).await?;
                Some(record.instance_id)
            }
            None => None,
        };
        self.session_file.clear()?;
        Ok(ended)
    }

    pub fn current_session(&self) -> Option<SessionRecord> {
        self.session_file.read()
    }

    /// Stop background loads started by this facade.
    pub async fn shutdown(&self) {
        self.loader.shutdown().await;
    }

    fn owns(&self, record: &SessionRecord, project_id: &str) -> bool {
        record.project_id == project_id && record.pid == self.env.session_pid
    }

    fn new_instance_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("inst_{}_{}", self.env.session_pid, &suffix[..8])
    }

    fn read_output(&self, path: &Path) -> Option<String> {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no command output captured");
                return None;
            }
        };
        let mut buf = Vec::new();
        if let Err(e) = file.take(self.output_read_limit as u64).read_to_end(&mut buf) {
            warn!(path = %path.display(), error = %e, "could not read command output");
            return None;
        }
        Some(String::from_utf8_lossy(&buf).into_owned())
    }
}
