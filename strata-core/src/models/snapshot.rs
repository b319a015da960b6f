use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Priority;
use crate::error::{ContextError, ContextResult};

/// One append-only context record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub snapshot_id: i64,
    pub project_id: String,
    pub phase_id: Option<i64>,
    pub sequence_number: i64,
    pub priority: Priority,
    pub content_type: String,
    pub token_count: i64,
    pub content: Value,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

pub const DEFAULT_CONTENT_TYPE: &str = "code";

/// Input for appending a snapshot. Defaults to `HIGH` / `code`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub project_id: String,
    pub phase_id: Option<i64>,
    pub priority: Priority,
    pub content_type: String,
    pub content: Value,
    pub metadata: Option<Value>,
    /// Caller-supplied count; estimated from the serialized content when absent.
    pub token_count: Option<i64>,
}

impl NewSnapshot {
    pub fn new(project_id: impl Into<String>, content: Value) -> Self {
        Self {
            project_id: project_id.into(),
            phase_id: None,
            priority: Priority::High,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            content,
            metadata: None,
            token_count: None,
        }
    }

    /// Build from raw JSON text; malformed text is a validation error.
    pub fn from_json_str(project_id: impl Into<String>, content: &str) -> ContextResult<Self> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| ContextError::validation(format!("content is not valid JSON: {}", e)))?;
        Ok(Self::new(project_id, value))
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn phase(mut self, phase_id: Option<i64>) -> Self {
        self.phase_id = phase_id;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn token_count(mut self, token_count: i64) -> Self {
        self.token_count = Some(token_count);
        self
    }

    /// Supplied token count, or `len(serialized content) / 4`.
    pub fn effective_token_count(&self) -> i64 {
        self.token_count
            .unwrap_or_else(|| estimate_tokens(&self.content))
    }
}

/// Rough token estimate: serialized length divided by four.
pub fn estimate_tokens(content: &Value) -> i64 {
    (content.to_string().len() / 4) as i64
}

/// Every tier of a project's context, fully materialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FullContext {
    #[serde(rename = "CRITICAL")]
    pub critical: Vec<Snapshot>,
    #[serde(rename = "HIGH")]
    pub high: Vec<Snapshot>,
    #[serde(rename = "MEDIUM")]
    pub medium: Vec<Snapshot>,
    #[serde(rename = "LOW")]
    pub low: Vec<Snapshot>,
}

impl FullContext {
    pub fn tier(&self, priority: Priority) -> &[Snapshot] {
        match priority {
            Priority::Critical => &self.critical,
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
        }
    }

    pub fn tier_mut(&mut self, priority: Priority) -> &mut Vec<Snapshot> {
        match priority {
            Priority::Critical => &mut self.critical,
            Priority::High => &mut self.high,
            Priority::Medium => &mut self.medium,
            Priority::Low => &mut self.low,
        }
    }

    pub fn len(&self) -> usize {
        Priority::ALL.iter().map(|p| self.tier(*p).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All snapshots across tiers, most urgent tier first.
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        Priority::ALL.into_iter().flat_map(move |p| self.tier(p).iter())
    }
}
