use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A running worker bound to a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub instance_id: String,
    pub project_id: String,
    pub phase_id: Option<i64>,
    pub hostname: String,
    pub process_id: i64,
    pub current_token_usage: i64,
    pub status: InstanceStatus,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Completed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterInstanceInput {
    pub instance_id: String,
    pub project_id: String,
    pub phase_id: Option<i64>,
    pub hostname: String,
    pub process_id: i64,
}
