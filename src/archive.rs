//! Transcript extraction.
//!
//! Pulls well-known markers out of a semi-structured execution transcript and
//! stores the result as a `decision` snapshot. Missing markers degrade the
//! record's status; they never fail the extraction.

use std::path::{Path, PathBuf};

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use strata_core::models::{NewSnapshot, Priority};

use crate::loader::PriorityLoader;

pub const UNKNOWN: &str = "Unknown";
const MAX_DIAGNOSTIC_LINES: usize = 50;

static PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*prompt:\s*(.*?)\s*$").expect("prompt regex")
});
static SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*summary:\s*(.*?)\s*$").expect("summary regex")
});
static AGENT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*agent:\s*(\S.*?)\s*$").expect("agent line regex")
});
static AGENT_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\[agent:\s*([^\]]*?)\s*\]").expect("agent tag regex")
});
static GUARDRAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:guardrail|validation)\s+([^:]+?)\s*:\s*(\S.*?)\s*$")
        .expect("guardrail regex")
});
static TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:total\s+)?tokens:\s*([\d,]+)").expect("tokens regex")
});
static DURATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:duration|elapsed):\s*(\d+(?:\.\d+)?)\s*(ms|s|m)\b")
        .expect("duration regex")
});
static ERROR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*error\b").expect("error line regex"));
static WARN_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*warn(?:ing)?\b").expect("warn line regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArchiveStatus {
    Ok,
    Partial,
    Error,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Partial => "PARTIAL",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardrailOutcome {
    pub name: String,
    pub outcome: String,
}

/// What was recovered from one transcript. Status and parse warnings travel
/// in the snapshot metadata, not the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveRecord {
    pub source: String,
    pub prompt: String,
    pub agents: Vec<String>,
    pub agent_count: usize,
    pub guardrails: Vec<GuardrailOutcome>,
    pub tokens: Option<u64>,
    pub duration_ms: Option<u64>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub summary: String,
    #[serde(skip)]
    pub status: ArchiveStatus,
    #[serde(skip)]
    pub parse_warnings: Vec<String>,
}

impl ArchiveRecord {
    fn empty(source: &str) -> Self {
        Self {
            source: source.to_string(),
            prompt: UNKNOWN.to_string(),
            agents: Vec::new(),
            agent_count: 0,
            guardrails: Vec::new(),
            tokens: None,
            duration_ms: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            summary: UNKNOWN.to_string(),
            status: ArchiveStatus::Ok,
            parse_warnings: Vec::new(),
        }
    }

    /// Snapshot payload and metadata for this record.
    pub fn to_snapshot(
        &self,
        project_id: &str,
        priority: Priority,
        phase_id: Option<i64>,
    ) -> NewSnapshot {
        let content =
            serde_json::to_value(self).unwrap_or_else(|_| json!({ "source": self.source }));
        NewSnapshot::new(project_id, content)
            .priority(priority)
            .phase(phase_id)
            .content_type("decision")
            .metadata(json!({
                "status": self.status,
                "parse_warnings": self.parse_warnings,
                "source": self.source,
                "extracted_at": Utc::now().to_rfc3339(),
            }))
    }
}

/// Parse a transcript. `source` labels the record (usually the file path).
pub fn extract(bytes: &[u8], source: &str) -> ArchiveRecord {
    let mut record = ArchiveRecord::empty(source);

    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(e) => {
            record.status = ArchiveStatus::Error;
            record.parse_warnings.push(format!("transcript is not valid UTF-8: {}", e));
            String::from_utf8_lossy(bytes).into_owned()
        }
    };
    if text.trim().is_empty() {
        record.status = ArchiveStatus::Error;
        record.parse_warnings.push("transcript is empty".to_string());
        return record;
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut prompt = None;
    let mut summary = None;

    for (idx, line) in lines.iter().enumerate() {
        if prompt.is_none() {
            if let Some(caps) = PROMPT.captures(line) {
                prompt = Some(value_or_next_line(&caps[1], &lines[idx + 1..]));
            }
        }
        if summary.is_none() {
            if let Some(caps) = SUMMARY.captures(line) {
                summary = Some(value_or_next_line(&caps[1], &lines[idx + 1..]));
            }
        }

        if let Some(caps) = AGENT_LINE.captures(line) {
            push_unique(&mut record.agents, &caps[1]);
        }
        for caps in AGENT_TAG.captures_iter(line) {
            if !caps[1].is_empty() {
                push_unique(&mut record.agents, &caps[1]);
            }
        }

        if let Some(caps) = GUARDRAIL.captures(line) {
            record.guardrails.push(GuardrailOutcome {
                name: caps[1].to_string(),
                outcome: caps[2].to_string(),
            });
        }
        if let Some(caps) = TOKENS.captures(line) {
            if let Ok(n) = caps[1].replace(',', "").parse::<u64>() {
                record.tokens = Some(n);
            }
        }
        if let Some(caps) = DURATION.captures(line) {
            record.duration_ms = duration_ms(&caps[1], &caps[2]);
        }

        if ERROR_LINE.is_match(line) && record.errors.len() < MAX_DIAGNOSTIC_LINES {
            record.errors.push(line.trim().to_string());
        } else if WARN_LINE.is_match(line) && record.warnings.len() < MAX_DIAGNOSTIC_LINES {
            record.warnings.push(line.trim().to_string());
        }
    }

    record.agent_count = record.agents.len();
    if let Some(p) = prompt.flatten() {
        record.prompt = p;
    }
    if let Some(s) = summary.flatten() {
        record.summary = s;
    }

    let missing = [
        ("prompt", record.prompt == UNKNOWN),
        ("agent", record.agents.is_empty()),
        ("guardrail", record.guardrails.is_empty()),
        ("tokens", record.tokens.is_none()),
        ("duration", record.duration_ms.is_none()),
        ("summary", record.summary == UNKNOWN),
    ];
    for (marker, absent) in missing {
        if absent {
            record.parse_warnings.push(format!("missing {} marker", marker));
        }
    }
    if record.status != ArchiveStatus::Error && !record.parse_warnings.is_empty() {
        record.status = ArchiveStatus::Partial;
    }
    record
}

fn value_or_next_line(inline: &str, rest: &[&str]) -> Option<String> {
    if !inline.is_empty() {
        return Some(inline.to_string());
    }
    rest.iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|existing| existing == name) {
        list.push(name.to_string());
    }
}

fn duration_ms(value: &str, unit: &str) -> Option<u64> {
    let value: f64 = value.parse().ok()?;
    let factor = match unit.to_ascii_lowercase().as_str() {
        "ms" => 1.0,
        "s" => 1_000.0,
        "m" => 60_000.0,
        _ => return None,
    };
    Some((value * factor).round() as u64)
}

/// Result of ingesting one transcript.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub source: PathBuf,
    pub status: ArchiveStatus,
    pub snapshot_id: Option<i64>,
    pub error: Option<String>,
}

/// Extract and store each transcript. A failing file is reported in its
/// outcome and the batch carries on.
pub async fn ingest(
    loader: &PriorityLoader,
    paths: &[PathBuf],
    project_id: &str,
    priority: Priority,
    phase_id: Option<i64>,
) -> Vec<IngestOutcome> {
    let mut outcomes = Vec::with_capacity(paths.len());
    for path in paths {
        outcomes.push(ingest_one(loader, path, project_id, priority, phase_id).await);
    }
    outcomes
}

async fn ingest_one(
    loader: &PriorityLoader,
    path: &Path,
    project_id: &str,
    priority: Priority,
    phase_id: Option<i64>,
) -> IngestOutcome {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read transcript");
            return IngestOutcome {
                source: path.to_path_buf(),
                status: ArchiveStatus::Error,
                snapshot_id: None,
                error: Some(e.to_string()),
            };
        }
    };

    let record = extract(&bytes, &path.to_string_lossy());
    let snapshot = record.to_snapshot(project_id, priority, phase_id);
    match loader.store_context(snapshot).await {
        Ok(snapshot_id) => {
            debug!(
                path = %path.display(),
                snapshot_id,
                status = %record.status,
                "transcript ingested"
            );
            IngestOutcome {
                source: path.to_path_buf(),
                status: record.status,
                snapshot_id: Some(snapshot_id),
                error: None,
            }
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not store transcript");
            IngestOutcome {
                source: path.to_path_buf(),
                status: record.status,
                snapshot_id: None,
                error: Some(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "\
Prompt: summarize the quarterly numbers
[agent:planner] drafting plan
Agent: writer
[agent:planner] revising
Guardrail pii: passed
Validation schema: failed (2 issues)
WARN retrying upstream call
ERROR tool timeout after 30s
Tokens: 1,200
Total tokens: 12,345
Duration: 1.5s
Summary: plan drafted and validated
";

    #[test]
    fn full_transcript_is_ok() {
        let record = extract(FULL.as_bytes(), "run.log");
        assert_eq!(record.status, ArchiveStatus::Ok, "{:?}", record.parse_warnings);
        assert_eq!(record.prompt, "summarize the quarterly numbers");
        assert_eq!(record.agents, vec!["planner", "writer"]);
        assert_eq!(record.agent_count, 2);
        assert_eq!(
            record.guardrails,
            vec![
                GuardrailOutcome { name: "pii".into(), outcome: "passed".into() },
                GuardrailOutcome { name: "schema".into(), outcome: "failed (2 issues)".into() },
            ]
        );
        assert_eq!(record.tokens, Some(12_345));
        assert_eq!(record.duration_ms, Some(1_500));
        assert_eq!(record.errors, vec!["ERROR tool timeout after 30s"]);
        assert_eq!(record.warnings, vec!["WARN retrying upstream call"]);
        assert_eq!(record.summary, "plan drafted and validated");
    }

    #[test]
    fn prompt_on_following_line() {
        let record = extract(b"PROMPT:\n\n   write tests\nSummary: done", "x");
        assert_eq!(record.prompt, "write tests");
        assert_eq!(record.summary, "done");
    }

    #[test]
    fn missing_markers_degrade_to_partial() {
        let record = extract(b"just some output\nnothing structured", "x");
        assert_eq!(record.status, ArchiveStatus::Partial);
        assert_eq!(record.prompt, UNKNOWN);
        assert_eq!(record.summary, UNKNOWN);
        assert!(record.agents.is_empty());
        assert_eq!(record.parse_warnings.len(), 6);
    }

    #[test]
    fn empty_input_is_an_error_record() {
        let record = extract(b"   \n", "x");
        assert_eq!(record.status, ArchiveStatus::Error);
        assert_eq!(record.prompt, UNKNOWN);
    }

    #[test]
    fn invalid_utf8_is_parsed_lossily() {
        let mut bytes = b"Prompt: caf".to_vec();
        bytes.push(0xff);
        bytes.extend_from_slice(b"\nSummary: ok");
        let record = extract(&bytes, "x");
        assert_eq!(record.status, ArchiveStatus::Error);
        assert!(record.prompt.starts_with("caf"));
        assert_eq!(record.summary, "ok");
    }

    #[test]
    fn diagnostics_are_capped() {
        let text: String = (0..80).map(|i| format!("ERROR line {}\n", i)).collect();
        let record = extract(text.as_bytes(), "x");
        assert_eq!(record.errors.len(), MAX_DIAGNOSTIC_LINES);
    }

    #[test]
    fn duration_units() {
        assert_eq!(duration_ms("250", "ms"), Some(250));
        assert_eq!(duration_ms("2", "m"), Some(120_000));
        assert_eq!(duration_ms("0.25", "S"), Some(250));
    }

    #[test]
    fn snapshot_carries_status_metadata() {
        let record = extract(b"nothing", "a.log");
        let snap = record.to_snapshot("P", Priority::Low, Some(3));
        assert_eq!(snap.content_type, "decision");
        assert_eq!(snap.priority, Priority::Low);
        assert_eq!(snap.phase_id, Some(3));
        let meta = snap.metadata.unwrap();
        assert_eq!(meta["status"], "PARTIAL");
        assert_eq!(meta["source"], "a.log");
        assert!(!meta["parse_warnings"].as_array().unwrap().is_empty());
        assert!(meta.get("extracted_at").is_some());
    }
}
