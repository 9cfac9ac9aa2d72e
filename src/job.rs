//! Job domain types shared by the manager, store and broadcaster.
//!
//! A [`Job`] is owned exclusively by the [`crate::manager::JobManager`]: it is
//! created at submission, mutated only through stage-completion and terminal
//! transitions, and evicted from the live table once its terminal snapshot has
//! been persisted. Everything here is plain serializable data — the snapshot
//! written to disk is the same struct the manager keeps in memory.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Short, URL-safe job identifier (12 hex chars of a v4 UUID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        Self(simple[..12].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Completed or failed — nothing further will happen to this job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("invalid job status: {}", s)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which analysis template stage 4 runs with.
///
/// `Custom` carries a caller-supplied template containing a `{content}`
/// placeholder; the named modes map to the built-in templates in
/// [`crate::prompts`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    Comprehensive,
    Quick,
    MethodologyFocus,
    Custom(String),
}

impl AnalysisMode {
    pub fn as_str(&self) -> &str {
        match self {
            AnalysisMode::Comprehensive => "comprehensive",
            AnalysisMode::Quick => "quick",
            AnalysisMode::MethodologyFocus => "methodology_focus",
            AnalysisMode::Custom(_) => "custom",
        }
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request to analyze one or more documents.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Source documents, processed strictly in order.
    pub documents: Vec<PathBuf>,
    /// Vision capability id used for stage 2 (page transcription).
    pub ocr_capability: String,
    /// Text capability id used for stage 4 (analysis).
    pub text_capability: String,
    /// Analysis template selection.
    pub mode: AnalysisMode,
}

/// Outputs of one completed document within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutput {
    /// Document title as resolved during assembly.
    pub title: String,
    /// Sanitized base name the history artifacts are stored under.
    pub base_name: String,
    /// Human-readable markdown report.
    pub markdown: String,
    /// Structured analysis data (metadata, structure index, analysis text).
    pub analysis: serde_json::Value,
}

/// The complete, serializable state of a job.
///
/// `get_status` returns a clone of this; the durable store persists it
/// verbatim as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub documents: Vec<PathBuf>,
    pub ocr_capability: String,
    pub text_capability: String,
    pub mode: AnalysisMode,
    pub status: JobStatus,
    /// Current pipeline stage, 0 before the first stage starts, then 1..=4.
    pub stage: u8,
    /// Index of the document currently being processed (0-based).
    pub document_cursor: usize,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// One entry per fully processed document, in submission order.
    pub outputs: Vec<JobOutput>,
}

impl Job {
    pub fn new(submission: Submission) -> Self {
        Self {
            id: JobId::new(),
            documents: submission.documents,
            ocr_capability: submission.ocr_capability,
            text_capability: submission.text_capability,
            mode: submission.mode,
            status: JobStatus::Queued,
            stage: 0,
            document_cursor: 0,
            submitted_at: Utc::now(),
            completed_at: None,
            error: None,
            outputs: Vec::new(),
        }
    }

    pub fn document_total(&self) -> usize {
        self.documents.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_twelve_hex_chars() {
        let id = JobId::new();
        assert_eq!(id.as_str().len(), 12);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn new_job_starts_queued_at_stage_zero() {
        let job = Job::new(Submission {
            documents: vec![PathBuf::from("a.pdf")],
            ocr_capability: "qwen2.5vl:7b".into(),
            text_capability: "qwen3-30b".into(),
            mode: AnalysisMode::Quick,
        });
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.stage, 0);
        assert!(job.outputs.is_empty());
        assert!(job.error.is_none());
    }
}
