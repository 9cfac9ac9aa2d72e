//! Error types for the paperlens orchestration library.
//!
//! One enum covers every failure mode because a job's terminal snapshot needs
//! a single error field: whatever went wrong, the stage driver records it,
//! marks the job failed and broadcasts a `done` event carrying the message.
//! The variants still keep operational distinctions a caller cares about —
//! in particular [`AnalysisError::ResourceTimeout`] (contention on the model
//! slot) is deliberately separate from [`AnalysisError::Capability`] (the
//! external engine actually failed), so an operator can tell a queue backed
//! up behind a slow unload from a broken inference backend.

use std::path::PathBuf;
use thiserror::Error;

use crate::job::JobId;

/// All errors returned by the paperlens library.
#[derive(Debug, Error)]
pub enum AnalysisError {
    // ── Submission errors ─────────────────────────────────────────────────
    /// The submission was rejected before a job was created. Not retried.
    #[error("invalid submission: {reason}")]
    InvalidInput { reason: String },

    /// Builder validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Lookup errors ─────────────────────────────────────────────────────
    /// No live or persisted job with this id.
    #[error("unknown job id: {id}")]
    JobNotFound { id: JobId },

    /// No history record with this base name.
    #[error("unknown history record: '{base_name}'")]
    RecordNotFound { base_name: String },

    // ── Stage errors ──────────────────────────────────────────────────────
    /// An external inference call failed or returned unusable output.
    /// Aborts the job; the stage number and raw error are recorded on the
    /// terminal snapshot. Never retried automatically — resubmit instead.
    #[error("stage {stage} capability call failed: {detail}")]
    Capability { stage: u8, detail: String },

    /// Waiting for the model slot exceeded the configured bound.
    /// Surfaced distinctly from [`AnalysisError::Capability`] so contention
    /// is tellable from failure.
    #[error("timed out after {waited_secs}s waiting for the model slot (wanted '{capability}')")]
    ResourceTimeout {
        capability: String,
        waited_secs: u64,
    },

    /// The worker process restarted while this job was still running.
    /// Produced by [`crate::manager::JobManager::recover`]; a job carrying
    /// this error is terminal and must be resubmitted.
    #[error("interrupted at stage {stage}: worker restarted mid-job")]
    Interrupted { stage: u8 },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not write an output artifact or index file.
    #[error("failed to write '{path}': {source}")]
    OutputWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The durable job-snapshot store failed to read or write.
    #[error("job state store error: {detail}")]
    StateStore { detail: String },
}

impl AnalysisError {
    /// Shorthand for a stage capability failure.
    pub fn capability(stage: u8, detail: impl Into<String>) -> Self {
        Self::Capability {
            stage,
            detail: detail.into(),
        }
    }

    /// Shorthand for a rejected submission.
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }
}
