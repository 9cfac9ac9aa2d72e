//! Pipeline stages for one document's analysis.
//!
//! Each submodule implements exactly one transformation step, so stages stay
//! independently testable and the manager's driver reads as the data flow it
//! is:
//!
//! ```text
//! rasterize ──▶ ocr ──▶ assemble ──▶ analyze
//! (external)   (vision   (merge +    (text model,
//!               model)    structure)   chunked if long)
//! ```
//!
//! Stages 2 and 4 are the heavy ones: they hold the
//! [`crate::gate::ResourceGate`] for their whole duration because each makes
//! a different large model resident. Stages 1 and 3 are CPU-only and run
//! outside the gate.

pub mod analyze;
pub mod assemble;
pub mod ocr;
pub mod rasterize;

use crate::config::OrchestratorConfig;
use crate::job::JobId;
use crate::progress::{ProgressHub, StageEvent};

/// Fraction of a document's total progress each stage accounts for.
///
/// Stages 1 and 3 are near-instant next to the two inference stages, so they
/// get 5% each and the model-bound stages split the rest.
pub(crate) const STAGE_WEIGHTS: [f32; 4] = [0.05, 0.45, 0.05, 0.45];

pub(crate) const STAGE_NAMES: [&str; 4] = [
    "PDF preprocessing",
    "OCR transcription",
    "Document assembly",
    "LLM analysis",
];

/// Sum of the weights of all stages before `stage` (1-indexed).
pub(crate) fn stage_base(stage: u8) -> f32 {
    STAGE_WEIGHTS
        .iter()
        .take(stage.saturating_sub(1) as usize)
        .sum()
}

/// Overall per-document progress for `fraction` of the way through `stage`.
pub(crate) fn stage_progress(stage: u8, fraction: f32) -> f32 {
    let idx = stage.saturating_sub(1) as usize;
    let weight = STAGE_WEIGHTS.get(idx).copied().unwrap_or(0.0);
    (stage_base(stage) + weight * fraction.clamp(0.0, 1.0)).min(1.0)
}

pub(crate) fn stage_name(stage: u8) -> &'static str {
    STAGE_NAMES
        .get(stage.saturating_sub(1) as usize)
        .copied()
        .unwrap_or("Pipeline")
}

/// Per-document context threaded through every stage: identifies the job and
/// document slot, and carries the hub the stages publish progress into.
pub struct StageContext<'a> {
    pub job_id: &'a JobId,
    pub hub: &'a ProgressHub,
    pub config: &'a OrchestratorConfig,
    pub document_index: usize,
    pub document_total: usize,
}

impl StageContext<'_> {
    /// Publish a progress event stamped with this document's slot.
    pub(crate) fn emit(&self, event: StageEvent) {
        let event = event.with_document(self.document_index, self.document_total);
        self.hub.publish(self.job_id, event);
    }

    /// Convenience: event for `fraction` of the way through `stage`.
    pub(crate) fn emit_stage(&self, stage: u8, fraction: f32, detail: impl Into<String>) {
        self.emit(
            StageEvent::new(stage, stage_name(stage), detail)
                .with_progress(stage_progress(stage, fraction)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_cover_the_whole_document() {
        let total: f32 = STAGE_WEIGHTS.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn stage_bases_accumulate() {
        assert_eq!(stage_base(1), 0.0);
        assert!((stage_base(2) - 0.05).abs() < 1e-6);
        assert!((stage_base(3) - 0.50).abs() < 1e-6);
        assert!((stage_base(4) - 0.55).abs() < 1e-6);
    }

    #[test]
    fn stage_progress_interpolates_and_caps() {
        assert!((stage_progress(2, 0.5) - 0.275).abs() < 1e-6);
        assert!((stage_progress(4, 1.0) - 1.0).abs() < 1e-6);
        assert_eq!(stage_progress(4, 2.0), 1.0);
    }
}
