//! Stage 2: transcribe each page image through the vision capability.
//!
//! The first inference stage, and the first holder of the model slot: the
//! gate is acquired before any page is sent and held until the last page
//! returns, so the vision model is made resident exactly once per document.
//! Pages go out strictly in order — the runtime processes one resident
//! model's requests serially anyway, and ordered progress events are part of
//! the observable contract.

use tracing::info;

use crate::capability::{PageImage, VisionCapability};
use crate::error::AnalysisError;
use crate::gate::ResourceGate;
use crate::prompts::OCR_INSTRUCTIONS;
use crate::progress::StageEvent;

use super::{stage_name, stage_progress, StageContext};

const STAGE: u8 = 2;

/// One page's markdown transcription, keyed by page order.
#[derive(Debug, Clone)]
pub struct PageTranscription {
    pub page_num: usize,
    pub markdown: String,
}

pub async fn run(
    ctx: &StageContext<'_>,
    gate: &ResourceGate,
    vision: &dyn VisionCapability,
    model: &str,
    pages: &[PageImage],
) -> Result<Vec<PageTranscription>, AnalysisError> {
    ctx.emit_stage(STAGE, 0.0, format!("Loading OCR model {model}"));

    // Held for the whole stage; dropped on every exit path.
    let _resident = gate.acquire(model, ctx.config.gate_timeout).await?;
    ctx.emit_stage(STAGE, 0.02, "OCR model ready");

    let total = pages.len();
    let mut transcriptions = Vec::with_capacity(total);

    for (done, page) in pages.iter().enumerate() {
        let markdown = vision
            .transcribe_page(model, page, OCR_INSTRUCTIONS)
            .await
            .map_err(|e| {
                AnalysisError::capability(
                    STAGE,
                    format!("page {}: {}", page.page_num, e),
                )
            })?;

        transcriptions.push(PageTranscription {
            page_num: page.page_num,
            markdown,
        });

        let done = done + 1;
        ctx.emit(
            StageEvent::new(STAGE, stage_name(STAGE), format!("Page {done}/{total}"))
                .with_progress(stage_progress(STAGE, done as f32 / total as f32))
                .with_page(done, total),
        );
    }

    info!(pages = total, model, "stage 2 complete");
    Ok(transcriptions)
}
