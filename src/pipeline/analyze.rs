//! Stage 4: run the analysis template through the text capability.
//!
//! The second and last holder of the model slot. Short documents go through
//! in a single request with a structure hint prepended; documents past the
//! chunking threshold take the map-then-combine path in [`crate::chunking`],
//! with per-chunk progress flowing out through the context.

use tracing::info;

use crate::capability::TextCapability;
use crate::chunking::{reduce, SectionChunker};
use crate::error::AnalysisError;
use crate::gate::ResourceGate;
use crate::job::AnalysisMode;
use crate::progress::StageEvent;
use crate::prompts::{analysis_template, render};

use super::assemble::AssembledDocument;
use super::{stage_name, stage_progress, StageContext};

const STAGE: u8 = 4;

pub async fn run(
    ctx: &StageContext<'_>,
    gate: &ResourceGate,
    text: &dyn TextCapability,
    model: &str,
    assembled: &AssembledDocument,
    mode: &AnalysisMode,
) -> Result<String, AnalysisError> {
    ctx.emit_stage(STAGE, 0.0, format!("Loading analysis model {model}"));

    let _resident = gate.acquire(model, ctx.config.gate_timeout).await?;
    ctx.emit_stage(STAGE, 0.02, "Analysis model ready");

    let template = analysis_template(mode);
    let chunker = SectionChunker::new(ctx.config.chunk_threshold, ctx.config.chunk_size);

    let analysis_text = if chunker.needs_chunking(&assembled.full_markdown) {
        let chunks = chunker.split(&assembled.full_markdown, &assembled.structure);
        info!(
            chunks = chunks.len(),
            bytes = assembled.full_markdown.len(),
            "document over threshold, chunked analysis"
        );
        ctx.emit_stage(
            STAGE,
            0.05,
            format!("Document too long, summarizing {} chunks", chunks.len()),
        );

        reduce(text, model, &chunks, template, |done, total| {
            ctx.emit(
                StageEvent::new(
                    STAGE,
                    stage_name(STAGE),
                    format!("Summarized chunk {done}/{total}"),
                )
                .with_progress(stage_progress(STAGE, done as f32 / total as f32))
                .with_chunk(done, total),
            );
        })
        .await?
    } else {
        ctx.emit_stage(STAGE, 0.1, "Analyzing document");
        let prompt = render(template, &with_context_hint(assembled));
        text.generate(model, &prompt)
            .await
            .map_err(|e| AnalysisError::capability(STAGE, e.to_string()))?
    };

    info!(output_bytes = analysis_text.len(), model, "stage 4 complete");
    ctx.emit_stage(STAGE, 1.0, "Analysis complete");

    Ok(analysis_text)
}

/// Prepend a compact structure hint so the model sees title, abstract and
/// table of contents before the body.
fn with_context_hint(assembled: &AssembledDocument) -> String {
    let structure = &assembled.structure;
    let mut hint = String::new();

    if !structure.title.is_empty() {
        hint.push_str(&format!("Title: {}\n", structure.title));
    }
    if !structure.abstract_text.is_empty() {
        let cut = structure
            .abstract_text
            .char_indices()
            .nth(500)
            .map(|(i, _)| i)
            .unwrap_or(structure.abstract_text.len());
        hint.push_str(&format!("Abstract: {}\n", &structure.abstract_text[..cut]));
    }
    let toc: Vec<&str> = structure
        .sections
        .iter()
        .filter(|s| s.level <= 2)
        .map(|s| s.title.as_str())
        .collect();
    if !toc.is_empty() {
        hint.push_str(&format!("Contents: {}\n", toc.join(", ")));
    }

    if hint.is_empty() {
        assembled.full_markdown.clone()
    } else {
        format!("{hint}\n{}", assembled.full_markdown)
    }
}
