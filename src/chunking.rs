//! Section-aware splitting and hierarchical reduction for oversized documents.
//!
//! Local text models handle a bounded request size; a 200-page transcription
//! does not fit in one prompt. Above the configured threshold stage 4 runs
//! map-then-combine: split at major section boundaries (falling back to a
//! fixed size ceiling when a document has no usable headings), summarize each
//! chunk independently, then combine the summaries — in original order —
//! under the requested analysis template.
//!
//! Ordering is load-bearing: chunk N's summary always precedes chunk N+1's in
//! the combine input, and splitting never drops or duplicates text, so every
//! section of the input lands in exactly one chunk.

use tracing::{debug, info};

use crate::capability::TextCapability;
use crate::error::AnalysisError;
use crate::prompts::{render, CHUNK_SUMMARY_TEMPLATE};
use crate::structure::DocumentStructure;

/// Hard cap on a single chunk summary, so the combine prompt stays within
/// the model's context budget even when the model ignores the "under 200
/// words" instruction.
const CHUNK_SUMMARY_MAX_BYTES: usize = 2_000;

/// A partial summary of one chunk, keyed by its original order.
/// Discarded once the combine step has produced the final analysis.
#[derive(Debug, Clone)]
pub struct ChunkSummary {
    pub index: usize,
    pub text: String,
}

/// Section-boundary splitter with a fixed-size fallback.
#[derive(Debug, Clone, Copy)]
pub struct SectionChunker {
    /// Documents longer than this (UTF-8 bytes) get chunked at all.
    pub threshold: usize,
    /// Target chunk length for the size-based fallback.
    pub chunk_size: usize,
}

impl SectionChunker {
    pub fn new(threshold: usize, chunk_size: usize) -> Self {
        Self {
            threshold,
            chunk_size,
        }
    }

    /// Whether `text` exceeds the single-request budget.
    pub fn needs_chunking(&self, text: &str) -> bool {
        text.len() > self.threshold
    }

    /// Split at major (level ≤ 2) section starts; preamble before the first
    /// heading becomes its own leading chunk. Documents without usable
    /// headings fall back to [`SectionChunker::split_by_size`].
    pub fn split(&self, text: &str, structure: &DocumentStructure) -> Vec<String> {
        let mut split_points: Vec<usize> = structure
            .sections
            .iter()
            .filter(|s| s.level <= 2)
            .map(|s| s.start)
            .filter(|&pos| pos < text.len())
            .collect();
        split_points.sort_unstable();
        split_points.dedup();

        if split_points.is_empty() {
            return self.split_by_size(text);
        }

        let mut chunks = Vec::with_capacity(split_points.len() + 1);
        if split_points[0] > 0 {
            let preamble = text[..split_points[0]].trim();
            if !preamble.is_empty() {
                chunks.push(preamble.to_string());
            }
        }
        for (i, &pos) in split_points.iter().enumerate() {
            let end = split_points.get(i + 1).copied().unwrap_or(text.len());
            let chunk = text[pos..end].trim();
            if !chunk.is_empty() {
                chunks.push(chunk.to_string());
            }
        }

        info!(chunks = chunks.len(), "split by sections");
        chunks
    }

    /// Fixed-size splitting that prefers to break at a paragraph boundary
    /// (`\n\n`) in the back half of each window.
    pub fn split_by_size(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < text.len() {
            let mut end = floor_char_boundary(text, (start + self.chunk_size).min(text.len()));
            if end >= text.len() {
                push_trimmed(&mut chunks, &text[start..]);
                break;
            }

            let half = floor_char_boundary(text, start + self.chunk_size / 2);
            if let Some(boundary) = text[half..end].rfind("\n\n") {
                end = half + boundary;
            }
            push_trimmed(&mut chunks, &text[start..end]);
            start = end;
        }

        info!(
            chunks = chunks.len(),
            chunk_size = self.chunk_size,
            "split by size"
        );
        chunks
    }
}

fn push_trimmed(chunks: &mut Vec<String>, piece: &str) {
    let piece = piece.trim();
    if !piece.is_empty() {
        chunks.push(piece.to_string());
    }
}

fn floor_char_boundary(s: &str, mut at: usize) -> usize {
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

/// Map phase: summarize each chunk independently, in order.
///
/// `observe(done, total)` fires after each chunk so the stage driver can
/// publish progress without this module knowing about the broadcaster.
pub async fn summarize_chunks(
    text: &dyn TextCapability,
    model: &str,
    chunks: &[String],
    mut observe: impl FnMut(usize, usize) + Send,
) -> Result<Vec<ChunkSummary>, AnalysisError> {
    let total = chunks.len();
    let mut summaries = Vec::with_capacity(total);

    for (index, chunk) in chunks.iter().enumerate() {
        debug!(chunk = index + 1, total, bytes = chunk.len(), "summarizing chunk");
        let prompt = render(CHUNK_SUMMARY_TEMPLATE, chunk);
        let summary = text
            .generate(model, &prompt)
            .await
            .map_err(|e| AnalysisError::capability(4, e.to_string()))?;
        summaries.push(ChunkSummary {
            index,
            text: truncate_summary(summary),
        });
        observe(index + 1, total);
    }

    Ok(summaries)
}

/// Combine phase: join the summaries in original order and run the final
/// analysis template over them.
pub async fn combine(
    text: &dyn TextCapability,
    model: &str,
    summaries: &[ChunkSummary],
    template: &str,
) -> Result<String, AnalysisError> {
    let combined = summaries
        .iter()
        .map(|s| format!("### Part {}\n{}", s.index + 1, s.text))
        .collect::<Vec<_>>()
        .join("\n\n");

    info!(
        parts = summaries.len(),
        bytes = combined.len(),
        "combining chunk summaries"
    );

    text.generate(model, &render(template, &combined))
        .await
        .map_err(|e| AnalysisError::capability(4, e.to_string()))
}

/// Full hierarchical reduction: map every chunk, then combine.
pub async fn reduce(
    text: &dyn TextCapability,
    model: &str,
    chunks: &[String],
    template: &str,
    observe: impl FnMut(usize, usize) + Send,
) -> Result<String, AnalysisError> {
    let summaries = summarize_chunks(text, model, chunks, observe).await?;
    combine(text, model, &summaries, template).await
}

fn truncate_summary(mut summary: String) -> String {
    if summary.len() > CHUNK_SUMMARY_MAX_BYTES {
        let cut = floor_char_boundary(&summary, CHUNK_SUMMARY_MAX_BYTES);
        summary.truncate(cut);
    }
    summary
}
