//! Stage 3: merge page transcriptions into one structured document.
//!
//! CPU-only. Joins the pages in order with an explicit page-break marker,
//! builds the structure index, and repairs the document title — vision
//! models read the real title off page one far more reliably than PDF
//! metadata, which is usually the upload filename.

use tracing::{debug, info};

use crate::capability::DocumentMetadata;
use crate::error::AnalysisError;
use crate::structure::{build_structure, looks_like_filename, DocumentStructure};

use super::StageContext;

const STAGE: u8 = 3;

/// Separator between consecutive pages in the assembled markdown.
pub const PAGE_SEPARATOR: &str = "\n\n---\n<!-- page break -->\n\n";

/// Stage 3 output: the merged document and its structure index.
#[derive(Debug, Clone)]
pub struct AssembledDocument {
    pub full_markdown: String,
    pub structure: DocumentStructure,
}

pub async fn run(
    ctx: &StageContext<'_>,
    transcriptions: &mut [super::ocr::PageTranscription],
    metadata: &mut DocumentMetadata,
) -> Result<AssembledDocument, AnalysisError> {
    if transcriptions.is_empty() {
        return Err(AnalysisError::capability(
            STAGE,
            "no page content to assemble",
        ));
    }

    ctx.emit_stage(STAGE, 0.0, "Merging page transcriptions");
    transcriptions.sort_by_key(|t| t.page_num);

    let body: String = transcriptions
        .iter()
        .map(|t| t.markdown.as_str())
        .collect::<Vec<_>>()
        .join(PAGE_SEPARATOR);

    let first_page = transcriptions.first().map(|t| t.markdown.clone());
    let parsed = build_structure(&body, first_page.as_deref());

    // Title priority: a real parsed title beats a filename-looking metadata
    // title; an already-good metadata title is kept.
    if parsed.title.len() > 5
        && looks_like_filename(&metadata.title)
        && !parsed.title.eq_ignore_ascii_case(&metadata.title)
    {
        debug!(
            parsed = %parsed.title,
            replaced = %metadata.title,
            "corrected filename-looking title"
        );
        metadata.title = parsed.title.clone();
    }

    let mut header = format!("# {}\n\n", metadata.title);
    if !metadata.author.is_empty() {
        header.push_str(&format!("**Author**: {}\n\n", metadata.author));
    }
    header.push_str(&format!("**Pages**: {}\n\n---\n\n", metadata.total_pages));

    let full_markdown = header + &body;

    // Re-index over the final document: section offsets feed the chunker,
    // which slices `full_markdown`, so they must be offsets into it — not
    // into the headerless body.
    let structure = build_structure(&full_markdown, first_page.as_deref());

    info!(
        bytes = full_markdown.len(),
        sections = structure.sections.len(),
        "stage 3 complete"
    );
    ctx.emit_stage(STAGE, 1.0, "Document assembled");

    Ok(AssembledDocument {
        full_markdown,
        structure,
    })
}
