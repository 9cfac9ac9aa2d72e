//! Stage 1: turn the source document into ordered page images.
//!
//! The rasterizer is an external collaborator; this stage only forwards the
//! call, validates the result and fills in metadata gaps (a missing title
//! falls back to the file stem so downstream naming never works with an
//! empty string).

use std::path::Path;

use tracing::info;

use crate::capability::{DocumentRasterizer, RasterizedDocument};
use crate::error::AnalysisError;

use super::StageContext;

const STAGE: u8 = 1;

pub async fn run(
    ctx: &StageContext<'_>,
    rasterizer: &dyn DocumentRasterizer,
    document: &Path,
) -> Result<RasterizedDocument, AnalysisError> {
    ctx.emit_stage(
        STAGE,
        0.0,
        format!("Rasterizing {}", document.display()),
    );

    let mut rasterized = rasterizer
        .rasterize(document, ctx.config.dpi)
        .await
        .map_err(|e| AnalysisError::capability(STAGE, e.to_string()))?;

    if rasterized.pages.is_empty() {
        return Err(AnalysisError::capability(
            STAGE,
            format!("rasterizer returned no pages for '{}'", document.display()),
        ));
    }

    if rasterized.metadata.title.trim().is_empty() {
        rasterized.metadata.title = document
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
    }
    if rasterized.metadata.total_pages == 0 {
        rasterized.metadata.total_pages = rasterized.pages.len();
    }

    info!(
        document = %document.display(),
        pages = rasterized.pages.len(),
        "stage 1 complete"
    );
    ctx.emit_stage(
        STAGE,
        1.0,
        format!("{} pages extracted", rasterized.pages.len()),
    );

    Ok(rasterized)
}
