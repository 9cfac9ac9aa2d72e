//! Abstract contracts for the external collaborators.
//!
//! The orchestrator never talks to a PDF renderer or an inference runtime
//! directly; every outbound call goes through one of these traits. That keeps
//! the heavy machinery swappable (local Ollama today, anything
//! request/response-shaped tomorrow) and lets the whole pipeline run against
//! in-memory fakes in tests.
//!
//! Capability ids (model names) are passed per call rather than baked into
//! the adapter, because the resident model changes between stage 2 and
//! stage 4 of every job while the underlying client connection does not.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw failure from an external capability call.
///
/// Adapters do not know which pipeline stage invoked them; the stage driver
/// wraps this into [`crate::error::AnalysisError::Capability`] with the
/// stage number attached.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CapabilityError(pub String);

impl CapabilityError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

/// A page-level fragment of a source document: order index plus raw pixels.
/// Produced by the rasterizer, consumed by the OCR stage; lives for one job.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 1-indexed page number.
    pub page_num: usize,
    /// PNG-encoded page raster.
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Document-level metadata reported by the rasterizer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: String,
    pub author: String,
    pub total_pages: usize,
}

/// Everything the rasterizer hands back for one document.
#[derive(Debug, Clone)]
pub struct RasterizedDocument {
    /// Pages in reading order.
    pub pages: Vec<PageImage>,
    pub metadata: DocumentMetadata,
}

/// Turns a source file into an ordered sequence of page images.
///
/// CPU-bound and outside the model-slot discipline: stage 1 never touches
/// accelerator memory.
#[async_trait]
pub trait DocumentRasterizer: Send + Sync {
    async fn rasterize(
        &self,
        document: &Path,
        dpi: u32,
    ) -> Result<RasterizedDocument, CapabilityError>;
}

/// Vision inference: one page image in, markdown transcription out.
#[async_trait]
pub trait VisionCapability: Send + Sync {
    async fn transcribe_page(
        &self,
        model: &str,
        page: &PageImage,
        instructions: &str,
    ) -> Result<String, CapabilityError>;
}

/// Text inference: one prompt in, generated text out.
#[async_trait]
pub trait TextCapability: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, CapabilityError>;
}

/// Whether a capability is a vision (OCR) model or a plain text model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Vision,
    Text,
}

/// One installed model as reported by the inference runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInfo {
    pub name: String,
    /// On-disk weight size in bytes (0 when the runtime does not report it).
    pub size_bytes: u64,
    pub kind: CapabilityKind,
}

/// Enumerates the capabilities the runtime currently offers.
#[async_trait]
pub trait CapabilityCatalog: Send + Sync {
    async fn list(&self) -> Result<Vec<CapabilityInfo>, CapabilityError>;
}

/// Classify a model as vision or text from its name and reported families.
///
/// The runtime does not tag models by modality, so classification falls back
/// to the naming conventions local vision models actually use
/// (`qwen2.5vl`, `minicpm-v`, `llama3.2-vision`, `glm-ocr`, ...).
pub fn classify_capability(name: &str, families: &[String]) -> CapabilityKind {
    const NAME_KEYWORDS: [&str; 5] = ["vl", "vision", "ocr", "glm-ocr", "minicpm-v"];
    const FAMILY_KEYWORDS: [&str; 3] = ["vl", "ocr", "vision"];

    let name_lower = name.to_lowercase();
    if NAME_KEYWORDS.iter().any(|kw| name_lower.contains(kw)) {
        return CapabilityKind::Vision;
    }
    let families_joined = families.join(" ").to_lowercase();
    if FAMILY_KEYWORDS.iter().any(|kw| families_joined.contains(kw)) {
        return CapabilityKind::Vision;
    }
    CapabilityKind::Text
}
