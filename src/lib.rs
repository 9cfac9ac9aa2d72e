//! # paperlens
//!
//! Orchestration core for a local document-analysis service: vision OCR plus
//! LLM summarization on hardware that fits **one** large model at a time.
//!
//! ## Why this crate?
//!
//! Running a vision model and a 30B text model on the same consumer GPU means
//! they can never be resident together. The interesting problem is therefore
//! not the inference calls — those are external request/response
//! capabilities — but the orchestration around them: serializing heavy stages
//! through a single model slot, streaming live progress to observers that
//! may disconnect and reconnect, and persisting enough state that a
//! restarted process answers honestly about jobs it was running when it died.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document
//!  │
//!  ├─ 1. Rasterize  external renderer → ordered page images   (CPU)
//!  ├─ 2. OCR        vision model transcribes each page        (model slot)
//!  ├─ 3. Assemble   merge pages, structure index, title fix   (CPU)
//!  └─ 4. Analyze    analysis template, chunked when oversized (model slot)
//!       │
//!       └─ report + structured analysis → history index
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use paperlens::{
//!     AnalysisMode, Capabilities, JobManager, OrchestratorConfig, OllamaClient, Submission,
//! };
//! # use paperlens::DocumentRasterizer;
//! # async fn demo(rasterizer: Arc<dyn DocumentRasterizer>) -> Result<(), Box<dyn std::error::Error>> {
//! let ollama = Arc::new(OllamaClient::new(paperlens::ollama::DEFAULT_BASE_URL));
//! let manager = JobManager::new(
//!     OrchestratorConfig::default(),
//!     Capabilities {
//!         rasterizer,
//!         vision: ollama.clone(),
//!         text: ollama.clone(),
//!         catalog: ollama,
//!     },
//! )
//! .await?;
//! manager.recover().await?;
//!
//! let job_id = manager
//!     .submit(Submission {
//!         documents: vec!["paper.pdf".into()],
//!         ocr_capability: "qwen2.5vl:7b".into(),
//!         text_capability: "qwen3-30b-a3b".into(),
//!         mode: AnalysisMode::Comprehensive,
//!     })
//!     .await?;
//!
//! let mut events = manager.subscribe(&job_id).await?;
//! while let Some(event) = events.next().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - At most one capability is resident at any instant, across all jobs.
//! - Within a job, stage index and within-stage progress are non-decreasing
//!   on every subscriber's stream.
//! - A subscriber joining mid-job gets the latest snapshot, then live events,
//!   then a terminal `done` event — even if it joins after the job ended.
//! - A failed job never exposes partial outputs; a restart marks interrupted
//!   jobs `failed` rather than leaving them `running` forever.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod capability;
pub mod chunking;
pub mod config;
pub mod error;
pub mod gate;
pub mod history;
pub mod job;
pub mod manager;
pub mod ollama;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod report;
pub mod store;
pub mod structure;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use capability::{
    CapabilityCatalog, CapabilityError, CapabilityInfo, CapabilityKind, DocumentMetadata,
    DocumentRasterizer, PageImage, RasterizedDocument, TextCapability, VisionCapability,
};
pub use config::{OrchestratorConfig, OrchestratorConfigBuilder};
pub use error::AnalysisError;
pub use gate::{ResidentModel, ResourceGate};
pub use history::{HistoryPage, HistoryQuery, HistoryRecord, HistorySort, HistoryStore};
pub use job::{AnalysisMode, Job, JobId, JobOutput, JobStatus, Submission};
pub use manager::{Capabilities, JobManager, JobResults};
pub use ollama::OllamaClient;
pub use progress::{EventStream, JobEvent, ProgressHub, StageEvent};
