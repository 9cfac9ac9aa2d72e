//! Job lifecycle: submission, stage sequencing, terminal transitions,
//! restart recovery.
//!
//! The manager owns the only two pieces of process-wide mutable state — the
//! live job table and (through [`crate::gate::ResourceGate`]) the resident-
//! capability slot. Each accepted job runs in its own spawned task; the four
//! stages execute strictly in order because stage N's output is stage N+1's
//! only input, and the heavy stages of concurrent jobs serialize through the
//! shared gate. Jobs are detached from any client: dropping every subscriber
//! stream leaves the job running, and there is no mid-stage cancellation.
//!
//! A job leaves the live table only after its terminal snapshot is persisted;
//! from then on the durable store answers `status`/`results` lookups, which
//! is also what makes resume-by-polling work across a process restart.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::capability::{
    CapabilityCatalog, CapabilityInfo, DocumentRasterizer, TextCapability, VisionCapability,
};
use crate::config::OrchestratorConfig;
use crate::error::AnalysisError;
use crate::gate::ResourceGate;
use crate::history::{HistoryStore, NewRecord};
use crate::job::{Job, JobId, JobOutput, JobStatus, Submission};
use crate::pipeline::{analyze, assemble, ocr, rasterize, StageContext};
use crate::progress::{EventStream, ProgressHub, StageEvent};
use crate::report::{build_analysis_data, build_markdown_report, DocumentAnalysis};
use crate::store::JobStore;

/// The bundle of external seams a manager drives.
#[derive(Clone)]
pub struct Capabilities {
    pub rasterizer: Arc<dyn DocumentRasterizer>,
    pub vision: Arc<dyn VisionCapability>,
    pub text: Arc<dyn TextCapability>,
    pub catalog: Arc<dyn CapabilityCatalog>,
}

/// What `results` reports for a job.
#[derive(Debug, Clone)]
pub enum JobResults {
    /// Still working; poll again or subscribe to progress.
    Running,
    /// One output per completed document, in submission order.
    Completed(Vec<JobOutput>),
    /// The recorded terminal error. Partial outputs are never exposed.
    Failed(String),
}

struct Inner {
    config: OrchestratorConfig,
    capabilities: Capabilities,
    gate: ResourceGate,
    hub: ProgressHub,
    store: JobStore,
    history: HistoryStore,
    jobs: RwLock<HashMap<JobId, Job>>,
}

/// The orchestrator. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    /// Build a manager, opening the durable store and history index.
    pub async fn new(
        config: OrchestratorConfig,
        capabilities: Capabilities,
    ) -> Result<Self, AnalysisError> {
        let store = JobStore::open(&config.state_dir).await?;
        let history = HistoryStore::open(&config.output_dir).await?;
        let hub = ProgressHub::new(config.event_capacity, config.heartbeat_interval);

        Ok(Self {
            inner: Arc::new(Inner {
                gate: ResourceGate::new(),
                hub,
                store,
                history,
                jobs: RwLock::new(HashMap::new()),
                config,
                capabilities,
            }),
        })
    }

    /// Mark every job the previous process left unfinished as failed.
    ///
    /// Policy (documented in DESIGN.md): an interrupted job is *not*
    /// resumed — inference stages are minutes of accelerator time and not
    /// idempotent, so the snapshot is stamped with a distinguishable
    /// "interrupted" error and the client resubmits. Call once at startup,
    /// before accepting submissions. Returns the number of jobs marked.
    pub async fn recover(&self) -> Result<usize, AnalysisError> {
        let mut marked = 0;
        for mut job in self.inner.store.load_all().await? {
            if job.status.is_terminal() {
                continue;
            }
            let interrupted = AnalysisError::Interrupted {
                stage: job.stage.max(1),
            };
            warn!(job_id = %job.id, stage = job.stage, "marking interrupted job as failed");
            job.status = JobStatus::Failed;
            job.error = Some(interrupted.to_string());
            job.completed_at = Some(Utc::now());
            self.inner.store.save(&job).await?;
            self.inner
                .hub
                .finish(&job.id, JobStatus::Failed, job.error.clone());
            marked += 1;
        }
        Ok(marked)
    }

    /// Validate and enqueue a submission; the job starts immediately in a
    /// background task.
    pub async fn submit(&self, submission: Submission) -> Result<JobId, AnalysisError> {
        if submission.documents.is_empty() {
            return Err(AnalysisError::invalid_input("no documents selected"));
        }
        if submission.ocr_capability.trim().is_empty() {
            return Err(AnalysisError::invalid_input("no OCR capability selected"));
        }
        if submission.text_capability.trim().is_empty() {
            return Err(AnalysisError::invalid_input("no text capability selected"));
        }

        let job = Job::new(submission);
        let id = job.id.clone();
        let document_total = job.document_total();
        info!(job_id = %id, documents = document_total, mode = %job.mode, "job submitted");

        self.inner.store.save(&job).await?;
        self.inner.jobs.write().await.insert(id.clone(), job);

        // Immediate first event so a subscriber attached right after submit
        // sees feedback before stage 1 starts.
        self.inner.hub.publish(
            &id,
            StageEvent::new(0, "Starting", "Initializing pipeline")
                .with_progress(0.0)
                .with_document(0, document_total),
        );

        let runner = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            runner.run_job(job_id).await;
        });

        Ok(id)
    }

    /// Latest live or persisted state of a job.
    pub async fn status(&self, id: &JobId) -> Result<Job, AnalysisError> {
        if let Some(job) = self.inner.jobs.read().await.get(id) {
            return Ok(job.clone());
        }
        match self.inner.store.load(id).await? {
            Some(job) => Ok(job),
            None => Err(AnalysisError::JobNotFound { id: id.clone() }),
        }
    }

    /// Results of a job: running marker, outputs, or the recorded error.
    pub async fn results(&self, id: &JobId) -> Result<JobResults, AnalysisError> {
        let job = self.status(id).await?;
        Ok(match job.status {
            JobStatus::Queued | JobStatus::Running => JobResults::Running,
            JobStatus::Completed => JobResults::Completed(job.outputs),
            JobStatus::Failed => {
                JobResults::Failed(job.error.unwrap_or_else(|| "unknown failure".to_string()))
            }
        })
    }

    /// Subscribe to a job's progress: latest snapshot first, then live
    /// events, terminated by a `done` event. Closing the stream never
    /// affects the job.
    pub async fn subscribe(&self, id: &JobId) -> Result<EventStream, AnalysisError> {
        let job = self.status(id).await?;
        if job.status.is_terminal() {
            // A job recovered or evicted before this process's hub saw its
            // finish still terminates subscriber streams correctly.
            self.inner
                .hub
                .finish(id, job.status, job.error.clone());
        }
        Ok(self.inner.hub.subscribe(id))
    }

    /// Available OCR/text capabilities as reported by the runtime.
    pub async fn list_capabilities(&self) -> Result<Vec<CapabilityInfo>, AnalysisError> {
        self.inner
            .capabilities
            .catalog
            .list()
            .await
            .map_err(|e| AnalysisError::capability(0, e.to_string()))
    }

    /// The completed-analysis index (list / delete).
    pub fn history(&self) -> &HistoryStore {
        &self.inner.history
    }

    /// Instrumentation: the capability currently holding the model slot.
    pub fn resident_capability(&self) -> Option<String> {
        self.inner.gate.resident()
    }

    // ── Stage driver ──────────────────────────────────────────────────────

    async fn run_job(&self, id: JobId) {
        self.update_job(&id, |job| {
            job.status = JobStatus::Running;
        })
        .await;

        let (documents, total) = match self.inner.jobs.read().await.get(&id) {
            Some(job) => (job.documents.clone(), job.documents.len()),
            None => return,
        };

        for (index, document) in documents.iter().enumerate() {
            self.update_job(&id, |job| {
                job.document_cursor = index;
                job.stage = 0;
            })
            .await;

            match self.run_document(&id, document, index, total).await {
                Ok(output) => {
                    self.update_job(&id, |job| job.outputs.push(output)).await;
                }
                Err(e) => {
                    self.fail_job(&id, e).await;
                    return;
                }
            }
        }

        self.finish_job(&id).await;
    }

    /// Run stages 1..=4 for one document and persist its history record.
    async fn run_document(
        &self,
        id: &JobId,
        document: &Path,
        index: usize,
        total: usize,
    ) -> Result<JobOutput, AnalysisError> {
        let inner = &self.inner;
        let started = Instant::now();
        let ctx = StageContext {
            job_id: id,
            hub: &inner.hub,
            config: &inner.config,
            document_index: index,
            document_total: total,
        };

        self.enter_stage(id, 1).await;
        let rasterized = rasterize::run(&ctx, inner.capabilities.rasterizer.as_ref(), document).await?;
        let mut metadata = rasterized.metadata;

        let (ocr_model, text_model, mode, submitted_at) = {
            let jobs = inner.jobs.read().await;
            let job = jobs.get(id).ok_or_else(|| AnalysisError::JobNotFound {
                id: id.clone(),
            })?;
            (
                job.ocr_capability.clone(),
                job.text_capability.clone(),
                job.mode.clone(),
                job.submitted_at,
            )
        };

        self.enter_stage(id, 2).await;
        let mut transcriptions = ocr::run(
            &ctx,
            &inner.gate,
            inner.capabilities.vision.as_ref(),
            &ocr_model,
            &rasterized.pages,
        )
        .await?;

        self.enter_stage(id, 3).await;
        let assembled = assemble::run(&ctx, &mut transcriptions, &mut metadata).await?;

        self.enter_stage(id, 4).await;
        let analysis_text = analyze::run(
            &ctx,
            &inner.gate,
            inner.capabilities.text.as_ref(),
            &text_model,
            &assembled,
            &mode,
        )
        .await?;

        let result = DocumentAnalysis {
            metadata,
            structure: assembled.structure.clone(),
            analysis_text,
            mode: mode.clone(),
            ocr_capability: ocr_model.clone(),
            text_capability: text_model.clone(),
            processing_secs: started.elapsed().as_secs_f64(),
        };
        let report_markdown = build_markdown_report(&result);
        let analysis = build_analysis_data(&result);

        let record = inner
            .history
            .save(NewRecord {
                title: result.metadata.title.clone(),
                mode,
                ocr_capability: ocr_model,
                text_capability: text_model,
                submitted_at,
                structured_markdown: assembled.full_markdown,
                report_markdown: report_markdown.clone(),
                analysis: analysis.clone(),
            })
            .await?;

        info!(
            job_id = %id,
            document = %document.display(),
            secs = result.processing_secs,
            "document analysis complete"
        );

        Ok(JobOutput {
            title: result.metadata.title,
            base_name: record.base_name,
            markdown: report_markdown,
            analysis,
        })
    }

    async fn enter_stage(&self, id: &JobId, stage: u8) {
        self.update_job(id, |job| job.stage = stage).await;
    }

    async fn finish_job(&self, id: &JobId) {
        self.update_job(id, |job| {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
        })
        .await;
        self.evict(id).await;
        self.inner.hub.finish(id, JobStatus::Completed, None);
        info!(job_id = %id, "job completed");
    }

    async fn fail_job(&self, id: &JobId, err: AnalysisError) {
        let message = err.to_string();
        error!(job_id = %id, error = %message, "job failed");
        self.update_job(id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(message.clone());
            job.completed_at = Some(Utc::now());
        })
        .await;
        self.evict(id).await;
        self.inner.hub.finish(id, JobStatus::Failed, Some(message));
    }

    /// Apply a mutation to the live record and persist the result.
    async fn update_job(&self, id: &JobId, mutate: impl FnOnce(&mut Job)) {
        let snapshot = {
            let mut jobs = self.inner.jobs.write().await;
            match jobs.get_mut(id) {
                Some(job) => {
                    mutate(job);
                    job.clone()
                }
                None => return,
            }
        };
        if let Err(e) = self.inner.store.save(&snapshot).await {
            warn!(job_id = %id, error = %e, "failed to persist job snapshot");
        }
    }

    /// Remove a terminal job from the live table. Its snapshot (already
    /// persisted by `update_job`) remains the source of truth.
    async fn evict(&self, id: &JobId) {
        self.inner.jobs.write().await.remove(id);
    }
}
