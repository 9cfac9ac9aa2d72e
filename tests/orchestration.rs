//! End-to-end orchestration tests over in-memory capability fakes.
//!
//! No Ollama, no PDF renderer: the mocks below stand in for every external
//! collaborator, so these tests exercise exactly the contracts the library
//! owns — stage sequencing, gate exclusivity, progress ordering, restart
//! recovery, and the history index.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use paperlens::history::HistoryQuery;
use paperlens::store::JobStore;
use paperlens::{
    AnalysisError, AnalysisMode, Capabilities, CapabilityCatalog, CapabilityError, CapabilityInfo,
    CapabilityKind, DocumentMetadata, DocumentRasterizer, Job, JobEvent, JobManager, JobResults,
    JobStatus, OrchestratorConfig, PageImage, RasterizedDocument, StageEvent, Submission,
    TextCapability, VisionCapability,
};

// ── Capability fakes ─────────────────────────────────────────────────────────

/// Counts how many inference calls are in flight at once, across both the
/// vision and text fakes. With a correct resource gate the maximum is 1.
#[derive(Default)]
struct SlotProbe {
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl SlotProbe {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockRasterizer {
    pages_per_doc: usize,
}

#[async_trait]
impl DocumentRasterizer for MockRasterizer {
    async fn rasterize(
        &self,
        _document: &Path,
        _dpi: u32,
    ) -> Result<RasterizedDocument, CapabilityError> {
        let pages = (1..=self.pages_per_doc)
            .map(|page_num| PageImage {
                page_num,
                png: vec![0x89, 0x50, 0x4e, 0x47],
                width: 1240,
                height: 1754,
            })
            .collect();
        Ok(RasterizedDocument {
            pages,
            metadata: DocumentMetadata {
                // Empty title: stage 1 falls back to the file stem.
                title: String::new(),
                author: "T. Author".into(),
                total_pages: self.pages_per_doc,
            },
        })
    }
}

struct MockVision {
    probe: Arc<SlotProbe>,
    delay: Duration,
}

#[async_trait]
impl VisionCapability for MockVision {
    async fn transcribe_page(
        &self,
        _model: &str,
        page: &PageImage,
        _instructions: &str,
    ) -> Result<String, CapabilityError> {
        self.probe.enter();
        tokio::time::sleep(self.delay).await;
        self.probe.exit();
        Ok(format!(
            "## Section {}\n\nTranscribed text of page {}.",
            page.page_num, page.page_num
        ))
    }
}

/// Fails on the given page number; earlier pages succeed.
struct FailingVision {
    fail_on_page: usize,
}

#[async_trait]
impl VisionCapability for FailingVision {
    async fn transcribe_page(
        &self,
        _model: &str,
        page: &PageImage,
        _instructions: &str,
    ) -> Result<String, CapabilityError> {
        if page.page_num == self.fail_on_page {
            return Err(CapabilityError::new("GPU fell off the bus"));
        }
        Ok(format!("page {} ok", page.page_num))
    }
}

struct MockText {
    probe: Arc<SlotProbe>,
    delay: Duration,
}

#[async_trait]
impl TextCapability for MockText {
    async fn generate(&self, _model: &str, prompt: &str) -> Result<String, CapabilityError> {
        self.probe.enter();
        tokio::time::sleep(self.delay).await;
        self.probe.exit();
        Ok(format!("Analysis over {} prompt bytes.", prompt.len()))
    }
}

struct MockCatalog;

#[async_trait]
impl CapabilityCatalog for MockCatalog {
    async fn list(&self) -> Result<Vec<CapabilityInfo>, CapabilityError> {
        Ok(vec![
            CapabilityInfo {
                name: "qwen2.5vl:7b".into(),
                size_bytes: 5_000_000_000,
                kind: CapabilityKind::Vision,
            },
            CapabilityInfo {
                name: "qwen3-30b-a3b".into(),
                size_bytes: 18_000_000_000,
                kind: CapabilityKind::Text,
            },
        ])
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    manager: JobManager,
    probe: Arc<SlotProbe>,
    _dir: tempfile::TempDir,
}

async fn harness_with(pages_per_doc: usize, delay: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(SlotProbe::default());
    let config = OrchestratorConfig::builder()
        .output_dir(dir.path().join("output"))
        .state_dir(dir.path().join("state"))
        .build()
        .unwrap();
    let manager = JobManager::new(
        config,
        Capabilities {
            rasterizer: Arc::new(MockRasterizer { pages_per_doc }),
            vision: Arc::new(MockVision {
                probe: probe.clone(),
                delay,
            }),
            text: Arc::new(MockText {
                probe: probe.clone(),
                delay,
            }),
            catalog: Arc::new(MockCatalog),
        },
    )
    .await
    .unwrap();

    Harness {
        manager,
        probe,
        _dir: dir,
    }
}

async fn harness() -> Harness {
    harness_with(3, Duration::from_millis(2)).await
}

fn submission(documents: Vec<PathBuf>, mode: AnalysisMode) -> Submission {
    Submission {
        documents,
        ocr_capability: "qwen2.5vl:7b".into(),
        text_capability: "qwen3-30b-a3b".into(),
        mode,
    }
}

/// Drain a subscriber stream until (and including) the terminal event.
async fn collect_until_done(mut stream: paperlens::EventStream) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        let done = matches!(event, JobEvent::Done { .. });
        events.push(event);
        if done {
            break;
        }
    }
    events
}

fn progress_events(events: &[JobEvent]) -> Vec<&StageEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            JobEvent::Progress(p) => Some(p),
            _ => None,
        })
        .collect()
}

/// Assert the ordering invariant: document index never decreases, stage never
/// decreases within a document, progress never decreases within a stage.
fn assert_monotonic(events: &[&StageEvent]) {
    for pair in events.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        assert!(
            b.document_index >= a.document_index,
            "document index regressed: {a:?} -> {b:?}"
        );
        if a.document_index == b.document_index {
            assert!(b.stage >= a.stage, "stage regressed: {a:?} -> {b:?}");
            if a.stage == b.stage {
                assert!(
                    b.progress >= a.progress,
                    "progress regressed: {a:?} -> {b:?}"
                );
            }
        }
    }
}

// ── Submission validation ────────────────────────────────────────────────────

#[tokio::test]
async fn submit_rejects_empty_document_list() {
    let h = harness().await;
    let err = h
        .manager
        .submit(submission(vec![], AnalysisMode::Quick))
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidInput { .. }));
}

#[tokio::test]
async fn submit_rejects_missing_capabilities() {
    let h = harness().await;
    let mut sub = submission(vec!["paper.pdf".into()], AnalysisMode::Quick);
    sub.ocr_capability = "  ".into();
    let err = h.manager.submit(sub).await.unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidInput { .. }));
}

#[tokio::test]
async fn status_of_unknown_job_is_not_found() {
    let h = harness().await;
    let err = h.manager.status(&"ffffffffffff".into()).await.unwrap_err();
    assert!(matches!(err, AnalysisError::JobNotFound { .. }));
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_document_job_runs_all_stages_to_completion() {
    let h = harness().await;
    let id = h
        .manager
        .submit(submission(vec!["widget-study.pdf".into()], AnalysisMode::Comprehensive))
        .await
        .unwrap();

    let events = collect_until_done(h.manager.subscribe(&id).await.unwrap()).await;
    let progress = progress_events(&events);
    assert_monotonic(&progress);

    // All four stages appear, and the document reaches 100%.
    for stage in 1..=4u8 {
        assert!(
            progress.iter().any(|e| e.stage == stage),
            "no event for stage {stage}"
        );
    }
    assert!(progress.iter().any(|e| (e.progress - 1.0).abs() < 1e-6));

    match events.last().unwrap() {
        JobEvent::Done { status, error } => {
            assert_eq!(*status, JobStatus::Completed);
            assert!(error.is_none());
        }
        other => panic!("stream must end with done, got {other:?}"),
    }

    // Terminal job: evicted from the live table but resolvable from the store.
    let job = h.manager.status(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());

    match h.manager.results(&id).await.unwrap() {
        JobResults::Completed(outputs) => {
            assert_eq!(outputs.len(), 1);
            assert_eq!(outputs[0].title, "widget-study");
            assert!(outputs[0].markdown.contains("Analysis Report"));
            assert_eq!(outputs[0].analysis["analysis"]["type"], "comprehensive");
        }
        other => panic!("expected completed results, got {other:?}"),
    }

    // The gate is free once the job is done.
    assert!(h.manager.resident_capability().is_none());

    // Exactly one history record, findable by substring.
    let page = h
        .manager
        .history()
        .list(&HistoryQuery {
            search: Some("widget".into()),
            page: 1,
            page_size: 10,
            ..Default::default()
        })
        .await;
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn three_document_batch_runs_sequential_full_cycles() {
    let h = harness().await;
    let docs: Vec<PathBuf> = vec!["alpha.pdf".into(), "beta.pdf".into(), "gamma.pdf".into()];
    let id = h
        .manager
        .submit(submission(docs, AnalysisMode::Quick))
        .await
        .unwrap();

    let events = collect_until_done(h.manager.subscribe(&id).await.unwrap()).await;
    let progress = progress_events(&events);
    assert_monotonic(&progress);

    // Each document runs a full cycle reaching 100% before the next starts.
    for doc in 0..3usize {
        let cycle: Vec<_> = progress
            .iter()
            .filter(|e| e.document_index == doc)
            .collect();
        assert!(!cycle.is_empty(), "no events for document {doc}");
        assert_eq!(cycle.iter().map(|e| e.document_total).max(), Some(3));
        assert!(
            cycle.iter().any(|e| (e.progress - 1.0).abs() < 1e-6),
            "document {doc} never reached 100%"
        );
    }

    match h.manager.results(&id).await.unwrap() {
        JobResults::Completed(outputs) => {
            let titles: Vec<&str> = outputs.iter().map(|o| o.title.as_str()).collect();
            assert_eq!(titles, ["alpha", "beta", "gamma"]);
        }
        other => panic!("expected completed results, got {other:?}"),
    }

    // One history record per document, all under the batch submission time.
    let job = h.manager.status(&id).await.unwrap();
    let page = h
        .manager
        .history()
        .list(&HistoryQuery {
            page: 1,
            page_size: 10,
            ..Default::default()
        })
        .await;
    assert_eq!(page.total, 3);
    for record in &page.items {
        assert_eq!(record.submitted_at, job.submitted_at);
    }
}

// ── Resource gate ────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_jobs_never_overlap_on_the_model_slot() {
    let h = harness_with(2, Duration::from_millis(5)).await;

    let id_a = h
        .manager
        .submit(submission(vec!["a.pdf".into(), "a2.pdf".into()], AnalysisMode::Quick))
        .await
        .unwrap();
    let id_b = h
        .manager
        .submit(submission(vec!["b.pdf".into()], AnalysisMode::Quick))
        .await
        .unwrap();

    let (events_a, events_b) = tokio::join!(
        collect_until_done(h.manager.subscribe(&id_a).await.unwrap()),
        collect_until_done(h.manager.subscribe(&id_b).await.unwrap()),
    );

    for events in [&events_a, &events_b] {
        match events.last().unwrap() {
            JobEvent::Done { status, .. } => assert_eq!(*status, JobStatus::Completed),
            other => panic!("expected done, got {other:?}"),
        }
    }

    assert_eq!(
        h.probe.max_active.load(Ordering::SeqCst),
        1,
        "two capabilities were resident at once"
    );
}

// ── Chunked analysis ─────────────────────────────────────────────────────────

#[tokio::test]
async fn oversized_document_takes_the_chunked_analysis_path() {
    let dir = tempfile::tempdir().unwrap();
    let probe = Arc::new(SlotProbe::default());
    let config = OrchestratorConfig::builder()
        .output_dir(dir.path().join("output"))
        .state_dir(dir.path().join("state"))
        .chunk_threshold(500)
        .chunk_size(200)
        .build()
        .unwrap();
    let manager = JobManager::new(
        config,
        Capabilities {
            rasterizer: Arc::new(MockRasterizer { pages_per_doc: 30 }),
            vision: Arc::new(MockVision {
                probe: probe.clone(),
                delay: Duration::from_millis(1),
            }),
            text: Arc::new(MockText {
                probe,
                delay: Duration::from_millis(1),
            }),
            catalog: Arc::new(MockCatalog),
        },
    )
    .await
    .unwrap();

    let id = manager
        .submit(submission(vec!["long.pdf".into()], AnalysisMode::Quick))
        .await
        .unwrap();
    let events = collect_until_done(manager.subscribe(&id).await.unwrap()).await;
    let progress = progress_events(&events);
    assert_monotonic(&progress);

    // Chunk counters appear and run to completion.
    let chunk_events: Vec<_> = progress.iter().filter(|e| e.total_chunks > 0).collect();
    assert!(!chunk_events.is_empty(), "chunked mode must emit chunk progress");
    let total = chunk_events[0].total_chunks;
    assert!(total > 1, "a 30-page document should split into several chunks");
    assert!(chunk_events.iter().any(|e| e.chunk == total));

    match manager.results(&id).await.unwrap() {
        JobResults::Completed(outputs) => assert_eq!(outputs.len(), 1),
        other => panic!("expected completed results, got {other:?}"),
    }
}

// ── Failure handling ─────────────────────────────────────────────────────────

#[tokio::test]
async fn stage_failure_aborts_the_job_and_hides_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = OrchestratorConfig::builder()
        .output_dir(dir.path().join("output"))
        .state_dir(dir.path().join("state"))
        .build()
        .unwrap();
    let probe = Arc::new(SlotProbe::default());
    let manager = JobManager::new(
        config,
        Capabilities {
            rasterizer: Arc::new(MockRasterizer { pages_per_doc: 3 }),
            vision: Arc::new(FailingVision { fail_on_page: 2 }),
            text: Arc::new(MockText {
                probe,
                delay: Duration::from_millis(1),
            }),
            catalog: Arc::new(MockCatalog),
        },
    )
    .await
    .unwrap();

    let id = manager
        .submit(submission(vec!["doomed.pdf".into()], AnalysisMode::Quick))
        .await
        .unwrap();
    let events = collect_until_done(manager.subscribe(&id).await.unwrap()).await;

    match events.last().unwrap() {
        JobEvent::Done { status, error } => {
            assert_eq!(*status, JobStatus::Failed);
            let error = error.as_deref().unwrap();
            assert!(error.contains("stage 2"), "error lacks stage: {error}");
            assert!(error.contains("GPU fell off the bus"));
        }
        other => panic!("expected done, got {other:?}"),
    }

    match manager.results(&id).await.unwrap() {
        JobResults::Failed(message) => assert!(message.contains("stage 2")),
        other => panic!("failed job must report Failed, got {other:?}"),
    }

    // Nothing reached the history index.
    let page = manager
        .history()
        .list(&HistoryQuery {
            page: 1,
            page_size: 10,
            ..Default::default()
        })
        .await;
    assert_eq!(page.total, 0);

    // And the slot was released on the error path.
    assert!(manager.resident_capability().is_none());
}

// ── Restart recovery ─────────────────────────────────────────────────────────

#[tokio::test]
async fn restart_marks_inflight_jobs_failed_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");

    // Simulate a worker that died mid-stage-2: a persisted Running snapshot.
    let store = JobStore::open(&state_dir).await.unwrap();
    let mut job = Job::new(submission(vec!["orphan.pdf".into()], AnalysisMode::Quick));
    job.status = JobStatus::Running;
    job.stage = 2;
    let orphan_id = job.id.clone();
    store.save(&job).await.unwrap();

    // New process over the same state dir.
    let config = OrchestratorConfig::builder()
        .output_dir(dir.path().join("output"))
        .state_dir(state_dir)
        .build()
        .unwrap();
    let probe = Arc::new(SlotProbe::default());
    let manager = JobManager::new(
        config,
        Capabilities {
            rasterizer: Arc::new(MockRasterizer { pages_per_doc: 1 }),
            vision: Arc::new(MockVision {
                probe: probe.clone(),
                delay: Duration::from_millis(1),
            }),
            text: Arc::new(MockText {
                probe,
                delay: Duration::from_millis(1),
            }),
            catalog: Arc::new(MockCatalog),
        },
    )
    .await
    .unwrap();

    assert_eq!(manager.recover().await.unwrap(), 1);

    // Deterministic terminal state, never an indefinite `running`.
    let job = manager.status(&orphan_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.as_deref().unwrap();
    assert!(error.contains("interrupted at stage 2"), "got: {error}");

    match manager.results(&orphan_id).await.unwrap() {
        JobResults::Failed(message) => assert!(message.contains("interrupted")),
        other => panic!("expected failed results, got {other:?}"),
    }

    // A reconnecting subscriber still receives a terminal event.
    let events = collect_until_done(manager.subscribe(&orphan_id).await.unwrap()).await;
    match events.last().unwrap() {
        JobEvent::Done { status, .. } => assert_eq!(*status, JobStatus::Failed),
        other => panic!("expected done, got {other:?}"),
    }

    // Recovery is idempotent.
    assert_eq!(manager.recover().await.unwrap(), 0);
}

// ── Reconnecting subscribers ─────────────────────────────────────────────────

#[tokio::test]
async fn mid_job_subscriber_gets_snapshot_then_live_events() {
    let h = harness_with(5, Duration::from_millis(10)).await;
    let id = h
        .manager
        .submit(submission(vec!["slow.pdf".into()], AnalysisMode::Quick))
        .await
        .unwrap();

    // Let the job make some progress before "reconnecting".
    tokio::time::sleep(Duration::from_millis(25)).await;

    let events = collect_until_done(h.manager.subscribe(&id).await.unwrap()).await;
    let progress = progress_events(&events);

    assert!(!progress.is_empty(), "reconnect must replay at least a snapshot");
    assert_monotonic(&progress);
    assert!(matches!(events.last().unwrap(), JobEvent::Done { .. }));
}

// ── History independence ─────────────────────────────────────────────────────

#[tokio::test]
async fn deleting_history_leaves_the_job_id_resolvable() {
    let h = harness().await;
    let id = h
        .manager
        .submit(submission(vec!["keeper.pdf".into()], AnalysisMode::Quick))
        .await
        .unwrap();
    collect_until_done(h.manager.subscribe(&id).await.unwrap()).await;

    let base_name = match h.manager.results(&id).await.unwrap() {
        JobResults::Completed(outputs) => outputs[0].base_name.clone(),
        other => panic!("expected completed, got {other:?}"),
    };

    h.manager.history().delete(&base_name).await.unwrap();

    // Gone from history...
    let page = h
        .manager
        .history()
        .list(&HistoryQuery {
            page: 1,
            page_size: 10,
            ..Default::default()
        })
        .await;
    assert_eq!(page.total, 0);

    // ...but the job keyspace is untouched.
    let job = h.manager.status(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

// ── Capability catalog ───────────────────────────────────────────────────────

#[tokio::test]
async fn list_capabilities_reports_both_modalities() {
    let h = harness().await;
    let capabilities = h.manager.list_capabilities().await.unwrap();
    assert!(capabilities
        .iter()
        .any(|c| c.kind == CapabilityKind::Vision && c.size_bytes > 0));
    assert!(capabilities.iter().any(|c| c.kind == CapabilityKind::Text));
}
