//! CLI binary for paperlens.
//!
//! A thin shim over the library: wires an [`OllamaClient`] into a
//! [`JobManager`], submits one job, and renders the progress stream as a
//! terminal progress bar. Page rendering is out of scope for the library, so
//! the CLI consumes a directory of pre-rendered page images (any external
//! rasterizer can produce one).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use paperlens::{
    AnalysisMode, Capabilities, CapabilityError, DocumentMetadata, DocumentRasterizer, JobEvent,
    JobManager, JobResults, JobStatus, OllamaClient, OrchestratorConfig, PageImage,
    RasterizedDocument, Submission,
};
use paperlens::history::HistoryQuery;

#[derive(Parser)]
#[command(name = "paperlens", version, about = "Analyze academic papers with local vision and text models")]
struct Cli {
    /// Ollama endpoint.
    #[arg(long, env = "PAPERLENS_OLLAMA_URL", default_value = paperlens::ollama::DEFAULT_BASE_URL, global = true)]
    ollama_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze a directory of pre-rendered page images (page-*.png).
    Run {
        /// Directory containing the page images, sorted by filename.
        #[arg(long)]
        images: PathBuf,

        /// Analysis mode: comprehensive, quick, or methodology_focus.
        #[arg(long, default_value = "comprehensive")]
        mode: String,

        /// Vision model for page transcription.
        #[arg(long, default_value = "qwen2.5vl:7b")]
        ocr_model: String,

        /// Text model for the analysis.
        #[arg(long, default_value = "qwen3-30b-a3b")]
        llm_model: String,

        /// Output directory for reports and the history index.
        #[arg(long, default_value = "output")]
        output_dir: PathBuf,

        /// Directory for durable job snapshots.
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,
    },

    /// List models installed in the Ollama runtime, split by modality.
    Models,

    /// Browse completed analyses.
    History {
        /// Case-insensitive title substring filter.
        #[arg(long)]
        search: Option<String>,

        /// 1-based page number.
        #[arg(long, default_value_t = 1)]
        page: usize,

        #[arg(long, default_value_t = 20)]
        page_size: usize,

        /// Output directory holding the history index.
        #[arg(long, default_value = "output")]
        output_dir: PathBuf,
    },
}

/// Rasterizer over pre-rendered page images: every `.png` in the directory,
/// in filename order, becomes one page.
struct PageDirRasterizer;

#[async_trait]
impl DocumentRasterizer for PageDirRasterizer {
    async fn rasterize(
        &self,
        document: &Path,
        _dpi: u32,
    ) -> Result<RasterizedDocument, CapabilityError> {
        let mut entries = tokio::fs::read_dir(document)
            .await
            .map_err(|e| CapabilityError::new(format!("reading '{}': {e}", document.display())))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CapabilityError::new(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("png") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut pages = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            let png = tokio::fs::read(path)
                .await
                .map_err(|e| CapabilityError::new(format!("reading '{}': {e}", path.display())))?;
            pages.push(PageImage {
                page_num: i + 1,
                png,
                width: 0,
                height: 0,
            });
        }

        let title = document
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let total_pages = pages.len();
        Ok(RasterizedDocument {
            pages,
            metadata: DocumentMetadata {
                title,
                author: String::new(),
                total_pages,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ollama = Arc::new(OllamaClient::new(cli.ollama_url.clone()));

    match cli.command {
        Command::Run {
            images,
            mode,
            ocr_model,
            llm_model,
            output_dir,
            state_dir,
        } => {
            let mode = match mode.as_str() {
                "comprehensive" => AnalysisMode::Comprehensive,
                "quick" => AnalysisMode::Quick,
                "methodology_focus" => AnalysisMode::MethodologyFocus,
                other => bail!("unknown mode '{other}'"),
            };

            let config = OrchestratorConfig::builder()
                .output_dir(output_dir)
                .state_dir(state_dir)
                .build()?;
            let manager = JobManager::new(
                config,
                Capabilities {
                    rasterizer: Arc::new(PageDirRasterizer),
                    vision: ollama.clone(),
                    text: ollama.clone(),
                    catalog: ollama,
                },
            )
            .await?;
            let recovered = manager.recover().await?;
            if recovered > 0 {
                eprintln!("marked {recovered} interrupted job(s) as failed");
            }

            let job_id = manager
                .submit(Submission {
                    documents: vec![images],
                    ocr_capability: ocr_model,
                    text_capability: llm_model,
                    mode,
                })
                .await?;

            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.cyan} {prefix:.bold} [{bar:42.green/238}] {percent:>3}%  {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.set_prefix("Analyzing");
            bar.enable_steady_tick(Duration::from_millis(80));

            let mut events = manager.subscribe(&job_id).await?;
            let mut final_status = None;
            while let Some(event) = events.next().await {
                match event {
                    JobEvent::Progress(e) => {
                        bar.set_position((e.progress * 100.0) as u64);
                        bar.set_message(format!("{}: {}", e.stage_name, e.detail));
                    }
                    JobEvent::Heartbeat => {}
                    JobEvent::Done { status, error } => {
                        final_status = Some((status, error));
                        break;
                    }
                }
            }
            bar.finish_and_clear();

            match final_status {
                Some((JobStatus::Completed, _)) => match manager.results(&job_id).await? {
                    JobResults::Completed(outputs) => {
                        for output in outputs {
                            println!("✓ {}", output.title);
                            println!("  report: {}_summary.md", output.base_name);
                        }
                        Ok(())
                    }
                    _ => bail!("job reported completed but results are unavailable"),
                },
                Some((JobStatus::Failed, error)) => {
                    bail!("analysis failed: {}", error.unwrap_or_default())
                }
                _ => bail!("progress stream ended without a terminal event"),
            }
        }

        Command::Models => {
            let models = paperlens::CapabilityCatalog::list(ollama.as_ref())
                .await
                .context("listing ollama models")?;
            println!("{:<40} {:>10}  kind", "model", "size");
            for m in models {
                println!(
                    "{:<40} {:>9.1}G  {:?}",
                    m.name,
                    m.size_bytes as f64 / 1e9,
                    m.kind
                );
            }
            Ok(())
        }

        Command::History {
            search,
            page,
            page_size,
            output_dir,
        } => {
            let history = paperlens::HistoryStore::open(&output_dir).await?;
            let result = history
                .list(&HistoryQuery {
                    search,
                    page,
                    page_size,
                    ..Default::default()
                })
                .await;
            println!(
                "page {}/{} — {} record(s) total",
                result.page,
                result.total.div_ceil(result.page_size).max(1),
                result.total
            );
            for record in result.items {
                println!(
                    "  {}  [{}]  {}",
                    record.completed_at.format("%Y-%m-%d %H:%M"),
                    record.mode,
                    record.title
                );
            }
            Ok(())
        }
    }
}
