//! Searchable index of completed analyses.
//!
//! Every completed document leaves three artifacts in the output directory —
//! the full structured markdown, the human-readable report, and the
//! structured analysis JSON — plus one entry in `history.json`, keyed by a
//! stable base name derived from the document title. The index lives behind
//! one async mutex: mutations rewrite `history.json` atomically, and `list`
//! filters/sorts/pages a clone taken under the lock, so a record saved
//! mid-query can neither appear twice nor corrupt pagination counts.
//!
//! History records are independent of live job ids: deleting a record does
//! not invalidate the job snapshot it came from, and vice versa.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::AnalysisError;
use crate::job::AnalysisMode;

const INDEX_FILE: &str = "history.json";

/// One completed analysis in the index. Immutable except for deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Sanitized title; artifact filenames and the delete key derive from it.
    pub base_name: String,
    /// Original document title.
    pub title: String,
    pub mode: AnalysisMode,
    pub ocr_capability: String,
    pub text_capability: String,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub structured_path: PathBuf,
    pub report_path: PathBuf,
    pub analysis_path: PathBuf,
}

/// Inputs for one new history entry.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub title: String,
    pub mode: AnalysisMode,
    pub ocr_capability: String,
    pub text_capability: String,
    pub submitted_at: DateTime<Utc>,
    pub structured_markdown: String,
    pub report_markdown: String,
    pub analysis: serde_json::Value,
}

/// Sort key for [`HistoryStore::list`]; newest first in both cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySort {
    #[default]
    Submitted,
    Completed,
}

/// Query parameters for [`HistoryStore::list`].
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Case-insensitive substring match over the record title.
    pub search: Option<String>,
    pub sort: HistorySort,
    /// 1-based page number; 0 is treated as 1.
    pub page: usize,
    pub page_size: usize,
}

/// One page of history records.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub items: Vec<HistoryRecord>,
    /// Total matches across all pages.
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

pub struct HistoryStore {
    output_dir: PathBuf,
    index: Mutex<Vec<HistoryRecord>>,
}

impl HistoryStore {
    /// Open the output directory, loading the existing index if present.
    pub async fn open(output_dir: &Path) -> Result<Self, AnalysisError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| AnalysisError::OutputWrite {
                path: output_dir.to_path_buf(),
                source: e,
            })?;

        let index_path = output_dir.join(INDEX_FILE);
        let records = match tokio::fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| AnalysisError::StateStore {
                detail: format!("parsing '{}': {e}", index_path.display()),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(AnalysisError::StateStore {
                    detail: format!("reading '{}': {e}", index_path.display()),
                })
            }
        };

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            index: Mutex::new(records),
        })
    }

    /// Write the three artifacts and index the record.
    ///
    /// Re-analyzing a document with the same title replaces its previous
    /// entry: base names are stable, not unique per run.
    pub async fn save(&self, new: NewRecord) -> Result<HistoryRecord, AnalysisError> {
        let base_name = sanitize_base_name(&new.title);

        let structured_path = self.output_dir.join(format!("{base_name}_structured.md"));
        let report_path = self.output_dir.join(format!("{base_name}_summary.md"));
        let analysis_path = self.output_dir.join(format!("{base_name}_analysis.json"));

        write_atomic(&structured_path, new.structured_markdown.as_bytes()).await?;
        write_atomic(&report_path, new.report_markdown.as_bytes()).await?;
        let analysis_bytes =
            serde_json::to_vec_pretty(&new.analysis).map_err(|e| AnalysisError::StateStore {
                detail: format!("serializing analysis for '{base_name}': {e}"),
            })?;
        write_atomic(&analysis_path, &analysis_bytes).await?;

        let record = HistoryRecord {
            base_name: base_name.clone(),
            title: new.title,
            mode: new.mode,
            ocr_capability: new.ocr_capability,
            text_capability: new.text_capability,
            submitted_at: new.submitted_at,
            completed_at: Utc::now(),
            structured_path,
            report_path,
            analysis_path,
        };

        {
            let mut index = self.index.lock().await;
            index.retain(|r| r.base_name != base_name);
            index.push(record.clone());
            self.persist_index(&index).await?;
        }

        info!(base_name = %record.base_name, "history record saved");
        Ok(record)
    }

    /// Page through the index.
    pub async fn list(&self, query: &HistoryQuery) -> HistoryPage {
        let snapshot: Vec<HistoryRecord> = {
            let index = self.index.lock().await;
            index.clone()
        };

        let needle = query
            .search
            .as_deref()
            .map(str::to_lowercase)
            .filter(|s| !s.is_empty());
        let mut matches: Vec<HistoryRecord> = snapshot
            .into_iter()
            .filter(|r| match &needle {
                Some(needle) => r.title.to_lowercase().contains(needle),
                None => true,
            })
            .collect();

        match query.sort {
            HistorySort::Submitted => matches.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at)),
            HistorySort::Completed => matches.sort_by(|a, b| b.completed_at.cmp(&a.completed_at)),
        }

        let total = matches.len();
        let page = query.page.max(1);
        let page_size = query.page_size.max(1);
        let start = (page - 1).saturating_mul(page_size).min(total);
        let end = (start + page_size).min(total);

        HistoryPage {
            items: matches[start..end].to_vec(),
            total,
            page,
            page_size,
        }
    }

    /// Remove a record and its backing artifacts.
    pub async fn delete(&self, base_name: &str) -> Result<(), AnalysisError> {
        let removed = {
            let mut index = self.index.lock().await;
            let Some(pos) = index.iter().position(|r| r.base_name == base_name) else {
                return Err(AnalysisError::RecordNotFound {
                    base_name: base_name.to_string(),
                });
            };
            let removed = index.remove(pos);
            self.persist_index(&index).await?;
            removed
        };

        for path in [
            &removed.structured_path,
            &removed.report_path,
            &removed.analysis_path,
        ] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(AnalysisError::OutputWrite {
                        path: path.clone(),
                        source: e,
                    });
                }
            }
        }

        debug!(base_name, "history record deleted");
        Ok(())
    }

    async fn persist_index(&self, records: &[HistoryRecord]) -> Result<(), AnalysisError> {
        let payload =
            serde_json::to_vec_pretty(records).map_err(|e| AnalysisError::StateStore {
                detail: format!("serializing history index: {e}"),
            })?;
        write_atomic(&self.output_dir.join(INDEX_FILE), &payload).await
    }
}

/// Derive a filesystem-safe base name from a document title.
pub fn sanitize_base_name(title: &str) -> String {
    const MAX_LEN: usize = 80;
    let mut safe: String = title
        .chars()
        .filter_map(|c| match c {
            '/' | '\\' | ':' => Some('_'),
            '?' | '*' | '"' | '<' | '>' | '|' => None,
            c => Some(c),
        })
        .collect();
    safe = safe.trim_matches(|c: char| c == '.' || c == ' ').to_string();
    let mut cut = MAX_LEN.min(safe.len());
    while cut > 0 && !safe.is_char_boundary(cut) {
        cut -= 1;
    }
    safe.truncate(cut);
    if safe.is_empty() {
        safe = "paper".to_string();
    }
    safe
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AnalysisError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| AnalysisError::OutputWrite {
            path: tmp.clone(),
            source: e,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| AnalysisError::OutputWrite {
            path: path.to_path_buf(),
            source: e,
        })
}
