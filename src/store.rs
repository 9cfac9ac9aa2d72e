//! Durable job snapshots.
//!
//! One JSON file per job under `state_dir/jobs/`. The store is the source of
//! truth for any job no longer in the manager's live table — a completed job
//! evicted from memory, or a job that was mid-flight when the process died.
//! Writes are atomic (temp file + rename) so a crash never leaves a
//! half-written snapshot for recovery to trip over.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::AnalysisError;
use crate::job::{Job, JobId};

pub struct JobStore {
    jobs_dir: PathBuf,
}

impl JobStore {
    /// Open (and create if missing) the snapshot directory.
    pub async fn open(state_dir: &Path) -> Result<Self, AnalysisError> {
        let jobs_dir = state_dir.join("jobs");
        tokio::fs::create_dir_all(&jobs_dir)
            .await
            .map_err(|e| AnalysisError::StateStore {
                detail: format!("creating '{}': {e}", jobs_dir.display()),
            })?;
        Ok(Self { jobs_dir })
    }

    fn path_for(&self, id: &JobId) -> PathBuf {
        self.jobs_dir.join(format!("{id}.json"))
    }

    /// Persist the current state of a job, replacing any prior snapshot.
    pub async fn save(&self, job: &Job) -> Result<(), AnalysisError> {
        let path = self.path_for(&job.id);
        let payload = serde_json::to_vec_pretty(job).map_err(|e| AnalysisError::StateStore {
            detail: format!("serializing job {}: {e}", job.id),
        })?;

        // Atomic write: temp file in the same directory, then rename.
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &payload)
            .await
            .map_err(|e| AnalysisError::OutputWrite {
                path: tmp_path.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| AnalysisError::OutputWrite {
                path: path.clone(),
                source: e,
            })?;

        debug!(job_id = %job.id, status = %job.status, "job snapshot persisted");
        Ok(())
    }

    /// Load one job's snapshot, `None` when it never existed.
    pub async fn load(&self, id: &JobId) -> Result<Option<Job>, AnalysisError> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AnalysisError::StateStore {
                    detail: format!("reading '{}': {e}", path.display()),
                })
            }
        };
        let job = serde_json::from_slice(&bytes).map_err(|e| AnalysisError::StateStore {
            detail: format!("parsing '{}': {e}", path.display()),
        })?;
        Ok(Some(job))
    }

    /// Load every persisted snapshot.
    ///
    /// Unreadable files are skipped with a warning rather than failing the
    /// whole scan — recovery after a crash must not be blocked by one
    /// corrupt leftover.
    pub async fn load_all(&self) -> Result<Vec<Job>, AnalysisError> {
        let mut entries =
            tokio::fs::read_dir(&self.jobs_dir)
                .await
                .map_err(|e| AnalysisError::StateStore {
                    detail: format!("listing '{}': {e}", self.jobs_dir.display()),
                })?;

        let mut jobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AnalysisError::StateStore {
                detail: format!("listing '{}': {e}", self.jobs_dir.display()),
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Job>(&bytes) {
                    Ok(job) => jobs.push(job),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job snapshot"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job snapshot"),
            }
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AnalysisMode, JobStatus, Submission};
    use std::path::PathBuf;

    fn sample_job() -> Job {
        Job::new(Submission {
            documents: vec![PathBuf::from("paper.pdf")],
            ocr_capability: "qwen2.5vl:7b".into(),
            text_capability: "qwen3-30b".into(),
            mode: AnalysisMode::Comprehensive,
        })
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();

        let mut job = sample_job();
        job.status = JobStatus::Running;
        job.stage = 2;
        store.save(&job).await.unwrap();

        let loaded = store.load(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.stage, 2);
    }

    #[tokio::test]
    async fn load_unknown_id_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();
        assert!(store.load(&JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_replaces_the_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();

        let mut job = sample_job();
        store.save(&job).await.unwrap();
        job.status = JobStatus::Completed;
        store.save(&job).await.unwrap();

        let loaded = store.load(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn load_all_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path()).await.unwrap();

        store.save(&sample_job()).await.unwrap();
        tokio::fs::write(dir.path().join("jobs/garbage.json"), b"not json")
            .await
            .unwrap();

        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }
}
