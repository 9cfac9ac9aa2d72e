//! Per-job progress broadcasting with replay for reconnecting observers.
//!
//! Each job gets its own `tokio::sync::broadcast` channel inside the
//! [`ProgressHub`]. The stage driver publishes [`StageEvent`]s as it works;
//! any number of subscribers independently receive a replay-then-live stream:
//! the latest known snapshot first (so a client that reconnects mid-job is
//! immediately current), then live events, terminated by a `done` event that
//! always carries the final status.
//!
//! Publishing never blocks on a slow consumer — the broadcast channel drops
//! the oldest buffered events instead, and a receiver that observes the gap
//! has its stream ended. A disconnected observer costs the job nothing.
//!
//! Event payloads are a closed tagged enum ([`JobEvent`]); there is no
//! free-form dictionary for a malformed producer to sneak fields into.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::warn;

use crate::job::{JobId, JobStatus};

/// A progress update produced by a running stage.
///
/// Ephemeral: only the most recent event per job is retained, as the replay
/// snapshot for late subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    /// Pipeline stage, 1..=4 (0 for the pre-stage "starting" tick).
    pub stage: u8,
    pub stage_name: String,
    pub detail: String,
    /// Overall fraction for the current document, in `[0, 1]`.
    pub progress: f32,
    /// 0-based index of the document this event belongs to.
    pub document_index: usize,
    pub document_total: usize,
    /// Page counters, set during stage 2.
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub total_pages: usize,
    /// Chunk counters, set during chunked stage 4.
    #[serde(default)]
    pub chunk: usize,
    #[serde(default)]
    pub total_chunks: usize,
}

impl StageEvent {
    pub fn new(stage: u8, stage_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            stage,
            stage_name: stage_name.into(),
            detail: detail.into(),
            progress: 0.0,
            document_index: 0,
            document_total: 1,
            page: 0,
            total_pages: 0,
            chunk: 0,
            total_chunks: 0,
        }
    }

    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = progress.clamp(0.0, 1.0);
        self
    }

    pub fn with_document(mut self, index: usize, total: usize) -> Self {
        self.document_index = index;
        self.document_total = total;
        self
    }

    pub fn with_page(mut self, page: usize, total: usize) -> Self {
        self.page = page;
        self.total_pages = total;
        self
    }

    pub fn with_chunk(mut self, chunk: usize, total: usize) -> Self {
        self.chunk = chunk;
        self.total_chunks = total;
        self
    }
}

/// Everything a subscriber can observe on a job's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum JobEvent {
    Progress(StageEvent),
    /// Injected after an idle interval to keep long-lived connections open.
    Heartbeat,
    /// Terminal marker; always the last event on a stream.
    Done {
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// A boxed, replay-then-live stream of job events.
pub type EventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

struct ChannelState {
    /// Latest progress event, replayed to late subscribers.
    latest: Option<StageEvent>,
    /// Terminal event, pinned so reconnecting clients still learn the outcome.
    done: Option<JobEvent>,
}

struct JobChannel {
    sender: broadcast::Sender<JobEvent>,
    state: Mutex<ChannelState>,
}

/// Fan-out hub holding one channel per job.
pub struct ProgressHub {
    channels: Mutex<HashMap<JobId, Arc<JobChannel>>>,
    capacity: usize,
    heartbeat_interval: Duration,
}

impl ProgressHub {
    pub fn new(capacity: usize, heartbeat_interval: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
            heartbeat_interval,
        }
    }

    fn channel(&self, job_id: &JobId) -> Arc<JobChannel> {
        let mut channels = self.channels.lock().expect("hub lock poisoned");
        Arc::clone(channels.entry(job_id.clone()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.capacity);
            Arc::new(JobChannel {
                sender,
                state: Mutex::new(ChannelState {
                    latest: None,
                    done: None,
                }),
            })
        }))
    }

    /// Publish a progress event for `job_id`.
    ///
    /// Enforces the ordering invariant at the boundary instead of trusting
    /// every callsite: an event for an earlier stage than the latest snapshot
    /// (of the same document) is discarded, and progress within the current
    /// stage never moves backwards.
    pub fn publish(&self, job_id: &JobId, mut event: StageEvent) {
        let channel = self.channel(job_id);
        let mut state = channel.state.lock().expect("channel lock poisoned");

        if let Some(latest) = &state.latest {
            if latest.document_index == event.document_index {
                if event.stage < latest.stage {
                    return;
                }
                if event.stage == latest.stage && event.progress < latest.progress {
                    event.progress = latest.progress;
                }
            }
        }

        state.latest = Some(event.clone());
        // SendError only means zero live receivers; the snapshot above is
        // what a future subscriber will replay.
        let _ = channel.sender.send(JobEvent::Progress(event));
    }

    /// Publish the terminal event and pin it for late subscribers.
    pub fn finish(&self, job_id: &JobId, status: JobStatus, error: Option<String>) {
        let channel = self.channel(job_id);
        let done = JobEvent::Done { status, error };
        let mut state = channel.state.lock().expect("channel lock poisoned");
        state.done = Some(done.clone());
        let _ = channel.sender.send(done);
    }

    /// Open a replay-then-live stream over `job_id`'s events.
    ///
    /// The snapshot is captured and the broadcast receiver registered under
    /// one lock, so no event can fall between replay and live. A subscriber
    /// that joins after the job finished still gets snapshot + `done`.
    pub fn subscribe(&self, job_id: &JobId) -> EventStream {
        let channel = self.channel(job_id);
        let heartbeat = self.heartbeat_interval;
        let job_id = job_id.clone();

        let (receiver, snapshot, done) = {
            let state = channel.state.lock().expect("channel lock poisoned");
            (
                channel.sender.subscribe(),
                state.latest.clone(),
                state.done.clone(),
            )
        };

        struct Sub {
            job_id: JobId,
            replay: Option<JobEvent>,
            pinned_done: Option<JobEvent>,
            receiver: broadcast::Receiver<JobEvent>,
            heartbeat: Duration,
            finished: bool,
        }

        let sub = Sub {
            job_id,
            replay: snapshot.map(JobEvent::Progress),
            pinned_done: done,
            receiver,
            heartbeat,
            finished: false,
        };

        Box::pin(stream::unfold(sub, |mut sub| async move {
            if sub.finished {
                return None;
            }
            if let Some(replayed) = sub.replay.take() {
                return Some((replayed, sub));
            }
            if let Some(done) = sub.pinned_done.take() {
                sub.finished = true;
                return Some((done, sub));
            }
            match tokio::time::timeout(sub.heartbeat, sub.receiver.recv()).await {
                Ok(Ok(event)) => {
                    if matches!(event, JobEvent::Done { .. }) {
                        sub.finished = true;
                    }
                    Some((event, sub))
                }
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    // Too slow to keep up: drop this subscriber rather than
                    // stall the job.
                    warn!(
                        job_id = %sub.job_id,
                        missed,
                        "subscriber lagged, closing its stream"
                    );
                    None
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => None,
                Err(_idle) => Some((JobEvent::Heartbeat, sub)),
            }
        }))
    }

    /// Latest snapshot for a job, if any event was ever published.
    pub fn latest(&self, job_id: &JobId) -> Option<StageEvent> {
        let channel = self.channel(job_id);
        let state = channel.state.lock().expect("channel lock poisoned");
        state.latest.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn hub() -> ProgressHub {
        ProgressHub::new(64, Duration::from_secs(60))
    }

    fn progress_of(event: &JobEvent) -> &StageEvent {
        match event {
            JobEvent::Progress(e) => e,
            other => panic!("expected progress event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn live_subscriber_sees_published_events_in_order() {
        let hub = hub();
        let id = JobId::new();
        let mut stream = hub.subscribe(&id);

        hub.publish(&id, StageEvent::new(1, "preprocess", "start").with_progress(0.0));
        hub.publish(&id, StageEvent::new(2, "ocr", "page 1/2").with_progress(0.3));

        assert_eq!(progress_of(&stream.next().await.unwrap()).stage, 1);
        assert_eq!(progress_of(&stream.next().await.unwrap()).stage, 2);
    }

    #[tokio::test]
    async fn late_subscriber_replays_snapshot_then_live() {
        let hub = hub();
        let id = JobId::new();

        hub.publish(&id, StageEvent::new(2, "ocr", "page 3/10").with_progress(0.2));

        let mut stream = hub.subscribe(&id);
        hub.publish(&id, StageEvent::new(2, "ocr", "page 4/10").with_progress(0.23));

        let replayed = stream.next().await.unwrap();
        assert_eq!(progress_of(&replayed).detail, "page 3/10");
        let live = stream.next().await.unwrap();
        assert_eq!(progress_of(&live).detail, "page 4/10");
    }

    #[tokio::test]
    async fn done_terminates_the_stream() {
        let hub = hub();
        let id = JobId::new();
        let mut stream = hub.subscribe(&id);

        hub.finish(&id, JobStatus::Completed, None);

        match stream.next().await.unwrap() {
            JobEvent::Done { status, error } => {
                assert_eq!(status, JobStatus::Completed);
                assert!(error.is_none());
            }
            other => panic!("expected done, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn subscriber_after_finish_gets_snapshot_and_done() {
        let hub = hub();
        let id = JobId::new();

        hub.publish(&id, StageEvent::new(4, "analyze", "combining").with_progress(0.9));
        hub.finish(&id, JobStatus::Failed, Some("engine exploded".into()));

        let mut stream = hub.subscribe(&id);
        assert_eq!(progress_of(&stream.next().await.unwrap()).stage, 4);
        match stream.next().await.unwrap() {
            JobEvent::Done { status, error } => {
                assert_eq!(status, JobStatus::Failed);
                assert_eq!(error.as_deref(), Some("engine exploded"));
            }
            other => panic!("expected done, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn progress_never_regresses_within_a_stage() {
        let hub = hub();
        let id = JobId::new();

        hub.publish(&id, StageEvent::new(2, "ocr", "page 5/10").with_progress(0.5));
        hub.publish(&id, StageEvent::new(2, "ocr", "stale").with_progress(0.2));

        assert_eq!(hub.latest(&id).unwrap().progress, 0.5);
    }

    #[tokio::test]
    async fn earlier_stage_events_are_discarded() {
        let hub = hub();
        let id = JobId::new();

        hub.publish(&id, StageEvent::new(3, "assemble", "merging").with_progress(0.55));
        hub.publish(&id, StageEvent::new(2, "ocr", "stale").with_progress(0.4));

        assert_eq!(hub.latest(&id).unwrap().stage, 3);
    }

    #[tokio::test]
    async fn new_document_resets_the_monotonicity_window() {
        let hub = hub();
        let id = JobId::new();

        hub.publish(
            &id,
            StageEvent::new(4, "analyze", "doc 0 done")
                .with_progress(1.0)
                .with_document(0, 2),
        );
        hub.publish(
            &id,
            StageEvent::new(1, "preprocess", "doc 1 start")
                .with_progress(0.0)
                .with_document(1, 2),
        );

        let latest = hub.latest(&id).unwrap();
        assert_eq!(latest.document_index, 1);
        assert_eq!(latest.stage, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_yields_heartbeats() {
        let hub = ProgressHub::new(64, Duration::from_millis(100));
        let id = JobId::new();
        let mut stream = hub.subscribe(&id);

        assert_eq!(stream.next().await.unwrap(), JobEvent::Heartbeat);
        assert_eq!(stream.next().await.unwrap(), JobEvent::Heartbeat);
    }

    #[tokio::test]
    async fn lagged_subscriber_is_dropped_not_stalled() {
        let hub = ProgressHub::new(16, Duration::from_secs(60));
        let id = JobId::new();
        let mut stream = hub.subscribe(&id);

        // Overrun the channel capacity without draining the subscriber.
        // publish() must never block on the slow receiver.
        for i in 0..100 {
            hub.publish(
                &id,
                StageEvent::new(2, "ocr", format!("page {i}")).with_progress(i as f32 / 100.0),
            );
        }

        // The subscriber observes the gap and its stream ends; it never
        // receives the full backlog.
        let mut received = 0;
        while let Some(event) = stream.next().await {
            assert!(matches!(event, JobEvent::Progress(_)));
            received += 1;
        }
        assert!(received < 100, "lagged subscriber should have been dropped");

        // The job itself is unaffected: a fresh subscriber still works.
        hub.publish(&id, StageEvent::new(2, "ocr", "page 100").with_progress(1.0));
        assert_eq!(hub.latest(&id).unwrap().detail, "page 100");
    }
}
