//! Mutual exclusion over the single heavy-model slot.
//!
//! The local accelerator fits one large model at a time; loading the text
//! model while the vision model is resident would thrash or OOM the device.
//! [`ResourceGate`] moves that hardware budget into software: every stage
//! that needs inference acquires the gate first, naming the capability it is
//! about to make resident, and holds it for the duration of the stage. The
//! constraint is system-wide, not per-job — two concurrent jobs' heavy
//! stages serialize through the same gate.
//!
//! Release is RAII: the [`ResidentModel`] guard frees the slot on drop, so
//! any exit path out of a stage — success, `?`-propagated error, panic —
//! wakes the next waiter. There is no `release()` to forget.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::AnalysisError;

struct GateInner {
    slot: Arc<Semaphore>,
    /// Name of the capability currently holding the slot, for instrumentation.
    resident: Mutex<Option<String>>,
}

/// The one-resident-model gate. Cheap to clone; all clones share the slot.
#[derive(Clone)]
pub struct ResourceGate {
    inner: Arc<GateInner>,
}

impl ResourceGate {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                slot: Arc::new(Semaphore::new(1)),
                resident: Mutex::new(None),
            }),
        }
    }

    /// Wait for the slot, then mark `capability_id` resident.
    ///
    /// Suspends until the current holder (if any) drops its guard; the wait
    /// is bounded by `timeout`, after which the caller gets
    /// [`AnalysisError::ResourceTimeout`] instead of a generic failure —
    /// contention and breakage are different operational problems.
    pub async fn acquire(
        &self,
        capability_id: &str,
        timeout: Duration,
    ) -> Result<ResidentModel, AnalysisError> {
        let permit = tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.slot).acquire_owned(),
        )
        .await
        .map_err(|_| AnalysisError::ResourceTimeout {
            capability: capability_id.to_string(),
            waited_secs: timeout.as_secs(),
        })?
        .expect("gate semaphore is never closed");

        *self.inner.resident.lock().expect("resident lock poisoned") =
            Some(capability_id.to_string());
        debug!(capability = capability_id, "model slot acquired");

        Ok(ResidentModel {
            gate: Arc::clone(&self.inner),
            capability: capability_id.to_string(),
            _permit: permit,
        })
    }

    /// The capability currently holding the slot, if any.
    pub fn resident(&self) -> Option<String> {
        self.inner.resident.lock().expect("resident lock poisoned").clone()
    }
}

impl Default for ResourceGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard proving its holder owns the model slot.
///
/// Dropping it clears the resident marker and wakes the next waiter.
pub struct ResidentModel {
    gate: Arc<GateInner>,
    capability: String,
    _permit: OwnedSemaphorePermit,
}

impl ResidentModel {
    pub fn capability(&self) -> &str {
        &self.capability
    }
}

impl Drop for ResidentModel {
    fn drop(&mut self) {
        let mut resident = self.gate.resident.lock().expect("resident lock poisoned");
        if resident.as_deref() == Some(self.capability.as_str()) {
            *resident = None;
        }
        debug!(capability = %self.capability, "model slot released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUICK: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn acquire_marks_resident_and_drop_clears_it() {
        let gate = ResourceGate::new();
        assert_eq!(gate.resident(), None);

        let guard = gate.acquire("ocr-model", QUICK).await.unwrap();
        assert_eq!(gate.resident().as_deref(), Some("ocr-model"));
        assert_eq!(guard.capability(), "ocr-model");

        drop(guard);
        assert_eq!(gate.resident(), None);
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let gate = ResourceGate::new();
        let _held = gate.acquire("ocr-model", QUICK).await.unwrap();

        match gate.acquire("llm-model", QUICK).await {
            Err(AnalysisError::ResourceTimeout { capability, .. }) => {
                assert_eq!(capability, "llm-model");
            }
            Err(other) => panic!("expected ResourceTimeout, got {other:?}"),
            Ok(_) => panic!("acquire should have timed out while the slot is held"),
        }
    }

    #[tokio::test]
    async fn release_wakes_the_next_waiter() {
        let gate = ResourceGate::new();
        let held = gate.acquire("first", QUICK).await.unwrap();

        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move {
            gate2.acquire("second", Duration::from_secs(5)).await
        });

        // Give the waiter time to park on the semaphore, then free the slot.
        tokio::task::yield_now().await;
        drop(held);

        let guard = waiter.await.unwrap().unwrap();
        assert_eq!(guard.capability(), "second");
    }

    #[tokio::test]
    async fn guard_released_even_when_stage_errors() {
        let gate = ResourceGate::new();

        async fn failing_stage(gate: &ResourceGate) -> Result<(), AnalysisError> {
            let _resident = gate.acquire("ocr-model", QUICK).await?;
            Err(AnalysisError::capability(2, "engine exploded"))
        }

        assert!(failing_stage(&gate).await.is_err());
        // The error path dropped the guard; the slot must be free again.
        assert!(gate.acquire("llm-model", QUICK).await.is_ok());
    }
}
