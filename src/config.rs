//! Configuration for the orchestrator.
//!
//! All tunables live in one [`OrchestratorConfig`] built through its
//! [`OrchestratorConfigBuilder`], so a config can be shared across tasks,
//! logged, and diffed between runs. Callers set only what they care about and
//! rely on documented defaults for the rest.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// Configuration for a [`crate::manager::JobManager`].
///
/// # Example
/// ```rust
/// use paperlens::OrchestratorConfig;
///
/// let config = OrchestratorConfig::builder()
///     .output_dir("output")
///     .chunk_threshold(40_000)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory for history artifacts and the history index. Default: `output`.
    pub output_dir: PathBuf,

    /// Directory for durable job snapshots. Default: `state`.
    ///
    /// One JSON file per job. This is what [`crate::manager::JobManager::recover`]
    /// scans after a restart, so it must live on the same durability domain as
    /// the output artifacts.
    pub state_dir: PathBuf,

    /// Rendering DPI forwarded to the rasterizer capability. Default: 200.
    pub dpi: u32,

    /// Maximum tokens the text capability may generate per call. Default: 4096.
    pub max_tokens: usize,

    /// Character count above which stage 4 switches to chunked
    /// (map-then-combine) analysis. Default: 50 000.
    ///
    /// The threshold reflects the single-request size the local text models
    /// handle reliably; below it the whole document goes through in one pass.
    pub chunk_threshold: usize,

    /// Target chunk size when a document has no usable section boundaries and
    /// must be split by size. Default: 30 000 characters.
    pub chunk_size: usize,

    /// How long a stage may wait for the model slot before the job fails with
    /// [`AnalysisError::ResourceTimeout`]. Default: 600 s.
    ///
    /// The bound exists so a wedged unload surfaces as a distinct operational
    /// error instead of a job that sits in `running` forever.
    pub gate_timeout: Duration,

    /// Idle interval after which a subscriber stream yields a heartbeat
    /// event. Default: 60 s.
    ///
    /// Keeps long-lived connections alive across proxies that drop idle
    /// streams; stage 2/4 inference calls can easily exceed a minute.
    pub heartbeat_interval: Duration,

    /// Capacity of each per-job event channel. Default: 256.
    ///
    /// A subscriber that falls more than this many events behind is dropped
    /// rather than allowed to stall the publisher.
    pub event_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            state_dir: PathBuf::from("state"),
            dpi: 200,
            max_tokens: 4096,
            chunk_threshold: 50_000,
            chunk_size: 30_000,
            gate_timeout: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(60),
            event_capacity: 256,
        }
    }
}

impl OrchestratorConfig {
    /// Create a new builder for `OrchestratorConfig`.
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Debug)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.state_dir = dir.into();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn chunk_threshold(mut self, chars: usize) -> Self {
        self.config.chunk_threshold = chars;
        self
    }

    pub fn chunk_size(mut self, chars: usize) -> Self {
        self.config.chunk_size = chars.max(1_000);
        self
    }

    pub fn gate_timeout(mut self, timeout: Duration) -> Self {
        self.config.gate_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn event_capacity(mut self, n: usize) -> Self {
        self.config.event_capacity = n.max(16);
        self
    }

    /// Build the configuration, validating cross-field constraints.
    pub fn build(self) -> Result<OrchestratorConfig, AnalysisError> {
        let c = &self.config;
        if c.chunk_size > c.chunk_threshold {
            return Err(AnalysisError::InvalidConfig(format!(
                "chunk_size ({}) must not exceed chunk_threshold ({})",
                c.chunk_size, c.chunk_threshold
            )));
        }
        if c.gate_timeout.is_zero() {
            return Err(AnalysisError::InvalidConfig(
                "gate_timeout must be non-zero".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::builder().build().unwrap();
        assert_eq!(config.chunk_threshold, 50_000);
        assert_eq!(config.chunk_size, 30_000);
        assert_eq!(config.dpi, 200);
    }

    #[test]
    fn dpi_is_clamped() {
        let config = OrchestratorConfig::builder().dpi(10_000).build().unwrap();
        assert_eq!(config.dpi, 400);
    }

    #[test]
    fn chunk_size_above_threshold_is_rejected() {
        let err = OrchestratorConfig::builder()
            .chunk_threshold(10_000)
            .chunk_size(20_000)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn zero_gate_timeout_is_rejected() {
        let err = OrchestratorConfig::builder()
            .gate_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("gate_timeout"));
    }
}
