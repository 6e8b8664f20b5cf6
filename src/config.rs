use crate::aggregation::{AggregationConfig, AggregationMode, ForwardMergeConfig};
use crate::audio::{AudioAggregatorConfig, SecondaryDecodeConfig};
use crate::cache::CacheConfig;
use crate::defaults;
use crate::error::{OrchestratorError, Result};
use crate::executor::ExecutorConfig;
use crate::gpu::GpuArbiterConfig;
use crate::pipeline::PipelineMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub aggregation: AggregationConfig,
    pub forward_merge: ForwardMergeConfig,
    pub executor: ExecutorConfig,
    pub gpu: GpuArbiterConfig,
    pub audio: AudioAggregatorConfig,
    pub secondary_decode: SecondaryDecodeConfig,
    pub session: SessionConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineSection,
}

/// Session lifecycle shared by every per-session subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle sessions are dropped from the engine, forward merge and audio
    /// aggregator after this long. Overrides `aggregation.session_ttl_ms`.
    pub ttl_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_ms: defaults::SESSION_TTL_MS,
        }
    }
}

/// Which downstream services committed text fans out to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PipelineSection {
    pub mode: PipelineMode,
    /// Model version recorded in result cache keys.
    pub model_version: String,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e)
                if e.downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(Self::default())
            }
            Err(e) => Err(e.context(format!("Failed to load config from {}", path.display()))),
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - UTTERFLOW_AGGREGATION_MODE → aggregation.mode
    /// - UTTERFLOW_PIPELINE_MODE → pipeline.mode
    /// - UTTERFLOW_GPU_KEYS → gpu.gpu_keys (comma separated)
    /// - UTTERFLOW_GPU_QUEUE_LIMIT → gpu.default_queue_limit
    ///
    /// Empty or unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(mode) = std::env::var("UTTERFLOW_AGGREGATION_MODE")
            && !mode.is_empty()
        {
            match mode.parse::<AggregationMode>() {
                Ok(mode) => self.aggregation.mode = mode,
                Err(e) => tracing::warn!("ignoring UTTERFLOW_AGGREGATION_MODE: {}", e),
            }
        }

        if let Ok(mode) = std::env::var("UTTERFLOW_PIPELINE_MODE")
            && !mode.is_empty()
        {
            match mode.parse::<PipelineMode>() {
                Ok(mode) => self.pipeline.mode = mode,
                Err(e) => tracing::warn!("ignoring UTTERFLOW_PIPELINE_MODE: {}", e),
            }
        }

        if let Ok(keys) = std::env::var("UTTERFLOW_GPU_KEYS") {
            let keys: Vec<String> = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
            if !keys.is_empty() {
                self.gpu.gpu_keys = keys;
            }
        }

        if let Ok(limit) = std::env::var("UTTERFLOW_GPU_QUEUE_LIMIT")
            && !limit.is_empty()
        {
            match limit.trim().parse::<usize>() {
                Ok(limit) => self.gpu.default_queue_limit = limit,
                Err(e) => tracing::warn!("ignoring UTTERFLOW_GPU_QUEUE_LIMIT: {}", e),
            }
        }

        self
    }

    /// Rejects values the subsystems cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, message: &str) -> OrchestratorError {
            OrchestratorError::ConfigInvalidValue {
                key: key.to_string(),
                message: message.to_string(),
            }
        }

        let fm = &self.forward_merge;
        if fm.min_length_to_keep >= fm.min_length_to_send {
            return Err(invalid(
                "forward_merge.min_length_to_keep",
                "must be less than min_length_to_send",
            ));
        }
        if fm.min_length_to_send > fm.max_length_to_wait {
            return Err(invalid(
                "forward_merge.min_length_to_send",
                "must not exceed max_length_to_wait",
            ));
        }

        if self.gpu.gpu_keys.is_empty() {
            return Err(invalid("gpu.gpu_keys", "at least one GPU key is required"));
        }
        if self.gpu.gpu_keys.iter().any(|k| k.trim().is_empty()) {
            return Err(invalid("gpu.gpu_keys", "GPU keys must not be blank"));
        }
        if self.gpu.default_queue_limit == 0 {
            return Err(invalid("gpu.default_queue_limit", "must be positive"));
        }
        if self.gpu.default_hold_max_ms == 0 {
            return Err(invalid("gpu.default_hold_max_ms", "must be positive"));
        }

        if self.secondary_decode.max_concurrency == 0 {
            return Err(invalid("secondary_decode.max_concurrency", "must be positive"));
        }
        if self.secondary_decode.timeout_ms == 0 {
            return Err(invalid("secondary_decode.timeout_ms", "must be positive"));
        }

        if self.executor.max_wait_ms == 0 {
            return Err(invalid("executor.max_wait_ms", "must be positive"));
        }
        if self.session.ttl_ms == 0 {
            return Err(invalid("session.ttl_ms", "must be positive"));
        }
        if self.audio.ring_buffer.max_duration_ms == 0 {
            return Err(invalid("audio.ring_buffer.max_duration_ms", "must be positive"));
        }

        if let Some(tuning) = &self.aggregation.tuning
            && !(0.0..=1.0).contains(&tuning.min_quality)
        {
            return Err(invalid("aggregation.tuning.min_quality", "must be within [0, 1]"));
        }

        Ok(())
    }
}
