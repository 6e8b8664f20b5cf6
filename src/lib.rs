//! utterflow - edge-node orchestration for real-time speech translation
//!
//! Aggregates streaming ASR results into committed text, dispatches downstream
//! translation and synthesis in utterance order, arbitrates shared GPUs, and
//! assembles captured audio into recognizer-ready buffers.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod aggregation;
pub mod audio;
pub mod cache;
pub mod clock;
pub mod config;
pub mod defaults;
pub mod error;
pub mod executor;
pub mod gpu;
pub mod logging;
pub mod node;
pub mod pipeline;
pub mod session;

// Subsystems
pub use aggregation::{AggregationEngine, AggregationOutcome, CommittedText, Utterance, UtteranceRecord};
pub use audio::{AudioAggregator, AudioChunk, AudioRingBuffer, SecondaryDecoder};
pub use executor::{SequentialExecutor, SequentialTask, ServiceType, TaskOutcome};
pub use gpu::{GpuArbiter, LeaseOutcome, LeaseRequest};
pub use node::{EdgeNode, ReadyText, UtteranceReport};

// Error handling
pub use error::{OrchestratorError, Result};

// Config
pub use config::Config;

// Time
pub use clock::{Clock, MockClock, SystemClock};

// Station framework (for advanced users)
pub use pipeline::error::{ErrorReporter, StationError};
pub use pipeline::station::Station;

/// Build version string with optional git commit hash.
///
/// Returns `"0.3.0+abc1234"` when git hash is available, `"0.3.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
