//! Pipeline plumbing shared by the orchestration stages.
//!
//! Stations run in their own threads, connected by bounded crossbeam channels
//! for backpressure. [`PipelineMode`] decides which downstream services a
//! committed utterance fans out to.

pub mod error;
pub mod mode;
pub mod station;

pub use error::{ErrorReporter, StationError, TracingReporter};
pub use mode::PipelineMode;
pub use station::{Station, StationRunner};
