//! GPU arbiter: lease-based admission control for GPU-bound work.

pub mod arbiter;
pub mod lease;
pub mod metrics;

pub use arbiter::{ExecutionTarget, GpuArbiter, GpuArbiterConfig};
pub use lease::{BusyPolicy, GpuLease, LeaseGuard, LeaseOutcome, LeaseRequest, SkipReason};
pub use metrics::{GpuKeyMetrics, HolderSnapshot, LeaseCounters};
