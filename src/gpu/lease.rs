//! Lease requests, grants and outcomes.

use crate::defaults;
use crate::executor::ServiceType;
use crate::gpu::arbiter::ArbiterShared;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Weak;
use tokio::time::Instant;

/// What the caller wants to happen when the GPU is held by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Queue (bounded) until granted or the wait timeout elapses.
    #[default]
    Wait,
    /// Give up immediately with `Skipped { reason: GpuBusy }`.
    Skip,
    /// Give up immediately and run on CPU.
    FallbackCpu,
}

/// A request for exclusive use of one GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub task_type: ServiceType,
    pub gpu_key: String,
    /// Overrides the arbiter's default wait timeout.
    pub wait_timeout_ms: Option<u64>,
    /// Overrides the arbiter's default hold limit.
    pub hold_max_ms: Option<u64>,
    pub policy: BusyPolicy,
}

impl LeaseRequest {
    pub fn new(task_type: ServiceType) -> Self {
        Self {
            task_type,
            gpu_key: defaults::GPU_KEY.to_string(),
            wait_timeout_ms: None,
            hold_max_ms: None,
            policy: BusyPolicy::Wait,
        }
    }

    pub fn on_gpu(mut self, gpu_key: impl Into<String>) -> Self {
        self.gpu_key = gpu_key.into();
        self
    }

    pub fn with_timeout_ms(mut self, wait_timeout_ms: u64) -> Self {
        self.wait_timeout_ms = Some(wait_timeout_ms);
        self
    }

    pub fn with_hold_max_ms(mut self, hold_max_ms: u64) -> Self {
        self.hold_max_ms = Some(hold_max_ms);
        self
    }

    pub fn with_policy(mut self, policy: BusyPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// A granted, time-bounded exclusive hold on a GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuLease {
    pub lease_id: u64,
    pub gpu_key: String,
    pub task_type: ServiceType,
    pub acquired_at: Instant,
    pub hold_max_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    QueueFull,
    GpuBusy,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::QueueFull => "queue_full",
            SkipReason::GpuBusy => "gpu_busy",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a lease request. Contention is never an error.
#[derive(Debug)]
pub enum LeaseOutcome {
    Acquired(LeaseGuard),
    Skipped { reason: SkipReason },
    Timeout,
    FallbackCpu,
}

impl LeaseOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseOutcome::Acquired(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LeaseOutcome::Acquired(_) => "ACQUIRED",
            LeaseOutcome::Skipped { .. } => "SKIPPED",
            LeaseOutcome::Timeout => "TIMEOUT",
            LeaseOutcome::FallbackCpu => "FALLBACK_CPU",
        }
    }

    pub fn into_guard(self) -> Option<LeaseGuard> {
        match self {
            LeaseOutcome::Acquired(guard) => Some(guard),
            _ => None,
        }
    }
}

/// Holds a lease and releases it when dropped.
pub struct LeaseGuard {
    lease: GpuLease,
    arbiter: Weak<ArbiterShared>,
    released: bool,
}

impl LeaseGuard {
    pub(crate) fn new(lease: GpuLease, arbiter: Weak<ArbiterShared>) -> Self {
        Self {
            lease,
            arbiter,
            released: false,
        }
    }

    pub fn lease(&self) -> &GpuLease {
        &self.lease
    }

    /// Releases the lease now. A lease that was already force-expired is left alone.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(shared) = self.arbiter.upgrade() {
            shared.release(&self.lease);
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("lease", &self.lease)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder_defaults() {
        let req = LeaseRequest::new(ServiceType::Tts);
        assert_eq!(req.gpu_key, "gpu:0");
        assert_eq!(req.policy, BusyPolicy::Wait);
        assert!(req.wait_timeout_ms.is_none());

        let req = req
            .on_gpu("gpu:1")
            .with_timeout_ms(250)
            .with_hold_max_ms(1000)
            .with_policy(BusyPolicy::FallbackCpu);
        assert_eq!(req.gpu_key, "gpu:1");
        assert_eq!(req.wait_timeout_ms, Some(250));
        assert_eq!(req.hold_max_ms, Some(1000));
        assert_eq!(req.policy, BusyPolicy::FallbackCpu);
    }

    #[test]
    fn test_skip_reason_strings() {
        assert_eq!(SkipReason::QueueFull.to_string(), "queue_full");
        assert_eq!(SkipReason::GpuBusy.as_str(), "gpu_busy");
    }

    #[test]
    fn test_outcome_kinds() {
        assert_eq!(LeaseOutcome::Timeout.kind(), "TIMEOUT");
        assert_eq!(LeaseOutcome::FallbackCpu.kind(), "FALLBACK_CPU");
        assert!(
            LeaseOutcome::Skipped {
                reason: SkipReason::QueueFull
            }
            .into_guard()
            .is_none()
        );
    }
}
