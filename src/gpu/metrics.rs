//! Per-GPU counters and point-in-time snapshots.

use crate::executor::ServiceType;
use serde::{Deserialize, Serialize};

/// Monotonic counters for one GPU key. Mutated only under the arbiter lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseCounters {
    pub acquired: u64,
    pub skipped: u64,
    pub fallback_cpu: u64,
    pub timeouts: u64,
    pub queue_full: u64,
    pub force_expired: u64,
    pub released: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderSnapshot {
    pub lease_id: u64,
    pub task_type: ServiceType,
    pub held_ms: u64,
}

/// Snapshot of one GPU key, suitable for serializing to observability consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuKeyMetrics {
    pub gpu_key: String,
    #[serde(flatten)]
    pub counters: LeaseCounters,
    pub holder: Option<HolderSnapshot>,
    pub queue_length: usize,
    pub queue_limit: usize,
}

impl GpuKeyMetrics {
    pub fn is_busy(&self) -> bool {
        self.holder.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_flat_counters() {
        let metrics = GpuKeyMetrics {
            gpu_key: "gpu:0".into(),
            counters: LeaseCounters {
                acquired: 3,
                queue_full: 1,
                skipped: 1,
                ..LeaseCounters::default()
            },
            holder: Some(HolderSnapshot {
                lease_id: 7,
                task_type: ServiceType::Nmt,
                held_ms: 120,
            }),
            queue_length: 2,
            queue_limit: 8,
        };
        let json: serde_json::Value = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["acquired"], 3);
        assert_eq!(json["queue_full"], 1);
        assert_eq!(json["holder"]["task_type"], "NMT");
        assert_eq!(json["queue_length"], 2);
        assert!(metrics.is_busy());
    }
}
