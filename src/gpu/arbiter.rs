//! Lease-based admission control for shared GPUs.
//!
//! Each GPU key has at most one holder and a bounded FIFO of waiters. Leases
//! are force-expired once they outlive their hold limit, both lazily on every
//! arbiter call and by a watchdog task when a tokio runtime is available.

use crate::defaults;
use crate::error::{OrchestratorError, Result};
use crate::gpu::lease::{BusyPolicy, GpuLease, LeaseGuard, LeaseOutcome, LeaseRequest, SkipReason};
use crate::gpu::metrics::{GpuKeyMetrics, HolderSnapshot, LeaseCounters};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuArbiterConfig {
    pub gpu_keys: Vec<String>,
    pub default_queue_limit: usize,
    pub default_hold_max_ms: u64,
    pub default_wait_timeout_ms: u64,
}

impl Default for GpuArbiterConfig {
    fn default() -> Self {
        Self {
            gpu_keys: vec![defaults::GPU_KEY.to_string()],
            default_queue_limit: defaults::GPU_QUEUE_LIMIT,
            default_hold_max_ms: defaults::GPU_HOLD_MAX_MS,
            default_wait_timeout_ms: defaults::GPU_WAIT_TIMEOUT_MS,
        }
    }
}

/// Where `run_with_fallback` ended up running the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    Gpu,
    Cpu,
}

struct Holder {
    lease: GpuLease,
    expires_at: Instant,
    watchdog: Option<AbortHandle>,
}

impl Drop for Holder {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

struct Waiting {
    ticket: u64,
    request: LeaseRequest,
    hold_max_ms: u64,
    grant_tx: oneshot::Sender<GpuLease>,
}

#[derive(Default)]
struct Slot {
    holder: Option<Holder>,
    queue: VecDeque<Waiting>,
    counters: LeaseCounters,
}

pub(crate) struct ArbiterShared {
    config: GpuArbiterConfig,
    slots: Mutex<HashMap<String, Slot>>,
    next_id: AtomicU64,
    this: Weak<ArbiterShared>,
}

impl ArbiterShared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn grant(&self, slot: &mut Slot, gpu_key: &str, request: &LeaseRequest, hold_max_ms: u64) -> GpuLease {
        let now = Instant::now();
        let lease = GpuLease {
            lease_id: self.next_id(),
            gpu_key: gpu_key.to_string(),
            task_type: request.task_type,
            acquired_at: now,
            hold_max_ms,
        };
        let expires_at = now + Duration::from_millis(hold_max_ms);
        slot.holder = Some(Holder {
            lease: lease.clone(),
            expires_at,
            watchdog: self.spawn_watchdog(gpu_key, lease.lease_id, expires_at),
        });
        slot.counters.acquired += 1;
        tracing::debug!(
            gpu_key,
            lease_id = lease.lease_id,
            task = %request.task_type,
            "GPU lease granted"
        );
        lease
    }

    /// Hands the GPU to the first waiter that is still listening.
    fn grant_next(&self, slot: &mut Slot, gpu_key: &str) {
        while slot.holder.is_none() {
            let Some(waiting) = slot.queue.pop_front() else {
                return;
            };
            if waiting.grant_tx.is_closed() {
                continue;
            }
            let lease = self.grant(slot, gpu_key, &waiting.request, waiting.hold_max_ms);
            if waiting.grant_tx.send(lease).is_err() {
                // Waiter vanished between the check and the send.
                slot.holder = None;
                slot.counters.acquired = slot.counters.acquired.saturating_sub(1);
            }
        }
    }

    fn expire_if_overdue(&self, slot: &mut Slot, gpu_key: &str, now: Instant) {
        let overdue = slot.holder.as_ref().is_some_and(|h| h.expires_at <= now);
        if !overdue {
            return;
        }
        if let Some(holder) = slot.holder.take() {
            slot.counters.force_expired += 1;
            tracing::warn!(
                gpu_key,
                lease_id = holder.lease.lease_id,
                hold_max_ms = holder.lease.hold_max_ms,
                "force-expiring GPU lease"
            );
        }
        self.grant_next(slot, gpu_key);
    }

    /// Expires the lease at its deadline. Aborted when the holder goes away.
    fn spawn_watchdog(&self, gpu_key: &str, lease_id: u64, expires_at: Instant) -> Option<AbortHandle> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let shared = self.this.clone();
        let gpu_key = gpu_key.to_string();
        let task = handle.spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut slots = shared.slots.lock();
            if let Some(slot) = slots.get_mut(&gpu_key)
                && slot.holder.as_ref().is_some_and(|h| h.lease.lease_id == lease_id)
            {
                shared.expire_if_overdue(slot, &gpu_key, Instant::now());
            }
        });
        Some(task.abort_handle())
    }

    pub(crate) fn release(&self, lease: &GpuLease) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&lease.gpu_key) else {
            return;
        };
        let is_holder = slot
            .holder
            .as_ref()
            .is_some_and(|h| h.lease.lease_id == lease.lease_id);
        if !is_holder {
            tracing::debug!(
                gpu_key = %lease.gpu_key,
                lease_id = lease.lease_id,
                "release of expired lease ignored"
            );
            return;
        }
        slot.holder = None;
        slot.counters.released += 1;
        self.grant_next(slot, &lease.gpu_key);
    }
}

/// Serializes GPU-bound work across all sessions.
#[derive(Clone)]
pub struct GpuArbiter {
    shared: Arc<ArbiterShared>,
}

impl GpuArbiter {
    pub fn new(config: GpuArbiterConfig) -> Self {
        let slots = config
            .gpu_keys
            .iter()
            .map(|key| (key.clone(), Slot::default()))
            .collect();
        let shared = Arc::new_cyclic(|this| ArbiterShared {
            config,
            slots: Mutex::new(slots),
            next_id: AtomicU64::new(0),
            this: this.clone(),
        });
        Self { shared }
    }

    pub fn config(&self) -> &GpuArbiterConfig {
        &self.shared.config
    }

    /// Requests a lease. Only an unknown GPU key is an error.
    pub async fn acquire(&self, request: LeaseRequest) -> Result<LeaseOutcome> {
        let config = &self.shared.config;
        let hold_max_ms = request.hold_max_ms.unwrap_or(config.default_hold_max_ms);
        let wait_ms = request
            .wait_timeout_ms
            .unwrap_or(config.default_wait_timeout_ms);
        let gpu_key = request.gpu_key.clone();

        let (ticket, mut grant_rx) = {
            let mut slots = self.shared.slots.lock();
            let slot = slots
                .get_mut(&gpu_key)
                .ok_or_else(|| OrchestratorError::UnknownGpuKey {
                    gpu_key: gpu_key.clone(),
                })?;
            self.shared.expire_if_overdue(slot, &gpu_key, Instant::now());

            if slot.holder.is_none() && slot.queue.is_empty() {
                let lease = self.shared.grant(slot, &gpu_key, &request, hold_max_ms);
                return Ok(LeaseOutcome::Acquired(self.guard(lease)));
            }

            match request.policy {
                BusyPolicy::Skip => {
                    slot.counters.skipped += 1;
                    return Ok(LeaseOutcome::Skipped {
                        reason: SkipReason::GpuBusy,
                    });
                }
                BusyPolicy::FallbackCpu => {
                    slot.counters.fallback_cpu += 1;
                    return Ok(LeaseOutcome::FallbackCpu);
                }
                BusyPolicy::Wait => {}
            }

            if slot.queue.len() >= config.default_queue_limit {
                slot.counters.skipped += 1;
                slot.counters.queue_full += 1;
                tracing::debug!(gpu_key = %gpu_key, queue_length = slot.queue.len(), "GPU queue full");
                return Ok(LeaseOutcome::Skipped {
                    reason: SkipReason::QueueFull,
                });
            }

            let ticket = self.shared.next_id();
            let (grant_tx, grant_rx) = oneshot::channel();
            slot.queue.push_back(Waiting {
                ticket,
                request,
                hold_max_ms,
                grant_tx,
            });
            (ticket, grant_rx)
        };

        match tokio::time::timeout(Duration::from_millis(wait_ms), &mut grant_rx).await {
            Ok(Ok(lease)) => Ok(LeaseOutcome::Acquired(self.guard(lease))),
            Ok(Err(_)) => Ok(LeaseOutcome::Timeout),
            Err(_) => {
                let mut slots = self.shared.slots.lock();
                if let Some(slot) = slots.get_mut(&gpu_key) {
                    let before = slot.queue.len();
                    slot.queue.retain(|w| w.ticket != ticket);
                    if slot.queue.len() < before {
                        slot.counters.timeouts += 1;
                        tracing::debug!(gpu_key = %gpu_key, wait_ms, "GPU lease wait timed out");
                        return Ok(LeaseOutcome::Timeout);
                    }
                }
                drop(slots);
                // Granted just as the wait expired.
                match grant_rx.try_recv() {
                    Ok(lease) => Ok(LeaseOutcome::Acquired(self.guard(lease))),
                    Err(_) => Ok(LeaseOutcome::Timeout),
                }
            }
        }
    }

    fn guard(&self, lease: GpuLease) -> LeaseGuard {
        LeaseGuard::new(lease, Arc::downgrade(&self.shared))
    }

    /// Runs `gpu_work` under a lease, or `cpu_work` when no lease is granted.
    pub async fn run_with_fallback<G, GF, C, CF, T>(
        &self,
        request: LeaseRequest,
        gpu_work: G,
        cpu_work: C,
    ) -> Result<(ExecutionTarget, T)>
    where
        G: FnOnce(GpuLease) -> GF,
        GF: Future<Output = T>,
        C: FnOnce() -> CF,
        CF: Future<Output = T>,
    {
        let gpu_key = request.gpu_key.clone();
        match self.acquire(request).await? {
            LeaseOutcome::Acquired(guard) => {
                let value = gpu_work(guard.lease().clone()).await;
                guard.release();
                Ok((ExecutionTarget::Gpu, value))
            }
            outcome => {
                if !matches!(outcome, LeaseOutcome::FallbackCpu) {
                    self.record_fallback(&gpu_key);
                }
                tracing::debug!(gpu_key = %gpu_key, outcome = outcome.kind(), "running on CPU");
                Ok((ExecutionTarget::Cpu, cpu_work().await))
            }
        }
    }

    fn record_fallback(&self, gpu_key: &str) {
        if let Some(slot) = self.shared.slots.lock().get_mut(gpu_key) {
            slot.counters.fallback_cpu += 1;
        }
    }

    /// Point-in-time snapshot of every GPU key, sorted by key.
    pub fn metrics(&self) -> Vec<GpuKeyMetrics> {
        let now = Instant::now();
        let mut slots = self.shared.slots.lock();
        let mut metrics: Vec<GpuKeyMetrics> = slots
            .iter_mut()
            .map(|(key, slot)| {
                self.shared.expire_if_overdue(slot, key, now);
                GpuKeyMetrics {
                    gpu_key: key.clone(),
                    counters: slot.counters,
                    holder: slot.holder.as_ref().map(|h| HolderSnapshot {
                        lease_id: h.lease.lease_id,
                        task_type: h.lease.task_type,
                        held_ms: now.saturating_duration_since(h.lease.acquired_at).as_millis() as u64,
                    }),
                    queue_length: slot.queue.len(),
                    queue_limit: self.shared.config.default_queue_limit,
                }
            })
            .collect();
        metrics.sort_by(|a, b| a.gpu_key.cmp(&b.gpu_key));
        metrics
    }

    pub fn key_metrics(&self, gpu_key: &str) -> Result<GpuKeyMetrics> {
        self.metrics()
            .into_iter()
            .find(|m| m.gpu_key == gpu_key)
            .ok_or_else(|| OrchestratorError::UnknownGpuKey {
                gpu_key: gpu_key.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ServiceType;

    fn arbiter(queue_limit: usize) -> GpuArbiter {
        GpuArbiter::new(GpuArbiterConfig {
            default_queue_limit: queue_limit,
            ..GpuArbiterConfig::default()
        })
    }

    fn request() -> LeaseRequest {
        LeaseRequest::new(ServiceType::Nmt)
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_gpu_is_acquired_immediately() {
        let arb = arbiter(2);
        let guard = arb.acquire(request()).await.unwrap().into_guard().unwrap();
        assert_eq!(guard.lease().gpu_key, "gpu:0");
        assert_eq!(guard.lease().task_type, ServiceType::Nmt);

        let m = arb.key_metrics("gpu:0").unwrap();
        assert_eq!(m.counters.acquired, 1);
        assert_eq!(m.holder.map(|h| h.lease_id), Some(guard.lease().lease_id));

        drop(guard);
        let m = arb.key_metrics("gpu:0").unwrap();
        assert!(m.holder.is_none());
        assert_eq!(m.counters.released, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_lease_stops_its_watchdog() {
        let arb = arbiter(2);
        let guard = arb.acquire(request()).await.unwrap().into_guard().unwrap();
        let watchdog = arb
            .shared
            .slots
            .lock()
            .get("gpu:0")
            .and_then(|slot| slot.holder.as_ref())
            .and_then(|holder| holder.watchdog.clone())
            .unwrap();
        assert!(!watchdog.is_finished());

        guard.release();
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert!(watchdog.is_finished());
    }

    #[tokio::test]
    async fn test_unknown_key_is_an_error() {
        let arb = arbiter(2);
        let err = arb.acquire(request().on_gpu("gpu:9")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownGpuKey { gpu_key } if gpu_key == "gpu:9"));
        assert!(arb.key_metrics("gpu:9").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_is_granted_on_release_in_fifo_order() {
        let arb = arbiter(4);
        let first = arb.acquire(request()).await.unwrap().into_guard().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for name in ["a", "b"] {
            let arb = arb.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                let outcome = arb.acquire(request().with_timeout_ms(10_000)).await.unwrap();
                let guard = outcome.into_guard();
                order.lock().push(name);
                tokio::time::sleep(Duration::from_millis(10)).await;
                guard.is_some()
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(arb.key_metrics("gpu:0").unwrap().queue_length, 2);

        first.release();
        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
        assert_eq!(*order.lock(), vec!["a", "b"]);
        assert_eq!(arb.key_metrics("gpu:0").unwrap().counters.acquired, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_skips_with_reason() {
        let arb = arbiter(1);
        let _holder = arb.acquire(request()).await.unwrap();

        let queued = {
            let arb = arb.clone();
            tokio::spawn(async move { arb.acquire(request().with_timeout_ms(60_000)).await })
        };
        tokio::task::yield_now().await;

        match arb.acquire(request()).await.unwrap() {
            LeaseOutcome::Skipped { reason } => assert_eq!(reason, SkipReason::QueueFull),
            other => panic!("expected skip, got {}", other.kind()),
        }
        let m = arb.key_metrics("gpu:0").unwrap();
        assert_eq!(m.counters.queue_full, 1);
        assert_eq!(m.counters.skipped, 1);
        queued.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let arb = arbiter(4);
        let _holder = arb.acquire(request().with_hold_max_ms(60_000)).await.unwrap();

        let outcome = arb.acquire(request().with_timeout_ms(500)).await.unwrap();
        assert!(matches!(outcome, LeaseOutcome::Timeout));
        let m = arb.key_metrics("gpu:0").unwrap();
        assert_eq!(m.counters.timeouts, 1);
        assert_eq!(m.queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_policies_do_not_queue() {
        let arb = arbiter(4);
        let _holder = arb.acquire(request()).await.unwrap();

        let skip = arb.acquire(request().with_policy(BusyPolicy::Skip)).await.unwrap();
        assert!(matches!(
            skip,
            LeaseOutcome::Skipped {
                reason: SkipReason::GpuBusy
            }
        ));
        let cpu = arb
            .acquire(request().with_policy(BusyPolicy::FallbackCpu))
            .await
            .unwrap();
        assert!(matches!(cpu, LeaseOutcome::FallbackCpu));

        let m = arb.key_metrics("gpu:0").unwrap();
        assert_eq!(m.counters.fallback_cpu, 1);
        assert_eq!(m.queue_length, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_holder_is_force_expired_and_late_release_is_ignored() {
        let arb = arbiter(4);
        let stuck = arb
            .acquire(request().with_hold_max_ms(1000))
            .await
            .unwrap()
            .into_guard()
            .unwrap();

        let next = arb
            .acquire(request().with_timeout_ms(5000))
            .await
            .unwrap()
            .into_guard()
            .unwrap();
        assert_ne!(next.lease().lease_id, stuck.lease().lease_id);

        let m = arb.key_metrics("gpu:0").unwrap();
        assert_eq!(m.counters.force_expired, 1);

        // The stale guard must not release the new holder.
        drop(stuck);
        let m = arb.key_metrics("gpu:0").unwrap();
        assert_eq!(m.holder.map(|h| h.lease_id), Some(next.lease().lease_id));
        assert_eq!(m.counters.released, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_fallback_uses_cpu_when_busy() {
        let arb = arbiter(0);
        let (target, value) = arb
            .run_with_fallback(request(), |_| async { "gpu" }, || async { "cpu" })
            .await
            .unwrap();
        assert_eq!((target, value), (ExecutionTarget::Gpu, "gpu"));

        let _holder = arb.acquire(request()).await.unwrap();
        let (target, value) = arb
            .run_with_fallback(request(), |_| async { "gpu" }, || async { "cpu" })
            .await
            .unwrap();
        assert_eq!((target, value), (ExecutionTarget::Cpu, "cpu"));
        assert_eq!(arb.key_metrics("gpu:0").unwrap().counters.fallback_cpu, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let arb = GpuArbiter::new(GpuArbiterConfig {
            gpu_keys: vec!["gpu:0".into(), "gpu:1".into()],
            ..GpuArbiterConfig::default()
        });
        let a = arb.acquire(request()).await.unwrap();
        let b = arb.acquire(request().on_gpu("gpu:1")).await.unwrap();
        assert!(a.is_acquired() && b.is_acquired());
        let keys: Vec<String> = arb.metrics().into_iter().map(|m| m.gpu_key).collect();
        assert_eq!(keys, vec!["gpu:0", "gpu:1"]);
    }
}
