//! Admission-controlled secondary (higher-quality, slower) re-decoding.
//!
//! At most `max_concurrency` decodes run at once and at most `max_queue` wait
//! behind them; anything beyond that is skipped rather than queued. Each decode
//! call races an explicit timeout.

use crate::audio::ring_buffer::AudioRef;
use crate::defaults;
use crate::error::Result;
use crate::executor::ServiceType;
use crate::gpu::{BusyPolicy, GpuArbiter, LeaseOutcome, LeaseRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// A slower, more accurate recognizer run over buffered audio.
#[async_trait]
pub trait SecondaryDecoder: Send + Sync {
    async fn decode(&self, audio: AudioRef) -> Result<String>;

    fn name(&self) -> &str {
        "secondary"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecondaryDecodeConfig {
    pub max_concurrency: usize,
    pub max_queue: usize,
    pub timeout_ms: u64,
}

impl Default for SecondaryDecodeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: defaults::SECONDARY_DECODE_MAX_CONCURRENCY,
            max_queue: defaults::SECONDARY_DECODE_MAX_QUEUE,
            timeout_ms: defaults::SECONDARY_DECODE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeSkipReason {
    QueueFull,
    GpuBusy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecondaryDecodeOutcome {
    Decoded(String),
    Skipped { reason: DecodeSkipReason },
    TimedOut,
    Failed { message: String },
}

#[derive(Debug, Default)]
struct DecodeCounters {
    decoded: AtomicU64,
    skipped: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryDecodeStats {
    pub decoded: u64,
    pub skipped: u64,
    pub timed_out: u64,
    pub failed: u64,
    /// Running plus waiting requests at snapshot time.
    pub outstanding: usize,
}

/// Decrements the outstanding count when a request leaves the worker.
struct OutstandingSlot(Arc<AtomicUsize>);

impl Drop for OutstandingSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SecondaryDecodeWorker<D: SecondaryDecoder> {
    decoder: Arc<D>,
    config: SecondaryDecodeConfig,
    permits: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
    counters: DecodeCounters,
    gpu: Option<(GpuArbiter, String)>,
}

impl<D: SecondaryDecoder> SecondaryDecodeWorker<D> {
    pub fn new(decoder: Arc<D>, config: SecondaryDecodeConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            decoder,
            config,
            permits,
            outstanding: Arc::new(AtomicUsize::new(0)),
            counters: DecodeCounters::default(),
            gpu: None,
        }
    }

    /// Requires a GPU lease per decode; a busy GPU skips the request.
    pub fn with_gpu(mut self, arbiter: GpuArbiter, gpu_key: impl Into<String>) -> Self {
        self.gpu = Some((arbiter, gpu_key.into()));
        self
    }

    fn try_admit(&self) -> Option<OutstandingSlot> {
        let capacity = self.config.max_concurrency.max(1) + self.config.max_queue;
        self.outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .ok()
            .map(|_| OutstandingSlot(self.outstanding.clone()))
    }

    fn skip(&self, reason: DecodeSkipReason) -> SecondaryDecodeOutcome {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(decoder = self.decoder.name(), ?reason, "secondary decode skipped");
        SecondaryDecodeOutcome::Skipped { reason }
    }

    pub async fn decode(&self, audio: AudioRef) -> SecondaryDecodeOutcome {
        let Some(_slot) = self.try_admit() else {
            return self.skip(DecodeSkipReason::QueueFull);
        };

        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return self.skip(DecodeSkipReason::QueueFull);
        };

        let _lease = match &self.gpu {
            Some((arbiter, gpu_key)) => {
                let request = LeaseRequest::new(ServiceType::Asr)
                    .on_gpu(gpu_key.clone())
                    .with_policy(BusyPolicy::Skip);
                match arbiter.acquire(request).await {
                    Ok(LeaseOutcome::Acquired(guard)) => Some(guard),
                    Ok(_) => return self.skip(DecodeSkipReason::GpuBusy),
                    Err(e) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        return SecondaryDecodeOutcome::Failed {
                            message: e.to_string(),
                        };
                    }
                }
            }
            None => None,
        };

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, self.decoder.decode(audio)).await {
            Ok(Ok(text)) => {
                self.counters.decoded.fetch_add(1, Ordering::Relaxed);
                SecondaryDecodeOutcome::Decoded(text)
            }
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(decoder = self.decoder.name(), error = %e, "secondary decode failed");
                SecondaryDecodeOutcome::Failed {
                    message: e.to_string(),
                }
            }
            Err(_) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    decoder = self.decoder.name(),
                    timeout_ms = self.config.timeout_ms,
                    "secondary decode timed out"
                );
                SecondaryDecodeOutcome::TimedOut
            }
        }
    }

    pub fn stats(&self) -> SecondaryDecodeStats {
        SecondaryDecodeStats {
            decoded: self.counters.decoded.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            outstanding: self.outstanding.load(Ordering::SeqCst),
        }
    }
}
