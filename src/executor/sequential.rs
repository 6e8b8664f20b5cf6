//! Per-(session, service) in-order dispatcher with cancellation.
//!
//! Each lane keeps the next index it expects, a queue of waiting tasks keyed by
//! index and at most one in-flight task. A task only runs once every lower index
//! has run, been cancelled or been declared lost. Waiting does not block a
//! thread: the caller's future parks on a oneshot until its turn arrives.

use crate::defaults;
use crate::executor::task::{SequentialTask, ServiceType, TaskOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Longest a task may wait for its turn before resolving `TimedOut`.
    pub max_wait_ms: u64,
    /// Index each new lane expects first.
    pub first_index: u64,
    /// Idle lanes older than this are dropped by `sweep_idle`.
    pub lane_idle_ttl_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: defaults::EXECUTOR_MAX_WAIT_MS,
            first_index: 0,
            lane_idle_ttl_ms: defaults::SESSION_TTL_MS,
        }
    }
}

type LaneKey = (String, ServiceType);

enum Turn {
    Go { cancel_rx: oneshot::Receiver<String> },
    Cancelled(String),
}

struct Waiter {
    ticket: u64,
    job_id: String,
    turn_tx: oneshot::Sender<Turn>,
}

/// A second task for an index that already ran, queued behind it.
struct Continuation {
    index: u64,
    waiter: Waiter,
}

struct InFlight {
    index: u64,
    ticket: u64,
    job_id: String,
    cancel_tx: oneshot::Sender<String>,
}

struct Lane {
    next_index: u64,
    current_index: Option<u64>,
    waiting: BTreeMap<u64, Waiter>,
    continuations: Vec<Continuation>,
    processing: Option<InFlight>,
    /// Indices that will never run: cancelled before submission, or lost.
    tombstones: BTreeMap<u64, String>,
    next_ticket: u64,
    last_activity: Instant,
}

impl Lane {
    fn new(first_index: u64) -> Self {
        Self {
            next_index: first_index,
            current_index: None,
            waiting: BTreeMap::new(),
            continuations: Vec::new(),
            processing: None,
            tombstones: BTreeMap::new(),
            next_ticket: 0,
            last_activity: Instant::now(),
        }
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn is_known(&self, index: u64) -> bool {
        index < self.next_index
            || self.waiting.contains_key(&index)
            || self.processing.as_ref().is_some_and(|p| p.index == index)
    }

    fn is_busy(&self) -> bool {
        self.processing.is_some() || !self.waiting.is_empty() || !self.continuations.is_empty()
    }

    /// Hands the turn to the next runnable waiter, if the lane is free.
    ///
    /// Continuations of indices already passed go before the next index.
    fn pump(&mut self) {
        if self.processing.is_some() {
            return;
        }
        loop {
            while self.tombstones.remove(&self.next_index).is_some() {
                self.next_index += 1;
            }
            self.tombstones = self.tombstones.split_off(&self.next_index);

            let (index, waiter) = if let Some(pos) = self
                .continuations
                .iter()
                .position(|c| c.index < self.next_index)
            {
                let continuation = self.continuations.remove(pos);
                (continuation.index, continuation.waiter)
            } else {
                let Some(waiter) = self.waiting.remove(&self.next_index) else {
                    return;
                };
                let index = self.next_index;
                self.next_index += 1;
                self.current_index = Some(index);
                (index, waiter)
            };

            let (cancel_tx, cancel_rx) = oneshot::channel();
            if waiter.turn_tx.send(Turn::Go { cancel_rx }).is_ok() {
                self.processing = Some(InFlight {
                    index,
                    ticket: waiter.ticket,
                    job_id: waiter.job_id,
                    cancel_tx,
                });
                return;
            }
            // Caller went away before its turn; move on.
        }
    }

    /// Resolves whatever task holds `index`. Returns true if a live task was resolved.
    fn cancel(&mut self, index: u64, reason: &str) -> bool {
        if let Some(waiter) = self.waiting.remove(&index) {
            self.tombstones.insert(index, reason.to_string());
            let delivered = waiter.turn_tx.send(Turn::Cancelled(reason.to_string())).is_ok();
            self.pump();
            return delivered;
        }
        if self.processing.as_ref().is_some_and(|p| p.index == index) {
            let delivered = self
                .processing
                .take()
                .is_some_and(|p| p.cancel_tx.send(reason.to_string()).is_ok());
            self.pump();
            return delivered;
        }
        if index >= self.next_index {
            self.tombstones.insert(index, reason.to_string());
            self.pump();
        }
        false
    }

    fn cancel_all(&mut self, reason: &str) -> usize {
        let mut resolved = 0;
        let queued = std::mem::take(&mut self.waiting)
            .into_values()
            .chain(std::mem::take(&mut self.continuations).into_iter().map(|c| c.waiter));
        for waiter in queued {
            if waiter.turn_tx.send(Turn::Cancelled(reason.to_string())).is_ok() {
                resolved += 1;
            }
        }
        if let Some(in_flight) = self.processing.take()
            && in_flight.cancel_tx.send(reason.to_string()).is_ok()
        {
            resolved += 1;
        }
        resolved
    }

    /// Drops the submission holding `ticket`, wherever it is.
    fn release(&mut self, index: u64, ticket: u64) {
        if self.waiting.get(&index).is_some_and(|w| w.ticket == ticket) {
            self.waiting.remove(&index);
        }
        self.continuations.retain(|c| c.waiter.ticket != ticket);
        if self.processing.as_ref().is_some_and(|p| p.ticket == ticket) {
            self.processing = None;
        }
    }
}

/// Point-in-time view of one lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneSnapshot {
    pub session_id: String,
    pub service_type: ServiceType,
    /// Highest index dispatched so far.
    pub current_index: Option<u64>,
    pub next_index: u64,
    pub queued: usize,
    pub processing: Option<u64>,
    pub processing_job_id: Option<String>,
    pub tombstones: usize,
}

type Lanes = Arc<Mutex<HashMap<LaneKey, Lane>>>;

/// Releases the lane slot held by one submission when its future finishes or is dropped.
struct SubmissionGuard {
    lanes: Lanes,
    key: LaneKey,
    index: u64,
    ticket: u64,
}

impl Drop for SubmissionGuard {
    fn drop(&mut self) {
        let mut lanes = self.lanes.lock();
        if let Some(lane) = lanes.get_mut(&self.key) {
            lane.release(self.index, self.ticket);
            lane.last_activity = Instant::now();
            lane.pump();
        }
    }
}

/// Orders downstream tasks per `(session, service)` by utterance index.
#[derive(Clone)]
pub struct SequentialExecutor {
    config: ExecutorConfig,
    lanes: Lanes,
}

impl SequentialExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs `task.execute` once every lower index in its lane has resolved.
    ///
    /// The task body runs on its own tokio task. Cancelling it while in flight
    /// resolves this call with `Cancelled` but lets the body finish in the
    /// background; it is never invoked if cancelled while still queued.
    ///
    /// A continuation task runs after its index instead of taking it: once the
    /// lane has passed the index it goes ahead of the next one, and it is never
    /// rejected as stale.
    pub async fn submit<F, Fut, T>(&self, task: SequentialTask<F>) -> TaskOutcome<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let SequentialTask {
            session_id,
            utterance_index: index,
            job_id,
            service_type,
            execute,
            continuation,
            ..
        } = task;
        let key: LaneKey = (session_id, service_type);

        let (turn_tx, mut turn_rx) = oneshot::channel();
        let ticket = {
            let mut lanes = self.lanes.lock();
            let lane = lanes
                .entry(key.clone())
                .or_insert_with(|| Lane::new(self.config.first_index));
            lane.last_activity = Instant::now();

            if let Some(reason) = lane.tombstones.get(&index) {
                tracing::debug!(
                    session_id = %key.0,
                    service = %service_type,
                    utterance_index = index,
                    "task cancelled before submission"
                );
                return TaskOutcome::Cancelled {
                    reason: reason.clone(),
                };
            }
            if !continuation && lane.is_known(index) {
                tracing::debug!(
                    session_id = %key.0,
                    service = %service_type,
                    utterance_index = index,
                    next_index = lane.next_index,
                    "stale task rejected"
                );
                return TaskOutcome::Stale;
            }
            let ticket = lane.ticket();
            let waiter = Waiter {
                ticket,
                job_id,
                turn_tx,
            };
            if continuation {
                lane.continuations.push(Continuation { index, waiter });
            } else {
                lane.waiting.insert(index, waiter);
            }
            lane.pump();
            ticket
        };

        let _guard = SubmissionGuard {
            lanes: self.lanes.clone(),
            key: key.clone(),
            index,
            ticket,
        };

        let max_wait = Duration::from_millis(self.config.max_wait_ms);
        let turn = match tokio::time::timeout(max_wait, &mut turn_rx).await {
            Ok(Ok(turn)) => turn,
            Ok(Err(_)) => {
                return TaskOutcome::Cancelled {
                    reason: "lane removed".to_string(),
                };
            }
            Err(_) => {
                let expired = if continuation {
                    self.expire_continuation(&key, ticket)
                } else {
                    self.expire_waiter(&key, index)
                };
                if expired {
                    tracing::warn!(
                        session_id = %key.0,
                        service = %service_type,
                        utterance_index = index,
                        continuation,
                        waited_ms = self.config.max_wait_ms,
                        "task timed out waiting for its turn"
                    );
                    return TaskOutcome::TimedOut;
                }
                // The turn was handed over just as the wait expired.
                match turn_rx.try_recv() {
                    Ok(turn) => turn,
                    Err(_) => return TaskOutcome::TimedOut,
                }
            }
        };

        let mut cancel_rx = match turn {
            Turn::Cancelled(reason) => return TaskOutcome::Cancelled { reason },
            Turn::Go { cancel_rx } => cancel_rx,
        };

        let handle = tokio::spawn(execute());
        tokio::select! {
            joined = handle => match joined {
                Ok(value) => TaskOutcome::Completed(value),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => TaskOutcome::Cancelled {
                    reason: "task aborted".to_string(),
                },
            },
            Ok(reason) = &mut cancel_rx => {
                tracing::debug!(
                    session_id = %key.0,
                    service = %service_type,
                    utterance_index = index,
                    reason = %reason,
                    "in-flight task cancelled"
                );
                TaskOutcome::Cancelled { reason }
            }
        }
    }

    /// Removes a timed-out waiter and declares lower unseen indices lost.
    fn expire_waiter(&self, key: &LaneKey, index: u64) -> bool {
        let mut lanes = self.lanes.lock();
        let Some(lane) = lanes.get_mut(key) else {
            return false;
        };
        if lane.waiting.remove(&index).is_none() {
            return false;
        }
        for missing in lane.next_index..index {
            if !lane.is_known(missing) {
                lane.tombstones
                    .entry(missing)
                    .or_insert_with(|| "lost".to_string());
            }
        }
        lane.tombstones.insert(index, "timed out".to_string());
        lane.pump();
        true
    }

    /// Removes a timed-out continuation. Lane order is unaffected.
    fn expire_continuation(&self, key: &LaneKey, ticket: u64) -> bool {
        let mut lanes = self.lanes.lock();
        let Some(lane) = lanes.get_mut(key) else {
            return false;
        };
        let before = lane.continuations.len();
        lane.continuations.retain(|c| c.waiter.ticket != ticket);
        lane.continuations.len() < before
    }

    /// Cancels `utterance_index` in one lane, or in every lane of the session.
    ///
    /// Queued and in-flight tasks resolve `Cancelled { reason }`; an index not
    /// yet submitted is tombstoned so later indices do not wait for it.
    /// Returns the number of live tasks resolved.
    pub fn cancel_task(
        &self,
        session_id: &str,
        utterance_index: u64,
        reason: &str,
        service_type: Option<ServiceType>,
    ) -> usize {
        let services: Vec<ServiceType> = match service_type {
            Some(service) => vec![service],
            None => ServiceType::ALL.to_vec(),
        };

        let mut lanes = self.lanes.lock();
        let mut resolved = 0;
        for service in services {
            let lane = lanes
                .entry((session_id.to_string(), service))
                .or_insert_with(|| Lane::new(self.config.first_index));
            lane.last_activity = Instant::now();
            if lane.cancel(utterance_index, reason) {
                resolved += 1;
            }
        }
        if resolved > 0 {
            tracing::debug!(
                session_id,
                utterance_index,
                reason,
                resolved,
                "cancelled superseded tasks"
            );
        }
        resolved
    }

    /// Resolves every task of a session and drops its lanes.
    pub fn cancel_session(&self, session_id: &str, reason: &str) -> usize {
        let mut lanes = self.lanes.lock();
        let keys: Vec<LaneKey> = lanes
            .keys()
            .filter(|(session, _)| session == session_id)
            .cloned()
            .collect();
        let mut resolved = 0;
        for key in keys {
            if let Some(mut lane) = lanes.remove(&key) {
                resolved += lane.cancel_all(reason);
            }
        }
        resolved
    }

    pub fn snapshot(&self) -> Vec<LaneSnapshot> {
        let lanes = self.lanes.lock();
        let mut snapshot: Vec<LaneSnapshot> = lanes
            .iter()
            .map(|((session_id, service_type), lane)| LaneSnapshot {
                session_id: session_id.clone(),
                service_type: *service_type,
                current_index: lane.current_index,
                next_index: lane.next_index,
                queued: lane.waiting.len() + lane.continuations.len(),
                processing: lane.processing.as_ref().map(|p| p.index),
                processing_job_id: lane.processing.as_ref().map(|p| p.job_id.clone()),
                tombstones: lane.tombstones.len(),
            })
            .collect();
        snapshot.sort_by(|a, b| {
            (a.session_id.as_str(), a.service_type).cmp(&(b.session_id.as_str(), b.service_type))
        });
        snapshot
    }

    /// Drops lanes with nothing queued or in flight that have been idle too long.
    pub fn sweep_idle(&self) -> usize {
        let ttl = Duration::from_millis(self.config.lane_idle_ttl_ms);
        let now = Instant::now();
        let mut lanes = self.lanes.lock();
        let before = lanes.len();
        lanes.retain(|_, lane| {
            lane.is_busy() || now.saturating_duration_since(lane.last_activity) <= ttl
        });
        before - lanes.len()
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.lock().len()
    }
}

impl Default for SequentialExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}
