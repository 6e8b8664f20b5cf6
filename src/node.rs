//! The edge node: every orchestration subsystem behind one handle.
//!
//! ASR results go through the aggregation engine and then the forward-merge
//! length router. Whatever either of them makes moot (indices merged away,
//! deduplicated or discarded) is cancelled in every downstream lane the
//! pipeline mode uses, so the sequential executor never waits on an index that
//! will not be dispatched.

use crate::aggregation::{
    AggregationEngine, AggregationOutcome, AggregationStation, CommitReason, CommittedText,
    ForwardMergeHandler, LengthRoute, PendingMergeEntry, UtteranceRecord,
};
use crate::audio::{
    AssembledAudio, AudioAggregator, AudioChunk, AudioRef, ChunkFlags, SecondaryDecodeWorker,
    SecondaryDecoder,
};
use crate::cache::{CacheKey, CacheStatsSnapshot, ResultCache};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::executor::{LaneSnapshot, SequentialExecutor, SequentialTask, ServiceType, TaskOutcome};
use crate::gpu::{GpuArbiter, GpuKeyMetrics, LeaseOutcome, LeaseRequest};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

/// Text ready for downstream dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadyText {
    pub session_id: Option<String>,
    pub utterance_index: u64,
    pub text: String,
    pub lang: String,
    /// Contains text that was held back for merge.
    pub from_hold: bool,
    /// Trails text already dispatched under `utterance_index`; dispatch it with
    /// [`EdgeNode::dispatch_ready`] so it runs as a continuation.
    pub continues: bool,
}

impl ReadyText {
    fn from_held(session_id: Option<&str>, entry: PendingMergeEntry) -> Self {
        Self {
            session_id: session_id.map(String::from),
            utterance_index: entry.utterance_index,
            text: entry.text,
            lang: entry.lang,
            from_hold: true,
            continues: false,
        }
    }
}

/// What [`EdgeNode::handle_utterance`] did with one ASR result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtteranceReport {
    pub outcome: AggregationOutcome,
    pub ready: Vec<ReadyText>,
    /// Indices now held by the forward merge.
    pub held: Vec<u64>,
    /// Indices dropped for being too short.
    pub discarded: Vec<u64>,
    /// Queued or in-flight downstream tasks resolved as cancelled.
    pub cancelled: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionFlush {
    pub ready: Vec<ReadyText>,
    #[serde(skip)]
    pub audio: Vec<AssembledAudio>,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub aggregation: Vec<String>,
    pub forward_merge: Vec<String>,
    pub audio: Vec<String>,
    pub lanes: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.aggregation.is_empty()
            && self.forward_merge.is_empty()
            && self.audio.is_empty()
            && self.lanes == 0
    }
}

/// Point-in-time view of the node for observability consumers.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub version: String,
    pub sessions: usize,
    pub gpu: Vec<GpuKeyMetrics>,
    pub lanes: Vec<LaneSnapshot>,
    pub repair_cache: CacheStatsSnapshot,
    pub translation_cache: CacheStatsSnapshot,
}

pub struct EdgeNode {
    config: Config,
    engine: Arc<AggregationEngine>,
    forward_merge: ForwardMergeHandler,
    executor: SequentialExecutor,
    gpu: GpuArbiter,
    audio: AudioAggregator,
    repair_cache: Arc<ResultCache<String>>,
    translation_cache: Arc<ResultCache<String>>,
}

impl EdgeNode {
    /// Validates `config` and builds every subsystem on the system clock.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new), with the synchronous subsystems reading `clock`.
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let mut aggregation = config.aggregation.clone();
        aggregation.session_ttl_ms = config.session.ttl_ms;

        let node = Self {
            engine: Arc::new(AggregationEngine::new(aggregation, clock.clone())),
            forward_merge: ForwardMergeHandler::new(config.forward_merge.clone(), clock.clone()),
            executor: SequentialExecutor::new(config.executor.clone()),
            gpu: GpuArbiter::new(config.gpu.clone()),
            audio: AudioAggregator::new(config.audio.clone(), clock.clone()),
            repair_cache: Arc::new(ResultCache::new(config.cache.clone(), clock.clone())),
            translation_cache: Arc::new(ResultCache::new(config.cache.clone(), clock)),
            config,
        };
        tracing::info!(
            aggregation_mode = %node.config.aggregation.mode,
            pipeline_mode = %node.config.pipeline.mode,
            gpu_keys = ?node.config.gpu.gpu_keys,
            "edge node ready"
        );
        Ok(node)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Arc<AggregationEngine> {
        &self.engine
    }

    pub fn executor(&self) -> &SequentialExecutor {
        &self.executor
    }

    pub fn gpu(&self) -> &GpuArbiter {
        &self.gpu
    }

    /// A station that feeds this node's engine from a channel, in arrival order.
    pub fn aggregation_station(&self) -> AggregationStation {
        AggregationStation::new(self.engine.clone())
    }

    /// A secondary decode worker sharing this node's GPU.
    pub fn secondary_decoder<D: SecondaryDecoder>(&self, decoder: Arc<D>) -> SecondaryDecodeWorker<D> {
        let worker = SecondaryDecodeWorker::new(decoder, self.config.secondary_decode.clone());
        match self.config.gpu.gpu_keys.first() {
            Some(gpu_key) => worker.with_gpu(self.gpu.clone(), gpu_key.clone()),
            None => worker,
        }
    }

    pub fn ingest_audio(
        &self,
        session_id: &str,
        job_id: &str,
        chunk: AudioChunk,
        flags: ChunkFlags,
    ) -> Vec<AssembledAudio> {
        self.audio.process_chunk(session_id, job_id, chunk, flags)
    }

    pub fn recent_audio(&self, session_id: &str, duration_secs: f64) -> Option<AudioRef> {
        self.audio.recent_audio(session_id, duration_secs)
    }

    /// Aggregates one ASR result and routes whatever it commits.
    pub fn handle_utterance(&self, record: &UtteranceRecord) -> UtteranceReport {
        let session_id = record.session();
        let outcome = self.engine.process(record);

        let mut report = UtteranceReport {
            outcome: outcome.clone(),
            ready: Vec::new(),
            held: Vec::new(),
            discarded: Vec::new(),
            cancelled: 0,
        };
        let mut moot = outcome.superseded;
        for commit in &outcome.commits {
            // Only this utterance's own commit was cut; an earlier group it
            // closed still gets the chance to merge forward.
            let manual_cut = record.utterance.is_manual_cut
                && commit.utterance_index == record.utterance_index;
            self.route_commit(session_id, commit, manual_cut, &mut report, &mut moot);
        }
        report.cancelled = self.cancel_indices(session_id, moot, "superseded");
        report
    }

    fn route_commit(
        &self,
        session_id: Option<&str>,
        commit: &CommittedText,
        manual_cut: bool,
        report: &mut UtteranceReport,
        moot: &mut Vec<u64>,
    ) {
        let manual_cut = manual_cut || commit.reason == CommitReason::SessionFlush;
        let routed = self.forward_merge.process(
            session_id,
            &commit.text,
            commit.utterance_index,
            manual_cut,
            &commit.lang,
        );

        if let Some(entry) = routed.expired {
            report.ready.push(ReadyText::from_held(session_id, entry));
        }
        // A tail carry shares its index with a commit that went out, or that
        // was held and has just been merged back into it.
        let resumes_held = routed.merged_from == Some(routed.utterance_index);
        if let Some(merged_from) = routed.merged_from.filter(|_| !resumes_held) {
            moot.push(merged_from);
        }

        match routed.route {
            LengthRoute::Discard => {
                report.discarded.push(routed.utterance_index);
                if !commit.is_tail_carry {
                    moot.push(routed.utterance_index);
                }
            }
            LengthRoute::WaitForMerge { .. } => report.held.push(routed.utterance_index),
            LengthRoute::Send => report.ready.push(ReadyText {
                session_id: session_id.map(String::from),
                utterance_index: routed.utterance_index,
                text: routed.text,
                lang: commit.lang.clone(),
                from_hold: routed.merged_from.is_some(),
                continues: commit.is_tail_carry && !resumes_held,
            }),
        }
    }

    /// Cancels `indices` in every downstream lane of the pipeline mode.
    fn cancel_indices(&self, session_id: Option<&str>, mut indices: Vec<u64>, reason: &str) -> usize {
        let Some(session_id) = session_id else {
            return 0;
        };
        indices.sort_unstable();
        indices.dedup();
        let mut cancelled = 0;
        for index in indices {
            for service in self.config.pipeline.mode.downstream_services() {
                cancelled += self
                    .executor
                    .cancel_task(session_id, index, reason, Some(*service));
            }
        }
        cancelled
    }

    /// Runs `execute` in `(session_id, service)` lane order.
    pub async fn dispatch<F, Fut, T>(
        &self,
        session_id: &str,
        utterance_index: u64,
        service: ServiceType,
        execute: F,
    ) -> TaskOutcome<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.executor
            .submit(SequentialTask::new(session_id, utterance_index, service, execute))
            .await
    }

    /// Dispatches ready text, as a continuation when it trails text already
    /// sent under the same index.
    pub async fn dispatch_ready<F, Fut, T>(
        &self,
        session_id: &str,
        ready: &ReadyText,
        service: ServiceType,
        execute: F,
    ) -> TaskOutcome<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let mut task = SequentialTask::new(session_id, ready.utterance_index, service, execute);
        if ready.continues {
            task = task.continuation();
        }
        self.executor.submit(task).await
    }

    fn cache_for(&self, service: ServiceType) -> Option<&Arc<ResultCache<String>>> {
        match service {
            ServiceType::SemanticRepair => Some(&self.repair_cache),
            ServiceType::Nmt => Some(&self.translation_cache),
            ServiceType::Asr | ServiceType::Tts => None,
        }
    }

    /// Like [`dispatch`](Self::dispatch) for text services, answering from the
    /// result cache when possible.
    ///
    /// A cached answer still waits for its turn in the lane.
    pub async fn dispatch_cached<F, Fut>(
        &self,
        session_id: &str,
        utterance_index: u64,
        service: ServiceType,
        input: &str,
        execute: F,
    ) -> TaskOutcome<Result<String>>
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let cache = self.cache_for(service).cloned();
        let key = CacheKey::new(input, self.config.pipeline.model_version.clone());
        let cached = cache.as_ref().and_then(|c| c.get(&key));
        let input = input.to_string();

        let task = SequentialTask::new(session_id, utterance_index, service, move || async move {
            if let Some(hit) = cached {
                return Ok(hit);
            }
            let result = execute(input).await;
            if let (Ok(value), Some(cache)) = (&result, &cache) {
                cache.insert(key, value.clone());
            }
            result
        });
        self.executor.submit(task).await
    }

    pub async fn acquire_gpu_lease(&self, request: LeaseRequest) -> Result<LeaseOutcome> {
        self.gpu.acquire(request).await
    }

    /// Releases held texts whose merge deadline passed.
    pub fn flush_expired(&self) -> Vec<ReadyText> {
        self.forward_merge
            .flush_expired()
            .into_iter()
            .map(|(session_id, entry)| ReadyText::from_held(Some(&session_id), entry))
            .collect()
    }

    /// Emits everything the session still holds: pending text, held text and audio.
    pub fn flush_session(&self, session_id: &str) -> SessionFlush {
        let outcome = self.engine.flush(session_id);
        let mut report = UtteranceReport {
            outcome: outcome.clone(),
            ready: Vec::new(),
            held: Vec::new(),
            discarded: Vec::new(),
            cancelled: 0,
        };
        let mut moot = outcome.superseded;
        for commit in &outcome.commits {
            self.route_commit(Some(session_id), commit, true, &mut report, &mut moot);
        }
        if let Some(entry) = self.forward_merge.flush_session(session_id) {
            report.ready.push(ReadyText::from_held(Some(session_id), entry));
        }

        SessionFlush {
            ready: report.ready,
            audio: self.audio.flush_session(session_id),
            cancelled: self.cancel_indices(Some(session_id), moot, "session flush"),
        }
    }

    /// Drops all of a session's state and resolves its outstanding tasks.
    pub fn remove_session(&self, session_id: &str, reason: &str) -> usize {
        self.engine.remove_session(session_id);
        self.forward_merge.remove_session(session_id);
        self.audio.remove_session(session_id);
        let cancelled = self.executor.cancel_session(session_id, reason);
        tracing::info!(session_id, reason, cancelled, "session removed");
        cancelled
    }

    /// Destroys idle per-session state across every subsystem.
    pub fn sweep_sessions(&self) -> SweepReport {
        let ttl_ms = self.config.session.ttl_ms;
        let report = SweepReport {
            aggregation: self.engine.sweep_idle(),
            forward_merge: self.forward_merge.sweep_idle(ttl_ms),
            audio: self.audio.sweep_idle(ttl_ms),
            lanes: self.executor.sweep_idle(),
        };
        if !report.is_empty() {
            tracing::debug!(?report, "swept idle sessions");
        }
        report
    }

    pub fn gpu_metrics(&self) -> Vec<GpuKeyMetrics> {
        self.gpu.metrics()
    }

    pub fn executor_snapshot(&self) -> Vec<LaneSnapshot> {
        self.executor.snapshot()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            version: crate::version_string(),
            sessions: self.engine.session_count(),
            gpu: self.gpu_metrics(),
            lanes: self.executor_snapshot(),
            repair_cache: self.repair_cache.stats.snapshot(),
            translation_cache: self.translation_cache.stats.snapshot(),
        }
    }
}
