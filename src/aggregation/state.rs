//! Per-session aggregator state.

use crate::aggregation::types::Utterance;
use std::collections::VecDeque;
use std::time::Instant;

/// Mutable aggregation state for one session.
///
/// Owned by the engine's session registry; only ever mutated under the
/// session's slot lock. `merge_group_start_time` is `Some` exactly while a
/// merge group is open.
#[derive(Debug, Clone, Default)]
pub struct AggregatorState {
    pub pending_text: String,
    pub pending_lang: String,
    /// Fragment withheld from the last soft commit.
    pub tail_buffer: String,
    pub last_utterance: Option<Utterance>,
    pub last_utterance_index: Option<u64>,
    pub merge_group_start_utterance: Option<Utterance>,
    pub merge_group_start_time: Option<Instant>,
    /// Arrival of the first utterance in `pending_indices`.
    pub pending_since: Option<Instant>,
    pub accumulated_audio_duration_ms: u64,
    /// Indices whose text is in `pending_text`, in arrival order.
    pub pending_indices: Vec<u64>,
    pub pending_job_id: Option<String>,
    /// Lowest quality among the pending utterances.
    pub pending_quality: Option<f32>,
    /// Most recent first.
    pub recent_committed_text: VecDeque<String>,
    pub last_commit_at: Option<Instant>,
    pub last_commit_quality: Option<f32>,
}

/// Pending text and its bookkeeping, taken out of the state at commit time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingGroup {
    pub text: String,
    pub lang: String,
    pub indices: Vec<u64>,
    pub job_id: Option<String>,
    pub quality: f32,
}

impl AggregatorState {
    pub fn has_pending(&self) -> bool {
        !self.pending_indices.is_empty() || !self.pending_text.trim().is_empty()
    }

    pub fn is_merge_group_open(&self) -> bool {
        self.merge_group_start_time.is_some()
    }

    pub(crate) fn open_merge_group(&mut self, start: Utterance, now: Instant) {
        if self.merge_group_start_time.is_none() {
            self.merge_group_start_time = Some(now);
            self.merge_group_start_utterance = Some(start);
        }
    }

    /// Adds an utterance's already-merged text and bookkeeping to the group.
    pub(crate) fn accumulate(
        &mut self,
        merged_text: String,
        utterance: &Utterance,
        utterance_index: u64,
        job_id: &str,
        now: Instant,
    ) {
        if self.pending_indices.is_empty() {
            self.pending_since = Some(now);
        }
        self.pending_text = merged_text;
        if !utterance.lang.is_empty() {
            self.pending_lang = utterance.lang.clone();
        }
        self.accumulated_audio_duration_ms = self
            .accumulated_audio_duration_ms
            .saturating_add(utterance.duration_ms());
        self.pending_indices.push(utterance_index);
        self.pending_job_id = Some(job_id.to_string());
        let quality = utterance.clamped_quality();
        self.pending_quality = Some(self.pending_quality.map_or(quality, |q| q.min(quality)));
    }

    /// Takes the pending text and clears all merge-group bookkeeping in one step.
    pub(crate) fn take_pending(&mut self) -> PendingGroup {
        let group = PendingGroup {
            text: std::mem::take(&mut self.pending_text),
            lang: self.pending_lang.clone(),
            indices: std::mem::take(&mut self.pending_indices),
            job_id: self.pending_job_id.take(),
            quality: self.pending_quality.take().unwrap_or(0.0),
        };
        self.merge_group_start_time = None;
        self.merge_group_start_utterance = None;
        self.pending_since = None;
        self.accumulated_audio_duration_ms = 0;
        group
    }

    pub(crate) fn record_commit(&mut self, text: &str, quality: f32, now: Instant, capacity: usize) {
        self.recent_committed_text.push_front(text.to_string());
        self.recent_committed_text.truncate(capacity);
        self.last_commit_at = Some(now);
        self.last_commit_quality = Some(quality);
    }

    pub fn was_recently_committed(&self, text: &str) -> bool {
        self.recent_committed_text.iter().any(|t| t == text)
    }
}
