//! The aggregation decision engine.
//!
//! Turns a stream of ASR utterances into committed text. Each session's state
//! is mutated under its own registry slot lock, so concurrent results for one
//! session are applied one at a time in arrival order while different sessions
//! proceed independently.

use crate::aggregation::decision::{AggregationTuning, CommitInput, decide_action, decide_commit};
use crate::aggregation::dedup::{append_deduped, dedup_merge_precise};
use crate::aggregation::state::{AggregatorState, PendingGroup};
use crate::aggregation::tail::extract_commit_text;
use crate::aggregation::types::{
    AggregationMode, AggregationOutcome, CommitDecision, CommitReason, CommittedText, StreamAction,
    UtteranceRecord,
};
use crate::clock::{Clock, elapsed_ms};
use crate::defaults;
use crate::session::SessionRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Overlap with the previous commit shorter than this is treated as coincidence.
const MIN_RECOMMIT_OVERLAP_CHARS: usize = 4;

/// Configuration for the aggregation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub mode: AggregationMode,
    /// Explicit tuning; when absent the preset for `mode` is used.
    pub tuning: Option<AggregationTuning>,
    pub session_ttl_ms: u64,
    pub recent_committed_capacity: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            mode: AggregationMode::default(),
            tuning: None,
            session_ttl_ms: defaults::SESSION_TTL_MS,
            recent_committed_capacity: defaults::RECENT_COMMITTED_CAPACITY,
        }
    }
}

impl AggregationConfig {
    pub fn effective_tuning(&self) -> AggregationTuning {
        self.tuning
            .clone()
            .unwrap_or_else(|| AggregationTuning::for_mode(self.mode))
    }
}

pub struct AggregationEngine {
    config: AggregationConfig,
    tuning: AggregationTuning,
    sessions: SessionRegistry<AggregatorState>,
}

impl AggregationEngine {
    pub fn new(config: AggregationConfig, clock: Arc<dyn Clock>) -> Self {
        let tuning = config.effective_tuning();
        Self {
            config,
            tuning,
            sessions: SessionRegistry::new(clock),
        }
    }

    pub fn tuning(&self) -> &AggregationTuning {
        &self.tuning
    }

    /// Processes one ASR result.
    pub fn process(&self, record: &UtteranceRecord) -> AggregationOutcome {
        let Some(session_id) = record.session() else {
            return Self::passthrough(record);
        };

        let now = self.sessions.clock().now();
        let outcome = self.sessions.with_session(session_id, AggregatorState::default, |state| {
            self.apply(state, record, now)
        });

        for commit in &outcome.commits {
            tracing::debug!(
                session_id,
                utterance_index = commit.utterance_index,
                reason = ?commit.reason,
                merged = commit.merged_indices.len(),
                "committed text"
            );
        }
        outcome
    }

    /// Stateless handling for records without a session id.
    fn passthrough(record: &UtteranceRecord) -> AggregationOutcome {
        let utterance = &record.utterance;
        let text = utterance.text.trim();
        let mut outcome = AggregationOutcome {
            action: StreamAction::NewStream,
            decision: CommitDecision::default(),
            commits: Vec::new(),
            superseded: Vec::new(),
        };
        if text.is_empty() {
            outcome.superseded.push(record.utterance_index);
            return outcome;
        }
        outcome.decision.should_commit = true;
        outcome.commits.push(CommittedText {
            text: text.to_string(),
            utterance_index: record.utterance_index,
            job_id: record.job_id.clone(),
            lang: utterance.lang.clone(),
            quality: utterance.clamped_quality(),
            reason: CommitReason::Passthrough,
            is_last_in_merged_group: false,
            merged_indices: vec![record.utterance_index],
            is_tail_carry: false,
        });
        outcome
    }

    fn apply(
        &self,
        state: &mut AggregatorState,
        record: &UtteranceRecord,
        now: Instant,
    ) -> AggregationOutcome {
        let utterance = &record.utterance;
        let mut commits = Vec::new();
        let mut superseded = Vec::new();

        let action = decide_action(
            state.last_utterance.as_ref(),
            utterance,
            &self.tuning,
            state.accumulated_audio_duration_ms,
        );

        if action == StreamAction::NewStream && state.has_pending() {
            let group = state.take_pending();
            self.commit_group(
                state,
                group,
                true,
                CommitReason::StreamBoundary,
                now,
                &mut commits,
                &mut superseded,
            );
        }

        if action == StreamAction::Merge {
            // The group starts with the first pending utterance, not this one.
            let (start, started_at) = if state.has_pending() {
                (
                    state.last_utterance.clone().unwrap_or_else(|| utterance.clone()),
                    state.pending_since.unwrap_or(now),
                )
            } else {
                (utterance.clone(), now)
            };
            state.open_merge_group(start, started_at);
        }

        let lang = if utterance.lang.is_empty() {
            state.pending_lang.clone()
        } else {
            utterance.lang.clone()
        };
        let (merged, dedup) = append_deduped(&state.pending_text, utterance.text.trim(), &lang);
        if dedup.deduped {
            tracing::trace!(overlap = dedup.overlap_chars, "stripped re-emitted prefix");
        }
        state.accumulate(merged, utterance, record.utterance_index, &record.job_id, now);

        let decision = decide_commit(
            &CommitInput {
                action,
                pending_text: &state.pending_text,
                lang: &lang,
                merge_group_age_ms: state.merge_group_start_time.map(|t| elapsed_ms(t, now)),
                since_last_commit_ms: state.last_commit_at.map(|t| elapsed_ms(t, now)),
                is_final: utterance.is_final,
                is_manual_cut: utterance.is_manual_cut,
                is_pause_triggered: utterance.is_pause_triggered,
                is_timeout_triggered: record.is_timeout_triggered,
            },
            &self.tuning,
        );

        if decision.should_commit {
            let reason = if decision.commit_by_manual_cut {
                CommitReason::ManualCut
            } else if utterance.is_final {
                CommitReason::Final
            } else if decision.commit_by_timeout {
                CommitReason::Timeout
            } else {
                CommitReason::Threshold
            };
            let hard = utterance.is_final || utterance.ends_stream();
            let committed_before = commits.len();
            let group = state.take_pending();
            self.commit_group(
                state,
                group,
                hard,
                reason,
                now,
                &mut commits,
                &mut superseded,
            );
            if commits.len() > committed_before
                && let Some(commit) = commits.last_mut()
            {
                commit.is_last_in_merged_group = decision.is_last_in_merged_group;
            }
        }

        state.last_utterance = Some(utterance.clone());
        state.last_utterance_index = Some(record.utterance_index);

        AggregationOutcome {
            action,
            decision,
            commits,
            superseded,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_group(
        &self,
        state: &mut AggregatorState,
        group: PendingGroup,
        hard_boundary: bool,
        reason: CommitReason,
        now: Instant,
        commits: &mut Vec<CommittedText>,
        superseded: &mut Vec<u64>,
    ) {
        let Some((&carrier, merged_away)) = group.indices.split_last() else {
            return;
        };
        superseded.extend_from_slice(merged_away);

        let mut text = extract_commit_text(
            &group.text,
            &mut state.tail_buffer,
            hard_boundary,
            &group.lang,
            &self.tuning,
        );

        if let Some(previous) = state.recent_committed_text.front() {
            let dedup = dedup_merge_precise(previous, &text);
            if dedup.overlap_chars >= MIN_RECOMMIT_OVERLAP_CHARS {
                text = dedup.text.trim().to_string();
            }
        }

        if text.is_empty() || state.was_recently_committed(&text) {
            tracing::debug!(utterance_index = carrier, "dropping duplicate commit");
            superseded.push(carrier);
            return;
        }

        state.record_commit(
            &text,
            group.quality,
            now,
            self.config.recent_committed_capacity,
        );
        commits.push(CommittedText {
            text,
            utterance_index: carrier,
            job_id: group.job_id.unwrap_or_else(|| format!("job-{}", carrier)),
            lang: group.lang,
            quality: group.quality,
            reason,
            is_last_in_merged_group: !merged_away.is_empty(),
            merged_indices: group.indices.clone(),
            is_tail_carry: false,
        });
    }

    /// Commits whatever the session still holds, including any tail carry.
    ///
    /// The outcome also lists indices superseded by the flush.
    pub fn flush(&self, session_id: &str) -> AggregationOutcome {
        let now = self.sessions.clock().now();
        let mut outcome = AggregationOutcome {
            action: StreamAction::NewStream,
            decision: CommitDecision::default(),
            commits: Vec::new(),
            superseded: Vec::new(),
        };
        self.sessions.with_existing(session_id, |state| {
            let group = state.take_pending();
            if group.indices.is_empty() {
                if let Some(tail) = self.release_tail(state, now) {
                    outcome.commits.push(tail);
                }
                return;
            }
            self.commit_group(
                state,
                group,
                true,
                CommitReason::SessionFlush,
                now,
                &mut outcome.commits,
                &mut outcome.superseded,
            );
        });
        outcome.decision.should_commit = !outcome.commits.is_empty();
        outcome.decision.is_last_in_merged_group = !outcome.commits.is_empty();
        outcome
    }

    /// Emits a tail left over from the last soft commit on its own.
    ///
    /// The carrier index already went downstream with the rest of its text, so
    /// the tail is marked as a carry and never supersedes that index.
    fn release_tail(&self, state: &mut AggregatorState, now: Instant) -> Option<CommittedText> {
        let tail = std::mem::take(&mut state.tail_buffer);
        let text = tail.trim();
        let carrier = state.last_utterance_index?;
        if text.is_empty() || state.was_recently_committed(text) {
            return None;
        }
        let quality = state.last_commit_quality.unwrap_or(0.0);
        state.record_commit(text, quality, now, self.config.recent_committed_capacity);
        Some(CommittedText {
            text: text.to_string(),
            utterance_index: carrier,
            job_id: format!("job-{}", carrier),
            lang: state.pending_lang.clone(),
            quality,
            reason: CommitReason::SessionFlush,
            is_last_in_merged_group: false,
            merged_indices: Vec::new(),
            is_tail_carry: true,
        })
    }

    /// Like [`flush`](Self::flush), returning only the committed text.
    pub fn flush_session(&self, session_id: &str) -> Option<CommittedText> {
        self.flush(session_id).commits.pop()
    }

    pub fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id)
    }

    /// Destroys sessions idle longer than the configured TTL.
    pub fn sweep_idle(&self) -> Vec<String> {
        let expired = self.sessions.sweep_idle(self.config.session_ttl_ms);
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired idle aggregation sessions");
        }
        expired
    }

    /// Copy of a session's state, for inspection.
    pub fn session_state(&self, session_id: &str) -> Option<AggregatorState> {
        self.sessions.with_existing(session_id, |state| state.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
