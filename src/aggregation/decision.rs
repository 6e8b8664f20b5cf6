//! Stream and commit decisions.
//!
//! Both decisions are pure functions of their inputs: no clock reads, no
//! session lookups. The engine gathers the inputs and applies the results.

use crate::aggregation::dedup::uses_char_units;
use crate::aggregation::types::{AggregationMode, CommitDecision, StreamAction, Utterance};
use crate::defaults;
use serde::{Deserialize, Serialize};

/// Timing and length thresholds for one aggregation mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationTuning {
    /// Gaps below this continue the current stream.
    pub silence_threshold_ms: u64,
    /// A single stream never grows past this much audio.
    pub max_stream_duration_ms: u64,
    /// Utterances below this quality always start a new stream.
    pub min_quality: f32,
    /// Commit pending text once this long has passed since the last commit.
    pub commit_interval_ms: u64,
    /// Commit once pending text reaches this many characters (CJK scripts).
    pub commit_len_chars: usize,
    /// Commit once pending text reaches this many words (space-delimited scripts).
    pub commit_len_words: usize,
    /// Characters withheld as tail carry on a soft commit (CJK scripts).
    pub tail_carry_chars: usize,
    /// Words withheld as tail carry on a soft commit (space-delimited scripts).
    pub tail_carry_words: usize,
    /// An open merge group older than this is committed.
    pub merge_group_timeout_ms: u64,
}

impl AggregationTuning {
    pub fn for_mode(mode: AggregationMode) -> Self {
        match mode {
            AggregationMode::Offline => Self {
                silence_threshold_ms: 1000,
                max_stream_duration_ms: 20_000,
                min_quality: 0.3,
                commit_interval_ms: 6000,
                commit_len_chars: 30,
                commit_len_words: 15,
                tail_carry_chars: 2,
                tail_carry_words: 1,
                merge_group_timeout_ms: defaults::MERGE_GROUP_TIMEOUT_MS,
            },
            AggregationMode::Room => Self {
                silence_threshold_ms: 500,
                max_stream_duration_ms: 12_000,
                min_quality: 0.35,
                commit_interval_ms: 4000,
                commit_len_chars: 20,
                commit_len_words: 10,
                tail_carry_chars: 2,
                tail_carry_words: 1,
                merge_group_timeout_ms: defaults::MERGE_GROUP_TIMEOUT_MS,
            },
        }
    }
}

impl Default for AggregationTuning {
    fn default() -> Self {
        Self::for_mode(AggregationMode::default())
    }
}

/// Decides whether `current` continues the stream that `last` belongs to.
///
/// `stream_duration_ms` is the audio already accumulated in the open stream.
pub fn decide_action(
    last: Option<&Utterance>,
    current: &Utterance,
    tuning: &AggregationTuning,
    stream_duration_ms: u64,
) -> StreamAction {
    let Some(last) = last else {
        return StreamAction::NewStream;
    };

    // An explicitly terminated utterance always closes its stream.
    if last.ends_stream() {
        return StreamAction::NewStream;
    }

    let gap_ms = current.start_ms.saturating_sub(last.end_ms);
    let within_duration =
        stream_duration_ms.saturating_add(current.duration_ms()) <= tuning.max_stream_duration_ms;
    let quality_ok = current.clamped_quality() >= tuning.min_quality;

    if gap_ms < tuning.silence_threshold_ms && within_duration && quality_ok {
        StreamAction::Merge
    } else {
        StreamAction::NewStream
    }
}

/// Inputs to [`decide_commit`].
#[derive(Debug, Clone, Copy)]
pub struct CommitInput<'a> {
    pub action: StreamAction,
    /// Pending text including the current utterance.
    pub pending_text: &'a str,
    pub lang: &'a str,
    /// Age of the open merge group, if one is open.
    pub merge_group_age_ms: Option<u64>,
    /// Time since the session's last commit, if it ever committed.
    pub since_last_commit_ms: Option<u64>,
    pub is_final: bool,
    pub is_manual_cut: bool,
    pub is_pause_triggered: bool,
    pub is_timeout_triggered: bool,
}

/// Length of `text` in commit units: characters for CJK scripts, words otherwise.
pub fn text_units(text: &str, lang: &str) -> usize {
    if uses_char_units(text, lang) {
        text.chars().filter(|c| !c.is_whitespace()).count()
    } else {
        text.split_whitespace().count()
    }
}

fn threshold_reached(input: &CommitInput<'_>, tuning: &AggregationTuning) -> bool {
    if input.pending_text.trim().is_empty() {
        return false;
    }
    let limit = if uses_char_units(input.pending_text, input.lang) {
        tuning.commit_len_chars
    } else {
        tuning.commit_len_words
    };
    let long_enough = text_units(input.pending_text, input.lang) >= limit;
    let interval_elapsed = input
        .since_last_commit_ms
        .is_some_and(|ms| ms >= tuning.commit_interval_ms);
    long_enough || interval_elapsed
}

/// Decides whether accumulated pending text should be committed now.
pub fn decide_commit(input: &CommitInput<'_>, tuning: &AggregationTuning) -> CommitDecision {
    let commit_by_manual_cut = input.is_manual_cut || input.is_pause_triggered;
    let merge_group_expired = input.action == StreamAction::Merge
        && input
            .merge_group_age_ms
            .is_some_and(|age| age >= tuning.merge_group_timeout_ms);
    let commit_by_timeout = input.is_timeout_triggered || merge_group_expired;

    if commit_by_manual_cut && input.action == StreamAction::Merge {
        return CommitDecision {
            should_commit: true,
            commit_by_manual_cut,
            commit_by_timeout,
            is_last_in_merged_group: true,
        };
    }

    let should_commit = commit_by_manual_cut
        || threshold_reached(input, tuning)
        || input.is_final
        || commit_by_timeout;

    CommitDecision {
        should_commit,
        commit_by_manual_cut,
        commit_by_timeout,
        is_last_in_merged_group: should_commit && input.action == StreamAction::Merge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning_500() -> AggregationTuning {
        AggregationTuning {
            silence_threshold_ms: 500,
            ..AggregationTuning::default()
        }
    }

    fn input(action: StreamAction, pending: &str) -> CommitInput<'_> {
        CommitInput {
            action,
            pending_text: pending,
            lang: "en",
            merge_group_age_ms: None,
            since_last_commit_ms: None,
            is_final: false,
            is_manual_cut: false,
            is_pause_triggered: false,
            is_timeout_triggered: false,
        }
    }

    #[test]
    fn test_short_gap_merges() {
        let last = Utterance::new("so today", 0, 1000);
        let current = Utterance::new("we talk", 1200, 2000);
        let action = decide_action(Some(&last), &current, &tuning_500(), 1000);
        assert_eq!(action, StreamAction::Merge);
    }

    #[test]
    fn test_pause_on_previous_forces_new_stream() {
        let last = Utterance::new("so today", 0, 1000).pause_triggered();
        let current = Utterance::new("we talk", 1200, 2000);
        let action = decide_action(Some(&last), &current, &tuning_500(), 1000);
        assert_eq!(action, StreamAction::NewStream);
    }

    #[test]
    fn test_manual_cut_on_previous_forces_new_stream_even_when_overlapping() {
        let last = Utterance::new("stop", 0, 1000).manual_cut();
        let current = Utterance::new("again", 900, 1500);
        let action = decide_action(Some(&last), &current, &tuning_500(), 0);
        assert_eq!(action, StreamAction::NewStream);
    }

    #[test]
    fn test_first_utterance_starts_stream() {
        let current = Utterance::new("hello", 0, 500);
        assert_eq!(
            decide_action(None, &current, &tuning_500(), 0),
            StreamAction::NewStream
        );
    }

    #[test]
    fn test_long_gap_starts_new_stream() {
        let last = Utterance::new("a", 0, 1000);
        let current = Utterance::new("b", 1500, 2000);
        assert_eq!(
            decide_action(Some(&last), &current, &tuning_500(), 1000),
            StreamAction::NewStream
        );
    }

    #[test]
    fn test_stream_duration_cap_starts_new_stream() {
        let tuning = AggregationTuning {
            max_stream_duration_ms: 3000,
            ..tuning_500()
        };
        let last = Utterance::new("a", 0, 2500);
        let current = Utterance::new("b", 2600, 3600);
        assert_eq!(
            decide_action(Some(&last), &current, &tuning, 2500),
            StreamAction::NewStream
        );
    }

    #[test]
    fn test_low_quality_starts_new_stream() {
        let last = Utterance::new("a", 0, 1000);
        let current = Utterance::new("b", 1100, 2000).with_quality(0.1);
        assert_eq!(
            decide_action(Some(&last), &current, &tuning_500(), 1000),
            StreamAction::NewStream
        );
        // Out-of-range scores are clamped rather than rejected.
        let current = Utterance::new("b", 1100, 2000).with_quality(3.0);
        assert_eq!(
            decide_action(Some(&last), &current, &tuning_500(), 1000),
            StreamAction::Merge
        );
    }

    #[test]
    fn test_manual_cut_during_merge_flushes_group() {
        let mut i = input(StreamAction::Merge, "short");
        i.is_manual_cut = true;
        let d = decide_commit(&i, &tuning_500());
        assert!(d.should_commit);
        assert!(d.commit_by_manual_cut);
        assert!(d.is_last_in_merged_group);
    }

    #[test]
    fn test_pause_on_new_stream_commits_without_group_flag() {
        let mut i = input(StreamAction::NewStream, "short");
        i.is_pause_triggered = true;
        let d = decide_commit(&i, &tuning_500());
        assert!(d.should_commit);
        assert!(d.commit_by_manual_cut);
        assert!(!d.is_last_in_merged_group);
    }

    #[test]
    fn test_old_merge_group_commits_by_timeout() {
        let mut i = input(StreamAction::Merge, "short");
        i.merge_group_age_ms = Some(10_000);
        let d = decide_commit(&i, &tuning_500());
        assert!(d.should_commit);
        assert!(d.commit_by_timeout);
        assert!(d.is_last_in_merged_group);

        i.merge_group_age_ms = Some(9_999);
        assert!(!decide_commit(&i, &tuning_500()).should_commit);
    }

    #[test]
    fn test_group_age_ignored_for_new_stream() {
        let mut i = input(StreamAction::NewStream, "short");
        i.merge_group_age_ms = Some(60_000);
        let d = decide_commit(&i, &tuning_500());
        assert!(!d.commit_by_timeout);
        assert!(!d.should_commit);
    }

    #[test]
    fn test_explicit_timeout_flag_commits() {
        let mut i = input(StreamAction::NewStream, "short");
        i.is_timeout_triggered = true;
        let d = decide_commit(&i, &tuning_500());
        assert!(d.should_commit && d.commit_by_timeout);
    }

    #[test]
    fn test_final_commits() {
        let mut i = input(StreamAction::Merge, "short");
        i.is_final = true;
        let d = decide_commit(&i, &tuning_500());
        assert!(d.should_commit);
        assert!(d.is_last_in_merged_group);
        assert!(!d.commit_by_manual_cut);
    }

    #[test]
    fn test_word_threshold_commits() {
        let tuning = AggregationTuning {
            commit_len_words: 4,
            ..tuning_500()
        };
        assert!(!decide_commit(&input(StreamAction::NewStream, "one two three"), &tuning).should_commit);
        assert!(decide_commit(&input(StreamAction::NewStream, "one two three four"), &tuning).should_commit);
    }

    #[test]
    fn test_char_threshold_for_cjk() {
        let tuning = AggregationTuning {
            commit_len_chars: 5,
            ..tuning_500()
        };
        let mut i = input(StreamAction::NewStream, "今天天气很好");
        i.lang = "zh";
        assert!(decide_commit(&i, &tuning).should_commit);
        i.pending_text = "今天";
        assert!(!decide_commit(&i, &tuning).should_commit);
    }

    #[test]
    fn test_commit_interval_commits() {
        let mut i = input(StreamAction::NewStream, "hi");
        i.since_last_commit_ms = Some(6000);
        assert!(decide_commit(&i, &AggregationTuning::default()).should_commit);
    }

    #[test]
    fn test_empty_pending_never_commits_on_threshold() {
        let mut i = input(StreamAction::NewStream, "   ");
        i.since_last_commit_ms = Some(60_000);
        assert!(!decide_commit(&i, &AggregationTuning::default()).should_commit);
    }

    #[test]
    fn test_room_is_tighter_than_offline() {
        let offline = AggregationTuning::for_mode(AggregationMode::Offline);
        let room = AggregationTuning::for_mode(AggregationMode::Room);
        assert!(room.silence_threshold_ms < offline.silence_threshold_ms);
        assert!(room.commit_interval_ms < offline.commit_interval_ms);
        assert_eq!(offline.merge_group_timeout_ms, 10_000);
    }
}
