//! Length-based routing of committed text ahead of semantic repair.
//!
//! Very short commits are discarded, medium ones are held for a few seconds in
//! case the next commit continues them, long ones are sent straight away.

use crate::aggregation::dedup::append_deduped;
use crate::clock::Clock;
use crate::defaults;
use crate::session::SessionRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardMergeConfig {
    /// Shorter text is discarded.
    pub min_length_to_keep: usize,
    pub min_length_to_send: usize,
    /// Longer text is always sent immediately.
    pub max_length_to_wait: usize,
    pub wait_timeout_ms: u64,
}

impl Default for ForwardMergeConfig {
    fn default() -> Self {
        Self {
            min_length_to_keep: defaults::MIN_LENGTH_TO_KEEP,
            min_length_to_send: defaults::MIN_LENGTH_TO_SEND,
            max_length_to_wait: defaults::MAX_LENGTH_TO_WAIT,
            wait_timeout_ms: defaults::FORWARD_MERGE_WAIT_TIMEOUT_MS,
        }
    }
}

/// Where a piece of text goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthRoute {
    Discard,
    /// Hold for merge with the next text until `wait_until`.
    WaitForMerge { wait_until: Instant },
    Send,
}

impl LengthRoute {
    pub fn is_discard(&self) -> bool {
        matches!(self, LengthRoute::Discard)
    }
}

/// Routes `text` by its character length.
pub fn decide(config: &ForwardMergeConfig, text: &str, is_manual_cut: bool, now: Instant) -> LengthRoute {
    let length = text.trim().chars().count();
    if length < config.min_length_to_keep {
        return LengthRoute::Discard;
    }
    if length > config.max_length_to_wait || is_manual_cut {
        return LengthRoute::Send;
    }
    // Both the keep..=send and send..=wait bands hold unless manually cut.
    LengthRoute::WaitForMerge {
        wait_until: now + Duration::from_millis(config.wait_timeout_ms),
    }
}

/// A short text held back for possible merge with the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMergeEntry {
    pub text: String,
    pub utterance_index: u64,
    pub lang: String,
    pub wait_until: Instant,
    pub created_at: Instant,
}

/// Result of [`ForwardMergeHandler::process`].
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardMergeOutput {
    pub route: LengthRoute,
    /// Text after merging any held entry into it.
    pub text: String,
    pub utterance_index: u64,
    /// Index of a held entry merged into this text; its downstream work is moot.
    pub merged_from: Option<u64>,
    /// A held entry that expired before this text arrived; emit it on its own.
    pub expired: Option<PendingMergeEntry>,
}

#[derive(Debug, Default)]
struct MergeSlot {
    pending: Option<PendingMergeEntry>,
}

pub struct ForwardMergeHandler {
    config: ForwardMergeConfig,
    sessions: SessionRegistry<MergeSlot>,
}

impl ForwardMergeHandler {
    pub fn new(config: ForwardMergeConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            sessions: SessionRegistry::new(clock),
        }
    }

    pub fn config(&self) -> &ForwardMergeConfig {
        &self.config
    }

    /// Routes one committed text, merging in the session's held entry.
    ///
    /// Without a session id nothing is held: text that would wait is sent.
    pub fn process(
        &self,
        session_id: Option<&str>,
        text: &str,
        utterance_index: u64,
        is_manual_cut: bool,
        lang: &str,
    ) -> ForwardMergeOutput {
        let now = self.sessions.clock().now();
        let text = text.trim();

        let Some(session_id) = session_id.filter(|s| !s.trim().is_empty()) else {
            let route = match decide(&self.config, text, is_manual_cut, now) {
                LengthRoute::WaitForMerge { .. } => LengthRoute::Send,
                other => other,
            };
            return ForwardMergeOutput {
                route,
                text: text.to_string(),
                utterance_index,
                merged_from: None,
                expired: None,
            };
        };

        let output = self.sessions.with_session(session_id, MergeSlot::default, |slot| {
            let mut merged_text = text.to_string();
            let mut merged_from = None;
            let mut expired = None;

            if let Some(entry) = slot.pending.take() {
                if now >= entry.wait_until {
                    expired = Some(entry);
                } else {
                    let (combined, _) = append_deduped(&entry.text, text, lang);
                    merged_text = combined;
                    merged_from = Some(entry.utterance_index);
                }
            }

            let route = decide(&self.config, &merged_text, is_manual_cut, now);
            if let LengthRoute::WaitForMerge { wait_until } = route {
                slot.pending = Some(PendingMergeEntry {
                    text: merged_text.clone(),
                    utterance_index,
                    lang: lang.to_string(),
                    wait_until,
                    created_at: now,
                });
            }

            ForwardMergeOutput {
                route,
                text: merged_text,
                utterance_index,
                merged_from,
                expired,
            }
        });

        tracing::trace!(
            session_id,
            utterance_index,
            route = ?output.route,
            merged_from = ?output.merged_from,
            "forward merge"
        );
        output
    }

    /// Takes every held entry whose wait has elapsed.
    pub fn flush_expired(&self) -> Vec<(String, PendingMergeEntry)> {
        let now = self.sessions.clock().now();
        let mut flushed = Vec::new();
        self.sessions.for_each(|session_id, slot| {
            if slot.pending.as_ref().is_some_and(|e| now >= e.wait_until)
                && let Some(entry) = slot.pending.take()
            {
                flushed.push((session_id.to_string(), entry));
            }
        });
        flushed
    }

    /// Takes the session's held entry regardless of its deadline.
    pub fn flush_session(&self, session_id: &str) -> Option<PendingMergeEntry> {
        self.sessions
            .with_existing(session_id, |slot| slot.pending.take())
            .flatten()
    }

    pub fn pending(&self, session_id: &str) -> Option<PendingMergeEntry> {
        self.sessions
            .with_existing(session_id, |slot| slot.pending.clone())
            .flatten()
    }

    pub fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id)
    }

    pub fn sweep_idle(&self, ttl_ms: u64) -> Vec<String> {
        self.sessions.sweep_idle(ttl_ms)
    }
}
