//! Per-session state registry.
//!
//! Every piece of mutable per-session state (aggregator state, pending merges,
//! audio buffers) lives in a [`SessionRegistry`]. The registry map is locked only
//! long enough to find or create a slot; the slot's own lock then serializes all
//! writers for that session, so different sessions never contend.

use crate::clock::{Clock, elapsed_ms};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

struct SessionSlot<S> {
    state: Mutex<S>,
    last_activity: Mutex<Instant>,
}

/// Registry of per-session state keyed by session id.
pub struct SessionRegistry<S> {
    sessions: Mutex<HashMap<String, Arc<SessionSlot<S>>>>,
    clock: Arc<dyn Clock>,
}

impl<S> SessionRegistry<S> {
    /// Creates an empty registry reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn slot(&self, session_id: &str, create: impl FnOnce() -> S) -> Arc<SessionSlot<S>> {
        let mut sessions = self.sessions.lock();
        if let Some(slot) = sessions.get(session_id) {
            return slot.clone();
        }
        let slot = Arc::new(SessionSlot {
            state: Mutex::new(create()),
            last_activity: Mutex::new(self.clock.now()),
        });
        sessions.insert(session_id.to_string(), slot.clone());
        slot
    }

    /// Runs `f` against the session's state, creating it with `create` on first use.
    ///
    /// Marks the session as active.
    pub fn with_session<R>(
        &self,
        session_id: &str,
        create: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> R {
        let slot = self.slot(session_id, create);
        *slot.last_activity.lock() = self.clock.now();
        let mut state = slot.state.lock();
        f(&mut state)
    }

    /// Runs `f` against an existing session without creating or touching it.
    pub fn with_existing<R>(&self, session_id: &str, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        let slot = self.sessions.lock().get(session_id).cloned()?;
        let mut state = slot.state.lock();
        Some(f(&mut state))
    }

    /// Runs `f` against every session, one at a time.
    pub fn for_each(&self, mut f: impl FnMut(&str, &mut S)) {
        let slots: Vec<(String, Arc<SessionSlot<S>>)> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        for (id, slot) in slots {
            f(&id, &mut slot.state.lock());
        }
    }

    /// Removes a session. Returns true if it existed.
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }

    /// Removes every session idle for longer than `ttl_ms`, returning their ids.
    pub fn sweep_idle(&self, ttl_ms: u64) -> Vec<String> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        self.sessions.lock().retain(|id, slot| {
            let idle = elapsed_ms(*slot.last_activity.lock(), now);
            if idle > ttl_ms {
                expired.push(id.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn registry(clock: &MockClock) -> SessionRegistry<Vec<u32>> {
        SessionRegistry::new(Arc::new(clock.clone()))
    }

    #[test]
    fn test_creates_state_on_first_use() {
        let clock = MockClock::new();
        let reg = registry(&clock);

        reg.with_session("s1", Vec::new, |v| v.push(1));
        reg.with_session("s1", || vec![99], |v| v.push(2));

        let snapshot = reg.with_existing("s1", |v| v.clone());
        assert_eq!(snapshot, Some(vec![1, 2]));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_with_existing_does_not_create() {
        let clock = MockClock::new();
        let reg = registry(&clock);
        assert!(reg.with_existing("missing", |v| v.len()).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_sweep_removes_only_idle_sessions() {
        let clock = MockClock::new();
        let reg = registry(&clock);

        reg.with_session("old", Vec::new, |_| ());
        clock.advance_ms(600);
        reg.with_session("fresh", Vec::new, |_| ());
        clock.advance_ms(500);

        let expired = reg.sweep_idle(1000);
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(reg.contains("fresh"));
        assert!(!reg.contains("old"));
    }

    #[test]
    fn test_activity_refreshes_ttl() {
        let clock = MockClock::new();
        let reg = registry(&clock);

        reg.with_session("s", Vec::new, |_| ());
        clock.advance_ms(900);
        reg.with_session("s", Vec::new, |_| ());
        clock.advance_ms(900);

        assert!(reg.sweep_idle(1000).is_empty());
    }

    #[test]
    fn test_for_each_visits_all_sessions() {
        let clock = MockClock::new();
        let reg = registry(&clock);
        reg.with_session("a", Vec::new, |v| v.push(1));
        reg.with_session("b", Vec::new, |v| v.push(2));

        let mut total = 0;
        reg.for_each(|_, v| total += v.iter().sum::<u32>());
        assert_eq!(total, 3);
    }
}
