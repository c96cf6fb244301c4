//! Typing presence, both directions.
//!
//! Local side: the first keystroke after idle publishes a typing signal;
//! further keystrokes refresh a short window without re-publishing; when the
//! window elapses a stop signal goes out. Remote side: observed signals carry
//! their own expiry so a typist drops off the list even when the stop signal
//! never arrives. All pure logic takes `now` so tests control the clock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use shared::domain::UserId;

/// Keystrokes inside this window refresh the published signal silently.
pub const TYPING_REFRESH_WINDOW: Duration = Duration::from_secs(2);
/// Observed typists expire this long after their last signal.
pub const TYPING_OBSERVER_EXPIRY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
struct ObservedTypist {
    name: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct TypingTracker {
    /// Remote typists per conversation key.
    observed: HashMap<String, HashMap<UserId, ObservedTypist>>,
    /// Conversations we have published a typing signal for, by last keystroke.
    published: HashMap<String, Instant>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a local keystroke. Returns `true` when a typing signal must be
    /// published (idle to typing transition); refreshes within the window stay
    /// silent.
    pub fn local_keystroke(&mut self, conversation_key: &str, now: Instant) -> bool {
        match self.published.get_mut(conversation_key) {
            Some(last) if now.duration_since(*last) < TYPING_REFRESH_WINDOW => {
                *last = now;
                false
            }
            _ => {
                self.published.insert(conversation_key.to_string(), now);
                true
            }
        }
    }

    /// Returns the conversations whose refresh window has elapsed, removing
    /// them from the published set. The caller publishes a stop signal for
    /// each.
    pub fn local_stops_due(&mut self, now: Instant) -> Vec<String> {
        let due: Vec<String> = self
            .published
            .iter()
            .filter(|(_, last)| now.duration_since(**last) >= TYPING_REFRESH_WINDOW)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.published.remove(key);
        }
        due
    }

    /// Drops the local published state without waiting for the window, e.g.
    /// when a message is actually sent. Returns whether a stop signal is owed.
    pub fn local_clear(&mut self, conversation_key: &str) -> bool {
        self.published.remove(conversation_key).is_some()
    }

    pub fn observe(&mut self, conversation_key: &str, user: UserId, name: String, now: Instant) {
        self.observed
            .entry(conversation_key.to_string())
            .or_default()
            .insert(
                user,
                ObservedTypist {
                    name,
                    expires_at: now + TYPING_OBSERVER_EXPIRY,
                },
            );
    }

    pub fn observe_stop(&mut self, conversation_key: &str, user: &UserId) -> bool {
        match self.observed.get_mut(conversation_key) {
            Some(typists) => typists.remove(user).is_some(),
            None => false,
        }
    }

    /// Removes expired observations everywhere. Returns the conversation keys
    /// whose typist list changed.
    pub fn prune(&mut self, now: Instant) -> Vec<String> {
        let mut changed = Vec::new();
        self.observed.retain(|key, typists| {
            let before = typists.len();
            typists.retain(|_, typist| typist.expires_at > now);
            if typists.len() != before {
                changed.push(key.clone());
            }
            !typists.is_empty()
        });
        changed
    }

    /// Names currently typing in a conversation, pruned on read and sorted
    /// for stable display.
    pub fn active_typists(&mut self, conversation_key: &str, now: Instant) -> Vec<String> {
        let Some(typists) = self.observed.get_mut(conversation_key) else {
            return Vec::new();
        };
        typists.retain(|_, typist| typist.expires_at > now);
        let mut names: Vec<String> = typists.values().map(|t| t.name.clone()).collect();
        names.sort();
        names
    }

    pub fn clear_all(&mut self) {
        self.observed.clear();
        self.published.clear();
    }
}
