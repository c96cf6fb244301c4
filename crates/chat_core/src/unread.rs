//! Unread counters, mute view, and notification popups.
//!
//! Counters increment for every inbound message from another user while its
//! conversation is not the active one. Muting a channel suppresses only the
//! audible side effect: the popup is still posted and the counter still
//! moves.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use shared::domain::{ChannelId, ConversationRef};

/// Popups dismiss themselves after this long unless dismissed by hand.
pub const POPUP_TTL: Duration = Duration::from_secs(8);

#[derive(Debug, Clone)]
pub struct Popup {
    pub id: u64,
    pub source: ConversationRef,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub preview: String,
    pub is_direct: bool,
    pub play_sound: bool,
    posted_at: Instant,
}

#[derive(Default)]
pub struct UnreadLedger {
    counts: HashMap<ConversationRef, u32>,
    muted: HashSet<ChannelId>,
    popups: Vec<Popup>,
    next_popup_id: u64,
}

impl UnreadLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, conversation: &ConversationRef) -> u32 {
        let count = self.counts.entry(conversation.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn clear(&mut self, conversation: &ConversationRef) {
        self.counts.remove(conversation);
    }

    pub fn count(&self, conversation: &ConversationRef) -> u32 {
        self.counts.get(conversation).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    /// Replaces all counters, used when rebuilding from store state at
    /// session start.
    pub fn rebuild(&mut self, counts: HashMap<ConversationRef, u32>) {
        self.counts = counts;
        self.counts.retain(|_, count| *count > 0);
    }

    pub fn set_muted(&mut self, channel: ChannelId, muted: bool) {
        if muted {
            self.muted.insert(channel);
        } else {
            self.muted.remove(&channel);
        }
    }

    pub fn replace_muted(&mut self, muted: HashSet<ChannelId>) {
        self.muted = muted;
    }

    /// Direct conversations are never muted; only group channels appear in
    /// the registry.
    pub fn is_muted(&self, conversation: &ConversationRef) -> bool {
        match conversation {
            ConversationRef::Channel { id } => self.muted.contains(id),
            ConversationRef::Direct { .. } => false,
        }
    }

    pub fn push_popup(
        &mut self,
        source: ConversationRef,
        sender_name: String,
        sender_avatar: Option<String>,
        preview: String,
        now: Instant,
    ) -> Popup {
        self.next_popup_id += 1;
        let popup = Popup {
            id: self.next_popup_id,
            is_direct: source.is_direct(),
            play_sound: !self.is_muted(&source),
            source,
            sender_name,
            sender_avatar,
            preview,
            posted_at: now,
        };
        self.popups.push(popup.clone());
        popup
    }

    pub fn dismiss_popup(&mut self, popup_id: u64) -> bool {
        let before = self.popups.len();
        self.popups.retain(|popup| popup.id != popup_id);
        self.popups.len() != before
    }

    pub fn popup(&self, popup_id: u64) -> Option<&Popup> {
        self.popups.iter().find(|popup| popup.id == popup_id)
    }

    /// Drops popups past their TTL, returning the ids that went away.
    pub fn sweep_popups(&mut self, now: Instant) -> Vec<u64> {
        let expired: Vec<u64> = self
            .popups
            .iter()
            .filter(|popup| now.duration_since(popup.posted_at) >= POPUP_TTL)
            .map(|popup| popup.id)
            .collect();
        self.popups
            .retain(|popup| now.duration_since(popup.posted_at) < POPUP_TTL);
        expired
    }

    pub fn popups(&self) -> &[Popup] {
        &self.popups
    }

    pub fn clear_all(&mut self) {
        self.counts.clear();
        self.popups.clear();
    }
}
