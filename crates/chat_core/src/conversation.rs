//! In-memory message state for the open conversation: the ordered log, the
//! optimistic-send lifecycle, and the read/reaction overlays.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ContentKind, ConversationRef, MessageId, UserId},
    protocol::MessageRecord,
};

use crate::directory::Conversation;

/// Where a message stands in the send pipeline. Everything loaded from the
/// store or received live is `Confirmed`; only locally authored placeholders
/// pass through the other two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
}

/// A message as the UI sees it. Direct bodies are plaintext here; the
/// obfuscated form exists only in transit and at rest.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation: ConversationRef,
    pub sender_id: UserId,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub content: String,
    pub content_kind: ContentKind,
    pub reply_to: Option<MessageId>,
    pub reply_snapshot: Option<String>,
    pub client_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read_by: BTreeSet<UserId>,
    pub reactions: Vec<Reaction>,
    pub delivery: Delivery,
}

impl ChatMessage {
    pub fn from_record(
        record: &MessageRecord,
        conversation: ConversationRef,
        content: String,
    ) -> Self {
        Self {
            id: record.id.clone(),
            conversation,
            sender_id: record.sender_id.clone(),
            sender_name: record.sender_name.clone(),
            sender_avatar: record.sender_avatar.clone(),
            content,
            content_kind: record.content_kind,
            reply_to: record.reply_to.clone(),
            reply_snapshot: record.reply_snapshot.clone(),
            client_token: record.client_token.clone(),
            created_at: record.created_at,
            read_by: BTreeSet::new(),
            reactions: Vec::new(),
            delivery: Delivery::Confirmed,
        }
    }

    pub fn has_reaction(&self, user: &UserId, emoji: &str) -> bool {
        self.reactions
            .iter()
            .any(|reaction| &reaction.user_id == user && reaction.emoji == emoji)
    }
}

/// The ordered message sequence of one conversation. History loads arrive
/// already ascending by creation time and are trusted as-is; live inserts are
/// placed by insertion sort so transport reordering cannot scramble the view.
#[derive(Default)]
pub struct MessageLog {
    messages: Vec<ChatMessage>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|message| &message.id == id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn get_by_token(&self, token: &str) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .find(|message| message.client_token.as_deref() == Some(token))
    }

    /// Appends the optimistic placeholder for an in-flight send. Placeholders
    /// are always newest, so plain append keeps the order.
    pub fn push_pending(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Replaces the placeholder matching `token` with the authoritative
    /// record, in place so the visual position is preserved. Works for both
    /// pending and failed placeholders (a late echo may confirm a send we
    /// already marked failed).
    pub fn confirm(&mut self, token: &str, mut confirmed: ChatMessage) -> bool {
        let Some(slot) = self
            .messages
            .iter_mut()
            .find(|message| message.client_token.as_deref() == Some(token))
        else {
            return false;
        };
        // The store response and the push echo both land here; whichever is
        // second must not re-apply.
        if slot.delivery == Delivery::Confirmed {
            return false;
        }
        confirmed.delivery = Delivery::Confirmed;
        // Overlays applied while the send was in flight survive the swap.
        confirmed.read_by.extend(slot.read_by.iter().cloned());
        for reaction in slot.reactions.drain(..) {
            if !confirmed.has_reaction(&reaction.user_id, &reaction.emoji) {
                confirmed.reactions.push(reaction);
            }
        }
        *slot = confirmed;
        true
    }

    pub fn mark_failed(&mut self, token: &str) -> bool {
        match self.find_token_mut(token) {
            Some(message) if message.delivery == Delivery::Pending => {
                message.delivery = Delivery::Failed;
                true
            }
            _ => false,
        }
    }

    /// Flips a failed placeholder back to pending for a retry, returning a
    /// clone for the caller to re-submit.
    pub fn mark_pending(&mut self, token: &str) -> Option<ChatMessage> {
        match self.find_token_mut(token) {
            Some(message) if message.delivery == Delivery::Failed => {
                message.delivery = Delivery::Pending;
                Some(message.clone())
            }
            _ => None,
        }
    }

    /// Removes a failed placeholder that the user chose to discard.
    pub fn discard_failed(&mut self, token: &str) -> Option<MessageId> {
        let index = self.messages.iter().position(|message| {
            message.client_token.as_deref() == Some(token) && message.delivery == Delivery::Failed
        })?;
        Some(self.messages.remove(index).id)
    }

    /// Inserts a live message at its chronological position. The scan runs
    /// from the tail because in-order delivery is the common case and costs
    /// one comparison.
    pub fn insert_sorted(&mut self, message: ChatMessage) {
        let mut index = self.messages.len();
        while index > 0 && self.messages[index - 1].created_at > message.created_at {
            index -= 1;
        }
        self.messages.insert(index, message);
    }

    pub fn remove(&mut self, id: &MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|message| &message.id != id);
        self.messages.len() != before
    }

    /// Merges one read receipt. Idempotent: re-applying an already-known
    /// receipt reports no change.
    pub fn merge_read(&mut self, message_id: &MessageId, user: UserId) -> bool {
        match self.find_mut(message_id) {
            Some(message) => message.read_by.insert(user),
            None => false,
        }
    }

    pub fn add_reaction(&mut self, message_id: &MessageId, user: UserId, emoji: &str) -> bool {
        let Some(message) = self.find_mut(message_id) else {
            return false;
        };
        if message.has_reaction(&user, emoji) {
            return false;
        }
        message.reactions.push(Reaction {
            user_id: user,
            emoji: emoji.to_string(),
        });
        true
    }

    pub fn remove_reaction(&mut self, message_id: &MessageId, user: &UserId, emoji: &str) -> bool {
        let Some(message) = self.find_mut(message_id) else {
            return false;
        };
        let before = message.reactions.len();
        message
            .reactions
            .retain(|reaction| !(&reaction.user_id == user && reaction.emoji == emoji));
        message.reactions.len() != before
    }

    fn find_mut(&mut self, id: &MessageId) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().find(|message| &message.id == id)
    }

    fn find_token_mut(&mut self, token: &str) -> Option<&mut ChatMessage> {
        self.messages
            .iter_mut()
            .find(|message| message.client_token.as_deref() == Some(token))
    }
}

/// View state of the one open conversation. A fresh record is created on
/// every open; the generation distinguishes its history fetch from any
/// fetch still in flight for a previously open conversation.
pub struct ActiveConversation {
    pub conversation: Conversation,
    pub generation: u64,
    pub log: MessageLog,
    pub draft: String,
}

impl ActiveConversation {
    pub fn new(conversation: Conversation, generation: u64) -> Self {
        Self {
            conversation,
            generation,
            log: MessageLog::new(),
            draft: String::new(),
        }
    }

    pub fn reference(&self) -> ConversationRef {
        self.conversation.reference()
    }
}
