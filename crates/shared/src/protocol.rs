use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ChannelId, ContentKind, ConversationRef, MessageId, PresenceStatus, UserId, WorkspaceId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub id: WorkspaceId,
    pub name: String,
    pub owner_id: UserId,
    /// Member entries as the store holds them: raw user ids or URL-encoded
    /// display tokens, depending on which surface wrote the row.
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: ChannelId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRecord {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub presence: PresenceStatus,
}

/// One message row. Exactly one of `channel_id` / `recipient_id` is set:
/// channel messages carry the channel, direct messages carry the recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    pub sender_id: UserId,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_avatar: Option<String>,
    pub content: String,
    #[serde(default)]
    pub content_kind: ContentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_snapshot: Option<String>,
    /// Correlation token minted by the sending client, echoed back by the
    /// store so the optimistic placeholder can be matched without comparing
    /// content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
}

impl MessageRecord {
    /// Resolves the conversation this row belongs to, from the local user's
    /// point of view. Returns `None` for rows missing both target columns.
    pub fn conversation(&self, local: &UserId) -> Option<ConversationRef> {
        if let Some(channel) = &self.channel_id {
            return Some(ConversationRef::Channel {
                id: channel.clone(),
            });
        }
        let recipient = self.recipient_id.as_ref()?;
        let peer = if &self.sender_id == local {
            recipient.clone()
        } else {
            self.sender_id.clone()
        };
        Some(ConversationRef::Direct { peer })
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.sender_id == user || self.recipient_id.as_ref() == Some(user)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceiptRecord {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub conversation_key: String,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub conversation_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingRecord {
    pub conversation_key: String,
    pub user_id: UserId,
    pub user_name: String,
    pub updated_at: DateTime<Utc>,
}

/// The fixed set of push topics. One long-lived subscription per class, not
/// one per conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTopic {
    ChannelMessages,
    DirectMessages,
    ReadReceipts,
    Reactions,
    TypingSignals,
}

impl SubscriptionTopic {
    pub const ALL: [SubscriptionTopic; 5] = [
        SubscriptionTopic::ChannelMessages,
        SubscriptionTopic::DirectMessages,
        SubscriptionTopic::ReadReceipts,
        SubscriptionTopic::Reactions,
        SubscriptionTopic::TypingSignals,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            SubscriptionTopic::ChannelMessages => "channel_messages",
            SubscriptionTopic::DirectMessages => "direct_messages",
            SubscriptionTopic::ReadReceipts => "read_receipts",
            SubscriptionTopic::Reactions => "reactions",
            SubscriptionTopic::TypingSignals => "typing_signals",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "table", content = "record", rename_all = "snake_case")]
pub enum ChangePayload {
    ChannelMessages(MessageRecord),
    DirectMessages(MessageRecord),
    ReadReceipts(ReadReceiptRecord),
    Reactions(ReactionRecord),
    TypingSignals(TypingRecord),
}

impl ChangePayload {
    pub fn topic(&self) -> SubscriptionTopic {
        match self {
            ChangePayload::ChannelMessages(_) => SubscriptionTopic::ChannelMessages,
            ChangePayload::DirectMessages(_) => SubscriptionTopic::DirectMessages,
            ChangePayload::ReadReceipts(_) => SubscriptionTopic::ReadReceipts,
            ChangePayload::Reactions(_) => SubscriptionTopic::Reactions,
            ChangePayload::TypingSignals(_) => SubscriptionTopic::TypingSignals,
        }
    }
}

/// One change delivered by the push transport. Delivery is at-least-once and
/// possibly reordered; consumers must apply idempotently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    #[serde(flatten)]
    pub payload: ChangePayload,
}

impl ChangeEvent {
    pub fn insert(payload: ChangePayload) -> Self {
        Self {
            op: ChangeOp::Insert,
            payload,
        }
    }

    pub fn update(payload: ChangePayload) -> Self {
        Self {
            op: ChangeOp::Update,
            payload,
        }
    }

    pub fn delete(payload: ChangePayload) -> Self {
        Self {
            op: ChangeOp::Delete,
            payload,
        }
    }
}
