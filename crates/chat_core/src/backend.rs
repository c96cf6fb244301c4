//! Seams between the engine and the remote store.
//!
//! [`ChatStore`] covers request/response traffic against the hosted tables,
//! [`PushTransport`] hands out live change feeds per topic, and
//! [`MentionNotifier`] delivers mention pings. The engine only ever talks to
//! these traits; `memory::MemoryBackend` implements them for tests and local
//! demos, `remote::RemoteBackend` for a real deployment.

use anyhow::anyhow;
use async_trait::async_trait;
use shared::{
    domain::{ChannelId, MessageId, UserId, WorkspaceId},
    protocol::{
        ChangeEvent, ChannelRecord, MemberRecord, MessageRecord, ReactionRecord,
        ReadReceiptRecord, SubscriptionTopic, TypingRecord, WorkspaceRecord,
    },
};
use tokio::sync::broadcast;

use crate::error::StoreError;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn fetch_workspaces(&self) -> Result<Vec<WorkspaceRecord>, StoreError>;

    async fn fetch_channels(
        &self,
        workspace: &WorkspaceId,
    ) -> Result<Vec<ChannelRecord>, StoreError>;

    async fn fetch_members(&self, workspace: &WorkspaceId)
        -> Result<Vec<MemberRecord>, StoreError>;

    /// Full channel history, oldest first, soft-deleted rows included.
    async fn channel_history(&self, channel: &ChannelId)
        -> Result<Vec<MessageRecord>, StoreError>;

    /// Full direct history between two users, oldest first.
    async fn direct_history(&self, a: &UserId, b: &UserId)
        -> Result<Vec<MessageRecord>, StoreError>;

    /// Inserts a message and returns the stored row. The stored row may carry
    /// a different id than the draft; `client_token` survives for
    /// correlation.
    async fn insert_message(&self, record: &MessageRecord) -> Result<MessageRecord, StoreError>;

    /// Flags a message as deleted without removing the row.
    async fn mark_message_deleted(&self, id: &MessageId) -> Result<(), StoreError>;

    /// Removes a message row entirely.
    async fn delete_message(&self, id: &MessageId) -> Result<(), StoreError>;

    async fn receipts_for_conversation(
        &self,
        conversation_key: &str,
    ) -> Result<Vec<ReadReceiptRecord>, StoreError>;

    /// Records that a user has read a message. Replaying the same pair must
    /// not create a second row.
    async fn upsert_receipt(&self, receipt: &ReadReceiptRecord) -> Result<(), StoreError>;

    async fn reactions_for_conversation(
        &self,
        conversation_key: &str,
    ) -> Result<Vec<ReactionRecord>, StoreError>;

    async fn insert_reaction(&self, reaction: &ReactionRecord) -> Result<(), StoreError>;

    async fn delete_reaction(&self, reaction: &ReactionRecord) -> Result<(), StoreError>;

    /// Publishes or refreshes a typing signal for the sending user.
    async fn publish_typing(&self, record: &TypingRecord) -> Result<(), StoreError>;

    /// Withdraws the user's typing signal from one conversation.
    async fn clear_typing(&self, conversation_key: &str, user: &UserId)
        -> Result<(), StoreError>;
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Returns a live feed of change events for one topic. Delivery is
    /// at-least-once and may arrive out of order; consumers must apply
    /// events idempotently.
    async fn subscribe(
        &self,
        topic: SubscriptionTopic,
    ) -> Result<broadcast::Receiver<ChangeEvent>, StoreError>;
}

#[async_trait]
pub trait MentionNotifier: Send + Sync {
    /// Fire-and-forget delivery of a mention ping for `message`.
    async fn notify_mention(&self, message: &MessageRecord) -> Result<(), StoreError>;
}

pub struct MissingChatStore;

#[async_trait]
impl ChatStore for MissingChatStore {
    async fn fetch_workspaces(&self) -> Result<Vec<WorkspaceRecord>, StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn fetch_channels(
        &self,
        _workspace: &WorkspaceId,
    ) -> Result<Vec<ChannelRecord>, StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn fetch_members(
        &self,
        _workspace: &WorkspaceId,
    ) -> Result<Vec<MemberRecord>, StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn channel_history(
        &self,
        _channel: &ChannelId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn direct_history(
        &self,
        _a: &UserId,
        _b: &UserId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn insert_message(&self, _record: &MessageRecord) -> Result<MessageRecord, StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn mark_message_deleted(&self, _id: &MessageId) -> Result<(), StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn delete_message(&self, _id: &MessageId) -> Result<(), StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn receipts_for_conversation(
        &self,
        _conversation_key: &str,
    ) -> Result<Vec<ReadReceiptRecord>, StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn upsert_receipt(&self, _receipt: &ReadReceiptRecord) -> Result<(), StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn reactions_for_conversation(
        &self,
        _conversation_key: &str,
    ) -> Result<Vec<ReactionRecord>, StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn insert_reaction(&self, _reaction: &ReactionRecord) -> Result<(), StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn delete_reaction(&self, _reaction: &ReactionRecord) -> Result<(), StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn publish_typing(&self, _record: &TypingRecord) -> Result<(), StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }

    async fn clear_typing(
        &self,
        _conversation_key: &str,
        _user: &UserId,
    ) -> Result<(), StoreError> {
        Err(StoreError::unavailable(anyhow!("chat store not configured")))
    }
}

pub struct MissingPushTransport;

#[async_trait]
impl PushTransport for MissingPushTransport {
    async fn subscribe(
        &self,
        topic: SubscriptionTopic,
    ) -> Result<broadcast::Receiver<ChangeEvent>, StoreError> {
        Err(StoreError::unavailable(anyhow!(
            "push transport not configured for topic {}",
            topic.table()
        )))
    }
}

/// Swallows mention pings. Mention delivery is best-effort, so a deployment
/// without a notification sink plugs this in.
pub struct NoopMentionNotifier;

#[async_trait]
impl MentionNotifier for NoopMentionNotifier {
    async fn notify_mention(&self, _message: &MessageRecord) -> Result<(), StoreError> {
        Ok(())
    }
}
