//! In-memory store backing tests and the console demo.
//!
//! Implements every backend seam over plain vectors behind a mutex and
//! replays each mutation on the matching topic feed, so an engine wired to a
//! [`MemoryBackend`] sees the same echo traffic a hosted store would send.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use shared::{
    domain::{direct_pair_key, ChannelId, MessageId, UserId, WorkspaceId},
    protocol::{
        ChangeEvent, ChangePayload, ChannelRecord, MemberRecord, MessageRecord, ReactionRecord,
        ReadReceiptRecord, SubscriptionTopic, TypingRecord, WorkspaceRecord,
    },
};
use tokio::sync::{broadcast, Mutex};

use crate::backend::{ChatStore, MentionNotifier, PushTransport};
use crate::error::StoreError;

const FEED_CAPACITY: usize = 256;

#[derive(Default)]
struct MemoryState {
    workspaces: Vec<WorkspaceRecord>,
    channels: Vec<ChannelRecord>,
    members: HashMap<WorkspaceId, Vec<MemberRecord>>,
    messages: Vec<MessageRecord>,
    receipts: Vec<ReadReceiptRecord>,
    reactions: Vec<ReactionRecord>,
    typing: Vec<TypingRecord>,
    mentions: Vec<MessageRecord>,
    next_id: u64,
    offline: bool,
    reject_next_insert: Option<String>,
    reject_next_reaction: Option<String>,
}

#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    feeds: Arc<HashMap<SubscriptionTopic, broadcast::Sender<ChangeEvent>>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut feeds = HashMap::new();
        for topic in SubscriptionTopic::ALL {
            let (tx, _) = broadcast::channel(FEED_CAPACITY);
            feeds.insert(topic, tx);
        }
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            feeds: Arc::new(feeds),
        }
    }

    pub async fn seed_workspace(&self, workspace: WorkspaceRecord) {
        self.state.lock().await.workspaces.push(workspace);
    }

    pub async fn seed_channel(&self, channel: ChannelRecord) {
        self.state.lock().await.channels.push(channel);
    }

    pub async fn seed_member(&self, workspace: &WorkspaceId, member: MemberRecord) {
        self.state
            .lock()
            .await
            .members
            .entry(workspace.clone())
            .or_default()
            .push(member);
    }

    /// Inserts history without emitting a change event.
    pub async fn seed_message(&self, message: MessageRecord) {
        self.state.lock().await.messages.push(message);
    }

    pub async fn seed_receipt(&self, receipt: ReadReceiptRecord) {
        self.state.lock().await.receipts.push(receipt);
    }

    pub async fn seed_reaction(&self, reaction: ReactionRecord) {
        self.state.lock().await.reactions.push(reaction);
    }

    /// While offline every store call and new subscription fails as
    /// transient.
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Makes the next message insert fail with an explicit rejection.
    pub async fn reject_next_message_insert(&self, reason: &str) {
        self.state.lock().await.reject_next_insert = Some(reason.to_string());
    }

    /// Makes the next reaction write fail with an explicit rejection.
    pub async fn reject_next_reaction_write(&self, reason: &str) {
        self.state.lock().await.reject_next_reaction = Some(reason.to_string());
    }

    /// Pushes a raw change event onto its topic feed without touching stored
    /// rows. Lets tests replay duplicates and reordered deliveries.
    pub fn push_event(&self, event: ChangeEvent) {
        self.broadcast(event);
    }

    /// Messages handed to the mention notifier so far.
    pub async fn mention_pings(&self) -> Vec<MessageRecord> {
        self.state.lock().await.mentions.clone()
    }

    pub async fn message_count(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn stored_message(&self, id: &MessageId) -> Option<MessageRecord> {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .find(|m| &m.id == id)
            .cloned()
    }

    fn broadcast(&self, event: ChangeEvent) {
        if let Some(tx) = self.feeds.get(&event.payload.topic()) {
            let _ = tx.send(event);
        }
    }

    fn check_online(state: &MemoryState) -> Result<(), StoreError> {
        if state.offline {
            return Err(StoreError::unavailable(anyhow!("memory store offline")));
        }
        Ok(())
    }

    fn message_payload(record: MessageRecord) -> ChangePayload {
        if record.channel_id.is_some() {
            ChangePayload::ChannelMessages(record)
        } else {
            ChangePayload::DirectMessages(record)
        }
    }
}

#[async_trait]
impl ChatStore for MemoryBackend {
    async fn fetch_workspaces(&self) -> Result<Vec<WorkspaceRecord>, StoreError> {
        let state = self.state.lock().await;
        Self::check_online(&state)?;
        Ok(state.workspaces.clone())
    }

    async fn fetch_channels(
        &self,
        workspace: &WorkspaceId,
    ) -> Result<Vec<ChannelRecord>, StoreError> {
        let state = self.state.lock().await;
        Self::check_online(&state)?;
        Ok(state
            .channels
            .iter()
            .filter(|channel| &channel.workspace_id == workspace)
            .cloned()
            .collect())
    }

    async fn fetch_members(
        &self,
        workspace: &WorkspaceId,
    ) -> Result<Vec<MemberRecord>, StoreError> {
        let state = self.state.lock().await;
        Self::check_online(&state)?;
        Ok(state.members.get(workspace).cloned().unwrap_or_default())
    }

    async fn channel_history(
        &self,
        channel: &ChannelId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let state = self.state.lock().await;
        Self::check_online(&state)?;
        let mut rows: Vec<MessageRecord> = state
            .messages
            .iter()
            .filter(|m| m.channel_id.as_ref() == Some(channel))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn direct_history(
        &self,
        a: &UserId,
        b: &UserId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let state = self.state.lock().await;
        Self::check_online(&state)?;
        let key = direct_pair_key(a, b);
        let mut rows: Vec<MessageRecord> = state
            .messages
            .iter()
            .filter(|m| {
                m.channel_id.is_none()
                    && m.recipient_id
                        .as_ref()
                        .map(|r| direct_pair_key(&m.sender_id, r) == key)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<MessageRecord, StoreError> {
        let mut state = self.state.lock().await;
        Self::check_online(&state)?;
        if let Some(reason) = state.reject_next_insert.take() {
            return Err(StoreError::rejected(reason));
        }
        state.next_id += 1;
        let mut stored = record.clone();
        stored.id = MessageId::new(format!("m-{:04}", state.next_id));
        state.messages.push(stored.clone());
        drop(state);
        self.broadcast(ChangeEvent::insert(Self::message_payload(stored.clone())));
        Ok(stored)
    }

    async fn mark_message_deleted(&self, id: &MessageId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_online(&state)?;
        let Some(row) = state.messages.iter_mut().find(|m| &m.id == id) else {
            return Err(StoreError::NotFound);
        };
        row.deleted = true;
        let updated = row.clone();
        drop(state);
        self.broadcast(ChangeEvent::update(Self::message_payload(updated)));
        Ok(())
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_online(&state)?;
        let Some(index) = state.messages.iter().position(|m| &m.id == id) else {
            return Err(StoreError::NotFound);
        };
        let removed = state.messages.remove(index);
        drop(state);
        self.broadcast(ChangeEvent::delete(Self::message_payload(removed)));
        Ok(())
    }

    async fn receipts_for_conversation(
        &self,
        conversation_key: &str,
    ) -> Result<Vec<ReadReceiptRecord>, StoreError> {
        let state = self.state.lock().await;
        Self::check_online(&state)?;
        Ok(state
            .receipts
            .iter()
            .filter(|r| r.conversation_key == conversation_key)
            .cloned()
            .collect())
    }

    async fn upsert_receipt(&self, receipt: &ReadReceiptRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_online(&state)?;
        let existing = state
            .receipts
            .iter_mut()
            .find(|r| r.message_id == receipt.message_id && r.user_id == receipt.user_id);
        let event = match existing {
            Some(row) => {
                row.read_at = receipt.read_at;
                ChangeEvent::update(ChangePayload::ReadReceipts(row.clone()))
            }
            None => {
                state.receipts.push(receipt.clone());
                ChangeEvent::insert(ChangePayload::ReadReceipts(receipt.clone()))
            }
        };
        drop(state);
        self.broadcast(event);
        Ok(())
    }

    async fn reactions_for_conversation(
        &self,
        conversation_key: &str,
    ) -> Result<Vec<ReactionRecord>, StoreError> {
        let state = self.state.lock().await;
        Self::check_online(&state)?;
        Ok(state
            .reactions
            .iter()
            .filter(|r| r.conversation_key == conversation_key)
            .cloned()
            .collect())
    }

    async fn insert_reaction(&self, reaction: &ReactionRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_online(&state)?;
        if let Some(reason) = state.reject_next_reaction.take() {
            return Err(StoreError::rejected(reason));
        }
        // Same row twice is a no-op, matching an INSERT OR IGNORE store.
        if state.reactions.iter().any(|r| r == reaction) {
            return Ok(());
        }
        state.reactions.push(reaction.clone());
        drop(state);
        self.broadcast(ChangeEvent::insert(ChangePayload::Reactions(
            reaction.clone(),
        )));
        Ok(())
    }

    async fn delete_reaction(&self, reaction: &ReactionRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_online(&state)?;
        if let Some(reason) = state.reject_next_reaction.take() {
            return Err(StoreError::rejected(reason));
        }
        let Some(index) = state.reactions.iter().position(|r| r == reaction) else {
            return Ok(());
        };
        let removed = state.reactions.remove(index);
        drop(state);
        self.broadcast(ChangeEvent::delete(ChangePayload::Reactions(removed)));
        Ok(())
    }

    async fn publish_typing(&self, record: &TypingRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_online(&state)?;
        let existing = state.typing.iter_mut().find(|t| {
            t.conversation_key == record.conversation_key && t.user_id == record.user_id
        });
        match existing {
            Some(row) => {
                row.user_name = record.user_name.clone();
                row.updated_at = record.updated_at;
            }
            None => state.typing.push(record.clone()),
        }
        drop(state);
        self.broadcast(ChangeEvent::insert(ChangePayload::TypingSignals(
            record.clone(),
        )));
        Ok(())
    }

    async fn clear_typing(
        &self,
        conversation_key: &str,
        user: &UserId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_online(&state)?;
        let Some(index) = state
            .typing
            .iter()
            .position(|t| t.conversation_key == conversation_key && &t.user_id == user)
        else {
            return Ok(());
        };
        let removed = state.typing.remove(index);
        drop(state);
        self.broadcast(ChangeEvent::delete(ChangePayload::TypingSignals(removed)));
        Ok(())
    }
}

#[async_trait]
impl PushTransport for MemoryBackend {
    async fn subscribe(
        &self,
        topic: SubscriptionTopic,
    ) -> Result<broadcast::Receiver<ChangeEvent>, StoreError> {
        let state = self.state.lock().await;
        Self::check_online(&state)?;
        match self.feeds.get(&topic) {
            Some(tx) => Ok(tx.subscribe()),
            None => Err(StoreError::unavailable(anyhow!(
                "no feed for topic {}",
                topic.table()
            ))),
        }
    }
}

#[async_trait]
impl MentionNotifier for MemoryBackend {
    async fn notify_mention(&self, message: &MessageRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check_online(&state)?;
        state.mentions.push(message.clone());
        Ok(())
    }
}
