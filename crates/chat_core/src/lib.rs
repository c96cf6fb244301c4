//! Client-side synchronization core for the chat dashboard.
//!
//! [`ChatClient`] owns the session: the workspace directory, the one open
//! conversation, typing state, unread counters and popups. It talks to the
//! hosted store through the `backend` seams and publishes every state change
//! on a broadcast channel that UI layers subscribe to.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use shared::{
    domain::{ChannelId, ContentKind, ConversationRef, MessageId, PresenceStatus, UserId, WorkspaceId},
    protocol::{
        ChangeEvent, ChangeOp, ChangePayload, MessageRecord, ReactionRecord, ReadReceiptRecord,
        TypingRecord, WorkspaceRecord,
    },
};
use storage::Storage;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

pub mod backend;
pub mod content;
pub mod conversation;
pub mod directory;
pub mod error;
pub mod memory;
pub mod obfuscate;
pub mod remote;
mod router;
pub mod typing;
pub mod unread;

use crate::backend::{
    ChatStore, MentionNotifier, MissingChatStore, MissingPushTransport, NoopMentionNotifier,
    PushTransport,
};
use crate::conversation::{ActiveConversation, ChatMessage, Delivery};
use crate::directory::{Conversation, Directory};
use crate::error::StoreError;
use crate::typing::TypingTracker;
use crate::unread::{Popup, UnreadLedger};

/// Attempts against the store for transient failures before giving up.
const STORE_RETRY_ATTEMPTS: u32 = 3;
const STORE_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
/// Cadence of the background sweep for typing expiry and popup lifetimes.
const MAINTENANCE_TICK: Duration = Duration::from_millis(500);
/// Live message ids remembered for duplicate-delivery suppression.
const SEEN_MESSAGE_CAP: usize = 512;
const PREVIEW_LEN: usize = 120;

/// Identity of the signed-in user for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct SessionProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl SessionProfile {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            display_name: display_name.into(),
            avatar: None,
        }
    }

    /// The URL-encoded display token that membership rows may hold instead
    /// of the raw user id.
    pub fn presence_token(&self) -> String {
        directory::presence_token(&self.display_name)
    }
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    WorkspacesLoaded {
        workspaces: Vec<WorkspaceRecord>,
    },
    ConversationsLoaded {
        conversations: Vec<Conversation>,
    },
    HistoryLoaded {
        conversation: ConversationRef,
        generation: u64,
    },
    MessageAppended {
        conversation: ConversationRef,
        message: ChatMessage,
    },
    MessageConfirmed {
        conversation: ConversationRef,
        token: String,
        id: MessageId,
    },
    MessageFailed {
        conversation: ConversationRef,
        token: String,
        reason: String,
    },
    MessageRetried {
        conversation: ConversationRef,
        token: String,
    },
    MessageRemoved {
        conversation: ConversationRef,
        id: MessageId,
    },
    ReadReceiptsChanged {
        conversation: ConversationRef,
        id: MessageId,
    },
    ReactionsChanged {
        conversation: ConversationRef,
        id: MessageId,
    },
    TypingChanged {
        conversation: ConversationRef,
        names: Vec<String>,
    },
    UnreadChanged {
        conversation: ConversationRef,
        count: u32,
    },
    PopupPosted {
        popup: Popup,
    },
    PopupDismissed {
        popup_id: u64,
    },
    Error(String),
}

pub struct ChatClient {
    store: Arc<dyn ChatStore>,
    push: Arc<dyn PushTransport>,
    notifier: Arc<dyn MentionNotifier>,
    local: Storage,
    inner: Mutex<ChatClientState>,
    events: broadcast::Sender<ChatEvent>,
}

struct ChatClientState {
    profile: Option<SessionProfile>,
    directory: Directory,
    active: Option<ActiveConversation>,
    typing: TypingTracker,
    ledger: UnreadLedger,
    seen_messages: HashSet<MessageId>,
    seen_order: VecDeque<MessageId>,
    generation: u64,
    router_started: bool,
    sweeper_started: bool,
}

impl ChatClientState {
    /// Registers a live message id, reporting whether it is new. Old entries
    /// fall out once the cap is reached.
    fn note_seen(&mut self, id: &MessageId) -> bool {
        if self.seen_messages.contains(id) {
            return false;
        }
        self.seen_messages.insert(id.clone());
        self.seen_order.push_back(id.clone());
        if self.seen_order.len() > SEEN_MESSAGE_CAP {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen_messages.remove(&oldest);
            }
        }
        true
    }

    fn reset_for_session(&mut self, profile: SessionProfile) {
        self.profile = Some(profile);
        self.directory.clear();
        self.active = None;
        self.typing.clear_all();
        self.ledger.clear_all();
        self.seen_messages.clear();
        self.seen_order.clear();
        self.generation += 1;
    }
}

impl ChatClient {
    pub fn new(
        store: Arc<dyn ChatStore>,
        push: Arc<dyn PushTransport>,
        notifier: Arc<dyn MentionNotifier>,
        local: Storage,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            store,
            push,
            notifier,
            local,
            inner: Mutex::new(ChatClientState {
                profile: None,
                directory: Directory::new(),
                active: None,
                typing: TypingTracker::new(),
                ledger: UnreadLedger::new(),
                seen_messages: HashSet::new(),
                seen_order: VecDeque::new(),
                generation: 0,
                router_started: false,
                sweeper_started: false,
            }),
            events,
        })
    }

    /// A client with no backend wired up. Every store call fails until a real
    /// backend is attached; useful for UI shells that boot before configuration.
    pub fn detached(local: Storage) -> Arc<Self> {
        Self::new(
            Arc::new(MissingChatStore),
            Arc::new(MissingPushTransport),
            Arc::new(NoopMentionNotifier),
            local,
        )
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Signs the user in: loads visible workspaces, restores the previous
    /// workspace selection when possible, and starts the push router and the
    /// maintenance sweeper.
    pub async fn start_session(self: &Arc<Self>, profile: SessionProfile) -> Result<()> {
        let token = profile.presence_token();
        {
            let mut guard = self.inner.lock().await;
            guard.reset_for_session(profile.clone());
        }

        let muted = self
            .local
            .muted_channels()
            .await
            .context("failed to load mute registry")?;
        let workspaces = with_retry("fetch_workspaces", || self.store.fetch_workspaces()).await?;

        let visible = {
            let mut guard = self.inner.lock().await;
            guard.ledger.replace_muted(muted);
            guard
                .directory
                .set_workspaces(workspaces, &profile.user_id, &token);
            guard.directory.workspaces().to_vec()
        };
        let _ = self.events.send(ChatEvent::WorkspacesLoaded {
            workspaces: visible.clone(),
        });

        let last = self
            .local
            .last_workspace()
            .await
            .context("failed to load last workspace")?;
        let target = {
            let guard = self.inner.lock().await;
            match last {
                Some(id) if guard.directory.is_visible(&id) => Some(id),
                _ => guard.directory.workspaces().first().map(|w| w.id.clone()),
            }
        };
        if let Some(workspace) = target {
            self.select_workspace(&workspace).await?;
        }

        self.ensure_background_tasks().await?;
        info!(user_id = %profile.user_id, workspaces = visible.len(), "chat session started");
        Ok(())
    }

    /// Switches the selected workspace, persisting the choice and reloading
    /// channels, members and unread counters.
    pub async fn select_workspace(self: &Arc<Self>, workspace: &WorkspaceId) -> Result<()> {
        let profile = self.profile().await?;
        {
            let mut guard = self.inner.lock().await;
            if !guard.directory.select(workspace) {
                return Err(anyhow!("workspace {workspace} is not visible to this user"));
            }
            guard.active = None;
        }
        self.local
            .set_last_workspace(workspace)
            .await
            .context("failed to persist workspace selection")?;

        let channels =
            with_retry("fetch_channels", || self.store.fetch_channels(workspace)).await?;
        let members = with_retry("fetch_members", || self.store.fetch_members(workspace)).await?;

        let conversations = {
            let mut guard = self.inner.lock().await;
            guard.directory.set_channels(channels);
            guard.directory.set_members(members);
            guard.directory.conversations(&profile.user_id)
        };
        let _ = self.events.send(ChatEvent::ConversationsLoaded {
            conversations: conversations.clone(),
        });

        self.rebuild_unread_counts(&profile, &conversations).await;
        Ok(())
    }

    /// Opens one conversation, loading its history and overlays. Any history
    /// load still in flight for a previously opened conversation is
    /// invalidated by the bumped generation.
    pub async fn open_conversation(self: &Arc<Self>, reference: &ConversationRef) -> Result<()> {
        let profile = self.profile().await?;
        let generation = {
            let mut guard = self.inner.lock().await;
            let descriptor = match reference {
                ConversationRef::Channel { id } => guard
                    .directory
                    .channel(id)
                    .map(Conversation::from_channel)
                    .ok_or_else(|| anyhow!("channel {id} is not in the selected workspace"))?,
                ConversationRef::Direct { peer } => guard
                    .directory
                    .member(peer)
                    .map(Conversation::from_member)
                    // Direct threads may outlive workspace membership; fall
                    // back to a bare descriptor until a member record shows up.
                    .unwrap_or_else(|| Conversation::DirectConversation {
                        peer_id: peer.clone(),
                        peer_name: peer.as_str().to_string(),
                        peer_avatar: None,
                        peer_presence: PresenceStatus::Offline,
                    }),
            };
            guard.generation += 1;
            let generation = guard.generation;
            guard.active = Some(ActiveConversation::new(descriptor, generation));
            guard.ledger.clear(reference);
            generation
        };
        let _ = self.events.send(ChatEvent::UnreadChanged {
            conversation: reference.clone(),
            count: 0,
        });

        let records = self.conversation_records(reference, &profile.user_id).await?;
        let key = reference.key(&profile.user_id);
        let receipts = with_retry("fetch_receipts", || {
            self.store.receipts_for_conversation(&key)
        })
        .await?;
        let reactions = with_retry("fetch_reactions", || {
            self.store.reactions_for_conversation(&key)
        })
        .await?;

        {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            // Re-opens re-note ids already tracked; the eviction queue must
            // never hold duplicates. Done before the active log is borrowed.
            for record in &records {
                state.note_seen(&record.id);
            }
            let Some(active) = state.active.as_mut() else {
                return Ok(());
            };
            if active.generation != generation {
                info!(generation, "discarding stale history load");
                return Ok(());
            }
            let mut entries = Vec::with_capacity(records.len());
            for record in &records {
                if record.deleted {
                    continue;
                }
                let content = render_content(&profile, reference, record);
                entries.push(ChatMessage::from_record(record, reference.clone(), content));
            }
            // Anything applied live while the fetch was in flight survives.
            let carried: Vec<ChatMessage> = active
                .log
                .messages()
                .iter()
                .filter(|m| !entries.iter().any(|e| e.id == m.id))
                .cloned()
                .collect();
            active.log.replace_all(entries);
            for message in carried {
                active.log.insert_sorted(message);
            }
            for receipt in &receipts {
                active
                    .log
                    .merge_read(&receipt.message_id, receipt.user_id.clone());
            }
            for reaction in &reactions {
                active
                    .log
                    .add_reaction(&reaction.message_id, reaction.user_id.clone(), &reaction.emoji);
            }
        }
        let _ = self.events.send(ChatEvent::HistoryLoaded {
            conversation: reference.clone(),
            generation,
        });

        // Opening marks everything from other senders as read.
        let unread: Vec<MessageId> = records
            .iter()
            .filter(|r| r.sender_id != profile.user_id && !r.deleted)
            .filter(|r| {
                !receipts
                    .iter()
                    .any(|x| x.user_id == profile.user_id && x.message_id == r.id)
            })
            .map(|r| r.id.clone())
            .collect();
        if !unread.is_empty() {
            let client = Arc::clone(self);
            let key = key.clone();
            let user = profile.user_id.clone();
            tokio::spawn(async move {
                for message_id in unread {
                    let receipt = ReadReceiptRecord {
                        message_id,
                        user_id: user.clone(),
                        conversation_key: key.clone(),
                        read_at: Utc::now(),
                    };
                    if let Err(err) = client.store.upsert_receipt(&receipt).await {
                        warn!(error = %err, "read receipt publish failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Sends a text message to the open conversation. Returns the correlation
    /// token identifying the optimistic placeholder, or `None` when the text
    /// is blank and nothing was queued.
    pub async fn send_message(self: &Arc<Self>, text: &str) -> Result<Option<String>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        self.submit_message(text.to_string(), ContentKind::Text, None)
            .await
            .map(Some)
    }

    /// Sends a reply. Channel replies carry a short snapshot of the quoted
    /// message so they render even after the original scrolls out.
    pub async fn send_reply(
        self: &Arc<Self>,
        text: &str,
        reply_to: &MessageId,
    ) -> Result<Option<String>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        self.submit_message(text.to_string(), ContentKind::Text, Some(reply_to.clone()))
            .await
            .map(Some)
    }

    /// Sends an attachment inlined as a data URI.
    pub async fn send_attachment(self: &Arc<Self>, mime: &str, bytes: &[u8]) -> Result<String> {
        let body = content::encode_attachment(mime, bytes)?;
        self.submit_message(body, content::kind_for_mime(mime), None)
            .await
    }

    async fn submit_message(
        self: &Arc<Self>,
        text: String,
        kind: ContentKind,
        reply_to: Option<MessageId>,
    ) -> Result<String> {
        let profile = self.profile().await?;
        let token = Uuid::new_v4().to_string();
        let (reference, record, placeholder, owed_stop) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let active = state
                .active
                .as_mut()
                .ok_or_else(|| anyhow!("no open conversation"))?;
            let reference = active.reference();
            let reply_snapshot = match (&reference, &reply_to) {
                (ConversationRef::Channel { .. }, Some(id)) => active
                    .log
                    .get(id)
                    .map(|quoted| format!("{}: {}", quoted.sender_name, preview_of(&quoted.content))),
                _ => None,
            };
            let record = build_record(
                &profile,
                &reference,
                &token,
                &text,
                kind,
                reply_to.clone(),
                reply_snapshot,
            );
            let mut placeholder = ChatMessage::from_record(&record, reference.clone(), text.clone());
            placeholder.delivery = Delivery::Pending;
            if !reference.is_direct() {
                placeholder.read_by.insert(profile.user_id.clone());
            }
            active.log.push_pending(placeholder.clone());
            active.draft.clear();
            let key = reference.key(&profile.user_id);
            let owed_stop = state.typing.local_clear(&key).then_some(key);
            (reference, record, placeholder, owed_stop)
        };
        let _ = self.events.send(ChatEvent::MessageAppended {
            conversation: reference.clone(),
            message: placeholder,
        });
        if let Some(key) = owed_stop {
            self.spawn_typing_withdraw(key, profile.user_id.clone());
        }
        self.dispatch_send(reference, record, token.clone());
        Ok(token)
    }

    fn dispatch_send(self: &Arc<Self>, reference: ConversationRef, record: MessageRecord, token: String) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            match client.store.insert_message(&record).await {
                Ok(stored) => client.confirm_send(&reference, &token, stored).await,
                Err(err) => {
                    warn!(token, error = %err, "message send failed");
                    client.fail_send(&reference, &token, err.to_string()).await;
                }
            }
        });
    }

    async fn confirm_send(&self, reference: &ConversationRef, token: &str, stored: MessageRecord) {
        let Ok(profile) = self.profile().await else {
            return;
        };
        let content = render_content(&profile, reference, &stored);
        let mut confirmed = ChatMessage::from_record(&stored, reference.clone(), content);
        if !reference.is_direct() {
            confirmed.read_by.insert(profile.user_id.clone());
        }
        let mut guard = self.inner.lock().await;
        guard.note_seen(&stored.id);
        let Some(active) = guard.active.as_mut() else {
            return;
        };
        if active.reference() != *reference {
            return;
        }
        if active.log.confirm(token, confirmed) {
            drop(guard);
            let _ = self.events.send(ChatEvent::MessageConfirmed {
                conversation: reference.clone(),
                token: token.to_string(),
                id: stored.id,
            });
        }
    }

    async fn fail_send(&self, reference: &ConversationRef, token: &str, reason: String) {
        let mut guard = self.inner.lock().await;
        let Some(active) = guard.active.as_mut() else {
            return;
        };
        if active.reference() != *reference {
            return;
        }
        if active.log.mark_failed(token) {
            drop(guard);
            let _ = self.events.send(ChatEvent::MessageFailed {
                conversation: reference.clone(),
                token: token.to_string(),
                reason,
            });
        }
    }

    /// Re-submits a failed send under its original token, keeping the
    /// placeholder's position and timestamp.
    pub async fn retry_send(self: &Arc<Self>, token: &str) -> Result<()> {
        let profile = self.profile().await?;
        let (reference, record) = {
            let mut guard = self.inner.lock().await;
            let active = guard
                .active
                .as_mut()
                .ok_or_else(|| anyhow!("no open conversation"))?;
            let reference = active.reference();
            let message = active
                .log
                .mark_pending(token)
                .ok_or_else(|| anyhow!("no failed send with token {token}"))?;
            let record = build_record(
                &profile,
                &reference,
                token,
                &message.content,
                message.content_kind,
                message.reply_to.clone(),
                message.reply_snapshot.clone(),
            );
            (reference, record)
        };
        let _ = self.events.send(ChatEvent::MessageRetried {
            conversation: reference.clone(),
            token: token.to_string(),
        });
        self.dispatch_send(reference, record, token.to_string());
        Ok(())
    }

    /// Drops a failed send without submitting it.
    pub async fn discard_failed(self: &Arc<Self>, token: &str) -> Result<()> {
        let (reference, id) = {
            let mut guard = self.inner.lock().await;
            let active = guard
                .active
                .as_mut()
                .ok_or_else(|| anyhow!("no open conversation"))?;
            let reference = active.reference();
            let id = active
                .log
                .discard_failed(token)
                .ok_or_else(|| anyhow!("no failed send with token {token}"))?;
            (reference, id)
        };
        let _ = self.events.send(ChatEvent::MessageRemoved {
            conversation: reference,
            id,
        });
        Ok(())
    }

    /// Toggles the local user's reaction on a confirmed message. The flip is
    /// optimistic; it is rolled back only if the store explicitly refuses the
    /// write. Transient failures keep the optimistic state for the echo to
    /// settle.
    pub async fn toggle_reaction(self: &Arc<Self>, message_id: &MessageId, emoji: &str) -> Result<()> {
        let profile = self.profile().await?;
        let (reference, key, adding) = {
            let mut guard = self.inner.lock().await;
            let active = guard
                .active
                .as_mut()
                .ok_or_else(|| anyhow!("no open conversation"))?;
            let reference = active.reference();
            let message = active
                .log
                .get(message_id)
                .ok_or_else(|| anyhow!("message {message_id} is not in the open conversation"))?;
            if message.delivery != Delivery::Confirmed {
                return Err(anyhow!("cannot react to an unconfirmed message"));
            }
            let adding = !message.has_reaction(&profile.user_id, emoji);
            if adding {
                active
                    .log
                    .add_reaction(message_id, profile.user_id.clone(), emoji);
            } else {
                active
                    .log
                    .remove_reaction(message_id, &profile.user_id, emoji);
            }
            (reference.clone(), reference.key(&profile.user_id), adding)
        };
        let _ = self.events.send(ChatEvent::ReactionsChanged {
            conversation: reference.clone(),
            id: message_id.clone(),
        });

        let reaction = ReactionRecord {
            message_id: message_id.clone(),
            user_id: profile.user_id.clone(),
            emoji: emoji.to_string(),
            conversation_key: key,
        };
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let result = if adding {
                client.store.insert_reaction(&reaction).await
            } else {
                client.store.delete_reaction(&reaction).await
            };
            if let Err(err) = result {
                if err.is_explicit_rejection() {
                    client.rollback_reaction(&reference, &reaction, adding).await;
                } else {
                    warn!(error = %err, "reaction write failed, keeping optimistic state");
                }
            }
        });
        Ok(())
    }

    async fn rollback_reaction(
        &self,
        reference: &ConversationRef,
        reaction: &ReactionRecord,
        was_adding: bool,
    ) {
        let mut guard = self.inner.lock().await;
        let Some(active) = guard.active.as_mut() else {
            return;
        };
        if active.reference() != *reference {
            return;
        }
        let changed = if was_adding {
            active
                .log
                .remove_reaction(&reaction.message_id, &reaction.user_id, &reaction.emoji)
        } else {
            active
                .log
                .add_reaction(&reaction.message_id, reaction.user_id.clone(), &reaction.emoji)
        };
        if changed {
            drop(guard);
            warn!(message_id = %reaction.message_id, "reaction refused by the store, rolled back");
            let _ = self.events.send(ChatEvent::ReactionsChanged {
                conversation: reference.clone(),
                id: reaction.message_id.clone(),
            });
        }
    }

    /// Deletes one of the local user's confirmed messages. Direct messages
    /// are soft-deleted (flagged, row kept); channel messages are removed
    /// outright. The local view updates only after the store accepts.
    pub async fn delete_message(self: &Arc<Self>, message_id: &MessageId) -> Result<()> {
        let profile = self.profile().await?;
        let reference = {
            let guard = self.inner.lock().await;
            let active = guard
                .active
                .as_ref()
                .ok_or_else(|| anyhow!("no open conversation"))?;
            let message = active
                .log
                .get(message_id)
                .ok_or_else(|| anyhow!("message {message_id} is not in the open conversation"))?;
            if message.sender_id != profile.user_id {
                return Err(anyhow!("only your own messages can be deleted"));
            }
            if message.delivery != Delivery::Confirmed {
                return Err(anyhow!("unconfirmed sends are discarded, not deleted"));
            }
            active.reference()
        };
        match &reference {
            ConversationRef::Direct { .. } => self.store.mark_message_deleted(message_id).await?,
            ConversationRef::Channel { .. } => self.store.delete_message(message_id).await?,
        }

        let mut guard = self.inner.lock().await;
        if let Some(active) = guard.active.as_mut() {
            if active.reference() == reference && active.log.remove(message_id) {
                drop(guard);
                let _ = self.events.send(ChatEvent::MessageRemoved {
                    conversation: reference,
                    id: message_id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Stores the composer draft and publishes a typing signal, debounced so
    /// continuous typing refreshes the store at most once per window.
    pub async fn update_draft(self: &Arc<Self>, text: &str) -> Result<()> {
        let profile = self.profile().await?;
        let (publish, withdraw) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let active = state
                .active
                .as_mut()
                .ok_or_else(|| anyhow!("no open conversation"))?;
            active.draft = text.to_string();
            let key = active.reference().key(&profile.user_id);
            if text.is_empty() {
                (None, state.typing.local_clear(&key).then_some(key))
            } else {
                (
                    state.typing.local_keystroke(&key, Instant::now()).then_some(key),
                    None,
                )
            }
        };
        if let Some(key) = publish {
            let record = TypingRecord {
                conversation_key: key,
                user_id: profile.user_id.clone(),
                user_name: profile.display_name.clone(),
                updated_at: Utc::now(),
            };
            let client = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = client.store.publish_typing(&record).await {
                    warn!(error = %err, "typing publish failed");
                }
            });
        }
        if let Some(key) = withdraw {
            self.spawn_typing_withdraw(key, profile.user_id.clone());
        }
        Ok(())
    }

    fn spawn_typing_withdraw(self: &Arc<Self>, key: String, user: UserId) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = client.store.clear_typing(&key, &user).await {
                warn!(error = %err, "typing withdraw failed");
            }
        });
    }

    /// Names of everyone currently typing in the open conversation, expired
    /// entries pruned.
    pub async fn active_typists(&self) -> Vec<String> {
        let Ok(profile) = self.profile().await else {
            return Vec::new();
        };
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let Some(active) = state.active.as_ref() else {
            return Vec::new();
        };
        let key = active.reference().key(&profile.user_id);
        state.typing.active_typists(&key, Instant::now())
    }

    /// Mutes or unmutes a channel. Muting suppresses popup sound only; the
    /// popup itself and the unread counter are unaffected.
    pub async fn set_channel_muted(&self, channel: &ChannelId, muted: bool) -> Result<()> {
        self.local
            .set_channel_muted(channel, muted)
            .await
            .context("failed to persist mute flag")?;
        let mut guard = self.inner.lock().await;
        guard.ledger.set_muted(channel.clone(), muted);
        Ok(())
    }

    pub async fn is_channel_muted(&self, channel: &ChannelId) -> bool {
        let guard = self.inner.lock().await;
        guard.ledger.is_muted(&ConversationRef::Channel { id: channel.clone() })
    }

    pub async fn unread_count(&self, conversation: &ConversationRef) -> u32 {
        self.inner.lock().await.ledger.count(conversation)
    }

    pub async fn total_unread(&self) -> u32 {
        self.inner.lock().await.ledger.total()
    }

    pub async fn popups(&self) -> Vec<Popup> {
        self.inner.lock().await.ledger.popups().to_vec()
    }

    pub async fn dismiss_popup(&self, popup_id: u64) -> bool {
        let dismissed = self.inner.lock().await.ledger.dismiss_popup(popup_id);
        if dismissed {
            let _ = self.events.send(ChatEvent::PopupDismissed { popup_id });
        }
        dismissed
    }

    /// Inline quick-reply from a direct-message popup: sends to the peer
    /// without opening the conversation and dismisses the popup. Channel
    /// popups have no quick reply; the UI jumps to the channel instead.
    pub async fn reply_from_popup(self: &Arc<Self>, popup_id: u64, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let profile = self.profile().await?;
        let source = {
            let mut guard = self.inner.lock().await;
            let popup = guard
                .ledger
                .popup(popup_id)
                .ok_or_else(|| anyhow!("popup {popup_id} is gone"))?;
            if !popup.is_direct {
                return Err(anyhow!("quick reply is only available for direct messages"));
            }
            let source = popup.source.clone();
            guard.ledger.dismiss_popup(popup_id);
            source
        };
        let _ = self.events.send(ChatEvent::PopupDismissed { popup_id });

        let token = Uuid::new_v4().to_string();
        let record = build_record(
            &profile,
            &source,
            &token,
            text,
            ContentKind::Text,
            None,
            None,
        );
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = client.store.insert_message(&record).await {
                let _ = client
                    .events
                    .send(ChatEvent::Error(format!("quick reply failed: {err}")));
            }
        });
        Ok(())
    }

    pub async fn workspaces(&self) -> Vec<WorkspaceRecord> {
        self.inner.lock().await.directory.workspaces().to_vec()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        let guard = self.inner.lock().await;
        match &guard.profile {
            Some(profile) => guard.directory.conversations(&profile.user_id),
            None => Vec::new(),
        }
    }

    pub async fn open_reference(&self) -> Option<ConversationRef> {
        let guard = self.inner.lock().await;
        guard.active.as_ref().map(|active| active.reference())
    }

    /// Snapshot of the open conversation's messages, oldest first.
    pub async fn active_messages(&self) -> Vec<ChatMessage> {
        let guard = self.inner.lock().await;
        guard
            .active
            .as_ref()
            .map(|active| active.log.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn current_draft(&self) -> String {
        let guard = self.inner.lock().await;
        guard
            .active
            .as_ref()
            .map(|active| active.draft.clone())
            .unwrap_or_default()
    }

    async fn profile(&self) -> Result<SessionProfile> {
        let guard = self.inner.lock().await;
        guard
            .profile
            .clone()
            .ok_or_else(|| anyhow!("no active session"))
    }

    async fn conversation_records(
        &self,
        reference: &ConversationRef,
        local: &UserId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        match reference {
            ConversationRef::Channel { id } => {
                with_retry("fetch_channel_history", || self.store.channel_history(id)).await
            }
            ConversationRef::Direct { peer } => {
                with_retry("fetch_direct_history", || {
                    self.store.direct_history(local, peer)
                })
                .await
            }
        }
    }

    /// Recomputes unread counters from store state: everything another user
    /// sent that the local user has no receipt for.
    async fn rebuild_unread_counts(
        self: &Arc<Self>,
        profile: &SessionProfile,
        conversations: &[Conversation],
    ) {
        let mut counts = HashMap::new();
        for conversation in conversations {
            let reference = conversation.reference();
            let key = reference.key(&profile.user_id);
            let records = match self.conversation_records(&reference, &profile.user_id).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(key, error = %err, "skipping unread rebuild for conversation");
                    continue;
                }
            };
            let receipts = match with_retry("fetch_receipts", || {
                self.store.receipts_for_conversation(&key)
            })
            .await
            {
                Ok(receipts) => receipts,
                Err(err) => {
                    warn!(key, error = %err, "skipping unread rebuild for conversation");
                    continue;
                }
            };
            let read: HashSet<&MessageId> = receipts
                .iter()
                .filter(|r| r.user_id == profile.user_id)
                .map(|r| &r.message_id)
                .collect();
            let unread = records
                .iter()
                .filter(|r| r.sender_id != profile.user_id && !r.deleted && !read.contains(&r.id))
                .count() as u32;
            if unread > 0 {
                counts.insert(reference, unread);
            }
        }

        {
            let mut guard = self.inner.lock().await;
            guard.ledger.rebuild(counts.clone());
        }
        for (conversation, count) in counts {
            let _ = self.events.send(ChatEvent::UnreadChanged { conversation, count });
        }
    }

    async fn ensure_background_tasks(self: &Arc<Self>) -> Result<()> {
        {
            let mut guard = self.inner.lock().await;
            if guard.router_started {
                return Ok(());
            }
            guard.router_started = true;
        }
        if let Err(err) = router::start(self).await {
            let mut guard = self.inner.lock().await;
            guard.router_started = false;
            return Err(err).context("failed to attach push subscriptions");
        }
        // The router flag hands back when the feeds close so a later session
        // re-subscribes; the sweeper outlives that cycle and spawns once.
        let spawn_sweeper = {
            let mut guard = self.inner.lock().await;
            !std::mem::replace(&mut guard.sweeper_started, true)
        };
        if spawn_sweeper {
            let client = Arc::downgrade(self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(MAINTENANCE_TICK);
                loop {
                    ticker.tick().await;
                    let Some(client) = client.upgrade() else {
                        break;
                    };
                    client.sweep(Instant::now()).await;
                }
            });
        }
        Ok(())
    }

    /// One maintenance pass: publish due typing stops, expire observed
    /// typists, expire popups. Driven by the background ticker; callable with
    /// a synthetic clock.
    pub(crate) async fn sweep(self: &Arc<Self>, now: Instant) {
        let Ok(profile) = self.profile().await else {
            return;
        };
        let (stops, typing_event, expired) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            let stops = state.typing.local_stops_due(now);
            let changed = state.typing.prune(now);
            let expired = state.ledger.sweep_popups(now);
            let active_ref = state.active.as_ref().map(|active| active.reference());
            let mut typing_event = None;
            if let Some(reference) = active_ref {
                let key = reference.key(&profile.user_id);
                if changed.contains(&key) {
                    let names = state.typing.active_typists(&key, now);
                    typing_event = Some((reference, names));
                }
            }
            (stops, typing_event, expired)
        };

        for key in stops {
            self.spawn_typing_withdraw(key, profile.user_id.clone());
        }
        if let Some((conversation, names)) = typing_event {
            let _ = self.events.send(ChatEvent::TypingChanged { conversation, names });
        }
        for popup_id in expired {
            let _ = self.events.send(ChatEvent::PopupDismissed { popup_id });
        }
    }

    /// Applies one change event from the push transport. Safe against
    /// duplicates and reordering: inserts deduplicate by id, receipts and
    /// reactions are set-like, and removals of unknown rows are no-ops.
    pub(crate) async fn apply_change(self: &Arc<Self>, event: ChangeEvent) {
        let Ok(profile) = self.profile().await else {
            return;
        };
        match event.payload {
            ChangePayload::ChannelMessages(record) | ChangePayload::DirectMessages(record) => {
                self.apply_message_change(&profile, event.op, record).await;
            }
            ChangePayload::ReadReceipts(receipt) => self.apply_receipt(&profile, receipt).await,
            ChangePayload::Reactions(reaction) => {
                self.apply_reaction(&profile, event.op, reaction).await;
            }
            ChangePayload::TypingSignals(typing) => {
                self.apply_typing(&profile, event.op, typing).await;
            }
        }
    }

    async fn apply_message_change(
        self: &Arc<Self>,
        profile: &SessionProfile,
        op: ChangeOp,
        record: MessageRecord,
    ) {
        let Some(reference) = record.conversation(&profile.user_id) else {
            return;
        };
        match &reference {
            ConversationRef::Channel { id } => {
                let guard = self.inner.lock().await;
                if !guard.directory.contains_channel(id) {
                    return;
                }
            }
            ConversationRef::Direct { .. } => {
                if !record.involves(&profile.user_id) {
                    return;
                }
            }
        }
        match op {
            ChangeOp::Insert => self.apply_message_insert(profile, reference, record).await,
            ChangeOp::Update if record.deleted => {
                self.apply_message_removal(reference, record.id).await;
            }
            ChangeOp::Update => {}
            ChangeOp::Delete => self.apply_message_removal(reference, record.id).await,
        }
    }

    async fn apply_message_insert(
        self: &Arc<Self>,
        profile: &SessionProfile,
        reference: ConversationRef,
        record: MessageRecord,
    ) {
        if record.deleted {
            return;
        }
        let content = render_content(profile, &reference, &record);
        let mention = !reference.is_direct()
            && record.sender_id != profile.user_id
            && content::mentions_user(&content, &profile.display_name);

        let mut events = Vec::new();
        let mut receipt = None;
        {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            if !state.note_seen(&record.id) {
                return;
            }
            let open = state
                .active
                .as_mut()
                .filter(|active| active.reference() == reference);
            match open {
                Some(active) => {
                    let token_match = record
                        .client_token
                        .as_deref()
                        .filter(|token| active.log.get_by_token(token).is_some());
                    if active.log.contains(&record.id) {
                        // duplicate of an already-applied row
                    } else if let Some(token) = token_match {
                        let mut confirmed =
                            ChatMessage::from_record(&record, reference.clone(), content.clone());
                        if !reference.is_direct() {
                            confirmed.read_by.insert(profile.user_id.clone());
                        }
                        if active.log.confirm(token, confirmed) {
                            events.push(ChatEvent::MessageConfirmed {
                                conversation: reference.clone(),
                                token: token.to_string(),
                                id: record.id.clone(),
                            });
                        }
                    } else {
                        let message =
                            ChatMessage::from_record(&record, reference.clone(), content.clone());
                        active.log.insert_sorted(message.clone());
                        events.push(ChatEvent::MessageAppended {
                            conversation: reference.clone(),
                            message,
                        });
                        if record.sender_id != profile.user_id {
                            // Reading it live counts as reading it.
                            receipt = Some(ReadReceiptRecord {
                                message_id: record.id.clone(),
                                user_id: profile.user_id.clone(),
                                conversation_key: reference.key(&profile.user_id),
                                read_at: Utc::now(),
                            });
                        }
                    }
                }
                None => {
                    if record.sender_id != profile.user_id {
                        let count = state.ledger.increment(&reference);
                        let popup = state.ledger.push_popup(
                            reference.clone(),
                            record.sender_name.clone(),
                            record.sender_avatar.clone(),
                            preview_of(&content),
                            Instant::now(),
                        );
                        events.push(ChatEvent::UnreadChanged {
                            conversation: reference.clone(),
                            count,
                        });
                        events.push(ChatEvent::PopupPosted { popup });
                    }
                }
            }
        }
        for event in events {
            let _ = self.events.send(event);
        }
        if let Some(receipt) = receipt {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = client.store.upsert_receipt(&receipt).await {
                    warn!(error = %err, "read receipt publish failed");
                }
            });
        }
        if mention {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = client.notifier.notify_mention(&record).await {
                    warn!(error = %err, "mention ping failed");
                }
            });
        }
    }

    async fn apply_message_removal(self: &Arc<Self>, reference: ConversationRef, id: MessageId) {
        let mut guard = self.inner.lock().await;
        let Some(active) = guard.active.as_mut() else {
            return;
        };
        if active.reference() != reference {
            return;
        }
        if active.log.remove(&id) {
            drop(guard);
            let _ = self.events.send(ChatEvent::MessageRemoved {
                conversation: reference,
                id,
            });
        }
    }

    async fn apply_receipt(self: &Arc<Self>, profile: &SessionProfile, receipt: ReadReceiptRecord) {
        let mut guard = self.inner.lock().await;
        let Some(active) = guard.active.as_mut() else {
            return;
        };
        let reference = active.reference();
        if reference.key(&profile.user_id) != receipt.conversation_key {
            return;
        }
        if active.log.merge_read(&receipt.message_id, receipt.user_id) {
            drop(guard);
            let _ = self.events.send(ChatEvent::ReadReceiptsChanged {
                conversation: reference,
                id: receipt.message_id,
            });
        }
    }

    async fn apply_reaction(
        self: &Arc<Self>,
        profile: &SessionProfile,
        op: ChangeOp,
        reaction: ReactionRecord,
    ) {
        let mut guard = self.inner.lock().await;
        let Some(active) = guard.active.as_mut() else {
            return;
        };
        let reference = active.reference();
        if reference.key(&profile.user_id) != reaction.conversation_key {
            return;
        }
        let changed = match op {
            ChangeOp::Insert | ChangeOp::Update => {
                active
                    .log
                    .add_reaction(&reaction.message_id, reaction.user_id, &reaction.emoji)
            }
            ChangeOp::Delete => {
                active
                    .log
                    .remove_reaction(&reaction.message_id, &reaction.user_id, &reaction.emoji)
            }
        };
        if changed {
            drop(guard);
            let _ = self.events.send(ChatEvent::ReactionsChanged {
                conversation: reference,
                id: reaction.message_id,
            });
        }
    }

    async fn apply_typing(
        self: &Arc<Self>,
        profile: &SessionProfile,
        op: ChangeOp,
        typing: TypingRecord,
    ) {
        if typing.user_id == profile.user_id {
            return;
        }
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        match op {
            ChangeOp::Insert | ChangeOp::Update => state.typing.observe(
                &typing.conversation_key,
                typing.user_id.clone(),
                typing.user_name.clone(),
                Instant::now(),
            ),
            ChangeOp::Delete => {
                state.typing.observe_stop(&typing.conversation_key, &typing.user_id);
            }
        }
        let Some(reference) = state.active.as_ref().map(|active| active.reference()) else {
            return;
        };
        let key = reference.key(&profile.user_id);
        if key != typing.conversation_key {
            return;
        }
        let names = state.typing.active_typists(&key, Instant::now());
        drop(guard);
        let _ = self.events.send(ChatEvent::TypingChanged {
            conversation: reference,
            names,
        });
    }
}

/// Builds the wire record for a send. Direct bodies are obfuscated; channel
/// bodies travel as typed.
fn build_record(
    profile: &SessionProfile,
    reference: &ConversationRef,
    token: &str,
    text: &str,
    kind: ContentKind,
    reply_to: Option<MessageId>,
    reply_snapshot: Option<String>,
) -> MessageRecord {
    let (channel_id, recipient_id, content) = match reference {
        ConversationRef::Channel { id } => (Some(id.clone()), None, text.to_string()),
        ConversationRef::Direct { peer } => {
            let key = obfuscate::derive_key(&profile.user_id, peer);
            (None, Some(peer.clone()), obfuscate::encode(&key, text))
        }
    };
    MessageRecord {
        id: MessageId::new(token),
        channel_id,
        recipient_id,
        sender_id: profile.user_id.clone(),
        sender_name: profile.display_name.clone(),
        sender_avatar: profile.avatar.clone(),
        content,
        content_kind: kind,
        reply_to,
        reply_snapshot,
        client_token: Some(token.to_string()),
        created_at: Utc::now(),
        deleted: false,
    }
}

/// What the UI should display for a record: direct bodies are decoded,
/// channel bodies pass through.
fn render_content(profile: &SessionProfile, reference: &ConversationRef, record: &MessageRecord) -> String {
    match reference {
        ConversationRef::Direct { peer } => {
            let key = obfuscate::derive_key(&profile.user_id, peer);
            obfuscate::decode(&key, &record.content)
        }
        ConversationRef::Channel { .. } => record.content.clone(),
    }
}

fn preview_of(content: &str) -> String {
    if let Some(blob) = content::decode_attachment(content) {
        return format!("[{}]", blob.mime);
    }
    let mut preview: String = content.chars().take(PREVIEW_LEN).collect();
    if content.chars().count() > PREVIEW_LEN {
        preview.push('…');
    }
    preview
}

/// Runs a store call, retrying transient failures with doubling backoff.
/// Explicit rejections are never retried.
pub(crate) async fn with_retry<T, Fut>(
    operation: &'static str,
    mut call: impl FnMut() -> Fut,
) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 1u32;
    let mut delay = STORE_RETRY_BASE_DELAY;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < STORE_RETRY_ATTEMPTS => {
                warn!(operation, attempt, error = %err, "transient store failure, backing off");
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod remote_tests;
