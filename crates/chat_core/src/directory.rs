//! Workspace visibility and the conversation list.
//!
//! A workspace is visible when the local user owns it or appears in its
//! member list. Member lists are messy in practice: entries are raw user ids
//! or URL-encoded display tokens depending on which surface wrote the row, so
//! the check decodes and compares both forms instead of assuming one
//! canonical shape.

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use shared::{
    domain::{ChannelId, ConversationRef, PresenceStatus, UserId, WorkspaceId},
    protocol::{ChannelRecord, MemberRecord, WorkspaceRecord},
};

/// What the UI opens: a workspace channel or a direct thread with one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversation {
    GroupChannel {
        id: ChannelId,
        workspace_id: WorkspaceId,
        name: String,
        icon: Option<String>,
    },
    DirectConversation {
        peer_id: UserId,
        peer_name: String,
        peer_avatar: Option<String>,
        peer_presence: PresenceStatus,
    },
}

impl Conversation {
    pub fn from_channel(record: &ChannelRecord) -> Self {
        Self::GroupChannel {
            id: record.id.clone(),
            workspace_id: record.workspace_id.clone(),
            name: record.name.clone(),
            icon: record.icon.clone(),
        }
    }

    pub fn from_member(record: &MemberRecord) -> Self {
        Self::DirectConversation {
            peer_id: record.user_id.clone(),
            peer_name: record.display_name.clone(),
            peer_avatar: record.avatar.clone(),
            peer_presence: record.presence,
        }
    }

    pub fn reference(&self) -> ConversationRef {
        match self {
            Self::GroupChannel { id, .. } => ConversationRef::Channel { id: id.clone() },
            Self::DirectConversation { peer_id, .. } => ConversationRef::Direct {
                peer: peer_id.clone(),
            },
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::GroupChannel { name, .. } => name,
            Self::DirectConversation { peer_name, .. } => peer_name,
        }
    }
}

/// The URL-encoded display token some membership rows store instead of the
/// raw user id.
pub fn presence_token(display_name: &str) -> String {
    utf8_percent_encode(display_name, NON_ALPHANUMERIC).to_string()
}

pub fn workspace_visible(workspace: &WorkspaceRecord, user: &UserId, token: &str) -> bool {
    if &workspace.owner_id == user {
        return true;
    }
    workspace
        .members
        .iter()
        .any(|entry| member_entry_matches(entry, user, token))
}

fn member_entry_matches(entry: &str, user: &UserId, token: &str) -> bool {
    if entry == user.as_str() || entry == token {
        return true;
    }
    // Legacy rows hold percent-encoded tokens; decode and compare again.
    match percent_decode_str(entry).decode_utf8() {
        Ok(decoded) => decoded == user.as_str() || decoded == token,
        Err(_) => false,
    }
}

/// The directory of everything the local user can converse in: visible
/// workspaces, the selected workspace's channels, and its members as direct
/// conversation candidates.
#[derive(Default)]
pub struct Directory {
    workspaces: Vec<WorkspaceRecord>,
    selected: Option<WorkspaceId>,
    channels: Vec<ChannelRecord>,
    members: Vec<MemberRecord>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the workspace set with the visible subset of `all`.
    pub fn set_workspaces(&mut self, all: Vec<WorkspaceRecord>, user: &UserId, token: &str) {
        self.workspaces = all
            .into_iter()
            .filter(|workspace| workspace_visible(workspace, user, token))
            .collect();
        if let Some(selected) = &self.selected {
            if !self.workspaces.iter().any(|w| &w.id == selected) {
                self.selected = None;
                self.channels.clear();
                self.members.clear();
            }
        }
    }

    pub fn workspaces(&self) -> &[WorkspaceRecord] {
        &self.workspaces
    }

    pub fn is_visible(&self, id: &WorkspaceId) -> bool {
        self.workspaces.iter().any(|workspace| &workspace.id == id)
    }

    /// Selects a visible workspace, dropping the previous workspace's
    /// channels and members. Returns false for unknown ids.
    pub fn select(&mut self, id: &WorkspaceId) -> bool {
        if !self.is_visible(id) {
            return false;
        }
        if self.selected.as_ref() != Some(id) {
            self.channels.clear();
            self.members.clear();
        }
        self.selected = Some(id.clone());
        true
    }

    pub fn selected(&self) -> Option<&WorkspaceId> {
        self.selected.as_ref()
    }

    pub fn set_channels(&mut self, channels: Vec<ChannelRecord>) {
        self.channels = channels;
    }

    pub fn set_members(&mut self, members: Vec<MemberRecord>) {
        self.members = members;
    }

    pub fn channel(&self, id: &ChannelId) -> Option<&ChannelRecord> {
        self.channels.iter().find(|channel| &channel.id == id)
    }

    pub fn contains_channel(&self, id: &ChannelId) -> bool {
        self.channel(id).is_some()
    }

    pub fn member(&self, id: &UserId) -> Option<&MemberRecord> {
        self.members.iter().find(|member| &member.user_id == id)
    }

    /// Channels of the selected workspace followed by direct-conversation
    /// candidates, which are every other member of that workspace.
    pub fn conversations(&self, local: &UserId) -> Vec<Conversation> {
        let mut list: Vec<Conversation> =
            self.channels.iter().map(Conversation::from_channel).collect();
        list.extend(
            self.members
                .iter()
                .filter(|member| &member.user_id != local)
                .map(Conversation::from_member),
        );
        list
    }

    pub fn clear(&mut self) {
        self.workspaces.clear();
        self.selected = None;
        self.channels.clear();
        self.members.clear();
    }
}
