use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(WorkspaceId);
id_newtype!(ChannelId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    #[default]
    Text,
    Image,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Idle,
    Busy,
    #[default]
    Offline,
}

/// Identifies a conversation independently of its record shape: a workspace
/// channel, or a pairwise direct thread named by the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationRef {
    Channel { id: ChannelId },
    Direct { peer: UserId },
}

impl ConversationRef {
    pub fn channel(id: impl Into<String>) -> Self {
        Self::Channel {
            id: ChannelId::new(id),
        }
    }

    pub fn direct(peer: impl Into<String>) -> Self {
        Self::Direct {
            peer: UserId::new(peer),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct { .. })
    }

    /// Stable key used by store rows and ledger maps. Channels key on the
    /// channel id; direct threads key on the sorted participant pair so both
    /// ends derive the same value.
    pub fn key(&self, local: &UserId) -> String {
        match self {
            Self::Channel { id } => id.0.clone(),
            Self::Direct { peer } => direct_pair_key(local, peer),
        }
    }
}

/// The two participant ids sorted lexicographically and joined with `:`.
pub fn direct_pair_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    format!("{}:{}", lo.0, hi.0)
}
