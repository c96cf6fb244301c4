//! Hosted-store adapter: REST tables for reads and writes, a websocket for
//! the change feed. One connection carries every subscribed topic; frames are
//! routed to per-topic broadcast channels so subscribers see only their table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::{
    domain::{direct_pair_key, ChannelId, MessageId, UserId, WorkspaceId},
    protocol::{
        ChangeEvent, ChannelRecord, MemberRecord, MessageRecord, ReactionRecord,
        ReadReceiptRecord, SubscriptionTopic, TypingRecord, WorkspaceRecord,
    },
};
use tokio::sync::broadcast;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::backend::{ChatStore, MentionNotifier, PushTransport};
use crate::error::StoreError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const FEED_CAPACITY: usize = 256;

/// Client for the hosted chat store.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    http: reqwest::Client,
    server_url: String,
    feeds: Arc<HashMap<SubscriptionTopic, broadcast::Sender<ChangeEvent>>>,
}

impl RemoteBackend {
    /// Connects to the hosted store: builds the REST client and opens the
    /// websocket change feed subscribed to every topic.
    pub async fn connect(server_url: &str) -> Result<Self, StoreError> {
        let server_url = server_url.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(StoreError::rejected(
                "server_url must start with http:// or https://",
            ));
        };
        let topics = SubscriptionTopic::ALL
            .iter()
            .map(|topic| topic.table())
            .collect::<Vec<_>>()
            .join(",");
        let ws_url = format!("{ws_url}/realtime?topics={topics}");
        let (ws_stream, _) = connect_async(&ws_url).await.map_err(StoreError::unavailable)?;
        let (_, mut ws_reader) = ws_stream.split();
        info!(url = %ws_url, "change feed connected");

        let mut feeds = HashMap::new();
        for topic in SubscriptionTopic::ALL {
            let (sender, _) = broadcast::channel(FEED_CAPACITY);
            feeds.insert(topic, sender);
        }
        let feeds = Arc::new(feeds);

        let routing = Arc::clone(&feeds);
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ChangeEvent>(&text) {
                        Ok(event) => {
                            if let Some(sender) = routing.get(&event.payload.topic()) {
                                let _ = sender.send(event);
                            }
                        }
                        Err(err) => warn!(error = %err, "invalid change frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "change feed receive failed");
                        break;
                    }
                }
            }
            warn!("change feed closed");
        });

        Ok(Self {
            http,
            server_url,
            feeds,
        })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/{table}", self.server_url)
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, StoreError> {
        let rows = self
            .http
            .get(self.rest_url(table))
            .query(query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(rows)
    }

    async fn post_row<T: Serialize, R: DeserializeOwned>(
        &self,
        table: &str,
        row: &T,
    ) -> Result<R, StoreError> {
        let stored = self
            .http
            .post(self.rest_url(table))
            .json(row)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(stored)
    }

    /// Insert-or-update keyed by the table's natural key; the response body
    /// is not interesting.
    async fn post_upsert<T: Serialize>(&self, table: &str, row: &T) -> Result<(), StoreError> {
        self.http
            .post(self.rest_url(table))
            .query(&[("on_conflict", "merge")])
            .json(row)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete_rows(&self, table: &str, query: &[(&str, &str)]) -> Result<(), StoreError> {
        self.http
            .delete(self.rest_url(table))
            .query(query)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for RemoteBackend {
    async fn fetch_workspaces(&self) -> Result<Vec<WorkspaceRecord>, StoreError> {
        self.get_rows("workspaces", &[]).await
    }

    async fn fetch_channels(&self, workspace: &WorkspaceId) -> Result<Vec<ChannelRecord>, StoreError> {
        self.get_rows("channels", &[("workspace_id", workspace.as_str())])
            .await
    }

    async fn fetch_members(&self, workspace: &WorkspaceId) -> Result<Vec<MemberRecord>, StoreError> {
        self.get_rows("members", &[("workspace_id", workspace.as_str())])
            .await
    }

    async fn channel_history(&self, channel: &ChannelId) -> Result<Vec<MessageRecord>, StoreError> {
        self.get_rows(
            "channel_messages",
            &[("channel_id", channel.as_str()), ("order", "created_at.asc")],
        )
        .await
    }

    async fn direct_history(
        &self,
        local: &UserId,
        peer: &UserId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let pair = direct_pair_key(local, peer);
        self.get_rows(
            "direct_messages",
            &[("pair_key", pair.as_str()), ("order", "created_at.asc")],
        )
        .await
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<MessageRecord, StoreError> {
        let table = if record.channel_id.is_some() {
            "channel_messages"
        } else {
            "direct_messages"
        };
        self.post_row(table, record).await
    }

    // Soft deletion is a direct-message affair; hard deletion a channel one.
    async fn mark_message_deleted(&self, id: &MessageId) -> Result<(), StoreError> {
        self.http
            .patch(format!("{}/{}", self.rest_url("direct_messages"), id))
            .json(&serde_json::json!({ "deleted": true }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), StoreError> {
        self.http
            .delete(format!("{}/{}", self.rest_url("channel_messages"), id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn receipts_for_conversation(
        &self,
        conversation_key: &str,
    ) -> Result<Vec<ReadReceiptRecord>, StoreError> {
        self.get_rows("read_receipts", &[("conversation_key", conversation_key)])
            .await
    }

    async fn upsert_receipt(&self, receipt: &ReadReceiptRecord) -> Result<(), StoreError> {
        self.post_upsert("read_receipts", receipt).await
    }

    async fn reactions_for_conversation(
        &self,
        conversation_key: &str,
    ) -> Result<Vec<ReactionRecord>, StoreError> {
        self.get_rows("reactions", &[("conversation_key", conversation_key)])
            .await
    }

    async fn insert_reaction(&self, reaction: &ReactionRecord) -> Result<(), StoreError> {
        self.post_upsert("reactions", reaction).await
    }

    async fn delete_reaction(&self, reaction: &ReactionRecord) -> Result<(), StoreError> {
        self.delete_rows(
            "reactions",
            &[
                ("message_id", reaction.message_id.as_str()),
                ("user_id", reaction.user_id.as_str()),
                ("emoji", reaction.emoji.as_str()),
            ],
        )
        .await
    }

    async fn publish_typing(&self, typing: &TypingRecord) -> Result<(), StoreError> {
        self.post_upsert("typing_signals", typing).await
    }

    async fn clear_typing(
        &self,
        conversation_key: &str,
        user: &UserId,
    ) -> Result<(), StoreError> {
        self.delete_rows(
            "typing_signals",
            &[
                ("conversation_key", conversation_key),
                ("user_id", user.as_str()),
            ],
        )
        .await
    }
}

#[async_trait]
impl PushTransport for RemoteBackend {
    async fn subscribe(
        &self,
        topic: SubscriptionTopic,
    ) -> Result<broadcast::Receiver<ChangeEvent>, StoreError> {
        self.feeds
            .get(&topic)
            .map(|sender| sender.subscribe())
            .ok_or_else(|| StoreError::rejected(format!("unknown topic {}", topic.table())))
    }
}

#[async_trait]
impl MentionNotifier for RemoteBackend {
    async fn notify_mention(&self, record: &MessageRecord) -> Result<(), StoreError> {
        self.http
            .post(format!("{}/notify/mentions", self.server_url))
            .json(record)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
