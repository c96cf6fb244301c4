//! Fan-in for the push transport: one subscription per topic, merged into a
//! single stream and applied to the client in arrival order.

use std::sync::Arc;

use futures::stream::{select_all, StreamExt};
use shared::protocol::SubscriptionTopic;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::{with_retry, ChatClient, ChatEvent};

/// Attaches all subscriptions and spawns the apply loop. Fails only when a
/// subscription cannot be established after retries.
pub(crate) async fn start(client: &Arc<ChatClient>) -> Result<(), StoreError> {
    let mut streams = Vec::with_capacity(SubscriptionTopic::ALL.len());
    for topic in SubscriptionTopic::ALL {
        let receiver = with_retry("subscribe", || client.push.subscribe(topic)).await?;
        info!(topic = topic.table(), "subscribed to change feed");
        streams.push(BroadcastStream::new(receiver));
    }

    let client = Arc::clone(client);
    tokio::spawn(async move {
        let mut merged = select_all(streams);
        while let Some(item) = merged.next().await {
            match item {
                Ok(event) => client.apply_change(event).await,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "change feed lagged, events dropped");
                }
            }
        }
        warn!("change feeds closed");
        let _ = client
            .events
            .send(ChatEvent::Error("realtime feed disconnected".into()));
        let mut guard = client.inner.lock().await;
        guard.router_started = false;
    });
    Ok(())
}
