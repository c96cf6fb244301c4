use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chat_core::conversation::Delivery;
use chat_core::memory::MemoryBackend;
use chat_core::obfuscate;
use chat_core::remote::RemoteBackend;
use chat_core::{ChatClient, ChatEvent, SessionProfile};
use chrono::Utc;
use clap::Parser;
use shared::domain::{
    ChannelId, ContentKind, ConversationRef, MessageId, PresenceStatus, UserId, WorkspaceId,
};
use shared::protocol::{
    ChangeEvent, ChangePayload, ChannelRecord, MemberRecord, MessageRecord, TypingRecord,
    WorkspaceRecord,
};
use storage::Storage;
use tokio::time::sleep;
use tracing::info;
use url::Url;

mod config;

const DEMO_WORKSPACE: &str = "w-atelier";
const DEMO_CHANNEL: &str = "c-workbench";
const DEMO_PEER: &str = "u-blake";

#[derive(Parser, Debug)]
struct Args {
    /// Chat store endpoint, e.g. https://chat.example.net. Runs the scripted
    /// local demo when omitted.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    display_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(v) = args.server_url {
        settings.server_url = Some(v);
    }
    if let Some(v) = args.database_url {
        settings.database_url = v;
    }
    if let Some(v) = args.user_id {
        settings.user_id = v;
    }
    if let Some(v) = args.display_name {
        settings.display_name = v;
    }

    let database_url = config::prepare_database_url(&settings.database_url)?;
    let local = Storage::new(&database_url).await?;
    let profile = SessionProfile::new(&settings.user_id, &settings.display_name);

    match settings.server_url {
        Some(raw) => run_remote(&raw, local, profile).await,
        None => run_demo(local, profile).await,
    }
}

async fn run_remote(raw_url: &str, local: Storage, profile: SessionProfile) -> Result<()> {
    let server_url =
        Url::parse(raw_url).with_context(|| format!("invalid server url '{raw_url}'"))?;
    anyhow::ensure!(
        matches!(server_url.scheme(), "http" | "https"),
        "server url must use http or https, got '{}'",
        server_url.scheme()
    );

    let backend = Arc::new(RemoteBackend::connect(server_url.as_str()).await?);
    let client = ChatClient::new(backend.clone(), backend.clone(), backend, local);
    spawn_printer(&client);

    client.start_session(profile).await?;
    let conversations = client.conversations().await;
    if let Some(first) = conversations.first() {
        client.open_conversation(&first.reference()).await?;
    }

    info!("session running, ctrl-c to quit");
    tokio::signal::ctrl_c().await?;
    Ok(())
}

/// Scripted two-user exchange against the in-memory store. The second user
/// only exists as rows pushed onto the change feeds.
async fn run_demo(local: Storage, profile: SessionProfile) -> Result<()> {
    let backend = MemoryBackend::new();
    seed_demo(&backend, &profile).await;

    let client = ChatClient::new(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        local,
    );
    spawn_printer(&client);

    client.start_session(profile.clone()).await?;
    client
        .open_conversation(&ConversationRef::channel(DEMO_CHANNEL))
        .await?;
    sleep(Duration::from_millis(200)).await;

    client
        .send_message("morning! wiring up the console shell today")
        .await?;
    sleep(Duration::from_millis(300)).await;

    // The peer answers over the push feed, mentioning us by display name.
    let ping = format!("@{} want a second pair of eyes?", profile.display_name);
    backend.push_event(ChangeEvent::insert(ChangePayload::ChannelMessages(
        peer_channel_message("m-demo-reply", &ping),
    )));
    sleep(Duration::from_millis(300)).await;

    let messages = client.active_messages().await;
    if let Some(reply) = messages
        .iter()
        .find(|message| message.sender_id.as_str() == DEMO_PEER)
    {
        client.toggle_reaction(&reply.id, "👍").await?;
    }
    sleep(Duration::from_millis(300)).await;

    backend.push_event(ChangeEvent::insert(ChangePayload::TypingSignals(
        TypingRecord {
            conversation_key: ConversationRef::channel(DEMO_CHANNEL).key(&profile.user_id),
            user_id: UserId::new(DEMO_PEER),
            user_name: "Blake".into(),
            updated_at: Utc::now(),
        },
    )));
    sleep(Duration::from_millis(300)).await;

    // A direct message while the channel stays open: counted unread, popup.
    backend.push_event(ChangeEvent::insert(ChangePayload::DirectMessages(
        peer_direct_message("m-demo-dm", &profile, "psst, check the release notes"),
    )));
    sleep(Duration::from_millis(300)).await;

    let popups = client.popups().await;
    if let Some(popup) = popups.first() {
        client.reply_from_popup(popup.id, "on it").await?;
    }

    // Long enough for the background sweep to expire the typing signal.
    sleep(Duration::from_millis(3500)).await;

    println!();
    println!("unread total: {}", client.total_unread().await);
    println!(
        "mention pings delivered: {}",
        backend.mention_pings().await.len()
    );
    println!(
        "demo finished, {} rows in the in-memory store",
        backend.message_count().await
    );
    Ok(())
}

fn spawn_printer(client: &Arc<ChatClient>) {
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });
}

async fn seed_demo(backend: &MemoryBackend, profile: &SessionProfile) {
    backend
        .seed_workspace(WorkspaceRecord {
            id: WorkspaceId::new(DEMO_WORKSPACE),
            name: "Atelier".into(),
            owner_id: profile.user_id.clone(),
            members: vec![DEMO_PEER.into()],
        })
        .await;
    backend
        .seed_channel(ChannelRecord {
            id: ChannelId::new(DEMO_CHANNEL),
            workspace_id: WorkspaceId::new(DEMO_WORKSPACE),
            name: "workbench".into(),
            icon: None,
        })
        .await;
    backend
        .seed_member(
            &WorkspaceId::new(DEMO_WORKSPACE),
            MemberRecord {
                user_id: profile.user_id.clone(),
                display_name: profile.display_name.clone(),
                avatar: None,
                presence: PresenceStatus::Online,
            },
        )
        .await;
    backend
        .seed_member(
            &WorkspaceId::new(DEMO_WORKSPACE),
            MemberRecord {
                user_id: UserId::new(DEMO_PEER),
                display_name: "Blake".into(),
                avatar: None,
                presence: PresenceStatus::Online,
            },
        )
        .await;
    backend
        .seed_message(peer_channel_message(
            "m-demo-history",
            "pushed the draft last night",
        ))
        .await;
}

fn peer_channel_message(id: &str, content: &str) -> MessageRecord {
    MessageRecord {
        id: MessageId::new(id),
        channel_id: Some(ChannelId::new(DEMO_CHANNEL)),
        recipient_id: None,
        sender_id: UserId::new(DEMO_PEER),
        sender_name: "Blake".into(),
        sender_avatar: None,
        content: content.into(),
        content_kind: ContentKind::Text,
        reply_to: None,
        reply_snapshot: None,
        client_token: None,
        created_at: Utc::now(),
        deleted: false,
    }
}

fn peer_direct_message(id: &str, profile: &SessionProfile, plaintext: &str) -> MessageRecord {
    let key = obfuscate::derive_key(&profile.user_id, &UserId::new(DEMO_PEER));
    MessageRecord {
        id: MessageId::new(id),
        channel_id: None,
        recipient_id: Some(profile.user_id.clone()),
        sender_id: UserId::new(DEMO_PEER),
        sender_name: "Blake".into(),
        sender_avatar: None,
        content: obfuscate::encode(&key, plaintext),
        content_kind: ContentKind::Text,
        reply_to: None,
        reply_snapshot: None,
        client_token: None,
        created_at: Utc::now(),
        deleted: false,
    }
}

fn print_event(event: &ChatEvent) {
    match event {
        ChatEvent::WorkspacesLoaded { workspaces } => {
            let names: Vec<&str> = workspaces.iter().map(|w| w.name.as_str()).collect();
            println!("workspaces: {}", names.join(", "));
        }
        ChatEvent::ConversationsLoaded { conversations } => {
            let titles: Vec<&str> = conversations.iter().map(|c| c.title()).collect();
            println!("conversations: {}", titles.join(", "));
        }
        ChatEvent::HistoryLoaded { conversation, .. } => {
            println!("-- {} --", label(conversation));
        }
        ChatEvent::MessageAppended {
            conversation,
            message,
        } => {
            let marker = match message.delivery {
                Delivery::Pending => " ...",
                Delivery::Failed => " (failed)",
                Delivery::Confirmed => "",
            };
            println!(
                "[{}] {}: {}{marker}",
                label(conversation),
                message.sender_name,
                message.content
            );
        }
        ChatEvent::MessageConfirmed {
            conversation, id, ..
        } => {
            println!("[{}] delivered as {id}", label(conversation));
        }
        ChatEvent::MessageFailed {
            conversation,
            reason,
            ..
        } => {
            println!("[{}] send failed: {reason}", label(conversation));
        }
        ChatEvent::MessageRetried { conversation, .. } => {
            println!("[{}] retrying send", label(conversation));
        }
        ChatEvent::MessageRemoved { conversation, id } => {
            println!("[{}] {id} removed", label(conversation));
        }
        ChatEvent::ReadReceiptsChanged { conversation, id } => {
            println!("[{}] {id} read", label(conversation));
        }
        ChatEvent::ReactionsChanged { conversation, id } => {
            println!("[{}] reactions changed on {id}", label(conversation));
        }
        ChatEvent::TypingChanged {
            conversation,
            names,
        } => {
            if names.is_empty() {
                println!("[{}] nobody is typing", label(conversation));
            } else {
                println!("[{}] typing: {}", label(conversation), names.join(", "));
            }
        }
        ChatEvent::UnreadChanged {
            conversation,
            count,
        } => {
            println!("[{}] unread: {count}", label(conversation));
        }
        ChatEvent::PopupPosted { popup } => {
            let sound = if popup.play_sound { "" } else { " (muted)" };
            println!(
                "popup #{}: {}: {}{sound}",
                popup.id, popup.sender_name, popup.preview
            );
        }
        ChatEvent::PopupDismissed { popup_id } => {
            println!("popup #{popup_id} dismissed");
        }
        ChatEvent::Error(reason) => {
            println!("error: {reason}");
        }
    }
}

fn label(reference: &ConversationRef) -> String {
    match reference {
        ConversationRef::Channel { id } => format!("#{id}"),
        ConversationRef::Direct { peer } => format!("dm:{peer}"),
    }
}
