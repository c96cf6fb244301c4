use super::*;
use crate::memory::MemoryBackend;
use shared::protocol::{ChannelRecord, MemberRecord, SubscriptionTopic};

const WORKSPACE: &str = "w-atelier";
const CHANNEL: &str = "c-general";

fn ari() -> SessionProfile {
    SessionProfile::new("u-ari", "Ari")
}

fn workspace_record() -> WorkspaceRecord {
    WorkspaceRecord {
        id: WorkspaceId::new(WORKSPACE),
        name: "Atelier".into(),
        owner_id: UserId::new("u-ari"),
        members: vec!["u-blake".to_string()],
    }
}

fn member(user_id: &str, name: &str) -> MemberRecord {
    MemberRecord {
        user_id: UserId::new(user_id),
        display_name: name.to_string(),
        avatar: None,
        presence: PresenceStatus::Online,
    }
}

fn channel_message_from(sender: &str, name: &str, content: &str) -> MessageRecord {
    MessageRecord {
        id: MessageId::new("unassigned"),
        channel_id: Some(ChannelId::new(CHANNEL)),
        recipient_id: None,
        sender_id: UserId::new(sender),
        sender_name: name.to_string(),
        sender_avatar: None,
        content: content.to_string(),
        content_kind: ContentKind::Text,
        reply_to: None,
        reply_snapshot: None,
        client_token: None,
        created_at: Utc::now(),
        deleted: false,
    }
}

fn direct_message_between(sender: &str, name: &str, recipient: &str, plaintext: &str) -> MessageRecord {
    let key = obfuscate::derive_key(&UserId::new(sender), &UserId::new(recipient));
    MessageRecord {
        id: MessageId::new("unassigned"),
        channel_id: None,
        recipient_id: Some(UserId::new(recipient)),
        sender_id: UserId::new(sender),
        sender_name: name.to_string(),
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

async fn seeded_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.seed_workspace(workspace_record()).await;
    backend
        .seed_channel(ChannelRecord {
            id: ChannelId::new(CHANNEL),
            workspace_id: WorkspaceId::new(WORKSPACE),
            name: "general".into(),
            icon: None,
        })
        .await;
    let workspace = WorkspaceId::new(WORKSPACE);
    backend.seed_member(&workspace, member("u-ari", "Ari")).await;
    backend.seed_member(&workspace, member("u-blake", "Blake")).await;
    backend
}

fn temp_db() -> String {
    std::env::temp_dir()
        .join(format!("chat_core_client_{}.sqlite", Uuid::new_v4()))
        .to_string_lossy()
        .into_owned()
}

async fn client_for(backend: &MemoryBackend) -> Arc<ChatClient> {
    let local = Storage::new(&temp_db()).await.expect("open local storage");
    ChatClient::new(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        local,
    )
}

async fn started_client(backend: &MemoryBackend) -> Arc<ChatClient> {
    let client = client_for(backend).await;
    client.start_session(ari()).await.expect("start session");
    client
}

async fn send(client: &Arc<ChatClient>, text: &str) -> String {
    client
        .send_message(text)
        .await
        .expect("send")
        .expect("message queued")
}

fn channel_ref() -> ConversationRef {
    ConversationRef::channel(CHANNEL)
}

fn blake_ref() -> ConversationRef {
    ConversationRef::direct("u-blake")
}

async fn next_event(rx: &mut broadcast::Receiver<ChatEvent>) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("event channel closed")
}

async fn wait_for(
    rx: &mut broadcast::Receiver<ChatEvent>,
    matches: impl Fn(&ChatEvent) -> bool,
) -> ChatEvent {
    for _ in 0..64 {
        let event = next_event(rx).await;
        if matches(&event) {
            return event;
        }
    }
    panic!("expected event never arrived");
}

#[tokio::test]
async fn session_start_lists_workspaces_and_conversations() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;

    let workspaces = client.workspaces().await;
    assert_eq!(workspaces.len(), 1);

    // One channel plus one direct peer; the local user is never listed.
    let conversations = client.conversations().await;
    assert_eq!(conversations.len(), 2);
    assert!(conversations
        .iter()
        .any(|c| matches!(c, Conversation::GroupChannel { name, .. } if name == "general")));
    assert!(conversations
        .iter()
        .any(|c| matches!(c, Conversation::DirectConversation { peer_name, .. } if peer_name == "Blake")));
}

#[tokio::test]
async fn session_restores_the_previously_selected_workspace() {
    let backend = seeded_backend().await;
    backend
        .seed_workspace(WorkspaceRecord {
            id: WorkspaceId::new("w-annex"),
            name: "Annex".into(),
            owner_id: UserId::new("u-ari"),
            members: Vec::new(),
        })
        .await;
    backend
        .seed_channel(ChannelRecord {
            id: ChannelId::new("c-annex"),
            workspace_id: WorkspaceId::new("w-annex"),
            name: "annex".into(),
            icon: None,
        })
        .await;

    let path = temp_db();
    {
        let local = Storage::new(&path).await.expect("open local storage");
        local
            .set_last_workspace(&WorkspaceId::new("w-annex"))
            .await
            .expect("persist selection");
    }
    let local = Storage::new(&path).await.expect("reopen local storage");
    let client = ChatClient::new(
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        Arc::new(backend.clone()),
        local,
    );
    client.start_session(ari()).await.expect("start session");

    let conversations = client.conversations().await;
    assert!(conversations
        .iter()
        .any(|c| matches!(c, Conversation::GroupChannel { name, .. } if name == "annex")));
}

#[tokio::test]
async fn session_restart_reattaches_feeds_without_duplicating_maintenance() {
    let backend = seeded_backend().await;
    let client = client_for(&backend).await;
    client.start_session(ari()).await.expect("start session");
    sleep(Duration::from_millis(50)).await;

    // The router hands its flag back when the feeds close; a later
    // start_session must re-subscribe without stacking another sweeper.
    client.inner.lock().await.router_started = false;
    let before = Arc::strong_count(&client);
    client.start_session(ari()).await.expect("restart");
    sleep(Duration::from_millis(50)).await;

    // Exactly one new long-lived task holds the client: the re-attached
    // router. The maintenance sweeper keeps only a weak handle.
    assert_eq!(Arc::strong_count(&client), before + 1);
}

#[tokio::test]
async fn send_confirms_exactly_once_between_response_and_echo() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open channel");

    let mut rx = client.subscribe_events();
    let token = send(&client, "first proof sketch").await;

    let appended = wait_for(&mut rx, |e| matches!(e, ChatEvent::MessageAppended { .. })).await;
    let ChatEvent::MessageAppended { message, .. } = appended else {
        unreachable!()
    };
    assert_eq!(message.delivery, Delivery::Pending);
    assert_eq!(message.client_token.as_deref(), Some(token.as_str()));

    wait_for(
        &mut rx,
        |e| matches!(e, ChatEvent::MessageConfirmed { token: t, .. } if *t == token),
    )
    .await;

    // Give the push echo time to race the store response, then make sure
    // neither path applied the send twice.
    sleep(Duration::from_millis(100)).await;
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(
                event,
                ChatEvent::MessageConfirmed { .. } | ChatEvent::MessageAppended { .. }
            ),
            "send applied twice: {event:?}"
        );
    }

    let messages = client.active_messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].delivery, Delivery::Confirmed);
    assert_eq!(messages[0].id.as_str(), "m-0001");
    assert_eq!(backend.message_count().await, 1);
}

#[tokio::test]
async fn failed_send_is_kept_for_retry() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open channel");
    backend.reject_next_message_insert("quota exceeded").await;

    let mut rx = client.subscribe_events();
    let token = send(&client, "will bounce").await;

    let failed = wait_for(&mut rx, |e| matches!(e, ChatEvent::MessageFailed { .. })).await;
    let ChatEvent::MessageFailed {
        token: failed_token,
        reason,
        ..
    } = failed
    else {
        unreachable!()
    };
    assert_eq!(failed_token, token);
    assert!(reason.contains("quota exceeded"));

    let messages = client.active_messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].delivery, Delivery::Failed);

    client.retry_send(&token).await.expect("retry");
    wait_for(
        &mut rx,
        |e| matches!(e, ChatEvent::MessageConfirmed { token: t, .. } if *t == token),
    )
    .await;

    let messages = client.active_messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].delivery, Delivery::Confirmed);
    assert_eq!(messages[0].content, "will bounce");
}

#[tokio::test]
async fn failed_send_can_be_discarded() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open channel");
    backend.reject_next_message_insert("quota exceeded").await;

    let mut rx = client.subscribe_events();
    let token = send(&client, "never mind").await;
    wait_for(&mut rx, |e| matches!(e, ChatEvent::MessageFailed { .. })).await;

    client.discard_failed(&token).await.expect("discard");
    wait_for(&mut rx, |e| matches!(e, ChatEvent::MessageRemoved { .. })).await;
    assert!(client.active_messages().await.is_empty());
    assert_eq!(backend.message_count().await, 0);
}

#[tokio::test]
async fn blank_sends_are_ignored() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open channel");

    assert!(client.send_message("   ").await.expect("send").is_none());
    assert!(client.send_message("").await.expect("send").is_none());
    sleep(Duration::from_millis(50)).await;
    assert!(client.active_messages().await.is_empty());
    assert_eq!(backend.message_count().await, 0);
}

#[tokio::test]
async fn closed_conversation_message_counts_and_pops() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;

    let mut rx = client.subscribe_events();
    backend
        .insert_message(&channel_message_from("u-blake", "Blake", "anyone around?"))
        .await
        .expect("peer insert");

    let unread = wait_for(&mut rx, |e| matches!(e, ChatEvent::UnreadChanged { .. })).await;
    let ChatEvent::UnreadChanged { conversation, count } = unread else {
        unreachable!()
    };
    assert_eq!(conversation, channel_ref());
    assert_eq!(count, 1);

    let posted = wait_for(&mut rx, |e| matches!(e, ChatEvent::PopupPosted { .. })).await;
    let ChatEvent::PopupPosted { popup } = posted else {
        unreachable!()
    };
    assert_eq!(popup.sender_name, "Blake");
    assert_eq!(popup.preview, "anyone around?");
    assert!(!popup.is_direct);
    assert!(popup.play_sound);

    assert_eq!(client.unread_count(&channel_ref()).await, 1);

    client.open_conversation(&channel_ref()).await.expect("open");
    assert_eq!(client.unread_count(&channel_ref()).await, 0);
    assert_eq!(client.active_messages().await.len(), 1);
}

#[tokio::test]
async fn own_echo_in_closed_conversation_never_counts() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;

    let mut rx = client.subscribe_events();
    backend
        .insert_message(&channel_message_from("u-ari", "Ari", "from my other device"))
        .await
        .expect("insert");

    sleep(Duration::from_millis(100)).await;
    assert_eq!(client.unread_count(&channel_ref()).await, 0);
    assert!(client.popups().await.is_empty());
    while let Ok(event) = rx.try_recv() {
        assert!(
            !matches!(
                event,
                ChatEvent::UnreadChanged { .. } | ChatEvent::PopupPosted { .. }
            ),
            "self echo surfaced: {event:?}"
        );
    }
}

#[tokio::test]
async fn duplicate_delivery_counts_once() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;

    let mut record = channel_message_from("u-blake", "Blake", "double trouble");
    record.id = MessageId::new("m-dup");
    let event = ChangeEvent::insert(ChangePayload::ChannelMessages(record));

    let mut rx = client.subscribe_events();
    backend.push_event(event.clone());
    backend.push_event(event);

    wait_for(&mut rx, |e| matches!(e, ChatEvent::UnreadChanged { .. })).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(client.unread_count(&channel_ref()).await, 1);
    assert_eq!(client.popups().await.len(), 1);
}

#[tokio::test]
async fn duplicate_delivery_counts_once_after_reopens() {
    let backend = seeded_backend().await;
    // Enough history that duplicate bookkeeping entries would overflow the
    // seen-id cap and evict ids that are still current.
    for n in 0..300 {
        let mut record = channel_message_from("u-blake", "Blake", "backlog");
        record.id = MessageId::new(format!("m-log-{n:03}"));
        backend.seed_message(record).await;
    }
    let mut dm = direct_message_between("u-blake", "Blake", "u-ari", "ping");
    dm.id = MessageId::new("m-dm-ping");
    backend.seed_message(dm).await;

    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open channel");
    client.open_conversation(&blake_ref()).await.expect("open dm");
    client.open_conversation(&channel_ref()).await.expect("reopen channel");
    client.open_conversation(&blake_ref()).await.expect("reopen dm");

    // The oldest loaded message arrives again over the feed.
    let mut replay = channel_message_from("u-blake", "Blake", "backlog");
    replay.id = MessageId::new("m-log-000");
    backend.push_event(ChangeEvent::insert(ChangePayload::ChannelMessages(replay)));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(client.unread_count(&channel_ref()).await, 0);
    assert!(client.popups().await.is_empty());
}

#[tokio::test]
async fn muted_channel_still_counts_but_popup_is_silent() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;
    client
        .set_channel_muted(&ChannelId::new(CHANNEL), true)
        .await
        .expect("mute");

    let mut rx = client.subscribe_events();
    backend
        .insert_message(&channel_message_from("u-blake", "Blake", "pst"))
        .await
        .expect("insert");

    let posted = wait_for(&mut rx, |e| matches!(e, ChatEvent::PopupPosted { .. })).await;
    let ChatEvent::PopupPosted { popup } = posted else {
        unreachable!()
    };
    assert!(!popup.play_sound);
    assert_eq!(client.unread_count(&channel_ref()).await, 1);
    assert!(client.is_channel_muted(&ChannelId::new(CHANNEL)).await);
}

#[tokio::test]
async fn direct_sends_are_obfuscated_at_rest_and_readable_locally() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;
    client.open_conversation(&blake_ref()).await.expect("open dm");

    let mut rx = client.subscribe_events();
    let token = send(&client, "meet at the annex").await;
    let confirmed = wait_for(
        &mut rx,
        |e| matches!(e, ChatEvent::MessageConfirmed { token: t, .. } if *t == token),
    )
    .await;
    let ChatEvent::MessageConfirmed { id, .. } = confirmed else {
        unreachable!()
    };

    let stored = backend.stored_message(&id).await.expect("stored row");
    assert_ne!(stored.content, "meet at the annex");
    let key = obfuscate::derive_key(&UserId::new("u-ari"), &UserId::new("u-blake"));
    assert_eq!(obfuscate::decode(&key, &stored.content), "meet at the annex");

    let messages = client.active_messages().await;
    assert_eq!(messages[0].content, "meet at the annex");
}

#[tokio::test]
async fn attachments_travel_as_typed_data_uris() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open channel");

    let mut rx = client.subscribe_events();
    let token = client
        .send_attachment("image/png", &[137, 80, 78, 71])
        .await
        .expect("send attachment");
    let confirmed = wait_for(
        &mut rx,
        |e| matches!(e, ChatEvent::MessageConfirmed { token: t, .. } if *t == token),
    )
    .await;
    let ChatEvent::MessageConfirmed { id, .. } = confirmed else {
        unreachable!()
    };

    let stored = backend.stored_message(&id).await.expect("stored row");
    assert_eq!(stored.content_kind, ContentKind::Image);
    let blob = content::decode_attachment(&stored.content).expect("data uri body");
    assert_eq!(blob.mime, "image/png");
    assert_eq!(blob.bytes, vec![137, 80, 78, 71]);
}

#[tokio::test]
async fn open_conversation_receipts_incoming_messages() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;
    client.open_conversation(&blake_ref()).await.expect("open dm");

    let mut rx = client.subscribe_events();
    backend
        .insert_message(&direct_message_between("u-blake", "Blake", "u-ari", "you up?"))
        .await
        .expect("peer insert");

    let appended = wait_for(&mut rx, |e| matches!(e, ChatEvent::MessageAppended { .. })).await;
    let ChatEvent::MessageAppended { message, .. } = appended else {
        unreachable!()
    };
    assert_eq!(message.content, "you up?");

    wait_for(&mut rx, |e| matches!(e, ChatEvent::ReadReceiptsChanged { .. })).await;
    let messages = client.active_messages().await;
    assert!(messages[0].read_by.contains(&UserId::new("u-ari")));
}

#[tokio::test]
async fn opening_marks_existing_history_read() {
    let backend = seeded_backend().await;
    let mut old = channel_message_from("u-blake", "Blake", "yesterday's news");
    old.id = MessageId::new("m-old");
    backend.seed_message(old).await;

    let client = started_client(&backend).await;
    assert_eq!(client.unread_count(&channel_ref()).await, 1);

    let mut rx = client.subscribe_events();
    client.open_conversation(&channel_ref()).await.expect("open");
    assert_eq!(client.unread_count(&channel_ref()).await, 0);

    wait_for(&mut rx, |e| matches!(e, ChatEvent::ReadReceiptsChanged { .. })).await;
    let messages = client.active_messages().await;
    assert!(messages[0].read_by.contains(&UserId::new("u-ari")));
}

#[tokio::test]
async fn reaction_toggle_rolls_back_only_on_rejection() {
    let backend = seeded_backend().await;
    let mut seeded = channel_message_from("u-blake", "Blake", "react to me");
    seeded.id = MessageId::new("m-react");
    backend.seed_message(seeded).await;

    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open");
    let target = MessageId::new("m-react");

    // Transient failure: the optimistic flip stays in place.
    backend.set_offline(true).await;
    client.toggle_reaction(&target, "🌮").await.expect("toggle");
    sleep(Duration::from_millis(100)).await;
    let messages = client.active_messages().await;
    assert!(messages[0].has_reaction(&UserId::new("u-ari"), "🌮"));
    backend.set_offline(false).await;

    // Explicit rejection: rolled back.
    let mut rx = client.subscribe_events();
    backend.reject_next_reaction_write("forbidden").await;
    client.toggle_reaction(&target, "🔥").await.expect("toggle");
    wait_for(&mut rx, |e| matches!(e, ChatEvent::ReactionsChanged { .. })).await;
    wait_for(&mut rx, |e| matches!(e, ChatEvent::ReactionsChanged { .. })).await;
    let messages = client.active_messages().await;
    assert!(!messages[0].has_reaction(&UserId::new("u-ari"), "🔥"));
    assert!(messages[0].has_reaction(&UserId::new("u-ari"), "🌮"));
}

#[tokio::test]
async fn double_toggle_returns_reactions_to_baseline() {
    let backend = seeded_backend().await;
    let mut seeded = channel_message_from("u-blake", "Blake", "flip flop");
    seeded.id = MessageId::new("m-flip");
    backend.seed_message(seeded).await;

    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open");
    let target = MessageId::new("m-flip");

    client.toggle_reaction(&target, "👀").await.expect("toggle on");
    sleep(Duration::from_millis(100)).await;
    let messages = client.active_messages().await;
    assert!(messages[0].has_reaction(&UserId::new("u-ari"), "👀"));

    client.toggle_reaction(&target, "👀").await.expect("toggle off");
    sleep(Duration::from_millis(100)).await;
    let messages = client.active_messages().await;
    assert!(!messages[0].has_reaction(&UserId::new("u-ari"), "👀"));
    assert!(messages[0].reactions.is_empty());
}

#[tokio::test]
async fn observed_typing_expires_after_silence() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open");

    let mut rx = client.subscribe_events();
    backend
        .publish_typing(&TypingRecord {
            conversation_key: CHANNEL.to_string(),
            user_id: UserId::new("u-blake"),
            user_name: "Blake".into(),
            updated_at: Utc::now(),
        })
        .await
        .expect("publish");

    let changed = wait_for(&mut rx, |e| matches!(e, ChatEvent::TypingChanged { .. })).await;
    let ChatEvent::TypingChanged { names, .. } = changed else {
        unreachable!()
    };
    assert_eq!(names, vec!["Blake".to_string()]);

    client.sweep(Instant::now() + Duration::from_secs(4)).await;
    let changed = wait_for(&mut rx, |e| matches!(e, ChatEvent::TypingChanged { .. })).await;
    let ChatEvent::TypingChanged { names, .. } = changed else {
        unreachable!()
    };
    assert!(names.is_empty());
    assert!(client.active_typists().await.is_empty());
}

#[tokio::test]
async fn keystrokes_publish_once_per_refresh_window() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open");

    let mut feed = backend
        .subscribe(SubscriptionTopic::TypingSignals)
        .await
        .expect("subscribe");
    client.update_draft("t").await.expect("draft");
    let first = tokio::time::timeout(Duration::from_secs(2), feed.recv())
        .await
        .expect("timed out waiting for typing frame")
        .expect("feed open");
    assert!(matches!(first.payload, ChangePayload::TypingSignals(_)));

    client.update_draft("tw").await.expect("draft");
    client.update_draft("two").await.expect("draft");
    sleep(Duration::from_millis(100)).await;
    assert!(feed.try_recv().is_err(), "debounce window leaked a refresh");
}

#[tokio::test]
async fn sending_clears_draft_and_withdraws_typing() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open");

    client.update_draft("half a tho").await.expect("draft");
    assert_eq!(client.current_draft().await, "half a tho");

    let mut feed = backend
        .subscribe(SubscriptionTopic::TypingSignals)
        .await
        .expect("subscribe");
    send(&client, "half a thought, sent anyway").await;
    assert!(client.current_draft().await.is_empty());

    let stop = loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .expect("timed out waiting for typing stop")
            .expect("feed open");
        if matches!(frame.op, ChangeOp::Delete) {
            break frame;
        }
    };
    assert!(
        matches!(stop.payload, ChangePayload::TypingSignals(t) if t.user_id.as_str() == "u-ari")
    );
}

#[tokio::test]
async fn direct_popup_quick_reply_sends_without_opening() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;

    let mut rx = client.subscribe_events();
    backend
        .insert_message(&direct_message_between("u-blake", "Blake", "u-ari", "lunch?"))
        .await
        .expect("insert");

    let posted = wait_for(&mut rx, |e| matches!(e, ChatEvent::PopupPosted { .. })).await;
    let ChatEvent::PopupPosted { popup } = posted else {
        unreachable!()
    };
    assert!(popup.is_direct);
    assert_eq!(popup.preview, "lunch?");

    client
        .reply_from_popup(popup.id, "give me ten")
        .await
        .expect("quick reply");
    wait_for(
        &mut rx,
        |e| matches!(e, ChatEvent::PopupDismissed { popup_id } if *popup_id == popup.id),
    )
    .await;
    assert!(client.open_reference().await.is_none());
    assert!(client.popups().await.is_empty());

    sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.message_count().await, 2);
    // The counter survives a quick reply; only opening clears it.
    assert_eq!(client.unread_count(&blake_ref()).await, 1);
}

#[tokio::test]
async fn channel_popups_have_no_quick_reply() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;

    let mut rx = client.subscribe_events();
    backend
        .insert_message(&channel_message_from("u-blake", "Blake", "meeting moved"))
        .await
        .expect("insert");
    let posted = wait_for(&mut rx, |e| matches!(e, ChatEvent::PopupPosted { .. })).await;
    let ChatEvent::PopupPosted { popup } = posted else {
        unreachable!()
    };

    let err = client
        .reply_from_popup(popup.id, "nope")
        .await
        .expect_err("group quick reply must fail");
    assert!(err.to_string().contains("direct"));
    // The popup survives a refused quick reply.
    assert_eq!(client.popups().await.len(), 1);
}

#[tokio::test]
async fn channel_mention_fires_a_ping() {
    let backend = seeded_backend().await;
    // Held so the router keeps applying feed events for the session.
    let _client = started_client(&backend).await;

    backend
        .insert_message(&channel_message_from("u-blake", "Blake", "Ari should see this"))
        .await
        .expect("insert");
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if backend.mention_pings().await.len() == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "mention ping never arrived");
        sleep(Duration::from_millis(25)).await;
    }

    // Direct messages never ping, even when the name appears.
    backend
        .insert_message(&direct_message_between("u-blake", "Blake", "u-ari", "Ari Ari Ari"))
        .await
        .expect("insert");
    sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.mention_pings().await.len(), 1);
}

#[tokio::test]
async fn newer_open_supersedes_older_history_load() {
    let backend = seeded_backend().await;
    let mut channel_msg = channel_message_from("u-blake", "Blake", "channel scroll");
    channel_msg.id = MessageId::new("m-chan");
    backend.seed_message(channel_msg).await;
    let mut dm = direct_message_between("u-blake", "Blake", "u-ari", "direct scroll");
    dm.id = MessageId::new("m-dm");
    backend.seed_message(dm).await;

    let client = started_client(&backend).await;
    let channel = channel_ref();
    let direct = blake_ref();
    let (first, second) = tokio::join!(
        client.open_conversation(&channel),
        client.open_conversation(&direct),
    );
    first.expect("first open");
    second.expect("second open");

    // Whatever the interleaving, the later open owns the view.
    assert_eq!(client.open_reference().await, Some(blake_ref()));
    let messages = client.active_messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "direct scroll");
}

#[tokio::test]
async fn popups_expire_after_their_lifetime() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;

    let mut rx = client.subscribe_events();
    backend
        .insert_message(&channel_message_from("u-blake", "Blake", "ephemeral"))
        .await
        .expect("insert");
    let posted = wait_for(&mut rx, |e| matches!(e, ChatEvent::PopupPosted { .. })).await;
    let ChatEvent::PopupPosted { popup } = posted else {
        unreachable!()
    };

    client.sweep(Instant::now() + Duration::from_secs(9)).await;
    wait_for(
        &mut rx,
        |e| matches!(e, ChatEvent::PopupDismissed { popup_id } if *popup_id == popup.id),
    )
    .await;
    assert!(client.popups().await.is_empty());
}

#[tokio::test]
async fn channel_deletes_are_hard_and_direct_deletes_soft() {
    let backend = seeded_backend().await;
    let client = started_client(&backend).await;

    client.open_conversation(&channel_ref()).await.expect("open channel");
    let mut rx = client.subscribe_events();
    let token = send(&client, "disappear me").await;
    let confirmed = wait_for(
        &mut rx,
        |e| matches!(e, ChatEvent::MessageConfirmed { token: t, .. } if *t == token),
    )
    .await;
    let ChatEvent::MessageConfirmed { id, .. } = confirmed else {
        unreachable!()
    };
    client.delete_message(&id).await.expect("delete");
    assert!(client.active_messages().await.is_empty());
    assert!(backend.stored_message(&id).await.is_none());

    client.open_conversation(&blake_ref()).await.expect("open dm");
    let token = send(&client, "soft goodbye").await;
    let confirmed = wait_for(
        &mut rx,
        |e| matches!(e, ChatEvent::MessageConfirmed { token: t, .. } if *t == token),
    )
    .await;
    let ChatEvent::MessageConfirmed { id, .. } = confirmed else {
        unreachable!()
    };
    client.delete_message(&id).await.expect("delete");
    assert!(client.active_messages().await.is_empty());
    let stored = backend.stored_message(&id).await.expect("row kept");
    assert!(stored.deleted);
}

#[tokio::test]
async fn other_users_messages_cannot_be_deleted() {
    let backend = seeded_backend().await;
    let mut seeded = channel_message_from("u-blake", "Blake", "hands off");
    seeded.id = MessageId::new("m-thx");
    backend.seed_message(seeded).await;

    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open");

    let err = client
        .delete_message(&MessageId::new("m-thx"))
        .await
        .expect_err("not the author");
    assert!(err.to_string().contains("own messages"));
}

#[tokio::test]
async fn channel_replies_carry_a_snapshot_of_the_quoted_message() {
    let backend = seeded_backend().await;
    let mut quoted = channel_message_from("u-blake", "Blake", "the original claim");
    quoted.id = MessageId::new("m-q");
    backend.seed_message(quoted).await;

    let client = started_client(&backend).await;
    client.open_conversation(&channel_ref()).await.expect("open");

    let mut rx = client.subscribe_events();
    let token = client
        .send_reply("counterpoint", &MessageId::new("m-q"))
        .await
        .expect("reply")
        .expect("message queued");
    let confirmed = wait_for(
        &mut rx,
        |e| matches!(e, ChatEvent::MessageConfirmed { token: t, .. } if *t == token),
    )
    .await;
    let ChatEvent::MessageConfirmed { id, .. } = confirmed else {
        unreachable!()
    };

    let stored = backend.stored_message(&id).await.expect("stored row");
    assert_eq!(stored.reply_to, Some(MessageId::new("m-q")));
    assert_eq!(
        stored.reply_snapshot.as_deref(),
        Some("Blake: the original claim")
    );
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_with_backoff() {
    let attempts = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&attempts);
    let result: Result<u32, StoreError> = with_retry("test_op", move || {
        let counter = Arc::clone(&counter);
        async move {
            let mut n = counter.lock().await;
            *n += 1;
            if *n < 3 {
                Err(StoreError::unavailable(anyhow!("flaky")))
            } else {
                Ok(42)
            }
        }
    })
    .await;

    assert_eq!(result.expect("eventually succeeds"), 42);
    assert_eq!(*attempts.lock().await, 3);
}

#[tokio::test]
async fn rejections_are_never_retried() {
    let attempts = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&attempts);
    let result: Result<u32, StoreError> = with_retry("test_op", move || {
        let counter = Arc::clone(&counter);
        async move {
            *counter.lock().await += 1;
            Err(StoreError::rejected("no"))
        }
    })
    .await;

    assert!(result.is_err());
    assert_eq!(*attempts.lock().await, 1);
}

// Runs on the real clock: a paused clock auto-advances during the blocking
// sqlite open and trips the pool-acquire timeout before the connection lands.
#[tokio::test]
async fn detached_client_reports_missing_backend() {
    let local = Storage::new(&temp_db()).await.expect("open local storage");
    let client = ChatClient::detached(local);
    let err = client
        .start_session(ari())
        .await
        .expect_err("no backend configured");
    assert!(err.to_string().contains("not configured"));
}
