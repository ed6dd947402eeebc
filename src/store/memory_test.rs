use std::sync::Mutex;

use super::*;
use crate::models::ChannelType;

async fn store_with_channel() -> (MemoryStore, Channel) {
    let store = MemoryStore::new();
    let channel = store
        .create_channel(NewChannel {
            name: "general".into(),
            channel_type: ChannelType::ProjectGeneral,
            participant_ids: vec!["u1".into(), "u2".into()],
            project_id: Some("p1".into()),
        })
        .await
        .expect("create");
    (store, channel)
}

fn outgoing(channel_id: &str, client_id: &str, sender: &str, content: &str) -> OutgoingMessage {
    OutgoingMessage {
        channel_id: channel_id.into(),
        client_id: client_id.into(),
        content: content.into(),
        sender_id: sender.into(),
        sender_name: sender.to_uppercase(),
        sender_role: "member".into(),
        channel_type: ChannelType::ProjectGeneral,
        attachments: Vec::new(),
    }
}

// =============================================================================
// channels
// =============================================================================

#[tokio::test]
async fn user_channels_only_include_memberships() {
    let (store, channel) = store_with_channel().await;
    assert_eq!(store.get_user_channels("u1").await.expect("list"), vec![channel.clone()]);
    assert!(store.get_user_channels("u9").await.expect("list").is_empty());
    assert_eq!(store.get_channel(&channel.id).await.expect("get"), channel);
}

#[tokio::test]
async fn unknown_channel_is_not_found() {
    let store = MemoryStore::new();
    let err = store.get_channel("nope").await.expect_err("missing");
    assert!(matches!(err, StoreError::NotFound(_)));
}

// =============================================================================
// messages
// =============================================================================

#[tokio::test]
async fn send_assigns_increasing_timestamps_and_updates_channel() {
    let (store, channel) = store_with_channel().await;
    let a = store.send_message(outgoing(&channel.id, "c-a", "u1", "one")).await.expect("a");
    let b = store.send_message(outgoing(&channel.id, "c-b", "u1", "two")).await.expect("b");
    assert!(b.timestamp > a.timestamp);

    let refreshed = store.get_channel(&channel.id).await.expect("get");
    assert_eq!(refreshed.unread_for("u2"), 2);
    assert_eq!(refreshed.unread_for("u1"), 0);
    assert_eq!(refreshed.last_message.map(|m| m.content), Some("two".to_owned()));
}

#[tokio::test]
async fn send_is_idempotent_on_client_id() {
    let (store, channel) = store_with_channel().await;
    let first = store.send_message(outgoing(&channel.id, "c-1", "u1", "hi")).await.expect("first");
    let again = store.send_message(outgoing(&channel.id, "c-1", "u1", "hi")).await.expect("again");
    assert_eq!(first, again);
    assert_eq!(store.stored_messages(&channel.id).len(), 1);
}

#[tokio::test]
async fn non_member_send_is_denied() {
    let (store, channel) = store_with_channel().await;
    let err = store
        .send_message(outgoing(&channel.id, "c-1", "intruder", "hi"))
        .await
        .expect_err("denied");
    assert!(matches!(err, StoreError::PermissionDenied(_)));
}

#[tokio::test]
async fn pages_walk_backwards_with_cursor() {
    let (store, channel) = store_with_channel().await;
    for i in 0..5 {
        store
            .send_message(outgoing(&channel.id, &format!("c-{i}"), "u1", &format!("m{i}")))
            .await
            .expect("send");
    }

    let newest = store.load_messages(&channel.id, &Pagination::latest(2)).await.expect("page 1");
    let contents: Vec<_> = newest.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m3", "m4"]);

    let older = store
        .load_messages(&channel.id, &Pagination { limit: 2, before: newest.next_cursor.clone() })
        .await
        .expect("page 2");
    let contents: Vec<_> = older.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m1", "m2"]);

    let oldest = store
        .load_messages(&channel.id, &Pagination { limit: 2, before: older.next_cursor.clone() })
        .await
        .expect("page 3");
    assert_eq!(oldest.messages.len(), 1);
    assert_eq!(oldest.next_cursor, None);
}

#[tokio::test]
async fn mark_read_is_idempotent_and_clears_unread() {
    let (store, channel) = store_with_channel().await;
    let ack = store.send_message(outgoing(&channel.id, "c-1", "u1", "hi")).await.expect("send");

    store.mark_message_as_read(&channel.id, &ack.id, "u2").await.expect("read");
    store.mark_message_as_read(&channel.id, &ack.id, "u2").await.expect("read again");

    let stored = store.stored_messages(&channel.id);
    assert_eq!(stored[0].read_by.iter().filter(|u| *u == "u2").count(), 1);
    assert_eq!(stored[0].status, MessageStatus::Read);
    assert_eq!(store.get_channel(&channel.id).await.expect("get").unread_for("u2"), 0);
}

// =============================================================================
// feeds
// =============================================================================

#[tokio::test]
async fn message_feed_delivers_until_dropped() {
    let (store, channel) = store_with_channel().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = store
        .subscribe_to_messages(&channel.id, Arc::new(move |m: Message| sink.lock().expect("lock").push(m.content)))
        .await
        .expect("subscribe");
    assert_eq!(store.message_feed_count(&channel.id), 1);

    store.send_message(outgoing(&channel.id, "c-1", "u2", "live")).await.expect("send");
    handle.unsubscribe();
    store.send_message(outgoing(&channel.id, "c-2", "u2", "after")).await.expect("send");

    assert_eq!(*seen.lock().expect("lock"), vec!["live"]);
    assert_eq!(store.message_feed_count(&channel.id), 0);
}

#[tokio::test]
async fn typing_feed_reports_full_list() {
    let (store, channel) = store_with_channel().await;
    let lists = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lists);
    let _handle = store
        .subscribe_to_typing(
            &channel.id,
            Arc::new(move |rows: Vec<TypingIndicator>| {
                sink.lock().expect("lock").push(rows.into_iter().map(|r| r.user_id).collect::<Vec<_>>());
            }),
        )
        .await
        .expect("subscribe");

    store.set_typing_indicator(&channel.id, "u1", "Ada", true).await.expect("start");
    store.set_typing_indicator(&channel.id, "u2", "Bo", true).await.expect("start");
    store.set_typing_indicator(&channel.id, "u1", "Ada", false).await.expect("stop");

    assert_eq!(
        *lists.lock().expect("lock"),
        vec![vec!["u1".to_owned()], vec!["u1".to_owned(), "u2".to_owned()], vec!["u2".to_owned()]]
    );
}

// =============================================================================
// failure switches
// =============================================================================

#[tokio::test]
async fn unavailable_mode_fails_every_call() {
    let (store, channel) = store_with_channel().await;
    store.set_unavailable(true);
    let err = store.send_message(outgoing(&channel.id, "c-1", "u1", "hi")).await.expect_err("offline");
    assert!(matches!(err, StoreError::Unavailable(_)));
    assert!(store.update_presence("u1", PresenceStatus::Online, "d1").await.is_err());

    store.set_unavailable(false);
    assert!(store.send_message(outgoing(&channel.id, "c-1", "u1", "hi")).await.is_ok());
}

#[tokio::test]
async fn denied_channel_is_hidden_and_refused() {
    let (store, channel) = store_with_channel().await;
    store.deny_channel(&channel.id);
    assert!(store.get_user_channels("u1").await.expect("list").is_empty());
    let err = store.load_messages(&channel.id, &Pagination::latest(10)).await.expect_err("denied");
    assert!(matches!(err, StoreError::PermissionDenied(_)));
}

#[tokio::test]
async fn presence_is_keyed_by_user_and_device() {
    let store = MemoryStore::new();
    store.update_presence("u1", PresenceStatus::Online, "phone").await.expect("phone");
    store.update_presence("u1", PresenceStatus::Away, "laptop").await.expect("laptop");
    assert_eq!(store.presence("u1", "phone").map(|p| p.status), Some(PresenceStatus::Online));
    assert_eq!(store.presence("u1", "laptop").map(|p| p.status), Some(PresenceStatus::Away));
}
