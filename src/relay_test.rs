use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::timeout;

use super::*;
use crate::config::ConnectionConfig;
use crate::connection::ConnectionManager;
use crate::envelope::{PresenceSignal, TypingSignal};
use crate::models::{ChannelType, NewChannel, PresenceStatus};
use crate::store::MemoryStore;
use crate::transport::{Connector, WsConnector};

/// Relay over a store holding one team channel with u1, u2 and u3.
async fn relay() -> (RelayState, String) {
    let store = MemoryStore::new();
    let channel = store
        .create_channel(NewChannel {
            name: "team".into(),
            channel_type: ChannelType::ProjectTeam,
            participant_ids: vec!["u1".into(), "u2".into(), "u3".into()],
            project_id: Some("p1".into()),
        })
        .await
        .expect("create channel");
    (RelayState::new(Arc::new(store)), channel.id)
}

fn chat_message(channel_id: &str, id: &str, sender_id: &str) -> ChatMessage {
    ChatMessage {
        id: id.into(),
        client_id: Some(id.into()),
        content: "hello".into(),
        sender_id: sender_id.into(),
        sender_name: sender_id.to_uppercase(),
        sender_role: "member".into(),
        channel_id: channel_id.into(),
        channel_type: ChannelType::ProjectTeam,
        timestamp: 1,
        status: MessageStatus::Sending,
        read_by: BTreeSet::new(),
        attachments: Vec::new(),
        ack_overdue: false,
    }
}

fn sent(channel_id: &str, id: &str, sender_id: &str) -> String {
    Envelope::new(Payload::MessageSent(chat_message(channel_id, id, sender_id))).encode()
}

fn typing(channel_id: &str, user_id: &str) -> Envelope {
    Envelope::new(Payload::TypingStart(TypingSignal {
        channel_id: channel_id.into(),
        user_id: user_id.into(),
        user_name: user_id.to_uppercase(),
    }))
}

async fn recv(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("relay receive timed out")
        .expect("channel open")
}

// =============================================================================
// dispatch
// =============================================================================

#[tokio::test]
async fn heartbeat_is_echoed_to_sender_only() {
    let (state, _) = relay().await;
    let (ada, _ada_rx) = state.register("u1").await;
    let (_bo, mut bo_rx) = state.register("u2").await;

    let replies = process_inbound_text(&state, ada, "u1", &Envelope::heartbeat().encode()).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind(), EnvelopeKind::Heartbeat);
    assert!(bo_rx.try_recv().is_err());
}

#[tokio::test]
async fn sent_message_reaches_channel_members_only() {
    let (state, channel_id) = relay().await;
    let (ada, mut ada_rx) = state.register("u1").await;
    let (_bo, mut bo_rx) = state.register("u2").await;
    let (_cy, mut cy_rx) = state.register("u3").await;
    let (_outsider, mut outsider_rx) = state.register("u9").await;

    let replies = process_inbound_text(&state, ada, "u1", &sent(&channel_id, "m-1", "u1")).await;

    for rx in [&mut bo_rx, &mut cy_rx] {
        let got = recv(rx).await;
        let Payload::MessageReceived(message) = got.payload else {
            panic!("expected MESSAGE_RECEIVED");
        };
        assert_eq!(message.id, "m-1");
        assert_eq!(message.status, MessageStatus::Sent);
        assert!(message.timestamp > 1, "server clock stamped");
    }
    assert!(ada_rx.try_recv().is_err(), "sender is not echoed");
    assert!(outsider_rx.try_recv().is_err(), "non-member sees nothing");

    assert_eq!(replies.len(), 1);
    let Payload::MessageStatusUpdate(receipt) = &replies[0].payload else {
        panic!("expected receipt");
    };
    assert_eq!((receipt.message_id.as_str(), receipt.status), ("m-1", MessageStatus::Delivered));
}

#[tokio::test]
async fn no_receipt_unless_another_member_was_reached() {
    let (state, channel_id) = relay().await;
    let (ada, _rx) = state.register("u1").await;
    let (_outsider, mut outsider_rx) = state.register("u9").await;
    let (_ada_phone, mut phone_rx) = state.register("u1").await;

    let replies = process_inbound_text(&state, ada, "u1", &sent(&channel_id, "m-1", "u1")).await;
    assert!(replies.is_empty(), "outsiders and our own devices do not count as delivery");
    assert!(outsider_rx.try_recv().is_err());
    assert_eq!(recv(&mut phone_rx).await.kind(), EnvelopeKind::MessageReceived, "own devices stay in sync");
}

#[tokio::test]
async fn spoofed_sender_is_dropped() {
    let (state, channel_id) = relay().await;
    let (ada, _rx) = state.register("u1").await;
    let (_bo, mut bo_rx) = state.register("u2").await;
    assert!(process_inbound_text(&state, ada, "u1", &sent(&channel_id, "m-1", "u3")).await.is_empty());
    assert!(process_inbound_text(&state, ada, "u1", &typing(&channel_id, "u3").encode()).await.is_empty());
    assert!(bo_rx.try_recv().is_err());
}

#[tokio::test]
async fn non_member_cannot_post_into_a_channel() {
    let (state, channel_id) = relay().await;
    let (outsider, _rx) = state.register("u9").await;
    let (_bo, mut bo_rx) = state.register("u2").await;

    assert!(process_inbound_text(&state, outsider, "u9", &sent(&channel_id, "m-1", "u9")).await.is_empty());
    assert!(process_inbound_text(&state, outsider, "u9", &typing(&channel_id, "u9").encode()).await.is_empty());
    assert!(process_inbound_text(&state, outsider, "u9", &sent("no-such-channel", "m-2", "u9")).await.is_empty());
    assert!(bo_rx.try_recv().is_err());
}

#[tokio::test]
async fn channel_frames_are_relayed_unchanged_to_members() {
    let (state, channel_id) = relay().await;
    let (ada, _ada_rx) = state.register("u1").await;
    let (_bo, mut bo_rx) = state.register("u2").await;
    let (_outsider, mut outsider_rx) = state.register("u9").await;

    let receipt = Envelope::new(Payload::MessageStatusUpdate(StatusUpdate {
        channel_id: channel_id.clone(),
        message_id: "m-1".into(),
        status: MessageStatus::Read,
        user_id: Some("u1".into()),
    }));
    for env in [&typing(&channel_id, "u1"), &receipt] {
        assert!(process_inbound_text(&state, ada, "u1", &env.encode()).await.is_empty());
        assert_eq!(&recv(&mut bo_rx).await, env);
    }
    assert!(outsider_rx.try_recv().is_err());
}

#[tokio::test]
async fn presence_is_relayed_to_everyone() {
    let (state, _) = relay().await;
    let (ada, _ada_rx) = state.register("u1").await;
    let (_outsider, mut outsider_rx) = state.register("u9").await;

    let presence = Envelope::new(Payload::PresenceUpdate(PresenceSignal {
        user_id: "u1".into(),
        device_id: "d1".into(),
        status: PresenceStatus::Away,
        timestamp: 42,
    }));
    assert!(process_inbound_text(&state, ada, "u1", &presence.encode()).await.is_empty());
    assert_eq!(recv(&mut outsider_rx).await, presence);
}

#[tokio::test]
async fn malformed_frames_are_dropped() {
    let (state, _) = relay().await;
    let (ada, _ada_rx) = state.register("u1").await;
    let (_bo, mut bo_rx) = state.register("u2").await;
    for junk in ["not json", r#"{"type":"NOPE","timestamp":1,"messageId":"x"}"#] {
        assert!(process_inbound_text(&state, ada, "u1", junk).await.is_empty());
    }
    assert!(bo_rx.try_recv().is_err());
}

#[tokio::test]
async fn unregister_removes_client() {
    let (state, _) = relay().await;
    let (ada, _rx) = state.register("u1").await;
    assert_eq!(state.client_count().await, 1);
    state.unregister(ada).await;
    assert_eq!(state.client_count().await, 0);
}

// =============================================================================
// end to end
// =============================================================================

async fn serve() -> (std::net::SocketAddr, String) {
    let (state, channel_id) = relay().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app(state)).await;
    });
    (addr, channel_id)
}

fn manager(addr: std::net::SocketAddr, user_id: &str) -> ConnectionManager {
    ConnectionManager::new(
        ConnectionConfig {
            url: format!("ws://{addr}/ws?user_id={user_id}"),
            reconnect_interval: Duration::from_millis(100),
            max_reconnect_attempts: 2,
            heartbeat_interval: Duration::from_millis(30_000),
            timeout: Duration::from_millis(2_000),
        },
        Arc::new(WsConnector),
    )
}

#[tokio::test]
async fn managers_exchange_messages_through_the_relay() {
    let (addr, channel_id) = serve().await;
    let (ada, bo) = (manager(addr, "u1"), manager(addr, "u2"));

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let _on_received = bo.on_message(EnvelopeKind::MessageReceived, move |env| {
        if let Payload::MessageReceived(m) = &env.payload {
            sink.lock().expect("lock").push(m.id.clone());
        }
        Ok(())
    });
    let receipts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&receipts);
    let _on_receipt = ada.on_message(EnvelopeKind::MessageStatusUpdate, move |env| {
        if let Payload::MessageStatusUpdate(u) = &env.payload {
            sink.lock().expect("lock").push((u.message_id.clone(), u.status));
        }
        Ok(())
    });

    ada.connect().await.expect("ada connects");
    bo.connect().await.expect("bo connects");
    tokio::time::sleep(Duration::from_millis(50)).await;

    ada.send(Payload::MessageSent(chat_message(&channel_id, "m-1", "u1"))).expect("send");
    for _ in 0..50 {
        if !receipts.lock().expect("lock").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(*received.lock().expect("lock"), vec!["m-1"]);
    assert_eq!(*receipts.lock().expect("lock"), vec![("m-1".to_owned(), MessageStatus::Delivered)]);

    ada.disconnect();
    bo.disconnect();
}

#[tokio::test]
async fn missing_user_id_is_rejected() {
    let (addr, _) = serve().await;
    let result = WsConnector.open(&format!("ws://{addr}/ws")).await;
    assert!(matches!(result, Err(crate::error::TransportError::Connect(_))));
}
