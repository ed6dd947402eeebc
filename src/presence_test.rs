use std::time::Duration;

use super::*;
use crate::config::ConnectionConfig;
use crate::envelope::Envelope;
use crate::store::MemoryStore;
use crate::transport::test_helpers::{MockConnector, MockPeer};

struct Fixture {
    presence: PresenceTracker,
    store: MemoryStore,
    connector: MockConnector,
    peer: Option<MockPeer>,
}

async fn fixture(connected: bool) -> Fixture {
    let store = MemoryStore::new();
    let connector = MockConnector::new();
    let manager = ConnectionManager::new(
        ConnectionConfig {
            url: "ws://mock/ws".into(),
            reconnect_interval: Duration::from_millis(1_000),
            max_reconnect_attempts: 3,
            heartbeat_interval: Duration::from_millis(30_000),
            timeout: Duration::from_millis(2_000),
        },
        Arc::new(connector.clone()),
    );
    let identity = Identity {
        user_id: "u1".into(),
        user_name: "Ada".into(),
        role: "member".into(),
        device_id: "laptop".into(),
    };
    let presence = PresenceTracker::new(identity, manager.clone(), Arc::new(store.clone()));
    let peer = if connected {
        manager.connect().await.expect("connect");
        connector.take_peer()
    } else {
        None
    };
    Fixture { presence, store, connector, peer }
}

fn update(user_id: &str, device_id: &str, status: PresenceStatus, timestamp: i64) -> Envelope {
    Envelope::new(Payload::PresenceUpdate(PresenceSignal {
        user_id: user_id.into(),
        device_id: device_id.into(),
        status,
        timestamp,
    }))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn later_timestamp_wins_regardless_of_arrival_order() {
    let fx = fixture(true).await;
    let peer = fx.peer.as_ref().expect("peer");
    peer.push(&update("u2", "phone", PresenceStatus::Offline, 2_000));
    peer.push(&update("u2", "phone", PresenceStatus::Online, 1_000));
    settle().await;

    let devices = fx.presence.get_device_presences("u2");
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].status, PresenceStatus::Offline);
    assert_eq!(devices[0].last_seen, 2_000);
}

#[tokio::test(start_paused = true)]
async fn user_presence_is_most_available_device() {
    let fx = fixture(true).await;
    let peer = fx.peer.as_ref().expect("peer");
    peer.push(&update("u2", "phone", PresenceStatus::Online, 1_000));
    peer.push(&update("u2", "laptop", PresenceStatus::Offline, 2_000));
    peer.push(&update("u3", "laptop", PresenceStatus::Away, 1_500));
    settle().await;

    let u2 = fx.presence.get_user_presence("u2").expect("u2 known");
    assert_eq!(u2.status, PresenceStatus::Online);
    assert_eq!(u2.last_seen, 2_000);
    assert_eq!(u2.device_count, 2);

    let all: Vec<(String, PresenceStatus)> =
        fx.presence.get_all_presences().into_iter().map(|p| (p.user_id, p.status)).collect();
    assert_eq!(all, vec![("u2".into(), PresenceStatus::Online), ("u3".into(), PresenceStatus::Away)]);
    assert_eq!(fx.presence.get_user_presence("u9"), None);
}

#[tokio::test(start_paused = true)]
async fn stale_updates_emit_no_event() {
    let fx = fixture(true).await;
    let mut events = fx.presence.events();
    let peer = fx.peer.as_ref().expect("peer");
    peer.push(&update("u2", "phone", PresenceStatus::Busy, 5_000));
    peer.push(&update("u2", "phone", PresenceStatus::Online, 4_000));
    settle().await;

    assert_eq!(events.try_recv().map(|e| e.presence.status), Ok(PresenceStatus::Busy));
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn update_presence_publishes_and_persists() {
    let mut fx = fixture(true).await;
    fx.presence.update_presence(PresenceStatus::Away).await.expect("update");

    let peer = fx.peer.as_mut().expect("peer");
    let sent = peer.next_envelope().await.expect("presence frame");
    let Payload::PresenceUpdate(signal) = sent.payload else {
        panic!("expected PRESENCE_UPDATE");
    };
    assert_eq!((signal.user_id.as_str(), signal.device_id.as_str()), ("u1", "laptop"));
    assert_eq!(signal.status, PresenceStatus::Away);

    assert_eq!(fx.store.presence("u1", "laptop").map(|p| p.status), Some(PresenceStatus::Away));
    assert_eq!(fx.presence.get_user_presence("u1").map(|p| p.status), Some(PresenceStatus::Away));
}

#[tokio::test(start_paused = true)]
async fn update_presence_while_disconnected_still_persists() {
    let fx = fixture(false).await;
    fx.presence.update_presence(PresenceStatus::Online).await.expect("update");
    assert_eq!(fx.store.presence("u1", "laptop").map(|p| p.status), Some(PresenceStatus::Online));
}

#[tokio::test(start_paused = true)]
async fn own_status_is_reannounced_after_reconnect() {
    let mut fx = fixture(true).await;
    fx.presence.update_presence(PresenceStatus::Busy).await.expect("update");
    let mut peer = fx.peer.take().expect("peer");
    assert!(peer.next_envelope().await.is_some());

    peer.close(Some(1006));
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let mut reopened = fx.connector.take_peer().expect("reconnected");
    let again = reopened.next_envelope().await.expect("re-announce");
    assert!(matches!(
        again.payload,
        Payload::PresenceUpdate(PresenceSignal { status: PresenceStatus::Busy, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn store_failure_is_reported_but_local_view_updates() {
    let fx = fixture(false).await;
    fx.store.set_unavailable(true);
    let err = fx.presence.update_presence(PresenceStatus::Online).await.err();
    assert!(matches!(err, Some(ChatError::Store(_))));
    assert_eq!(fx.presence.get_device_presences("u1").len(), 1);
}
