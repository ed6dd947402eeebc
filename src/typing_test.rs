use std::time::Duration;

use super::*;
use crate::config::ConnectionConfig;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::models::{ChannelType, NewChannel};
use crate::store::MemoryStore;
use crate::transport::test_helpers::{MockConnector, MockPeer};

const TTL: Duration = Duration::from_millis(5_000);
const IDLE: Duration = Duration::from_millis(3_000);
const RENEW: Duration = Duration::from_millis(2_500);

struct Fixture {
    typing: TypingIndicatorAggregator,
    store: MemoryStore,
    connector: MockConnector,
    peer: Option<MockPeer>,
    channel_id: String,
}

async fn team_channel(store: &MemoryStore) -> String {
    store
        .create_channel(NewChannel {
            name: "c1".into(),
            channel_type: ChannelType::ProjectTeam,
            participant_ids: vec!["u1".into(), "u2".into()],
            project_id: None,
        })
        .await
        .expect("create channel")
        .id
}

async fn aggregator(
    user_id: &str,
    user_name: &str,
    store: &MemoryStore,
    connected: bool,
) -> (TypingIndicatorAggregator, MockConnector, Option<MockPeer>) {
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
        user_id: user_id.into(),
        user_name: user_name.into(),
        role: "member".into(),
        device_id: "d1".into(),
    };
    let typing = TypingIndicatorAggregator::new(
        identity,
        TypingConfig { ttl: TTL, idle_timeout: IDLE, renew_interval: RENEW },
        manager.clone(),
        Arc::new(store.clone()),
    );

    let peer = if connected {
        manager.connect().await.expect("connect");
        connector.take_peer()
    } else {
        None
    };
    (typing, connector, peer)
}

async fn fixture(connected: bool) -> Fixture {
    let store = MemoryStore::new();
    let channel_id = team_channel(&store).await;
    let (typing, connector, peer) = aggregator("u1", "Ada", &store, connected).await;
    Fixture { typing, store, connector, peer, channel_id }
}

/// Frames the client has written so far, without waiting for more.
fn written(peer: &mut MockPeer) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(frame) = peer.from_client.try_recv() {
        if let crate::transport::Outbound::Text(text) = frame {
            if let Ok(env) = Envelope::decode(&text) {
                if env.kind() != EnvelopeKind::Heartbeat {
                    out.push(env);
                }
            }
        }
    }
    out
}

fn signal(channel_id: &str, user_id: &str) -> TypingSignal {
    TypingSignal { channel_id: channel_id.into(), user_id: user_id.into(), user_name: user_id.to_uppercase() }
}

fn start(channel_id: &str, user_id: &str) -> Envelope {
    Envelope::new(Payload::TypingStart(signal(channel_id, user_id)))
}

fn stop(channel_id: &str, user_id: &str) -> Envelope {
    Envelope::new(Payload::TypingStop(signal(channel_id, user_id)))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

fn typing_ids(fx: &Fixture) -> Vec<String> {
    fx.typing.typing_users(&fx.channel_id).into_iter().map(|t| t.user_id).collect()
}

// =============================================================================
// remote indicators
// =============================================================================

#[tokio::test(start_paused = true)]
async fn repeated_start_renews_ttl() {
    let fx = fixture(true).await;
    let peer = fx.peer.as_ref().expect("peer");

    peer.push(&start(&fx.channel_id, "u2"));
    settle().await;
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    peer.push(&start(&fx.channel_id, "u2"));
    settle().await;
    assert_eq!(typing_ids(&fx), vec!["u2"]);

    tokio::time::sleep(Duration::from_millis(4_000)).await;
    assert_eq!(typing_ids(&fx), vec!["u2"], "still present 4s after the second START");

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert!(typing_ids(&fx).is_empty(), "gone 6s after the second START");
}

#[tokio::test(start_paused = true)]
async fn start_without_stop_expires_after_ttl() {
    let fx = fixture(true).await;
    let mut events = fx.typing.events();
    fx.peer.as_ref().expect("peer").push(&start(&fx.channel_id, "u2"));
    settle().await;

    let first = events.try_recv().expect("start event");
    assert_eq!(first.users.len(), 1);

    tokio::time::sleep(TTL).await;
    assert!(typing_ids(&fx).is_empty());
    let expired = events.try_recv().expect("expiry event");
    assert_eq!(expired.channel_id, fx.channel_id);
    assert!(expired.users.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_removes_immediately() {
    let fx = fixture(true).await;
    let peer = fx.peer.as_ref().expect("peer");
    peer.push(&start(&fx.channel_id, "u2"));
    peer.push(&start(&fx.channel_id, "u3"));
    peer.push(&stop(&fx.channel_id, "u2"));
    settle().await;
    assert_eq!(typing_ids(&fx), vec!["u3"]);
}

#[tokio::test(start_paused = true)]
async fn own_frames_are_ignored() {
    let fx = fixture(true).await;
    fx.peer.as_ref().expect("peer").push(&start(&fx.channel_id, "u1"));
    settle().await;
    assert!(typing_ids(&fx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn snapshot_rows_join_the_ttl_map() {
    let fx = fixture(false).await;
    let row = |user_id: &str, timestamp: i64| TypingIndicator {
        user_id: user_id.into(),
        user_name: user_id.to_uppercase(),
        channel_id: fx.channel_id.clone(),
        timestamp,
        is_typing: true,
    };
    fx.typing
        .apply_snapshot(&fx.channel_id, vec![row("u1", now_ms()), row("u2", now_ms()), row("u3", 0)]);
    assert_eq!(typing_ids(&fx), vec!["u2"]);

    tokio::time::sleep(TTL + Duration::from_millis(10)).await;
    assert!(typing_ids(&fx).is_empty());
}

// =============================================================================
// own indicator
// =============================================================================

#[tokio::test(start_paused = true)]
async fn own_start_is_sent_once_and_withdrawn_when_idle() {
    let mut fx = fixture(true).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _feed = fx
        .store
        .subscribe_to_typing(&fx.channel_id, Arc::new(move |rows: Vec<TypingIndicator>| lock(&sink).push(rows.len())))
        .await
        .expect("typing feed");

    fx.typing.set_typing(&fx.channel_id, true).await.expect("start");
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    fx.typing.set_typing(&fx.channel_id, true).await.expect("reassert");
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert!(fx.typing.is_typing(&fx.channel_id), "reassertion re-armed the idle timer");

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(!fx.typing.is_typing(&fx.channel_id));

    let peer = fx.peer.as_mut().expect("peer");
    let kinds: Vec<EnvelopeKind> = [peer.next_envelope().await, peer.next_envelope().await]
        .into_iter()
        .flatten()
        .map(|e| e.kind())
        .collect();
    assert_eq!(kinds, vec![EnvelopeKind::TypingStart, EnvelopeKind::TypingStop]);
    assert!(peer.next_envelope().await.is_none());
    assert_eq!(*lock(&seen), vec![1, 0]);
}

#[tokio::test(start_paused = true)]
async fn stop_without_start_is_a_no_op() {
    let mut fx = fixture(true).await;
    fx.typing.set_typing(&fx.channel_id, false).await.expect("stop");
    assert!(fx.peer.as_mut().expect("peer").next_envelope().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn typing_while_disconnected_still_reaches_the_store() {
    let fx = fixture(false).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _feed = fx
        .store
        .subscribe_to_typing(&fx.channel_id, Arc::new(move |rows: Vec<TypingIndicator>| lock(&sink).push(rows.len())))
        .await
        .expect("typing feed");

    fx.typing.set_typing(&fx.channel_id, true).await.expect("start");
    assert_eq!(*lock(&seen), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn store_failure_is_reported() {
    let fx = fixture(false).await;
    fx.store.set_unavailable(true);
    let err = fx.typing.set_typing(&fx.channel_id, true).await.err();
    assert!(matches!(err, Some(ChatError::Store(_))));
}

#[tokio::test(start_paused = true)]
async fn shutdown_withdraws_and_clears() {
    let mut fx = fixture(true).await;
    fx.typing.set_typing(&fx.channel_id, true).await.expect("start");
    fx.peer.as_ref().expect("peer").push(&start(&fx.channel_id, "u2"));
    settle().await;

    fx.typing.shutdown();
    assert!(typing_ids(&fx).is_empty());
    assert!(!fx.typing.is_typing(&fx.channel_id));

    let peer = fx.peer.as_mut().expect("peer");
    assert_eq!(peer.next_envelope().await.map(|e| e.kind()), Some(EnvelopeKind::TypingStart));
    assert_eq!(peer.next_envelope().await.map(|e| e.kind()), Some(EnvelopeKind::TypingStop));

    peer.push(&start(&fx.channel_id, "u3"));
    settle().await;
    assert!(typing_ids(&fx).is_empty(), "detached from the transport");
}

#[tokio::test(start_paused = true)]
async fn continuous_typing_renews_start_before_peers_expire_it() {
    let store = MemoryStore::new();
    let channel_id = team_channel(&store).await;
    let (ada, _c1, ada_peer) = aggregator("u1", "Ada", &store, true).await;
    let (bo, _c2, bo_peer) = aggregator("u2", "Bo", &store, true).await;
    let (mut ada_peer, bo_peer) = (ada_peer.expect("ada peer"), bo_peer.expect("bo peer"));

    let mut starts = 0;
    for second in 0..10 {
        ada.set_typing(&channel_id, true).await.expect("typing");
        for env in written(&mut ada_peer) {
            if env.kind() == EnvelopeKind::TypingStart {
                starts += 1;
            }
            bo_peer.push(&env);
        }
        settle().await;
        let seen: Vec<String> = bo.typing_users(&channel_id).into_iter().map(|t| t.user_id).collect();
        assert_eq!(seen, vec!["u1"], "bo lost ada after {second}s of continuous typing");
        tokio::time::sleep(Duration::from_millis(1_000)).await;
    }
    assert!(starts > 1, "START renewed while typing, got {starts}");
    assert!(starts <= 5, "renewals are throttled, got {starts}");
}

#[tokio::test(start_paused = true)]
async fn start_is_resent_after_reconnect() {
    let mut fx = fixture(true).await;
    fx.typing.set_typing(&fx.channel_id, true).await.expect("typing");
    let mut peer = fx.peer.take().expect("peer");
    assert_eq!(peer.next_envelope().await.map(|e| e.kind()), Some(EnvelopeKind::TypingStart));

    peer.close(Some(1006));
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let mut reopened = fx.connector.take_peer().expect("reconnected");
    let again = reopened.next_envelope().await.expect("start re-sent");
    assert!(matches!(again.payload, Payload::TypingStart(ref s) if s.channel_id == fx.channel_id));
}
