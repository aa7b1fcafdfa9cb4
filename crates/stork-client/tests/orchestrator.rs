//! Orchestrator integration tests against a real relay and in-memory
//! direct channels.

mod common;

use std::sync::Arc;
use std::time::Duration;

use stork_client::{
    ClientError, Delivery, DirBroadcastStore, MemoryBroadcastStore, OrchestratorEvent, RelayStatus,
};
use stork_shared::constants::{DIRECT_FRAME_CEILING, MAX_GROUP_PARTICIPANTS};
use stork_shared::{ConversationId, GroupRosterUpdate, Participant, PeerId, TransportTier};

use common::*;

fn no_broadcast() -> Arc<MemoryBroadcastStore> {
    Arc::new(MemoryBroadcastStore::new())
}

#[tokio::test]
async fn test_relayed_delivery_end_to_end() {
    init_test_logging();
    let relay = spawn_relay().await;
    let connector = MemoryConnector::silent();

    let mut abc = spawn_peer(
        "peer_abc",
        test_config(Some(relay.clone())),
        &connector,
        no_broadcast(),
    );
    let mut xyz = spawn_peer("peer_xyz", test_config(Some(relay)), &connector, no_broadcast());
    abc.expect_online().await;
    xyz.expect_online().await;

    let envelope = text_envelope("m1", "c1", &abc.id, "hi");
    let delivery = abc.handle.send(xyz.id.clone(), envelope).await.unwrap();
    assert_eq!(delivery, Delivery::Delivered(TransportTier::Relayed));

    let (conversation, received, tier) = xyz.expect_message().await;
    assert_eq!(conversation, ConversationId::new("c1"));
    assert_eq!(received.id, "m1");
    assert_eq!(received.sender, abc.id);
    assert_eq!(received.body.text.as_deref(), Some("hi"));
    assert_eq!(tier, TransportTier::Relayed);

    xyz.assert_quiet(is_message).await;

    let records = abc.handle.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tier, TransportTier::Relayed);
}

#[tokio::test]
async fn test_concurrent_connect_creates_one_record() {
    let connector = MemoryConnector::new();
    let mut peer = spawn_peer("peer_abc", test_config(None), &connector, no_broadcast());
    peer.expect(|e| matches!(e, OrchestratorEvent::RelayStatus(RelayStatus::Offline)))
        .await;

    let remote = PeerId::new("peer_xyz");
    let conversation = ConversationId::new("c1");
    let (first, second) = tokio::join!(
        peer.handle.connect(remote.clone(), conversation.clone()),
        peer.handle.connect(remote.clone(), conversation.clone()),
    );
    first.unwrap();
    second.unwrap();

    let records = peer.handle.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tier, TransportTier::Relayed);
    assert!(records[0].connected);

    let event = peer
        .expect(|e| matches!(e, OrchestratorEvent::Connected { .. }))
        .await;
    assert_eq!(
        event,
        OrchestratorEvent::Connected {
            remote,
            conversation_id: conversation,
            tier: TransportTier::Relayed,
        }
    );
    peer.assert_quiet(|e| matches!(e, OrchestratorEvent::Connected { .. }))
        .await;
}

#[tokio::test]
async fn test_direct_channel_carries_small_frames_and_oversized_falls_back() {
    let relay = spawn_relay().await;
    let connector = MemoryConnector::new();

    let mut a = spawn_peer("peer_a", test_config(Some(relay.clone())), &connector, no_broadcast());
    let mut b = spawn_peer("peer_b", test_config(Some(relay)), &connector, no_broadcast());
    a.expect_online().await;
    b.expect_online().await;

    a.handle
        .connect(b.id.clone(), ConversationId::new("c1"))
        .await
        .unwrap();

    let direct = |e: &OrchestratorEvent| {
        matches!(e, OrchestratorEvent::Connected { tier: TransportTier::Direct, .. })
    };
    a.expect(direct).await;
    b.expect(direct).await;

    let small = text_envelope("m1", "c1", &a.id, "over the channel");
    let delivery = a.handle.send(b.id.clone(), small).await.unwrap();
    assert_eq!(delivery, Delivery::Delivered(TransportTier::Direct));
    assert_eq!(connector.frames_sent(), 1);

    let (_, received, tier) = b.expect_message().await;
    assert_eq!(received.id, "m1");
    assert_eq!(tier, TransportTier::Direct);

    let big_text = "x".repeat(DIRECT_FRAME_CEILING + 1);
    let big = text_envelope("m2", "c1", &a.id, &big_text);
    let delivery = a.handle.send(b.id.clone(), big).await.unwrap();
    assert_eq!(delivery, Delivery::Delivered(TransportTier::Relayed));
    assert_eq!(connector.frames_sent(), 1);

    let (_, received, tier) = b.expect_message().await;
    assert_eq!(received.id, "m2");
    assert_eq!(received.body.text.map(|t| t.len()), Some(DIRECT_FRAME_CEILING + 1));
    assert_eq!(tier, TransportTier::Relayed);

    let records = a.handle.records().await.unwrap();
    assert_eq!(records[0].tier, TransportTier::Direct);
}

#[tokio::test]
async fn test_negotiation_timeout_discards_record() {
    let relay = spawn_relay().await;
    let connector = MemoryConnector::silent();
    let config = |relay: &str| stork_client::ClientConfig {
        negotiation_timeout: Duration::from_millis(150),
        ..test_config(Some(relay.to_string()))
    };

    let mut a = spawn_peer("peer_a", config(&relay), &connector, no_broadcast());
    let mut b = spawn_peer("peer_b", config(&relay), &connector, no_broadcast());
    a.expect_online().await;
    b.expect_online().await;

    a.handle
        .connect(b.id.clone(), ConversationId::new("c1"))
        .await
        .unwrap();
    let records = a.handle.records().await.unwrap();
    assert_eq!(records[0].tier, TransportTier::Negotiating);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(a.handle.records().await.unwrap().is_empty());

    let delivery = a
        .handle
        .send(b.id.clone(), text_envelope("m1", "c1", &a.id, "after timeout"))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Delivered(TransportTier::Relayed));
    let records = a.handle.records().await.unwrap();
    assert_eq!(records[0].tier, TransportTier::Relayed);

    let (_, received, _) = b.expect_message().await;
    assert_eq!(received.id, "m1");
}

#[tokio::test]
async fn test_send_group_skips_self() {
    let relay = spawn_relay().await;
    let connector = MemoryConnector::silent();

    let mut a = spawn_peer("peer_a", test_config(Some(relay.clone())), &connector, no_broadcast());
    let mut b = spawn_peer("peer_b", test_config(Some(relay.clone())), &connector, no_broadcast());
    let mut c = spawn_peer("peer_c", test_config(Some(relay)), &connector, no_broadcast());
    a.expect_online().await;
    b.expect_online().await;
    c.expect_online().await;

    let participants = vec![
        Participant::new(a.id.clone()),
        Participant::new(b.id.clone()),
        Participant::new(c.id.clone()),
    ];
    let outcomes = a
        .handle
        .send_group(
            ConversationId::new("g1"),
            participants,
            text_envelope("g-m1", "g1", &a.id, "hello group"),
        )
        .await
        .unwrap();

    let targets: Vec<_> = outcomes.iter().map(|(peer, _)| peer.clone()).collect();
    assert_eq!(targets, vec![b.id.clone(), c.id.clone()]);
    assert!(outcomes.iter().all(|(_, d)| *d == Delivery::Delivered(TransportTier::Relayed)));

    for peer in [&mut b, &mut c] {
        let (conversation, received, _) = peer.expect_message().await;
        assert_eq!(conversation, ConversationId::new("g1"));
        assert!(received.is_group);
        peer.assert_quiet(is_message).await;
    }
    a.assert_quiet(is_message).await;
    assert!(a
        .handle
        .records()
        .await
        .unwrap()
        .iter()
        .all(|record| record.is_group));
}

#[tokio::test]
async fn test_oversized_group_is_rejected() {
    let connector = MemoryConnector::new();
    let peer = spawn_peer("peer_a", test_config(None), &connector, no_broadcast());

    let participants: Vec<_> = (0..=MAX_GROUP_PARTICIPANTS)
        .map(|i| Participant::new(PeerId::new(format!("peer_{i}"))))
        .collect();
    let err = peer
        .handle
        .send_group(
            ConversationId::new("g1"),
            participants,
            text_envelope("m1", "g1", &peer.id, "too many"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::GroupTooLarge { count: 101, max: 100 }));
}

#[tokio::test]
async fn test_group_connect_negotiates_with_each_member() {
    let relay = spawn_relay().await;
    let connector = MemoryConnector::new();

    let mut a = spawn_peer("peer_a", test_config(Some(relay.clone())), &connector, no_broadcast());
    let mut b = spawn_peer("peer_b", test_config(Some(relay.clone())), &connector, no_broadcast());
    let mut c = spawn_peer("peer_c", test_config(Some(relay)), &connector, no_broadcast());
    a.expect_online().await;
    b.expect_online().await;
    c.expect_online().await;

    let members = vec![
        Participant::new(a.id.clone()),
        Participant::new(b.id.clone()),
        Participant::new(c.id.clone()),
    ];
    a.handle
        .connect_group(ConversationId::new("g1"), members)
        .await
        .unwrap();

    for peer in [&mut b, &mut c] {
        let event = peer
            .expect(|e| matches!(e, OrchestratorEvent::Connected { .. }))
            .await;
        match event {
            OrchestratorEvent::Connected { tier, remote, .. } => {
                assert_eq!(tier, TransportTier::Direct);
                assert_eq!(remote.as_str(), "peer_a");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    let records = a.handle.records().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.is_group));
}

#[tokio::test]
async fn test_roster_and_avatar_updates_are_forwarded() {
    let relay = spawn_relay().await;
    let connector = MemoryConnector::silent();

    let mut a = spawn_peer("peer_a", test_config(Some(relay.clone())), &connector, no_broadcast());
    let mut b = spawn_peer("peer_b", test_config(Some(relay)), &connector, no_broadcast());
    a.expect_online().await;
    b.expect_online().await;

    let update = GroupRosterUpdate {
        conversation_id: ConversationId::new("g1"),
        display_name: "Hikers".into(),
        participants: vec![a.id.clone(), b.id.clone()],
        admins: vec![a.id.clone()],
        avatar: None,
    };
    let delivery = a
        .handle
        .send_roster_update(b.id.clone(), update.clone())
        .await
        .unwrap();
    assert!(delivery.is_delivered());
    let event = b
        .expect(|e| matches!(e, OrchestratorEvent::RosterUpdate(_)))
        .await;
    assert_eq!(event, OrchestratorEvent::RosterUpdate(update));

    a.handle
        .send_avatar_update(b.id.clone(), Some("data:image/png;base64,AAAA".into()))
        .await
        .unwrap();
    let event = b
        .expect(|e| matches!(e, OrchestratorEvent::AvatarUpdate { .. }))
        .await;
    assert_eq!(
        event,
        OrchestratorEvent::AvatarUpdate {
            from: Some(a.id.clone()),
            avatar: Some("data:image/png;base64,AAAA".into()),
        }
    );
}

#[tokio::test]
async fn test_exhausted_reconnects_fall_back_to_local_broadcast() {
    // Nothing listens on port 1, so every dial is refused.
    let unreachable = Some("ws://127.0.0.1:1".to_string());
    let connector = MemoryConnector::new();
    let shared = MemoryBroadcastStore::new();

    let mut a = spawn_peer(
        "peer_a",
        test_config(unreachable.clone()),
        &connector,
        Arc::new(shared.clone()),
    );
    let mut b = spawn_peer("peer_b", test_config(unreachable), &connector, Arc::new(shared));

    for attempt in 1..=2 {
        let event = a
            .expect(|e| matches!(e, OrchestratorEvent::RelayStatus(_)))
            .await;
        match event {
            OrchestratorEvent::RelayStatus(RelayStatus::Reconnecting { attempt: n, .. }) => {
                assert_eq!(n, attempt);
            }
            other => panic!("expected a reconnect, got {other:?}"),
        }
    }
    a.expect(|e| matches!(e, OrchestratorEvent::RelayStatus(RelayStatus::Offline)))
        .await;
    a.assert_quiet(|e| matches!(e, OrchestratorEvent::RelayStatus(_)))
        .await;
    assert!(!a.handle.is_relay_online().await.unwrap());

    let delivery = a
        .handle
        .send(b.id.clone(), text_envelope("m1", "c1", &a.id, "same machine"))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Delivered(TransportTier::LocalBroadcast));

    let (conversation, received, tier) = b.expect_message().await;
    assert_eq!(conversation, ConversationId::new("c1"));
    assert_eq!(received.id, "m1");
    assert_eq!(tier, TransportTier::LocalBroadcast);
    b.assert_quiet(is_message).await;

    let records = a.handle.records().await.unwrap();
    assert_eq!(records[0].tier, TransportTier::LocalBroadcast);
}

#[tokio::test]
async fn test_directory_broadcast_store_delivers_between_instances() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let connector = MemoryConnector::new();

    let mut a = spawn_peer(
        "peer_a",
        test_config(None),
        &connector,
        Arc::new(DirBroadcastStore::open(dir.path()).unwrap()),
    );
    let mut b = spawn_peer(
        "peer_b",
        test_config(None),
        &connector,
        Arc::new(DirBroadcastStore::open(dir.path()).unwrap()),
    );
    a.expect(|e| matches!(e, OrchestratorEvent::RelayStatus(RelayStatus::Offline)))
        .await;

    for (id, text) in [("m1", "first"), ("m2", "second")] {
        let delivery = a
            .handle
            .send(b.id.clone(), text_envelope(id, "c1", &a.id, text))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Delivered(TransportTier::LocalBroadcast));
    }

    let mut received = Vec::new();
    for _ in 0..2 {
        let (conversation, envelope, tier) = b.expect_message().await;
        assert_eq!(conversation, ConversationId::new("c1"));
        assert_eq!(tier, TransportTier::LocalBroadcast);
        received.push(envelope.id);
    }
    received.sort();
    assert_eq!(received, ["m1", "m2"]);
    b.assert_quiet(is_message).await;

    // Claimed entries are removed from the shared directory.
    let leftover = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftover, 0);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_connect() {
    let connector = MemoryConnector::new();
    let mut peer = spawn_peer("peer_a", test_config(None), &connector, no_broadcast());

    peer.handle
        .connect(PeerId::new("peer_b"), ConversationId::new("c1"))
        .await
        .unwrap();
    let removed = peer
        .handle
        .disconnect(ConversationId::new("c1"))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(peer.handle.records().await.unwrap().is_empty());

    peer.assert_quiet(|e| matches!(e, OrchestratorEvent::Connected { .. }))
        .await;
}

#[tokio::test]
async fn test_calls_after_teardown_fail() {
    let connector = MemoryConnector::new();
    let peer = spawn_peer("peer_a", test_config(None), &connector, no_broadcast());

    peer.handle.teardown().await.unwrap();
    let err = peer.handle.records().await.unwrap_err();
    assert!(matches!(err, ClientError::Shutdown));
}

#[tokio::test]
async fn test_relay_drop_reconnects_and_registers_again() {
    let (relay, mut registrations) = spawn_dropping_relay().await;
    let connector = MemoryConnector::silent();
    let mut a = spawn_peer("peer_a", test_config(Some(relay)), &connector, no_broadcast());

    a.expect_online().await;
    let event = a
        .expect(|e| matches!(e, OrchestratorEvent::RelayStatus(_)))
        .await;
    assert_eq!(
        event,
        OrchestratorEvent::RelayStatus(RelayStatus::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(20),
        })
    );
    a.expect_online().await;

    assert_eq!(registrations.recv().await, Some(a.id.clone()));
    assert_eq!(registrations.recv().await, Some(a.id.clone()));
    assert!(a.handle.is_relay_online().await.unwrap());
}

#[tokio::test]
async fn test_simultaneous_connects_converge_on_one_direct_channel() {
    let relay = spawn_relay().await;
    let connector = MemoryConnector::new();

    let mut a = spawn_peer("peer_a", test_config(Some(relay.clone())), &connector, no_broadcast());
    let mut b = spawn_peer("peer_b", test_config(Some(relay)), &connector, no_broadcast());
    a.expect_online().await;
    b.expect_online().await;

    let conversation = ConversationId::new("c1");
    let (from_a, from_b) = tokio::join!(
        a.handle.connect(b.id.clone(), conversation.clone()),
        b.handle.connect(a.id.clone(), conversation.clone()),
    );
    from_a.unwrap();
    from_b.unwrap();

    a.expect(is_direct_connected).await;
    b.expect(is_direct_connected).await;

    for peer in [&a, &b] {
        let records = peer.handle.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tier, TransportTier::Direct);
    }

    let delivery = a
        .handle
        .send(b.id.clone(), text_envelope("m1", "c1", &a.id, "after glare"))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Delivered(TransportTier::Direct));
    let (_, received, tier) = b.expect_message().await;
    assert_eq!(received.id, "m1");
    assert_eq!(tier, TransportTier::Direct);
}

#[tokio::test]
async fn test_relayed_record_upgrades_on_remote_offer() {
    let relay = spawn_relay().await;
    let connector = MemoryConnector::new();

    let mut a = spawn_peer("peer_a", test_config(Some(relay.clone())), &connector, no_broadcast());
    let mut b = spawn_peer("peer_b", test_config(Some(relay)), &connector, no_broadcast());
    a.expect_online().await;
    b.expect_online().await;

    let delivery = a
        .handle
        .send(b.id.clone(), text_envelope("m1", "c1", &a.id, "first over relay"))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Delivered(TransportTier::Relayed));
    b.expect_message().await;

    b.handle
        .connect(a.id.clone(), ConversationId::new("c1"))
        .await
        .unwrap();

    let event = a.expect(is_direct_connected).await;
    assert_eq!(
        event,
        OrchestratorEvent::Connected {
            remote: b.id.clone(),
            conversation_id: ConversationId::new("c1"),
            tier: TransportTier::Direct,
        }
    );
    let records = a.handle.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tier, TransportTier::Direct);
    assert!(records[0].connected);

    let delivery = a
        .handle
        .send(b.id.clone(), text_envelope("m2", "c1", &a.id, "now direct"))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Delivered(TransportTier::Direct));
}

#[tokio::test]
async fn test_direct_record_discarded_when_channel_closes() {
    let relay = spawn_relay().await;
    let connector = MemoryConnector::new();

    let mut a = spawn_peer("peer_a", test_config(Some(relay.clone())), &connector, no_broadcast());
    let mut b = spawn_peer("peer_b", test_config(Some(relay)), &connector, no_broadcast());
    a.expect_online().await;
    b.expect_online().await;

    a.handle
        .connect(b.id.clone(), ConversationId::new("c1"))
        .await
        .unwrap();
    a.expect(is_direct_connected).await;
    b.expect(is_direct_connected).await;

    assert_eq!(
        b.handle.disconnect(ConversationId::new("c1")).await.unwrap(),
        1
    );
    wait_for_records(&a.handle, |records| records.is_empty()).await;

    let delivery = a
        .handle
        .send(b.id.clone(), text_envelope("m1", "c1", &a.id, "back to relay"))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Delivered(TransportTier::Relayed));
    let (_, received, tier) = b.expect_message().await;
    assert_eq!(received.id, "m1");
    assert_eq!(tier, TransportTier::Relayed);
}
