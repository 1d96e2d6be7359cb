//! tests/integration/mesh.rs
//!
//! Full end-to-end tests: several real node runtimes wired to a shared
//! broadcast medium, exchanging signed frames exactly as they would over
//! the IP mesh. Each test asserts on the receiving side's store, observer
//! deliveries, and read APIs.

use crate::common::harness::{self, Hub, TestNode, EFFECT_TIMEOUT};
use std::sync::Arc;
use std::time::Duration;
use tacnet::domain::{now_ms, topic, GeofenceZone, Priority, ZoneType};
use tacnet::transport::Transport;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_lone_broadcast_reaches_peer() {
    let hub = Hub::new();
    let alpha = TestNode::spawn("ALPHA-1", vec![hub.endpoint() as Arc<dyn Transport>])
        .await
        .unwrap();
    let bravo = TestNode::spawn("BRAVO-2", vec![hub.endpoint() as Arc<dyn Transport>])
        .await
        .unwrap();
    let (_token, mut rx) = bravo.node.subscribe();

    alpha
        .node
        .send_message(topic::COMMAND, harness::text_payload("move"), vec![], Priority::Priority, "UNCLASSIFIED")
        .unwrap();

    // Bravo's observer sees exactly one delivery.
    let delivered = harness::expect_message(&mut rx, EFFECT_TIMEOUT).await.unwrap();
    assert_eq!(delivered.payload["text"], "move");
    assert_eq!(delivered.sender, alpha.node.identity().node_id);
    assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    // Bravo's store holds the message and Alpha's pinned identity.
    let stored = bravo.store.messages_by_topic(Some(topic::COMMAND), 10).unwrap();
    assert_eq!(stored.len(), 1);
    let record = bravo
        .store
        .node(&alpha.node.identity().node_id)
        .unwrap()
        .expect("alpha's node row");
    assert_eq!(record.identity.verify_key, alpha.node.identity().verify_key);
    assert_eq!(record.identity.callsign, "ALPHA-1");

    // Alpha never applies its own loopback frame as a foreign sighting.
    assert_eq!(alpha.node.diagnostics().duplicate_messages, 0);

    alpha.node.stop().await;
    bravo.node.stop().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_broadcast_fans_out_to_every_peer() {
    let hub = Hub::new();
    let alpha = TestNode::spawn("ALPHA-1", vec![hub.endpoint() as Arc<dyn Transport>])
        .await
        .unwrap();
    let bravo = TestNode::spawn("BRAVO-2", vec![hub.endpoint() as Arc<dyn Transport>])
        .await
        .unwrap();
    let charlie = TestNode::spawn("CHARLIE-3", vec![hub.endpoint() as Arc<dyn Transport>])
        .await
        .unwrap();

    let (_tb, mut rx_b) = bravo.node.subscribe();
    let (_tc, mut rx_c) = charlie.node.subscribe();

    alpha
        .node
        .send_message(topic::ALERT, harness::text_payload("contact north"), vec![], Priority::Flash, "SECRET")
        .unwrap();

    let at_b = harness::expect_message(&mut rx_b, EFFECT_TIMEOUT).await.unwrap();
    let at_c = harness::expect_message(&mut rx_c, EFFECT_TIMEOUT).await.unwrap();
    assert_eq!(at_b.msg_id, at_c.msg_id);
    assert_eq!(at_b.priority, Priority::Flash);

    alpha.node.stop().await;
    bravo.node.stop().await;
    charlie.node.stop().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_position_update_builds_the_peer_picture() {
    let hub = Hub::new();
    let alpha = TestNode::spawn("ALPHA-1", vec![hub.endpoint() as Arc<dyn Transport>])
        .await
        .unwrap();
    let bravo = TestNode::spawn("BRAVO-2", vec![hub.endpoint() as Arc<dyn Transport>])
        .await
        .unwrap();

    alpha.node.update_position(37.0, -122.0, 15.0, 5.0, 0.0, 90.0).unwrap();

    let alpha_id = alpha.node.identity().node_id.clone();
    assert!(
        harness::wait_until(
            || {
                bravo
                    .store
                    .current_positions(Duration::from_secs(300))
                    .map(|p| p.iter().any(|p| p.node_id == alpha_id))
                    .unwrap_or(false)
            },
            EFFECT_TIMEOUT
        )
        .await
    );

    // Bravo's read APIs now show the track.
    let active = bravo.node.active_nodes().unwrap();
    assert!(active.iter().any(|n| n.identity.node_id == alpha_id));

    let picture = bravo.node.tactical_picture(None).unwrap();
    let features = picture["features"].as_array().unwrap();
    assert_eq!(features.len(), 1);
    assert_eq!(features[0]["properties"]["node_id"], alpha_id.as_str());
    assert_eq!(features[0]["properties"]["callsign"], "ALPHA-1");

    alpha.node.stop().await;
    bravo.node.stop().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_inbound_track_trips_the_geofence() {
    let hub = Hub::new();
    let alpha = TestNode::spawn("ALPHA-1", vec![hub.endpoint() as Arc<dyn Transport>])
        .await
        .unwrap();
    let bravo = TestNode::spawn("BRAVO-2", vec![hub.endpoint() as Arc<dyn Transport>])
        .await
        .unwrap();

    bravo
        .store
        .upsert_geofence(&GeofenceZone {
            zone_id: "z1".into(),
            name: "NAI HAWK".into(),
            zone_type: ZoneType::Hostile,
            polygon: "POLYGON((0 0, 0 10, 10 10, 10 0, 0 0))".into(),
            classification: "SECRET".into(),
            created_by: bravo.node.identity().node_id.clone(),
            created: now_ms(),
            active: true,
        })
        .unwrap();

    alpha.node.update_position(5.0, 5.0, 0.0, 5.0, 0.0, 0.0).unwrap();

    let alpha_id = alpha.node.identity().node_id.clone();
    assert!(
        harness::wait_until(
            || {
                bravo
                    .store
                    .current_positions(Duration::from_secs(300))
                    .map(|p| !p.is_empty())
                    .unwrap_or(false)
            },
            EFFECT_TIMEOUT
        )
        .await
    );

    let track = bravo
        .store
        .current_positions(Duration::from_secs(300))
        .unwrap()
        .into_iter()
        .find(|p| p.node_id == alpha_id)
        .unwrap();
    let violations = bravo.node.geofence_violations(&track).unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].zone_id, "z1");

    alpha.node.stop().await;
    bravo.node.stop().await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_two_way_traffic_between_peers() {
    let hub = Hub::new();
    let alpha = TestNode::spawn("ALPHA-1", vec![hub.endpoint() as Arc<dyn Transport>])
        .await
        .unwrap();
    let bravo = TestNode::spawn("BRAVO-2", vec![hub.endpoint() as Arc<dyn Transport>])
        .await
        .unwrap();

    let (_ta, mut rx_a) = alpha.node.subscribe();
    let (_tb, mut rx_b) = bravo.node.subscribe();

    alpha
        .node
        .send_message(topic::SITREP, harness::text_payload("alpha up"), vec![], Priority::Routine, "UNCLASSIFIED")
        .unwrap();
    bravo
        .node
        .send_message(topic::SITREP, harness::text_payload("bravo up"), vec![], Priority::Routine, "UNCLASSIFIED")
        .unwrap();

    let at_b = harness::expect_message(&mut rx_b, EFFECT_TIMEOUT).await.unwrap();
    let at_a = harness::expect_message(&mut rx_a, EFFECT_TIMEOUT).await.unwrap();
    assert_eq!(at_b.payload["text"], "alpha up");
    assert_eq!(at_a.payload["text"], "bravo up");

    // Each side ends with both sitreps stored: its own plus the peer's.
    for node in [&alpha, &bravo] {
        assert!(
            harness::wait_until(
                || {
                    node.store
                        .messages_by_topic(Some(topic::SITREP), 10)
                        .map(|m| m.len() == 2)
                        .unwrap_or(false)
                },
                EFFECT_TIMEOUT
            )
            .await
        );
    }

    alpha.node.stop().await;
    bravo.node.stop().await;
}
