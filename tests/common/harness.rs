//! tests/common/harness.rs
//!
//! A test harness for creating and managing in-process mesh clusters.
//! This module provides the building blocks for the component and
//! integration tests, abstracting away the boilerplate of:
//! - An in-memory broadcast hub standing in for the IP mesh.
//! - Instrumented transports for injecting raw frames and capturing sends.
//! - Spawning full node runtimes against ephemeral stores and identities.
//! - Waiting on observer deliveries and store conditions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tacnet::crypto::{Identity, NodeProfile};
use tacnet::domain::{now_ms, Priority, TacticalMessage};
use tacnet::node::{Node, ObserverEvent};
use tacnet::store::Store;
use tacnet::transport::{Frame, Transport};
use tempfile::tempdir;
use tokio::sync::{broadcast, mpsc};

/// How long tests wait for asynchronous effects before giving up.
pub const EFFECT_TIMEOUT: Duration = Duration::from_secs(3);

/// An in-memory broadcast medium. Every endpoint's `send` is delivered to
/// every endpoint, the sender included, which matches the loopback
/// behaviour of a real broadcast link.
pub struct Hub {
    tx: broadcast::Sender<Vec<u8>>,
}

impl Hub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn endpoint(&self) -> Arc<HubTransport> {
        Arc::new(HubTransport {
            tx: self.tx.clone(),
            rx: tokio::sync::Mutex::new(self.tx.subscribe()),
        })
    }
}

pub struct HubTransport {
    tx: broadcast::Sender<Vec<u8>>,
    rx: tokio::sync::Mutex<broadcast::Receiver<Vec<u8>>>,
}

#[async_trait]
impl Transport for HubTransport {
    fn name(&self) -> &'static str {
        "hub"
    }

    async fn start(&self) -> tacnet::Result<()> {
        Ok(())
    }

    async fn send(&self, data: &[u8], _dest: Option<&str>) -> tacnet::Result<()> {
        // No subscribers is not a failure on a broadcast link.
        let _ = self.tx.send(data.to_vec());
        Ok(())
    }

    async fn recv(&self) -> tacnet::Result<Option<Frame>> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.try_recv() {
                Ok(data) => return Ok(Some(Frame { data, source: None })),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return Ok(None),
            }
        }
    }

    async fn stop(&self) {}
}

/// A transport that records every frame handed to it and receives nothing.
/// Used to assert on transmit order and envelope contents.
#[derive(Default)]
pub struct CollectTransport {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl CollectTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for CollectTransport {
    fn name(&self) -> &'static str {
        "collect"
    }

    async fn start(&self) -> tacnet::Result<()> {
        Ok(())
    }

    async fn send(&self, data: &[u8], _dest: Option<&str>) -> tacnet::Result<()> {
        self.sent.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn recv(&self) -> tacnet::Result<Option<Frame>> {
        Ok(None)
    }

    async fn stop(&self) {}
}

/// A transport whose receive side is fed by the test. Used to hand crafted
/// or replayed raw frames to a node's receive loop.
#[derive(Default)]
pub struct InjectTransport {
    queue: Mutex<VecDeque<Vec<u8>>>,
}

impl InjectTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inject(&self, frame: Vec<u8>) {
        self.queue.lock().unwrap().push_back(frame);
    }
}

#[async_trait]
impl Transport for InjectTransport {
    fn name(&self) -> &'static str {
        "inject"
    }

    async fn start(&self) -> tacnet::Result<()> {
        Ok(())
    }

    async fn send(&self, _data: &[u8], _dest: Option<&str>) -> tacnet::Result<()> {
        Ok(())
    }

    async fn recv(&self) -> tacnet::Result<Option<Frame>> {
        Ok(self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .map(|data| Frame { data, source: None }))
    }

    async fn stop(&self) {}
}

/// A transport whose sends always fail. Used to exercise the degraded
/// transport accounting.
pub struct FailTransport;

#[async_trait]
impl Transport for FailTransport {
    fn name(&self) -> &'static str {
        "fail"
    }

    async fn start(&self) -> tacnet::Result<()> {
        Ok(())
    }

    async fn send(&self, _data: &[u8], _dest: Option<&str>) -> tacnet::Result<()> {
        Err(tacnet::Error::Transport("link down".into()))
    }

    async fn recv(&self) -> tacnet::Result<Option<Frame>> {
        Ok(None)
    }

    async fn stop(&self) {}
}

pub fn test_profile(callsign: &str) -> NodeProfile {
    NodeProfile {
        callsign: callsign.to_string(),
        unit: "1st Recon".to_string(),
        rank: "SGT".to_string(),
        role: "scout".to_string(),
        clearance_level: 2,
    }
}

/// A standalone identity for crafting foreign frames. The backing key file
/// is ephemeral.
pub fn make_identity(callsign: &str) -> Identity {
    let dir = tempdir().expect("tempdir");
    Identity::load_or_generate(dir.path().join("id.key"), &test_profile(callsign))
        .expect("identity")
}

/// A handle to a running node runtime in a test environment.
pub struct TestNode {
    pub node: Arc<Node>,
    pub store: Arc<Store>,
}

impl TestNode {
    /// Builds and starts a node over the given transports, with an
    /// in-memory store and a fresh identity.
    pub async fn spawn(callsign: &str, transports: Vec<Arc<dyn Transport>>) -> Result<Self> {
        let identity = make_identity(callsign);
        let store = Arc::new(Store::in_memory().context("open store")?);
        let node = Arc::new(Node::new(
            identity,
            store.clone(),
            transports,
            Duration::from_secs(300),
        ));
        node.start().await.context("start node")?;
        Ok(Self { node, store })
    }
}

/// Builds an unsigned message from `identity` ready for `encode_signed`.
pub fn craft_message(
    identity: &Identity,
    topic: &str,
    payload: Map<String, Value>,
    priority: Priority,
) -> TacticalMessage {
    TacticalMessage {
        msg_id: uuid::Uuid::new_v4().to_string(),
        msg_type: "broadcast".into(),
        topic: topic.into(),
        sender: identity.node.node_id.clone(),
        recipients: vec![],
        classification: "UNCLASSIFIED".into(),
        priority,
        timestamp: now_ms(),
        expires: None,
        payload,
        attachments: vec![],
        signature: String::new(),
    }
}

pub fn text_payload(text: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("text".into(), json!(text));
    payload
}

/// Waits for the next observer delivery and unwraps it to the message.
pub async fn expect_message(
    rx: &mut mpsc::Receiver<ObserverEvent>,
    timeout: Duration,
) -> Result<TacticalMessage> {
    let event = tokio::time::timeout(timeout, rx.recv())
        .await
        .context("timed out waiting for observer delivery")?
        .context("observer channel closed")?;
    let ObserverEvent::Message(message) = event;
    Ok(message)
}

/// Polls `predicate` until it holds or the timeout elapses.
pub async fn wait_until<F>(mut predicate: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
