//! src/node/mod.rs
//!
//! The node runtime: the concurrent heart of the system. It owns the
//! in-process identity, drives every registered transport symmetrically,
//! and reconciles the outbound priority queue, the envelope pipeline, the
//! store, and the observer fan-out.
//!
//! Two cooperative tasks do the work. The transmit loop drains the
//! priority queue, signs, and fires each frame at all started transports
//! concurrently. The receive loop polls the transports, authenticates every
//! frame before any state is touched, and applies the result to the store
//! before observers hear about it. Neither loop ever terminates on a
//! per-message error.

use crate::crypto::Identity;
use crate::domain::{now_ms, topic, Position, Priority, TacticalMessage};
use crate::envelope;
use crate::error::{Error, Result};
use crate::situation::{self, BoundingBox};
use crate::store::{NodeRecord, Store};
use crate::transport::{Frame, Transport};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod queue;

use queue::OutboundQueue;

/// Bounded wait on the outbound queue so shutdown is observed promptly.
const QUEUE_WAIT: Duration = Duration::from_secs(1);
/// Receive-loop yield when every transport comes back empty.
const IDLE_POLL: Duration = Duration::from_millis(10);
/// An observer that cannot accept a delivery within this deadline is
/// removed from the set.
const OBSERVER_DEADLINE: Duration = Duration::from_millis(250);
/// How long `stop` waits for the outbound queue to drain.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);
/// Consecutive send failures before a transport is marked degraded.
const DEGRADED_AFTER: u32 = 5;

const OBSERVER_BUFFER: usize = 32;

/// Delivered to every subscribed observer for each authenticated inbound
/// message. Serialises as `{"type":"message","data":{...}}`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ObserverEvent {
    Message(TacticalMessage),
}

/// Point-in-time view of the runtime's drop counters and transport health.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DiagnosticsSnapshot {
    pub frames_received: u64,
    pub messages_transmitted: u64,
    pub verification_failures: u64,
    pub codec_errors: u64,
    pub duplicate_messages: u64,
    pub stale_positions: u64,
    pub store_errors: u64,
    pub degraded_transports: Vec<&'static str>,
}

#[derive(Default)]
struct Diagnostics {
    frames_received: AtomicU64,
    messages_transmitted: AtomicU64,
    verification_failures: AtomicU64,
    codec_errors: AtomicU64,
    duplicate_messages: AtomicU64,
    stale_positions: AtomicU64,
    store_errors: AtomicU64,
}

struct TransportSlot {
    transport: Arc<dyn Transport>,
    started: AtomicBool,
    consecutive_failures: AtomicU32,
    degraded: AtomicBool,
}

impl TransportSlot {
    fn note_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= DEGRADED_AFTER && !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                transport = self.transport.name(),
                failures,
                "Transport marked degraded"
            );
        }
    }

    fn note_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!(transport = self.transport.name(), "Transport recovered");
        }
    }
}

struct Shared {
    identity: Identity,
    store: Arc<Store>,
    slots: Vec<TransportSlot>,
    outbound: OutboundQueue,
    observers: Mutex<HashMap<u64, mpsc::Sender<ObserverEvent>>>,
    next_token: AtomicU64,
    diagnostics: Diagnostics,
    active_window: Duration,
}

pub struct Node {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(
        identity: Identity,
        store: Arc<Store>,
        transports: Vec<Arc<dyn Transport>>,
        active_window: Duration,
    ) -> Self {
        let slots = transports
            .into_iter()
            .map(|transport| TransportSlot {
                transport,
                started: AtomicBool::new(false),
                consecutive_failures: AtomicU32::new(0),
                degraded: AtomicBool::new(false),
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                identity,
                store,
                slots,
                outbound: OutboundQueue::new(),
                observers: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                diagnostics: Diagnostics::default(),
                active_window,
            }),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> &crate::domain::NodeIdentity {
        &self.shared.identity.node
    }

    /// Starts every registered transport (failures are logged, the
    /// transport stays registered but unstarted) and spawns the transmit
    /// and receive loops.
    pub async fn start(&self) -> Result<()> {
        self.shared.store.upsert_node(&self.shared.identity.node)?;

        for slot in &self.shared.slots {
            match slot.transport.start().await {
                Ok(()) => slot.started.store(true, Ordering::Relaxed),
                Err(e) => tracing::error!(
                    transport = slot.transport.name(),
                    error = %e,
                    "Transport failed to start"
                ),
            }
        }

        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        tasks.push(tokio::spawn(transmit_loop(
            self.shared.clone(),
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(receive_loop(
            self.shared.clone(),
            self.shutdown.clone(),
        )));

        tracing::info!(
            node_id = %self.shared.identity.node.short_id(),
            callsign = %self.shared.identity.node.callsign,
            transports = self.shared.slots.len(),
            "Node runtime started"
        );
        Ok(())
    }

    /// Constructs, persists, and enqueues a tactical message. A store
    /// failure here is logged but the message is still transmitted.
    pub fn send_message(
        &self,
        topic: &str,
        payload: Map<String, Value>,
        recipients: Vec<String>,
        priority: Priority,
        classification: &str,
    ) -> Result<String> {
        let msg_type = if recipients.is_empty() {
            "broadcast"
        } else {
            "direct"
        };
        let message = TacticalMessage {
            msg_id: uuid::Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            topic: topic.into(),
            sender: self.shared.identity.node.node_id.clone(),
            recipients,
            classification: classification.into(),
            priority,
            timestamp: now_ms(),
            expires: None,
            payload,
            attachments: vec![],
            signature: String::new(),
        };

        if let Err(e) = self.shared.store.store_message(&message) {
            self.shared
                .diagnostics
                .store_errors
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, msg_id = %message.msg_id, "Outbound message not persisted; transmitting anyway");
        }

        let msg_id = message.msg_id.clone();
        self.shared.outbound.push(message);
        Ok(msg_id)
    }

    /// Records the node's own position and announces it on `blue_force` at
    /// PRIORITY precedence.
    pub fn update_position(
        &self,
        lat: f64,
        lon: f64,
        alt: f64,
        accuracy: f64,
        speed: f64,
        course: f64,
    ) -> Result<()> {
        let position = Position {
            node_id: self.shared.identity.node.node_id.clone(),
            lat,
            lon,
            alt,
            accuracy,
            speed,
            course,
            timestamp: now_ms(),
            mgrs: None,
        };
        position.validate()?;

        self.shared.store.upsert_node(&self.shared.identity.node)?;
        self.shared.store.upsert_position(&position)?;

        let Value::Object(payload) = serde_json::to_value(&position)? else {
            unreachable!("positions serialise as objects");
        };
        self.send_message(topic::BLUE_FORCE, payload, vec![], Priority::Priority, "UNCLASSIFIED")?;
        Ok(())
    }

    /// Registers an observer. Every authenticated inbound message is
    /// delivered, subject to the bounded-deadline backpressure policy.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<ObserverEvent>) {
        let (tx, rx) = mpsc::channel(OBSERVER_BUFFER);
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        self.shared
            .observers
            .lock()
            .expect("observer lock poisoned")
            .insert(token, tx);
        (token, rx)
    }

    pub fn unsubscribe(&self, token: u64) {
        self.shared
            .observers
            .lock()
            .expect("observer lock poisoned")
            .remove(&token);
    }

    pub fn active_nodes(&self) -> Result<Vec<NodeRecord>> {
        self.shared.store.active_nodes(self.shared.active_window)
    }

    pub fn messages(&self, topic: Option<&str>, limit: usize) -> Result<Vec<TacticalMessage>> {
        self.shared.store.messages_by_topic(topic, limit)
    }

    pub fn tactical_picture(&self, bbox: Option<&BoundingBox>) -> Result<Value> {
        situation::tactical_picture(&self.shared.store, self.shared.active_window, bbox)
    }

    pub fn geofence_violations(&self, position: &Position) -> Result<Vec<crate::domain::GeofenceZone>> {
        situation::geofence_violations(&self.shared.store, position)
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        let d = &self.shared.diagnostics;
        DiagnosticsSnapshot {
            frames_received: d.frames_received.load(Ordering::Relaxed),
            messages_transmitted: d.messages_transmitted.load(Ordering::Relaxed),
            verification_failures: d.verification_failures.load(Ordering::Relaxed),
            codec_errors: d.codec_errors.load(Ordering::Relaxed),
            duplicate_messages: d.duplicate_messages.load(Ordering::Relaxed),
            stale_positions: d.stale_positions.load(Ordering::Relaxed),
            store_errors: d.store_errors.load(Ordering::Relaxed),
            degraded_transports: self
                .shared
                .slots
                .iter()
                .filter(|slot| slot.degraded.load(Ordering::Relaxed))
                .map(|slot| slot.transport.name())
                .collect(),
        }
    }

    /// Signals both loops, waits for the outbound queue to drain up to a
    /// bounded deadline, then stops the transports and joins the tasks.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let drain_deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
        while !self.shared.outbound.is_empty() && tokio::time::Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if !self.shared.outbound.is_empty() {
            tracing::warn!("Shutdown deadline reached with undelivered outbound messages");
        }

        for slot in &self.shared.slots {
            if slot.started.swap(false, Ordering::Relaxed) {
                slot.transport.stop().await;
            }
        }

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .expect("task list lock poisoned")
            .drain(..)
            .collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = ?e, "Runtime task failed during shutdown");
            }
        }
        tracing::info!("Node runtime stopped");
    }
}

async fn transmit_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        match shared.outbound.recv(QUEUE_WAIT).await {
            Some(message) => shared.transmit(message).await,
            None => {
                if shutdown.is_cancelled() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Transmit loop stopped");
}

async fn receive_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let mut received_any = false;
        for slot in shared.started_slots() {
            match slot.transport.recv().await {
                Ok(Some(frame)) => {
                    received_any = true;
                    shared
                        .diagnostics
                        .frames_received
                        .fetch_add(1, Ordering::Relaxed);
                    shared.handle_frame(frame).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(
                        transport = slot.transport.name(),
                        error = %e,
                        "Transport receive failed"
                    );
                    slot.note_failure();
                }
            }
        }

        if !received_any {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }
    }
    tracing::debug!("Receive loop stopped");
}

impl Shared {
    fn started_slots(&self) -> impl Iterator<Item = &TransportSlot> {
        self.slots
            .iter()
            .filter(|slot| slot.started.load(Ordering::Relaxed))
    }

    /// Signs and fires one message at every started transport concurrently.
    /// Per-transport failures are logged and counted; they never abort the
    /// loop.
    async fn transmit(&self, message: TacticalMessage) {
        let msg_id = message.msg_id.clone();
        let bytes = match envelope::encode_signed(&self.identity, message) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, msg_id = %msg_id, "Failed to encode outbound envelope");
                return;
            }
        };

        let sends = self.started_slots().map(|slot| {
            let bytes = &bytes;
            async move { (slot, slot.transport.send(bytes, None).await) }
        });
        for (slot, result) in join_all(sends).await {
            match result {
                Ok(()) => slot.note_success(),
                Err(e) => {
                    tracing::warn!(
                        transport = slot.transport.name(),
                        error = %e,
                        msg_id = %msg_id,
                        "Transport send failed"
                    );
                    slot.note_failure();
                }
            }
        }

        self.diagnostics
            .messages_transmitted
            .fetch_add(1, Ordering::Relaxed);
    }

    /// The authenticated inbound path: verify, pin the sender's keys,
    /// suppress duplicates, persist, apply positions, then fan out.
    async fn handle_frame(&self, frame: Frame) {
        let envelope = match envelope::decode_verified(&frame.data) {
            Ok(envelope) => envelope,
            Err(Error::Verification(reason)) => {
                self.diagnostics
                    .verification_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::debug!(reason, source = ?frame.source, "Dropping unverified frame");
                return;
            }
            Err(e) => {
                self.diagnostics.codec_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(error = %e, source = ?frame.source, "Dropping malformed frame");
                return;
            }
        };

        let sender = envelope.sender_identity;
        // Broadcast links loop our own frames back; they carry nothing new.
        if sender.node_id == self.identity.node.node_id {
            return;
        }

        // Trust-on-first-use: the first authenticated sighting pins the
        // verify key; a later contradiction is treated as impersonation.
        match self.store.node(&sender.node_id) {
            Ok(Some(known)) if known.identity.verify_key != sender.verify_key => {
                self.diagnostics
                    .verification_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    node_id = %sender.short_id(),
                    "Verify key changed for known node; dropping frame"
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                self.diagnostics.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Store lookup failed; dropping frame");
                return;
            }
        }

        if let Err(e) = self.store.upsert_node(&sender) {
            self.diagnostics.store_errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "Failed to record sender identity; dropping frame");
            return;
        }

        let message = envelope.message;
        match self.store.store_message(&message) {
            Ok(true) => {}
            Ok(false) => {
                self.diagnostics
                    .duplicate_messages
                    .fetch_add(1, Ordering::Relaxed);
                tracing::trace!(msg_id = %message.msg_id, "Duplicate message dropped");
                return;
            }
            Err(e) => {
                // Persistence-before-delivery: observers never see a message
                // the store did not accept.
                self.diagnostics.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, msg_id = %message.msg_id, "Failed to persist inbound message");
                return;
            }
        }

        if message.topic == topic::BLUE_FORCE {
            self.apply_position(&sender.node_id, &message);
        }

        self.fan_out(ObserverEvent::Message(message)).await;
    }

    fn apply_position(&self, sender_id: &str, message: &TacticalMessage) {
        let position: Position =
            match serde_json::from_value(Value::Object(message.payload.clone())) {
                Ok(position) => position,
                Err(e) => {
                    tracing::debug!(error = %e, "blue_force payload is not a position");
                    return;
                }
            };

        // The signature vouches for the sender's own track only.
        if position.node_id != sender_id {
            tracing::warn!(
                claimed = %position.node_id,
                "Position payload names a foreign node; discarding"
            );
            return;
        }
        if let Err(e) = position.validate() {
            tracing::debug!(error = %e, "Discarding out-of-range position");
            return;
        }

        match self.store.upsert_position(&position) {
            Ok(true) => {}
            Ok(false) => {
                self.diagnostics
                    .stale_positions
                    .fetch_add(1, Ordering::Relaxed);
                tracing::trace!(node_id = %sender_id, "Stale position dropped");
            }
            Err(e) => {
                self.diagnostics.store_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Failed to persist position");
            }
        }
    }

    /// Delivers one event to every observer. A slow observer misses its
    /// deadline and is removed; delivery to the rest proceeds.
    async fn fan_out(&self, event: ObserverEvent) {
        let observers: Vec<(u64, mpsc::Sender<ObserverEvent>)> = self
            .observers
            .lock()
            .expect("observer lock poisoned")
            .iter()
            .map(|(token, tx)| (*token, tx.clone()))
            .collect();
        if observers.is_empty() {
            return;
        }

        let mut expired = Vec::new();
        for (token, tx) in observers {
            match tokio::time::timeout(OBSERVER_DEADLINE, tx.send(event.clone())).await {
                Ok(Ok(())) => {}
                _ => expired.push(token),
            }
        }

        if !expired.is_empty() {
            let mut observers = self.observers.lock().expect("observer lock poisoned");
            for token in &expired {
                observers.remove(token);
            }
            tracing::warn!(count = expired.len(), "Removed unresponsive observers");
        }
    }
}
