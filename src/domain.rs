//! src/domain.rs
//!
//! The application's domain model: node identity, geospatial positions,
//! tactical messages, and geofence zones. These types double as the wire
//! schema, so field declaration order is part of the canonical encoding
//! contract (see `envelope`) and must not be reordered casually.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in milliseconds. All timestamps in the system use this
/// resolution, including store rows and liveness windows.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_millis() as u64
}

/// Reserved topic strings. Unknown topics are accepted and stored but
/// trigger no special processing.
pub mod topic {
    pub const BLUE_FORCE: &str = "blue_force";
    pub const RED_FORCE: &str = "red_force";
    pub const NEUTRAL: &str = "neutral";
    pub const INTEL: &str = "intel";
    pub const SITREP: &str = "sitrep";
    pub const MEDEVAC: &str = "medevac";
    pub const SUPPLIES: &str = "supplies";
    pub const FIRES: &str = "fires";
    pub const COMMAND: &str = "command";
    pub const ALERT: &str = "alert";
    pub const FILE_TRANSFER: &str = "file_transfer";
}

/// Message precedence, 0 most urgent. Within a level, transmission is FIFO
/// by enqueue order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Flash = 0,
    Immediate = 1,
    Priority = 2,
    Routine = 3,
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(Priority::Flash),
            1 => Ok(Priority::Immediate),
            2 => Ok(Priority::Priority),
            3 => Ok(Priority::Routine),
            other => Err(format!("priority out of range: {other}")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Flash => "FLASH",
            Priority::Immediate => "IMMEDIATE",
            Priority::Priority => "PRIORITY",
            Priority::Routine => "ROUTINE",
        };
        write!(f, "{name}")
    }
}

/// A node's public identity as carried on the wire and persisted locally.
/// The id is derived once at first boot and never changes; `last_seen` is
/// tracked separately by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub callsign: String,
    pub unit: String,
    pub rank: String,
    pub role: String,
    pub clearance_level: u8,
    /// X25519 encryption public key, base64.
    pub public_key: String,
    /// Ed25519 verify key, base64.
    pub verify_key: String,
    pub created: u64,
}

impl NodeIdentity {
    /// Short id prefix for log lines.
    pub fn short_id(&self) -> &str {
        let end = self.node_id.len().min(8);
        &self.node_id[..end]
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.callsign, self.short_id())
    }
}

/// A single observed track for a node. The store keeps at most one row per
/// node, the most recently observed by emitter timestamp.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub node_id: String,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub accuracy: f64,
    pub speed: f64,
    pub course: f64,
    pub timestamp: u64,
    /// Opaque grid-reference string. Never synthesised here.
    pub mgrs: Option<String>,
}

impl Position {
    pub fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(Error::InvalidPosition(format!("lat {} out of range", self.lat)));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(Error::InvalidPosition(format!("lon {} out of range", self.lon)));
        }
        if self.accuracy < 0.0 {
            return Err(Error::InvalidPosition("negative accuracy".into()));
        }
        if self.speed < 0.0 {
            return Err(Error::InvalidPosition("negative speed".into()));
        }
        Ok(())
    }
}

/// The unit of exchange on the mesh. `(sender, msg_id)` is globally unique
/// and is the duplicate-suppression key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TacticalMessage {
    pub msg_id: String,
    pub msg_type: String,
    pub topic: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub classification: String,
    pub priority: Priority,
    pub timestamp: u64,
    pub expires: Option<u64>,
    pub payload: Map<String, Value>,
    pub attachments: Vec<String>,
    /// Base64 Ed25519 signature over the canonical envelope; empty string
    /// while unsigned.
    pub signature: String,
}

impl TacticalMessage {
    pub fn is_broadcast(&self) -> bool {
        self.recipients.is_empty()
    }
}

/// Geofence zone classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ZoneType {
    Friendly,
    Hostile,
    Restricted,
    Objective,
}

impl ZoneType {
    /// Zone classes that constitute a violation when a position falls inside.
    pub fn is_violation_class(&self) -> bool {
        matches!(self, ZoneType::Hostile | ZoneType::Restricted)
    }
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ZoneType::Friendly => "FRIENDLY",
            ZoneType::Hostile => "HOSTILE",
            ZoneType::Restricted => "RESTRICTED",
            ZoneType::Objective => "OBJECTIVE",
        };
        write!(f, "{name}")
    }
}

/// A named polygonal zone. `polygon` is well-known text with x = lon,
/// y = lat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeofenceZone {
    pub zone_id: String,
    pub name: String,
    pub zone_type: ZoneType,
    pub polygon: String,
    pub classification: String,
    pub created_by: String,
    pub created: u64,
    pub active: bool,
}

// --- Unit Tests ---
