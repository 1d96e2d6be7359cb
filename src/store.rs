//! src/store.rs
//!
//! The durable local store, the single source of truth for the situational
//! picture. Four tables: nodes, positions, messages, geofences. One
//! `rusqlite` connection owned behind a mutex; concurrent callers serialise
//! on the lock, so every operation is atomic from the caller's view.
//!
//! Write semantics worth knowing:
//!   - a position row requires an existing node row (callers upsert the
//!     sender's identity first),
//!   - positions are monotone per node by emitter timestamp; stale arrivals
//!     report `false` and mutate nothing,
//!   - `(sender, msg_id)` is stored at most once; a duplicate reports
//!     `false`.

use crate::domain::{
    now_ms, GeofenceZone, NodeIdentity, Position, Priority, TacticalMessage, ZoneType,
};
use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A stored node: the immutable wire identity plus the store-tracked
/// `last_seen`.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRecord {
    pub identity: NodeIdentity,
    pub last_seen: u64,
}

pub struct Store {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    node_id         TEXT PRIMARY KEY,
    callsign        TEXT NOT NULL,
    unit            TEXT NOT NULL,
    rank            TEXT NOT NULL,
    role            TEXT NOT NULL,
    clearance_level INTEGER NOT NULL,
    public_key      TEXT NOT NULL,
    verify_key      TEXT NOT NULL,
    created         INTEGER NOT NULL,
    last_seen       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_nodes_unit ON nodes(unit);

CREATE TABLE IF NOT EXISTS positions (
    node_id   TEXT PRIMARY KEY REFERENCES nodes(node_id),
    lat       REAL NOT NULL,
    lon       REAL NOT NULL,
    alt       REAL NOT NULL,
    accuracy  REAL NOT NULL,
    speed     REAL NOT NULL,
    course    REAL NOT NULL,
    timestamp INTEGER NOT NULL,
    mgrs      TEXT
);
CREATE INDEX IF NOT EXISTS idx_positions_timestamp ON positions(timestamp);

CREATE TABLE IF NOT EXISTS messages (
    sender         TEXT NOT NULL,
    msg_id         TEXT NOT NULL,
    msg_type       TEXT NOT NULL,
    topic          TEXT NOT NULL,
    recipients     TEXT NOT NULL,
    classification TEXT NOT NULL,
    priority       INTEGER NOT NULL,
    timestamp      INTEGER NOT NULL,
    expires        INTEGER,
    payload        TEXT NOT NULL,
    attachments    TEXT NOT NULL,
    signature      TEXT NOT NULL,
    PRIMARY KEY (sender, msg_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_topic ON messages(topic);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);

CREATE TABLE IF NOT EXISTS geofences (
    zone_id        TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    zone_type      TEXT NOT NULL,
    polygon        TEXT NOT NULL,
    classification TEXT NOT NULL,
    created_by     TEXT NOT NULL,
    created        INTEGER NOT NULL,
    active         INTEGER NOT NULL
);
";

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Ephemeral store for tests and tooling.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    /// Inserts or overwrites the node row and refreshes `last_seen`.
    pub fn upsert_node(&self, identity: &NodeIdentity) -> Result<()> {
        self.conn().execute(
            "INSERT INTO nodes
               (node_id, callsign, unit, rank, role, clearance_level,
                public_key, verify_key, created, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(node_id) DO UPDATE SET
               callsign = excluded.callsign,
               unit = excluded.unit,
               rank = excluded.rank,
               role = excluded.role,
               clearance_level = excluded.clearance_level,
               public_key = excluded.public_key,
               verify_key = excluded.verify_key,
               created = excluded.created,
               last_seen = excluded.last_seen",
            params![
                identity.node_id,
                identity.callsign,
                identity.unit,
                identity.rank,
                identity.role,
                identity.clearance_level,
                identity.public_key,
                identity.verify_key,
                identity.created,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    pub fn node(&self, node_id: &str) -> Result<Option<NodeRecord>> {
        let record = self
            .conn()
            .query_row(
                "SELECT node_id, callsign, unit, rank, role, clearance_level,
                        public_key, verify_key, created, last_seen
                 FROM nodes WHERE node_id = ?1",
                params![node_id],
                row_to_node,
            )
            .optional()?;
        Ok(record)
    }

    /// Inserts or overwrites the single position row for `position.node_id`.
    /// Returns `false` (no mutation) when the incoming emitter timestamp is
    /// not strictly newer than the stored one. Errors when no node row
    /// exists.
    pub fn upsert_position(&self, position: &Position) -> Result<bool> {
        let conn = self.conn();

        let known: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM nodes WHERE node_id = ?1",
                params![position.node_id],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(Error::UnknownNode(position.node_id.clone()));
        }

        let stored: Option<u64> = conn
            .query_row(
                "SELECT timestamp FROM positions WHERE node_id = ?1",
                params![position.node_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(stored) = stored {
            if position.timestamp <= stored {
                return Ok(false);
            }
        }

        conn.execute(
            "INSERT OR REPLACE INTO positions
               (node_id, lat, lon, alt, accuracy, speed, course, timestamp, mgrs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                position.node_id,
                position.lat,
                position.lon,
                position.alt,
                position.accuracy,
                position.speed,
                position.course,
                position.timestamp,
                position.mgrs,
            ],
        )?;
        Ok(true)
    }

    /// Inserts the message unless `(sender, msg_id)` is already stored.
    /// Returns `false` on a duplicate.
    pub fn store_message(&self, message: &TacticalMessage) -> Result<bool> {
        let changed = self.conn().execute(
            "INSERT OR IGNORE INTO messages
               (sender, msg_id, msg_type, topic, recipients, classification,
                priority, timestamp, expires, payload, attachments, signature)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                message.sender,
                message.msg_id,
                message.msg_type,
                message.topic,
                serde_json::to_string(&message.recipients)?,
                message.classification,
                u8::from(message.priority),
                message.timestamp,
                message.expires,
                serde_json::to_string(&message.payload)?,
                serde_json::to_string(&message.attachments)?,
                message.signature,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Nodes seen within the liveness window.
    pub fn active_nodes(&self, window: Duration) -> Result<Vec<NodeRecord>> {
        let cutoff = now_ms().saturating_sub(window.as_millis() as u64);
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT node_id, callsign, unit, rank, role, clearance_level,
                    public_key, verify_key, created, last_seen
             FROM nodes WHERE last_seen > ?1 ORDER BY last_seen DESC",
        )?;
        let rows = stmt.query_map(params![cutoff], row_to_node)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Positions observed within the liveness window.
    pub fn current_positions(&self, window: Duration) -> Result<Vec<Position>> {
        let cutoff = now_ms().saturating_sub(window.as_millis() as u64);
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT node_id, lat, lon, alt, accuracy, speed, course, timestamp, mgrs
             FROM positions WHERE timestamp > ?1 ORDER BY timestamp DESC",
        )?;
        let rows = stmt.query_map(params![cutoff], row_to_position)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Stored messages, newest first, optionally filtered by topic.
    pub fn messages_by_topic(
        &self,
        topic: Option<&str>,
        limit: usize,
    ) -> Result<Vec<TacticalMessage>> {
        let conn = self.conn();
        let rows = match topic {
            Some(topic) => {
                let mut stmt = conn.prepare(
                    "SELECT sender, msg_id, msg_type, topic, recipients, classification,
                            priority, timestamp, expires, payload, attachments, signature
                     FROM messages WHERE topic = ?1
                     ORDER BY timestamp DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![topic, limit as i64], row_to_message)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT sender, msg_id, msg_type, topic, recipients, classification,
                            priority, timestamp, expires, payload, attachments, signature
                     FROM messages ORDER BY timestamp DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], row_to_message)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    pub fn upsert_geofence(&self, zone: &GeofenceZone) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO geofences
               (zone_id, name, zone_type, polygon, classification,
                created_by, created, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                zone.zone_id,
                zone.name,
                zone.zone_type.to_string(),
                zone.polygon,
                zone.classification,
                zone.created_by,
                zone.created,
                zone.active,
            ],
        )?;
        Ok(())
    }

    pub fn active_geofences(&self) -> Result<Vec<GeofenceZone>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT zone_id, name, zone_type, polygon, classification,
                    created_by, created, active
             FROM geofences WHERE active = 1",
        )?;
        let rows = stmt.query_map([], row_to_zone)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<NodeRecord> {
    Ok(NodeRecord {
        identity: NodeIdentity {
            node_id: row.get(0)?,
            callsign: row.get(1)?,
            unit: row.get(2)?,
            rank: row.get(3)?,
            role: row.get(4)?,
            clearance_level: row.get(5)?,
            public_key: row.get(6)?,
            verify_key: row.get(7)?,
            created: row.get(8)?,
        },
        last_seen: row.get(9)?,
    })
}

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        node_id: row.get(0)?,
        lat: row.get(1)?,
        lon: row.get(2)?,
        alt: row.get(3)?,
        accuracy: row.get(4)?,
        speed: row.get(5)?,
        course: row.get(6)?,
        timestamp: row.get(7)?,
        mgrs: row.get(8)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<TacticalMessage> {
    let recipients: String = row.get(4)?;
    let priority: u8 = row.get(6)?;
    let payload: String = row.get(9)?;
    let attachments: String = row.get(10)?;

    Ok(TacticalMessage {
        sender: row.get(0)?,
        msg_id: row.get(1)?,
        msg_type: row.get(2)?,
        topic: row.get(3)?,
        recipients: serde_json::from_str(&recipients)
            .map_err(|e| text_conversion_err(4, e.to_string()))?,
        classification: row.get(5)?,
        priority: Priority::try_from(priority).map_err(|e| text_conversion_err(6, e))?,
        timestamp: row.get(7)?,
        expires: row.get(8)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| text_conversion_err(9, e.to_string()))?,
        attachments: serde_json::from_str(&attachments)
            .map_err(|e| text_conversion_err(10, e.to_string()))?,
        signature: row.get(11)?,
    })
}

fn row_to_zone(row: &Row<'_>) -> rusqlite::Result<GeofenceZone> {
    let zone_type: String = row.get(2)?;
    let zone_type = match zone_type.as_str() {
        "FRIENDLY" => ZoneType::Friendly,
        "HOSTILE" => ZoneType::Hostile,
        "RESTRICTED" => ZoneType::Restricted,
        "OBJECTIVE" => ZoneType::Objective,
        other => return Err(text_conversion_err(2, format!("unknown zone type {other}"))),
    };

    Ok(GeofenceZone {
        zone_id: row.get(0)?,
        name: row.get(1)?,
        zone_type,
        polygon: row.get(3)?,
        classification: row.get(4)?,
        created_by: row.get(5)?,
        created: row.get(6)?,
        active: row.get(7)?,
    })
}

fn text_conversion_err(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

// --- Unit Tests ---
