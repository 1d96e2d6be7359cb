//! src/situation.rs
//!
//! The read-side situational engine. Stateless across calls: every query
//! reads the store on demand and assembles the answer. Two operations:
//! the tactical picture (live positions as GeoJSON features, optionally
//! clipped to a bounding box) and geofence violation checks.

use crate::domain::{GeofenceZone, Position};
use crate::error::{Error, Result};
use crate::store::Store;
use geo::{Intersects, Point, Polygon, Rect};
use serde_json::{json, Value};
use std::str::FromStr;
use std::time::Duration;
use wkt::Wkt;

/// Geographic bounding box, inclusive of its edges.
#[derive(Clone, Copy, Debug)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    fn to_polygon(self) -> Polygon<f64> {
        Rect::new(
            (self.min_lon, self.min_lat),
            (self.max_lon, self.max_lat),
        )
        .to_polygon()
    }
}

/// Assembles the live tactical picture: one Point feature per current
/// position within the liveness window, joined with the node's callsign and
/// unit where known. Coordinates are GeoJSON order, `[lon, lat, alt]`.
pub fn tactical_picture(
    store: &Store,
    window: Duration,
    bbox: Option<&BoundingBox>,
) -> Result<Value> {
    let clip = bbox.map(|b| b.to_polygon());
    let mut features = Vec::new();

    for position in store.current_positions(window)? {
        if let Some(clip) = &clip {
            let point = Point::new(position.lon, position.lat);
            if !point.intersects(clip) {
                continue;
            }
        }

        let node = store.node(&position.node_id)?;
        features.push(json!({
            "type": "Feature",
            "geometry": {
                "type": "Point",
                "coordinates": [position.lon, position.lat, position.alt],
            },
            "properties": {
                "node_id": position.node_id,
                "callsign": node.as_ref().map(|n| n.identity.callsign.clone()),
                "unit": node.as_ref().map(|n| n.identity.unit.clone()),
                "accuracy": position.accuracy,
                "speed": position.speed,
                "course": position.course,
                "timestamp": position.timestamp,
                "mgrs": position.mgrs,
            },
        }));
    }

    Ok(json!({
        "type": "FeatureCollection",
        "features": features,
    }))
}

/// Active HOSTILE and RESTRICTED zones whose polygon contains the position.
/// Containment is ray-cast semantics with edge coincidence counting as
/// inside. A zone whose stored polygon fails to parse is skipped with a
/// warning rather than failing the whole check.
pub fn geofence_violations(store: &Store, position: &Position) -> Result<Vec<GeofenceZone>> {
    let point = Point::new(position.lon, position.lat);
    let mut violations = Vec::new();

    for zone in store.active_geofences()? {
        if !zone.zone_type.is_violation_class() {
            continue;
        }
        let polygon = match parse_polygon(&zone.polygon) {
            Ok(polygon) => polygon,
            Err(e) => {
                tracing::warn!(zone_id = %zone.zone_id, error = %e, "Skipping unparseable zone polygon");
                continue;
            }
        };
        if point.intersects(&polygon) {
            violations.push(zone);
        }
    }

    Ok(violations)
}

fn parse_polygon(text: &str) -> Result<Polygon<f64>> {
    let parsed = Wkt::<f64>::from_str(text).map_err(|e| Error::Geometry(e.to_string()))?;
    let geometry =
        geo::Geometry::<f64>::try_from(parsed).map_err(|e| Error::Geometry(e.to_string()))?;
    match geometry {
        geo::Geometry::Polygon(polygon) => Ok(polygon),
        _ => Err(Error::Geometry("zone geometry is not a polygon".into())),
    }
}

// --- Unit Tests ---
