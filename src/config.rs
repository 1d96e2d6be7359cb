//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use crate::crypto::NodeProfile;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level struct holding all application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Application root. The store file, key file, attachments directory,
    /// and logs directory all live beneath it.
    pub data_dir: PathBuf,

    // Identity profile, baked into the node identity at first boot.
    pub callsign: String,
    pub unit: String,
    pub rank: String,
    pub role: String,
    pub clearance_level: u8,

    // IP mesh transport.
    pub batman_enabled: bool,
    pub ip_interface: Option<String>,
    pub ip_port: u16,

    // Serial radio transport.
    pub lora_enabled: bool,
    pub lora: LoraConfig,

    // Periodic static-position emission.
    pub gps_enabled: bool,
    pub position: StaticPosition,
    pub gps_interval_secs: u64,

    /// Liveness threshold for nodes and positions.
    pub active_window_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub port: String,
    pub baudrate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticPosition {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

impl Config {
    /// Loads configuration from `tacnet.toml` and environment variables.
    /// It uses the `Default` implementation as a base layer.
    pub fn load() -> Result<Self, figment::Error> {
        use figment::{
            providers::{Env, Format, Serialized, Toml},
            Figment,
        };
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("tacnet.toml"))
            .merge(Env::prefixed("TACNET_"))
            .extract()
    }

    /// Sanity checks that are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.clearance_level > 5 {
            return Err(Error::InvalidConfig(format!(
                "clearance_level {} out of range 0-5",
                self.clearance_level
            )));
        }
        if self.gps_enabled {
            if !(-90.0..=90.0).contains(&self.position.lat)
                || !(-180.0..=180.0).contains(&self.position.lon)
            {
                return Err(Error::InvalidConfig("static position out of range".into()));
            }
            if self.gps_interval_secs == 0 {
                return Err(Error::InvalidConfig("gps_interval_secs must be nonzero".into()));
            }
        }
        Ok(())
    }

    pub fn profile(&self) -> NodeProfile {
        NodeProfile {
            callsign: self.callsign.clone(),
            unit: self.unit.clone(),
            rank: self.rank.clone(),
            role: self.role.clone(),
            clearance_level: self.clearance_level,
        }
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("tacnet.db")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.data_dir.join("attachments")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.active_window_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("tacnet-data"),
            callsign: "UNASSIGNED".into(),
            unit: "UNASSIGNED".into(),
            rank: "NONE".into(),
            role: "operator".into(),
            clearance_level: 0,
            batman_enabled: true,
            ip_interface: None,
            ip_port: 47474,
            lora_enabled: false,
            lora: LoraConfig {
                port: "/dev/ttyUSB0".into(),
                baudrate: 57_600,
            },
            gps_enabled: false,
            position: StaticPosition {
                lat: 0.0,
                lon: 0.0,
                alt: 0.0,
            },
            gps_interval_secs: 30,
            active_window_seconds: 300,
        }
    }
}
