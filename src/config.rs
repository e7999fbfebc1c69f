//! Engine tuning and architecture configuration.

use crate::error::{CanError, Result};
use crate::types::{BusName, FrameId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Delivery threads for regular subscriptions.
    /// Default: 2
    pub dispatch_workers: usize,

    /// Delivery threads for RT subscriptions (0 = RT not supported).
    /// Default: 1
    pub rt_workers: usize,

    /// Pending deliveries per regular subscription before the oldest is dropped.
    /// Default: 256
    pub mailbox_capacity: usize,

    /// Longest history kept per key, in milliseconds.
    /// Default: 255s, the longest window a history read can request.
    pub max_retention_ms: u64,

    /// Approximate byte ceiling for the history cache.
    /// Default: 8MB
    pub memory_ceiling_bytes: usize,

    /// Largest accepted frame payload.
    /// Default: 64 (CAN FD)
    pub max_payload_len: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: 2,
            rt_workers: 1,
            mailbox_capacity: 256,
            max_retention_ms: 255_000,
            memory_ceiling_bytes: 8 * 1024 * 1024, // 8MB
            max_payload_len: 64,
        }
    }
}

/// Vehicle electrical architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchitectureType {
    NeaR1,
    #[serde(rename = "NEA_R1_RETROFIT_2010")]
    NeaR1Retrofit2010,
    NeaR2,
    /// Reported when the architecture could not be read from persistence.
    Unavailable,
    #[serde(rename = "NEA_R1_1")]
    NeaR1Rev1,
    #[serde(rename = "NEA_R1_2")]
    NeaR1Rev2,
}

/// Physical bus speed class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusType {
    LowSpeed,
    HighSpeed,
    CanFd,
    InvalidSpeed,
}

/// One bus declared by the architecture.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    pub name: BusName,
    #[serde(default)]
    pub label: String,
    pub bus_type: BusType,
    /// Bit rate in kbit/s.
    pub speed_kbps: u32,
    /// Frame identifiers that may be read or subscribed on this bus.
    #[serde(default)]
    pub frames: Vec<FrameId>,
}

/// Architecture snapshot supplied by the configuration source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    pub architecture: ArchitectureType,
    pub buses: Vec<BusConfig>,
}

impl ArchitectureConfig {
    /// Snapshot used when the source failed.
    pub fn unavailable() -> Self {
        Self {
            architecture: ArchitectureType::Unavailable,
            buses: Vec::new(),
        }
    }

    pub fn bus(&self, name: BusName) -> Option<&BusConfig> {
        self.buses.iter().find(|b| b.name == name)
    }

    pub fn declares_frame(&self, bus: BusName, frame_id: FrameId) -> bool {
        self.bus(bus)
            .map(|b| b.frames.contains(&frame_id))
            .unwrap_or(false)
    }

    /// Reject snapshots that declare the same bus twice.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for bus in &self.buses {
            if !seen.insert(bus.name) {
                return Err(CanError::Persistence(format!(
                    "bus {} declared more than once",
                    bus.name
                )));
            }
        }
        Ok(())
    }

    pub fn info(&self) -> ConfigurationInfo {
        ConfigurationInfo {
            architecture: self.architecture,
            bus_count: self.buses.len(),
            buses: self
                .buses
                .iter()
                .map(|b| BusInfo {
                    name: b.name,
                    bus_type: b.bus_type,
                    speed_kbps: b.speed_kbps,
                })
                .collect(),
        }
    }
}

/// Per-bus entry of [`ConfigurationInfo`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusInfo {
    pub name: BusName,
    pub bus_type: BusType,
    pub speed_kbps: u32,
}

/// Result of a configuration query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationInfo {
    pub architecture: ArchitectureType,
    pub buses: Vec<BusInfo>,
    pub bus_count: usize,
}

impl ConfigurationInfo {
    pub fn bus_names(&self) -> Vec<BusName> {
        self.buses.iter().map(|b| b.name).collect()
    }
}

/// Provider of the architecture snapshot.
///
/// Failures are reported as [`CanError::Persistence`] and surfaced to
/// callers of the configuration query unchanged.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<ArchitectureConfig>;
}

/// Reads the architecture snapshot from a JSON file.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigSource for JsonFileSource {
    fn load(&self) -> Result<ArchitectureConfig> {
        let text = fs::read_to_string(&self.path).map_err(|e| {
            CanError::Persistence(format!("{}: {}", self.path.display(), e))
        })?;
        let config: ArchitectureConfig = serde_json::from_str(&text)
            .map_err(|e| CanError::Persistence(format!("{}: {}", self.path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Serves a fixed in-memory snapshot.
pub struct StaticSource(pub ArchitectureConfig);

impl ConfigSource for StaticSource {
    fn load(&self) -> Result<ArchitectureConfig> {
        self.0.validate()?;
        Ok(self.0.clone())
    }
}
