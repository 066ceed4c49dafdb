use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::EngineError;
use crate::store::types::{ProtocolKind, StationProfile, StationRole};

/// Bootstrap configuration: where the schedule database lives and which
/// station programs exist. Profiles from here are seeded into the store at
/// startup; later edits go through the orchestrator.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    pub role: StationRole,
    pub protocol: ProtocolKind,
    #[serde(default = "default_host")]
    pub host: String,
    /// Defaults to the protocol's well-known port when omitted.
    pub port: Option<u16>,
    pub path: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("netmarshal.db")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        toml::from_str(raw).map_err(|e| EngineError::Configuration(format!("bad config: {}", e)))
    }
}

impl StationConfig {
    pub fn into_profile(self) -> StationProfile {
        let port = self.port.unwrap_or_else(|| self.protocol.default_port());
        StationProfile {
            role: self.role,
            protocol: self.protocol,
            host: self.host,
            port,
            path: self.path,
            timeout_ms: self.timeout_ms,
        }
    }
}

/// Parse operator-entered frequency text in MHz into integer Hz. Tolerates
/// comma decimal separators, stray spaces, and thousands dots ("7.078.000"
/// means 7.078000 MHz).
pub fn parse_frequency_mhz(text: &str) -> Option<u64> {
    let normalized = text.replace(',', ".").replace(' ', "");
    if normalized.is_empty() {
        return None;
    }
    let parts: Vec<&str> = normalized.split('.').collect();
    let joined = if parts.len() > 2 {
        format!("{}.{}", parts[0], parts[1..].join(""))
    } else {
        normalized
    };
    let mhz: f64 = joined.parse().ok()?;
    if !(mhz.is_finite() && mhz > 0.0) {
        return None;
    }
    Some((mhz * 1_000_000.0).round() as u64)
}
