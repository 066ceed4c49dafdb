pub mod filewatch;
pub mod linejson;
pub mod rigsock;
pub mod xmlrpc;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, ProtocolError};
use crate::store::types::{ProtocolKind, StationProfile, Vfo};

/// Uniform capability set over one station program's native transport.
///
/// Callers get exclusive access through the registry's per-role mutex, so
/// implementations may keep connection state in `&mut self` without their
/// own locking. Transport setup is lazy: each call (re)connects as needed,
/// and `close` releases the connection on every exit path.
#[async_trait]
pub trait StationAdapter: Send + Sync {
    /// Establish the underlying transport. Idempotent; a no-op for
    /// connectionless protocols.
    async fn connect(&mut self) -> Result<(), ProtocolError>;

    async fn set_frequency(&mut self, hz: u64, vfo: Option<Vfo>) -> Result<(), ProtocolError>;

    async fn set_mode(&mut self, mode: &str) -> Result<(), ProtocolError>;

    async fn send_text(&mut self, text: &str) -> Result<(), ProtocolError>;

    /// Waterfall offset for decoder programs. Targets that have no notion
    /// of a waterfall reject it as a permanent failure.
    async fn set_waterfall(&mut self, _offset_hz: i64) -> Result<(), ProtocolError> {
        Err(ProtocolError::Permanent(
            "waterfall offset not supported by this station".to_string(),
        ))
    }

    /// Fast, side-effect-free reachability probe. The dispatcher gates real
    /// commands on this.
    async fn health_check(&mut self) -> Result<(), ProtocolError>;

    /// Release the underlying connection. Safe to call repeatedly.
    async fn close(&mut self);
}

/// Construct an adapter from a validated profile. Fails with
/// ConfigurationError if the profile is incomplete for its protocol kind;
/// no connection is attempted here.
pub fn build(profile: &StationProfile) -> Result<Box<dyn StationAdapter>, EngineError> {
    profile
        .validate()
        .map_err(|e| EngineError::Configuration(e.to_string()))?;
    let timeout = call_timeout(profile);
    Ok(match profile.protocol {
        ProtocolKind::XmlRpc => Box::new(xmlrpc::XmlRpcAdapter::new(
            &profile.host,
            profile.port,
            timeout,
        )),
        ProtocolKind::LineJson => Box::new(linejson::LineJsonAdapter::new(
            &profile.host,
            profile.port,
            timeout,
        )),
        ProtocolKind::RigSocket => Box::new(rigsock::RigSocketAdapter::new(
            &profile.host,
            profile.port,
            timeout,
        )),
        ProtocolKind::FileWatch => {
            // Presence checked by validate() above.
            let path = profile.path.clone().ok_or_else(|| {
                EngineError::Configuration(format!(
                    "file_watch profile for '{}' has no path",
                    profile.role
                ))
            })?;
            Box::new(filewatch::FileWatchAdapter::new(path))
        }
    })
}

/// Per-call timeout: the profile override, or the protocol default.
fn call_timeout(profile: &StationProfile) -> Duration {
    if let Some(ms) = profile.timeout_ms {
        return Duration::from_millis(ms);
    }
    match profile.protocol {
        ProtocolKind::XmlRpc => Duration::from_secs(5),
        ProtocolKind::LineJson => Duration::from_secs(5),
        ProtocolKind::RigSocket => Duration::from_secs(3),
        ProtocolKind::FileWatch => Duration::from_secs(3),
    }
}
