use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::adapters::{self, StationAdapter};
use crate::error::EngineError;
use crate::store::types::StationRole;
use crate::store::ScheduleStore;

/// A live adapter handle. The outer mutex serializes all use of one role's
/// connection so protocol frames never interleave.
pub type AdapterHandle = Arc<Mutex<Box<dyn StationAdapter>>>;

/// Maps station roles to live adapters, built lazily from the persisted
/// station profiles. The registry exclusively owns adapter connections;
/// configuration is copied in at build time, so a profile edit takes effect
/// by invalidating the role rather than mutating the adapter.
pub struct AdapterRegistry {
    store: Arc<ScheduleStore>,
    adapters: Mutex<HashMap<StationRole, AdapterHandle>>,
}

impl AdapterRegistry {
    pub fn new(store: Arc<ScheduleStore>) -> Self {
        Self {
            store,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Live adapter for a role, constructing and caching it from the role's
    /// profile on first use. Fails with ConfigurationError when no profile
    /// exists.
    pub async fn resolve(&self, role: StationRole) -> Result<AdapterHandle, EngineError> {
        let mut adapters = self.adapters.lock().await;
        if let Some(handle) = adapters.get(&role) {
            return Ok(handle.clone());
        }

        let profile = self
            .store
            .get_profile(role)
            .await?
            .ok_or_else(|| {
                EngineError::Configuration(format!("no station profile for role '{}'", role))
            })?;
        let adapter = adapters::build(&profile)?;
        info!("[{}] Built {} adapter", role, profile.protocol.as_str());

        let handle: AdapterHandle = Arc::new(Mutex::new(adapter));
        adapters.insert(role, handle.clone());
        Ok(handle)
    }

    /// Drop and close a cached adapter, forcing reconnection on next use.
    /// Called after repeated consecutive failures or a profile change.
    pub async fn invalidate(&self, role: StationRole) {
        let removed = self.adapters.lock().await.remove(&role);
        if let Some(handle) = removed {
            handle.lock().await.close().await;
            info!("[{}] Adapter invalidated; next use reconnects", role);
        }
    }
}
