use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatcher::{Dispatcher, RetryPolicy};
use crate::error::EngineError;
use crate::registry::AdapterRegistry;
use crate::scheduler::SchedulerLoop;
use crate::store::types::{ActionResult, ScheduleEntry, StationProfile};
use crate::store::ScheduleStore;

/// The only entry point external callers (GUI, CLI) use. Everything here is
/// safe to invoke concurrently; the store and registry serialize their own
/// mutations.
pub struct Orchestrator {
    store: Arc<ScheduleStore>,
    registry: Arc<AdapterRegistry>,
    dispatcher: Arc<Dispatcher>,
    change: Arc<Notify>,
}

impl Orchestrator {
    pub fn new(store: ScheduleStore) -> Self {
        Self::with_retry_policy(store, RetryPolicy::default())
    }

    pub fn with_retry_policy(store: ScheduleStore, policy: RetryPolicy) -> Self {
        let store = Arc::new(store);
        let registry = Arc::new(AdapterRegistry::new(store.clone()));
        let dispatcher = Arc::new(Dispatcher::with_policy(
            store.clone(),
            registry.clone(),
            policy,
        ));
        Self {
            store,
            registry,
            dispatcher,
            change: Arc::new(Notify::new()),
        }
    }

    /// Spawn the scheduler loop. The returned handle resolves when the loop
    /// halts: on shutdown, or fatally on a persistence error.
    pub fn spawn_scheduler(
        &self,
        shutdown: CancellationToken,
    ) -> JoinHandle<Result<(), EngineError>> {
        let scheduler = SchedulerLoop::new(
            self.store.clone(),
            self.dispatcher.clone(),
            self.change.clone(),
            shutdown,
        );
        tokio::spawn(scheduler.run())
    }

    /// Validate and persist an entry (insert or whole-entry replace), then
    /// interrupt the scheduler's sleep so a near-term entry is picked up.
    pub async fn schedule(&self, entry: ScheduleEntry) -> Result<Uuid, EngineError> {
        let id = entry.id;
        self.store.put(&entry).await?;
        self.change.notify_one();
        Ok(id)
    }

    /// Remove an entry. A fire already in flight for it is allowed to
    /// complete and record its result, but the entry will not fire again.
    pub async fn cancel(&self, id: Uuid) -> Result<(), EngineError> {
        self.store.remove(id).await?;
        self.change.notify_one();
        Ok(())
    }

    pub async fn list_schedule(&self) -> Result<Vec<ScheduleEntry>, EngineError> {
        self.store.list().await
    }

    pub async fn last_result(&self, id: Uuid) -> Result<Option<ActionResult>, EngineError> {
        self.store.last_result(id).await
    }

    /// Fire an entry immediately, bypassing its trigger time but still
    /// going through the dispatcher. Firing a disabled entry is an error,
    /// never a fire.
    pub async fn force_fire_now(&self, id: Uuid) -> Result<ActionResult, EngineError> {
        let entry = self
            .store
            .get(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if !entry.enabled {
            return Err(EngineError::Validation(format!(
                "entry {} is disabled and cannot be fired",
                id
            )));
        }
        self.dispatcher.dispatch(&entry).await
    }

    /// Replace a station profile and drop the role's cached adapter so live
    /// connections never hold stale parameters.
    pub async fn configure_station(&self, profile: StationProfile) -> Result<(), EngineError> {
        let role = profile.role;
        self.store.put_profile(&profile).await?;
        self.registry.invalidate(role).await;
        Ok(())
    }

    pub async fn station_profiles(&self) -> Result<Vec<StationProfile>, EngineError> {
        self.store.list_profiles().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{ProtocolKind, StationRole, Trigger};
    use chrono::{Duration, Utc};

    async fn orchestrator_with_net_tool(dir: &std::path::Path) -> Orchestrator {
        let store = ScheduleStore::open_in_memory().unwrap();
        let orchestrator = Orchestrator::new(store);
        let profile = StationProfile {
            role: StationRole::NetTool,
            protocol: ProtocolKind::FileWatch,
            host: String::new(),
            port: 0,
            path: Some(dir.join("NETCTL.TXT")),
            timeout_ms: None,
        };
        orchestrator.configure_station(profile).await.unwrap();
        orchestrator
    }

    #[tokio::test]
    async fn force_fire_on_disabled_entry_is_an_error_not_a_fire() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with_net_tool(dir.path()).await;

        let mut entry = ScheduleEntry::new(
            Trigger::Once {
                at: Utc::now() + Duration::hours(1),
            },
            vec![StationRole::NetTool],
        );
        entry.message = Some("should never appear".to_string());
        entry.enabled = false;
        let id = orchestrator.schedule(entry).await.unwrap();

        assert!(matches!(
            orchestrator.force_fire_now(id).await,
            Err(EngineError::Validation(_))
        ));
        // No result recorded, no drop-file line written.
        assert!(orchestrator.last_result(id).await.unwrap().is_none());
        assert!(!dir.path().join("NETCTL.TXT").exists());
    }

    #[tokio::test]
    async fn force_fire_records_result_and_removes_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with_net_tool(dir.path()).await;

        let mut entry = ScheduleEntry::new(
            Trigger::Once {
                at: Utc::now() + Duration::hours(1),
            },
            vec![StationRole::NetTool],
        );
        entry.message = Some("net opens in five".to_string());
        let id = orchestrator.schedule(entry).await.unwrap();

        let result = orchestrator.force_fire_now(id).await.unwrap();
        assert!(result.all_succeeded());
        assert!(orchestrator.list_schedule().await.unwrap().is_empty());
        let last = orchestrator.last_result(id).await.unwrap().unwrap();
        assert!(last.all_succeeded());
    }

    #[tokio::test]
    async fn cancel_missing_entry_reports_not_found() {
        let orchestrator = Orchestrator::new(ScheduleStore::open_in_memory().unwrap());
        let id = Uuid::new_v4();
        assert!(matches!(
            orchestrator.cancel(id).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
