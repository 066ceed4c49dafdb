use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::adapters::StationAdapter;
use crate::error::{EngineError, ProtocolError};
use crate::registry::AdapterRegistry;
use crate::store::types::{ActionResult, RoleOutcome, ScheduleEntry, StationRole};
use crate::store::ScheduleStore;

/// A role whose adapter has failed this many consecutive dispatch cycles
/// gets its cached connection invalidated so the next cycle reconnects.
const INVALIDATE_AFTER: u32 = 3;

/// Bounded-attempt retry policy for transient wire failures. Permanent
/// failures and validation rejections never retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first (3 = up to 2 retries).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            factor: 2,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `completed` attempts:
    /// base, base*factor, base*factor^2, ...
    pub fn delay_after(&self, completed: u32) -> Duration {
        self.base_delay * self.factor.saturating_pow(completed.saturating_sub(1))
    }

    /// Next state after attempt number `attempt` (1-based) failed.
    pub fn after_failure(&self, attempt: u32, error: &ProtocolError) -> AttemptState {
        if !error.is_transient() {
            return AttemptState::Failed {
                reason: error.to_string(),
            };
        }
        if attempt >= self.max_attempts {
            return AttemptState::Failed {
                reason: format!("transient-exhausted: {}", error),
            };
        }
        AttemptState::RetryWait {
            next_attempt: attempt + 1,
            delay: self.delay_after(attempt),
        }
    }
}

/// Explicit per-role attempt state machine, so attempt counts and backoff
/// are testable without a live adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Attempting { attempt: u32 },
    RetryWait { next_attempt: u32, delay: Duration },
    Succeeded,
    Failed { reason: String },
}

/// Fans a due entry's commands out to its target roles concurrently,
/// collects per-role outcomes, and records one composite ActionResult.
/// Adapter failures are classified here and never propagate to the
/// scheduler loop; store failures do.
pub struct Dispatcher {
    store: Arc<ScheduleStore>,
    registry: Arc<AdapterRegistry>,
    policy: RetryPolicy,
    consecutive_failures: Mutex<HashMap<StationRole, u32>>,
}

impl Dispatcher {
    pub fn new(store: Arc<ScheduleStore>, registry: Arc<AdapterRegistry>) -> Self {
        Self::with_policy(store, registry, RetryPolicy::default())
    }

    pub fn with_policy(
        store: Arc<ScheduleStore>,
        registry: Arc<AdapterRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            consecutive_failures: Mutex::new(HashMap::new()),
        }
    }

    /// One fire cycle for one entry. Each role runs as its own task; a
    /// failure on one role neither delays nor fails the others.
    pub async fn dispatch(&self, entry: &ScheduleEntry) -> Result<ActionResult, EngineError> {
        let fired_at = Utc::now();
        info!(
            "Firing entry {} across {} role(s)",
            entry.id,
            entry.roles.len()
        );

        let mut handles = Vec::with_capacity(entry.roles.len());
        for &role in &entry.roles {
            let registry = self.registry.clone();
            let policy = self.policy.clone();
            let entry = entry.clone();
            handles.push((
                role,
                tokio::spawn(async move { run_role(registry, policy, entry, role).await }),
            ));
        }

        let mut outcomes = BTreeMap::new();
        for (role, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|e| RoleOutcome::Failed {
                reason: format!("dispatch task failed: {}", e),
            });
            outcomes.insert(role, outcome);
        }

        let stale = self.note_outcomes(&outcomes).await;
        for role in stale {
            warn!(
                "[{}] {} consecutive failed cycles; forcing reconnect",
                role, INVALIDATE_AFTER
            );
            self.registry.invalidate(role).await;
        }

        let result = ActionResult {
            entry_id: entry.id,
            fired_at,
            outcomes,
        };
        self.store.record_result(&result).await?;

        // One-shots leave the due set after every fire: removed on full
        // success, parked disabled on anything less so the scheduler never
        // re-dispatches them in a hot loop. The failure stays readable via
        // last_result; recurring entries are never auto-removed.
        if !entry.trigger.is_recurring() {
            let change = if result.all_succeeded() {
                self.store.remove(entry.id).await
            } else {
                warn!(
                    "Entry {} failed as a one-shot; disabled pending reschedule",
                    entry.id
                );
                self.store.set_enabled(entry.id, false).await
            };
            match change {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(result)
    }

    /// Update consecutive-failure counters; returns roles that just crossed
    /// the invalidation threshold.
    async fn note_outcomes(
        &self,
        outcomes: &BTreeMap<StationRole, RoleOutcome>,
    ) -> Vec<StationRole> {
        let mut counters = self.consecutive_failures.lock().await;
        let mut stale = Vec::new();
        for (role, outcome) in outcomes {
            if outcome.is_success() {
                counters.remove(role);
                continue;
            }
            let count = counters.entry(*role).or_insert(0);
            *count += 1;
            if *count >= INVALIDATE_AFTER {
                *count = 0;
                stale.push(*role);
            }
        }
        stale
    }
}

async fn run_role(
    registry: Arc<AdapterRegistry>,
    policy: RetryPolicy,
    entry: ScheduleEntry,
    role: StationRole,
) -> RoleOutcome {
    let handle = match registry.resolve(role).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("[{}] cannot resolve adapter: {}", role, e);
            return RoleOutcome::Failed {
                reason: e.to_string(),
            };
        }
    };

    // Exclusive use of this role's connection for the whole cycle.
    let mut adapter = handle.lock().await;

    let mut state = AttemptState::Attempting { attempt: 1 };
    loop {
        state = match state {
            AttemptState::Idle => AttemptState::Attempting { attempt: 1 },
            AttemptState::Attempting { attempt } => {
                // Probe before commanding. A transient probe failure
                // (refused, timeout) is retried like any wire failure; a
                // permanent one means the station is not there at all.
                match adapter.health_check().await {
                    Ok(()) => match apply_commands(&mut **adapter, &entry, role).await {
                        Ok(()) => AttemptState::Succeeded,
                        Err(e) => {
                            warn!("[{}] attempt {} failed: {}", role, attempt, e);
                            policy.after_failure(attempt, &e)
                        }
                    },
                    Err(e) if e.is_transient() => {
                        warn!("[{}] attempt {} cannot reach station: {}", role, attempt, e);
                        policy.after_failure(attempt, &e)
                    }
                    Err(e) => {
                        warn!("[{}] unreachable, skipping commands: {}", role, e);
                        return RoleOutcome::SkippedUnreachable;
                    }
                }
            }
            AttemptState::RetryWait {
                next_attempt,
                delay,
            } => {
                tokio::time::sleep(delay).await;
                AttemptState::Attempting {
                    attempt: next_attempt,
                }
            }
            AttemptState::Succeeded => {
                info!("[{}] commands applied", role);
                return RoleOutcome::Succeeded;
            }
            AttemptState::Failed { reason } => {
                return RoleOutcome::Failed { reason };
            }
        };
    }
}

/// Issue whichever of the entry's command fields are set, in a fixed order:
/// frequency (with VFO), waterfall (decoder only), mode, message.
async fn apply_commands(
    adapter: &mut dyn StationAdapter,
    entry: &ScheduleEntry,
    role: StationRole,
) -> Result<(), ProtocolError> {
    if let Some(hz) = entry.frequency_hz {
        adapter.set_frequency(hz, entry.vfo).await?;
    }
    if role == StationRole::Decoder {
        if let Some(offset) = entry.waterfall_hz {
            adapter.set_waterfall(offset).await?;
        }
    }
    if let Some(mode) = &entry.mode {
        adapter.set_mode(mode).await?;
    }
    if let Some(text) = &entry.message {
        adapter.send_text(text).await?;
    }
    Ok(())
}
