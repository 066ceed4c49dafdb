pub mod types;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use types::{ActionResult, RoleOutcome, ScheduleEntry, StationProfile, StationRole, Trigger};

/// Durable store for schedule entries, station profiles, and fire results.
///
/// The store exclusively owns schedule rows; every mutation goes through its
/// own serialized contract (the connection mutex), so callers never need
/// external locking. Timestamps are RFC 3339 UTC with fixed-width fractional
/// seconds, which makes lexicographic ordering chronological.
pub struct ScheduleStore {
    db: Arc<Mutex<Connection>>,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, EngineError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Validation(format!("bad stored timestamp '{}': {}", raw, e)))
}

impl ScheduleStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let db = Connection::open(path.as_ref())?;
        Self::init_schema(&db)?;
        info!("Schedule store opened at {}", path.as_ref().display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    /// In-memory store for tests and dry runs. Does not survive restart.
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    fn init_schema(db: &Connection) -> Result<(), EngineError> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS schedule_entries (
                id TEXT PRIMARY KEY,
                trigger_json TEXT NOT NULL,
                next_fire_utc TEXT NOT NULL,
                frequency_hz INTEGER,
                mode TEXT,
                message TEXT,
                vfo TEXT,
                waterfall_hz INTEGER,
                roles_json TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                comment TEXT
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS station_profiles (
                role TEXT PRIMARY KEY,
                protocol TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                path TEXT,
                timeout_ms INTEGER
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS action_results (
                entry_id TEXT NOT NULL,
                fired_at TEXT NOT NULL,
                outcomes_json TEXT NOT NULL,
                PRIMARY KEY (entry_id, fired_at)
            )",
            [],
        )?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Schedule entries
    // ------------------------------------------------------------------

    /// Validate and persist an entry (insert or whole-entry replace by id).
    pub async fn put(&self, entry: &ScheduleEntry) -> Result<(), EngineError> {
        let now = Utc::now();
        entry.validate(now)?;
        let next_fire = entry.trigger.next_occurrence(now);

        let trigger_json = serde_json::to_string(&entry.trigger)
            .map_err(|e| EngineError::Validation(format!("unserializable trigger: {}", e)))?;
        let roles_json = serde_json::to_string(&entry.roles)
            .map_err(|e| EngineError::Validation(format!("unserializable roles: {}", e)))?;

        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO schedule_entries
                (id, trigger_json, next_fire_utc, frequency_hz, mode, message,
                 vfo, waterfall_hz, roles_json, enabled, comment)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.id.to_string(),
                trigger_json,
                ts(next_fire),
                entry.frequency_hz.map(|v| v as i64),
                entry.mode,
                entry.message,
                entry.vfo.map(|v| v.as_str()),
                entry.waterfall_hz,
                roles_json,
                entry.enabled as i64,
                entry.comment,
            ],
        )?;
        Ok(())
    }

    pub async fn remove(&self, id: Uuid) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        let deleted = db.execute(
            "DELETE FROM schedule_entries WHERE id = ?1",
            params![id.to_string()],
        )?;
        if deleted == 0 {
            return Err(EngineError::NotFound(id));
        }
        Ok(())
    }

    /// Flip an entry's enabled flag in place. The dispatcher parks failed
    /// one-shots through this so they cannot come due again.
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), EngineError> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE schedule_entries SET enabled = ?1 WHERE id = ?2",
            params![enabled as i64, id.to_string()],
        )?;
        if updated == 0 {
            return Err(EngineError::NotFound(id));
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ScheduleEntry>, EngineError> {
        let db = self.db.lock().await;
        let row: Option<EntryRow> = db
            .query_row(
                "SELECT id, trigger_json, frequency_hz, mode, message, vfo,
                        waterfall_hz, roles_json, enabled, comment
                 FROM schedule_entries WHERE id = ?1",
                params![id.to_string()],
                EntryRow::from_row,
            )
            .optional()?;
        row.map(EntryRow::into_entry).transpose()
    }

    pub async fn list(&self) -> Result<Vec<ScheduleEntry>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, trigger_json, frequency_hz, mode, message, vfo,
                    waterfall_hz, roles_json, enabled, comment
             FROM schedule_entries ORDER BY next_fire_utc ASC, id ASC",
        )?;
        let rows = stmt.query_map([], EntryRow::from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    /// Earliest next-occurrence across all enabled entries, if any. The
    /// scheduler loop sleeps until this instant.
    pub async fn next_wake(&self) -> Result<Option<DateTime<Utc>>, EngineError> {
        let db = self.db.lock().await;
        let raw: Option<String> = db.query_row(
            "SELECT MIN(next_fire_utc) FROM schedule_entries WHERE enabled = 1",
            [],
            |row| row.get(0),
        )?;
        raw.as_deref().map(parse_ts).transpose()
    }

    /// Every enabled entry due at or before `deadline`, trigger-time
    /// ascending with ties broken by id. As a side effect, each matched
    /// recurring entry's stored next occurrence advances to the following
    /// one; one-shots are left untouched (the dispatcher removes those
    /// after a fully successful fire).
    pub async fn due_before(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<ScheduleEntry>, EngineError> {
        let db = self.db.lock().await;
        let mut entries = Vec::new();
        {
            let mut stmt = db.prepare(
                "SELECT id, trigger_json, frequency_hz, mode, message, vfo,
                        waterfall_hz, roles_json, enabled, comment
                 FROM schedule_entries
                 WHERE enabled = 1 AND next_fire_utc <= ?1
                 ORDER BY next_fire_utc ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![ts(deadline)], EntryRow::from_row)?;
            for row in rows {
                entries.push(row?.into_entry()?);
            }
        }

        for entry in &entries {
            if entry.trigger.is_recurring() {
                let following = entry.trigger.next_occurrence(deadline);
                db.execute(
                    "UPDATE schedule_entries SET next_fire_utc = ?1 WHERE id = ?2",
                    params![ts(following), entry.id.to_string()],
                )?;
            }
        }

        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Station profiles
    // ------------------------------------------------------------------

    pub async fn put_profile(&self, profile: &StationProfile) -> Result<(), EngineError> {
        profile.validate()?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO station_profiles (role, protocol, host, port, path, timeout_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                profile.role.as_str(),
                profile.protocol.as_str(),
                profile.host,
                i64::from(profile.port),
                profile.path.as_ref().map(|p| p.display().to_string()),
                profile.timeout_ms.map(|v| v as i64),
            ],
        )?;
        Ok(())
    }

    pub async fn get_profile(
        &self,
        role: StationRole,
    ) -> Result<Option<StationProfile>, EngineError> {
        let db = self.db.lock().await;
        let row: Option<ProfileRow> = db
            .query_row(
                "SELECT role, protocol, host, port, path, timeout_ms
                 FROM station_profiles WHERE role = ?1",
                params![role.as_str()],
                ProfileRow::from_row,
            )
            .optional()?;
        row.map(ProfileRow::into_profile).transpose()
    }

    pub async fn list_profiles(&self) -> Result<Vec<StationProfile>, EngineError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT role, protocol, host, port, path, timeout_ms FROM station_profiles",
        )?;
        let rows = stmt.query_map([], ProfileRow::from_row)?;
        let mut profiles = Vec::new();
        for row in rows {
            profiles.push(row?.into_profile()?);
        }
        Ok(profiles)
    }

    // ------------------------------------------------------------------
    // Action results
    // ------------------------------------------------------------------

    /// Persist one fire cycle's composite result. Write-back is atomic; a
    /// result is never visible half-written.
    pub async fn record_result(&self, result: &ActionResult) -> Result<(), EngineError> {
        let outcomes_json = serde_json::to_string(&result.outcomes)
            .map_err(|e| EngineError::Validation(format!("unserializable outcomes: {}", e)))?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO action_results (entry_id, fired_at, outcomes_json)
             VALUES (?1, ?2, ?3)",
            params![result.entry_id.to_string(), ts(result.fired_at), outcomes_json],
        )?;
        Ok(())
    }

    pub async fn last_result(&self, entry_id: Uuid) -> Result<Option<ActionResult>, EngineError> {
        let db = self.db.lock().await;
        let row: Option<(String, String)> = db
            .query_row(
                "SELECT fired_at, outcomes_json FROM action_results
                 WHERE entry_id = ?1 ORDER BY fired_at DESC LIMIT 1",
                params![entry_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((fired_at, outcomes_json)) = row else {
            return Ok(None);
        };
        let outcomes: BTreeMap<StationRole, RoleOutcome> = serde_json::from_str(&outcomes_json)
            .map_err(|e| EngineError::Validation(format!("bad stored outcomes: {}", e)))?;
        Ok(Some(ActionResult {
            entry_id,
            fired_at: parse_ts(&fired_at)?,
            outcomes,
        }))
    }
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

struct EntryRow {
    id: String,
    trigger_json: String,
    frequency_hz: Option<i64>,
    mode: Option<String>,
    message: Option<String>,
    vfo: Option<String>,
    waterfall_hz: Option<i64>,
    roles_json: String,
    enabled: i64,
    comment: Option<String>,
}

impl EntryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            trigger_json: row.get(1)?,
            frequency_hz: row.get(2)?,
            mode: row.get(3)?,
            message: row.get(4)?,
            vfo: row.get(5)?,
            waterfall_hz: row.get(6)?,
            roles_json: row.get(7)?,
            enabled: row.get(8)?,
            comment: row.get(9)?,
        })
    }

    fn into_entry(self) -> Result<ScheduleEntry, EngineError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| EngineError::Validation(format!("bad stored id '{}': {}", self.id, e)))?;
        let trigger: Trigger = serde_json::from_str(&self.trigger_json)
            .map_err(|e| EngineError::Validation(format!("bad stored trigger: {}", e)))?;
        let roles: Vec<StationRole> = serde_json::from_str(&self.roles_json)
            .map_err(|e| EngineError::Validation(format!("bad stored roles: {}", e)))?;
        let vfo = match self.vfo.as_deref() {
            Some("VFOA") => Some(types::Vfo::A),
            Some("VFOB") => Some(types::Vfo::B),
            _ => None,
        };
        Ok(ScheduleEntry {
            id,
            trigger,
            frequency_hz: self.frequency_hz.map(|v| v as u64),
            mode: self.mode,
            message: self.message,
            vfo,
            waterfall_hz: self.waterfall_hz,
            roles,
            enabled: self.enabled != 0,
            comment: self.comment,
        })
    }
}

struct ProfileRow {
    role: String,
    protocol: String,
    host: String,
    port: i64,
    path: Option<String>,
    timeout_ms: Option<i64>,
}

impl ProfileRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            role: row.get(0)?,
            protocol: row.get(1)?,
            host: row.get(2)?,
            port: row.get(3)?,
            path: row.get(4)?,
            timeout_ms: row.get(5)?,
        })
    }

    fn into_profile(self) -> Result<StationProfile, EngineError> {
        let role = StationRole::from_name(&self.role).ok_or_else(|| {
            EngineError::Validation(format!("unknown stored role '{}'", self.role))
        })?;
        let protocol = types::ProtocolKind::from_name(&self.protocol).ok_or_else(|| {
            EngineError::Validation(format!("unknown stored protocol '{}'", self.protocol))
        })?;
        Ok(StationProfile {
            role,
            protocol,
            host: self.host,
            port: self.port as u16,
            path: self.path.map(std::path::PathBuf::from),
            timeout_ms: self.timeout_ms.map(|v| v as u64),
        })
    }
}
