use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Logical station function a schedule entry can target. Each role maps to
/// exactly one configured adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StationRole {
    Rig,
    Decoder,
    Messenger,
    NetTool,
}

impl StationRole {
    pub fn as_str(self) -> &'static str {
        match self {
            StationRole::Rig => "rig",
            StationRole::Decoder => "decoder",
            StationRole::Messenger => "messenger",
            StationRole::NetTool => "net_tool",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "rig" => Some(StationRole::Rig),
            "decoder" => Some(StationRole::Decoder),
            "messenger" => Some(StationRole::Messenger),
            "net_tool" => Some(StationRole::NetTool),
            _ => None,
        }
    }
}

impl std::fmt::Display for StationRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire protocol spoken by a station program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    XmlRpc,
    LineJson,
    RigSocket,
    FileWatch,
}

impl ProtocolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::XmlRpc => "xml_rpc",
            ProtocolKind::LineJson => "line_json",
            ProtocolKind::RigSocket => "rig_socket",
            ProtocolKind::FileWatch => "file_watch",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        match value {
            "xml_rpc" => Some(ProtocolKind::XmlRpc),
            "line_json" => Some(ProtocolKind::LineJson),
            "rig_socket" => Some(ProtocolKind::RigSocket),
            "file_watch" => Some(ProtocolKind::FileWatch),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            ProtocolKind::XmlRpc => 7362,
            ProtocolKind::LineJson => 2442,
            ProtocolKind::RigSocket => 12345,
            ProtocolKind::FileWatch => 0,
        }
    }
}

/// VFO selection forwarded to the rig before a frequency change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vfo {
    A,
    B,
}

impl Vfo {
    pub fn as_str(self) -> &'static str {
        match self {
            Vfo::A => "VFOA",
            Vfo::B => "VFOB",
        }
    }
}

/// When a schedule entry fires: once at an absolute instant, or on a daily
/// or weekly recurrence at a UTC wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Trigger {
    Once { at: DateTime<Utc> },
    Daily { hour: u8, minute: u8 },
    Weekly { weekday: Weekday, hour: u8, minute: u8 },
}

impl Trigger {
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Trigger::Once { .. })
    }

    /// First occurrence strictly after `after`. For one-shots this is the
    /// fixed instant regardless of `after`.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Trigger::Once { at } => at,
            Trigger::Daily { hour, minute } => {
                let time = NaiveTime::from_hms_opt(u32::from(hour), u32::from(minute), 0)
                    .unwrap_or(NaiveTime::MIN);
                let candidate = at_wall_time(after, time);
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
            Trigger::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let time = NaiveTime::from_hms_opt(u32::from(hour), u32::from(minute), 0)
                    .unwrap_or(NaiveTime::MIN);
                let days_ahead = (weekday.num_days_from_monday() + 7
                    - after.weekday().num_days_from_monday())
                    % 7;
                let candidate = at_wall_time(after, time) + Duration::days(i64::from(days_ahead));
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::days(7)
                }
            }
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        let (hour, minute) = match *self {
            Trigger::Once { .. } => return Ok(()),
            Trigger::Daily { hour, minute } => (hour, minute),
            Trigger::Weekly { hour, minute, .. } => (hour, minute),
        };
        if hour > 23 || minute > 59 {
            return Err(EngineError::Validation(format!(
                "trigger time {:02}:{:02} is out of range",
                hour, minute
            )));
        }
        Ok(())
    }
}

fn at_wall_time(day: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.date_naive().and_time(time))
}

/// One scheduled action: what to apply (frequency / mode / message), to
/// which roles, and when. Mutated only by whole-entry replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub trigger: Trigger,
    pub frequency_hz: Option<u64>,
    pub mode: Option<String>,
    pub message: Option<String>,
    /// VFO the rig should switch to before the frequency change.
    pub vfo: Option<Vfo>,
    /// Waterfall offset delivered to the decoder alongside the entry.
    pub waterfall_hz: Option<i64>,
    pub roles: Vec<StationRole>,
    pub enabled: bool,
    pub comment: Option<String>,
}

impl ScheduleEntry {
    pub fn new(trigger: Trigger, roles: Vec<StationRole>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            frequency_hz: None,
            mode: None,
            message: None,
            vfo: None,
            waterfall_hz: None,
            roles,
            enabled: true,
            comment: None,
        }
    }

    /// Invariants checked at `put` time: at least one command field, at
    /// least one target role, and a one-shot trigger that is not already in
    /// the past.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        self.trigger.validate()?;
        if self.frequency_hz.is_none()
            && self.mode.is_none()
            && self.waterfall_hz.is_none()
            && self.message.is_none()
        {
            return Err(EngineError::Validation(
                "entry sets none of frequency, mode, waterfall, or message".to_string(),
            ));
        }
        if self.roles.is_empty() {
            return Err(EngineError::Validation(
                "entry targets no station roles".to_string(),
            ));
        }
        // The waterfall only ever goes to the decoder; an entry carrying
        // nothing else would fire as an empty no-op on every other role.
        let only_waterfall = self.frequency_hz.is_none()
            && self.mode.is_none()
            && self.message.is_none()
            && self.waterfall_hz.is_some();
        if only_waterfall && !self.roles.contains(&StationRole::Decoder) {
            return Err(EngineError::Validation(
                "waterfall-only entry must target the decoder role".to_string(),
            ));
        }
        if let Trigger::Once { at } = self.trigger {
            if at <= now {
                return Err(EngineError::Validation(format!(
                    "one-shot trigger {} is in the past",
                    at.to_rfc3339()
                )));
            }
        }
        if let Some(mode) = &self.mode {
            if mode.trim().is_empty() {
                return Err(EngineError::Validation("mode is empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Connection parameters for one station role. Configuration is copied into
/// the adapter at construction; adapters are rebuilt, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationProfile {
    pub role: StationRole,
    pub protocol: ProtocolKind,
    pub host: String,
    pub port: u16,
    /// Drop-file path for the file-watch protocol.
    pub path: Option<PathBuf>,
    /// Per-call timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl StationProfile {
    /// Protocol kind determines which fields are required; an adapter is
    /// never constructed from an incomplete profile.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self.protocol {
            ProtocolKind::FileWatch => {
                if self.path.is_none() {
                    return Err(EngineError::Validation(format!(
                        "file_watch profile for role '{}' is missing a path",
                        self.role
                    )));
                }
            }
            _ => {
                if self.host.trim().is_empty() {
                    return Err(EngineError::Validation(format!(
                        "profile for role '{}' is missing a host",
                        self.role
                    )));
                }
                if self.port == 0 {
                    return Err(EngineError::Validation(format!(
                        "profile for role '{}' is missing a port",
                        self.role
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Per-role outcome of one fire cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RoleOutcome {
    Succeeded,
    Failed { reason: String },
    /// The reachability probe failed permanently; no command was attempted.
    SkippedUnreachable,
}

impl RoleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RoleOutcome::Succeeded)
    }
}

/// Composite record of one fire attempt. Immutable once written; a retry of
/// a later cycle produces a new record with its own fire timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub entry_id: Uuid,
    pub fired_at: DateTime<Utc>,
    pub outcomes: BTreeMap<StationRole, RoleOutcome>,
}

impl ActionResult {
    pub fn all_succeeded(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.values().all(RoleOutcome::is_success)
    }
}
