use thiserror::Error;
use uuid::Uuid;

/// Engine-level errors surfaced to callers of the orchestrator facade.
///
/// Adapter-level wire failures never appear here; the dispatcher classifies
/// those into per-role outcomes instead (see [`ProtocolError`]).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed schedule entry or station profile. Rejected synchronously,
    /// never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No profile (or an incomplete profile) exists for a station role.
    /// Blocks that role only.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("schedule entry not found: {0}")]
    NotFound(Uuid),

    /// Store unreachable or corrupt. Fatal to the scheduler loop; the loop
    /// halts rather than silently dropping schedules.
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

/// A classified wire-protocol failure from a station adapter.
///
/// Transient failures (refused connection, timeout) are eligible for the
/// dispatcher's bounded retry; permanent ones (malformed or fault responses)
/// are recorded immediately.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("transient protocol failure: {0}")]
    Transient(String),

    #[error("permanent protocol failure: {0}")]
    Permanent(String),
}

impl ProtocolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::Transient(_))
    }

    /// Classify a std::io error the way the retry policy expects: refused /
    /// reset / timed-out connections are worth another attempt, everything
    /// else is not.
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted => {
                ProtocolError::Transient(format!("{}: {}", context, err))
            }
            _ => ProtocolError::Permanent(format!("{}: {}", context, err)),
        }
    }
}
