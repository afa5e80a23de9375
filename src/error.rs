//! Error taxonomy shared by the engine, the outbox and the sync worker.

use thiserror::Error;

use crate::engine::TimerStatus;

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database corruption detected: {0}")]
    Corrupted(String),

    #[error("Database mutex poisoned. A panic occurred while holding the lock; restart to recover.")]
    Poisoned,

    #[error("Payload encryption: {0}")]
    Encryption(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// Errors from local timer transitions. Always synchronous; the caller
/// knows immediately whether the transition happened.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimerError {
    /// Event not valid from the current state. State is unchanged.
    #[error("invalid transition: cannot {event} from {from}")]
    InvalidTransition { from: TimerStatus, event: &'static str },

    /// The durable write failed; in-memory state was not flipped.
    #[error("failed to persist timer state: {0}")]
    Persistence(String),

    #[error("timer lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

/// Errors from appending to the outbox.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Admission control rejected the task. The drop is counted and surfaced.
    #[error("sync queue is full ({capacity} tasks), task dropped")]
    QueueFull { capacity: usize },

    #[error("failed to write sync task: {0}")]
    Persistence(String),

    #[error("payload encryption failed: {0}")]
    Encryption(String),

    #[error("failed to serialize payload: {0}")]
    Serialize(String),
}

/// Errors from a sync pass or a single remote attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Parse payload: {0}")]
    ParsePayload(String),

    /// No usable credential (not logged in).
    #[error("Auth: {0}")]
    Auth(String),

    /// Still 401 after one refresh-and-retry cycle.
    #[error("Auth expired: {0}")]
    AuthExpired(String),

    /// The refresh credential itself was rejected. The user must log in again.
    #[error("Re-authentication required: {0}")]
    ReauthRequired(String),

    #[error("Network: {0}")]
    Network(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// A pause/resume/stop whose time entry has no server id yet.
    #[error("Unresolved time entry: {0}")]
    UnresolvedEntry(String),

    #[error("DB: {0}")]
    Db(String),

    /// Another pass was in flight and did not finish within the join timeout.
    #[error("sync already in progress")]
    Busy,

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the failure should count as a connectivity problem.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout(_))
    }
}

/// Errors from the token provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Access token not set. Call set_tokens first.")]
    NotAuthenticated,

    /// Refresh endpoint answered 401: terminal, requires a new login.
    #[error("refresh token rejected")]
    RefreshRejected,

    #[error("Network error during token refresh: {0}")]
    Network(String),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),
}

impl From<AuthError> for SyncError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::RefreshRejected => SyncError::ReauthRequired(e.to_string()),
            AuthError::Network(msg) => SyncError::Network(msg),
            other => SyncError::Auth(other.to_string()),
        }
    }
}

/// Recovery-time clock problem. Recoverable: the engine clamps and continues.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClockAnomaly {
    /// Wall clock is earlier than the persisted session start or heartbeat.
    Backward { now: i64, reference: i64 },
    /// Elapsed time since the session start exceeds the plausibility bound.
    ImplausibleGap { elapsed_secs: u64, limit_secs: u64 },
}

impl std::fmt::Display for ClockAnomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockAnomaly::Backward { now, reference } => {
                write!(f, "clock moved backward: now {} < saved {}", now, reference)
            }
            ClockAnomaly::ImplausibleGap {
                elapsed_secs,
                limit_secs,
            } => write!(
                f,
                "implausible gap of {}s (limit {}s)",
                elapsed_secs, limit_secs
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_rejected_maps_to_reauth() {
        let err: SyncError = AuthError::RefreshRejected.into();
        assert!(matches!(err, SyncError::ReauthRequired(_)));
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(SyncError::Network("down".into()).is_connectivity());
        assert!(SyncError::Timeout("2m".into()).is_connectivity());
        assert!(!SyncError::Http {
            status: 500,
            message: "boom".into()
        }
        .is_connectivity());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = TimerError::InvalidTransition {
            from: TimerStatus::Stopped,
            event: "pause",
        };
        assert_eq!(err.to_string(), "invalid transition: cannot pause from STOPPED");
    }
}
