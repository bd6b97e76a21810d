//! Error taxonomy for the overlap tracker
//!
//! - `FetchError` - a single channel's audience fetch failed (transient-fetch)
//! - `UpstreamError` - the top-channel list or metadata could not be fetched
//! - `DbError` - database write failure; `Busy` is the only transient kind
//! - `StateError` - durable iteration state unreadable or unwritable
//! - `TrackerError` - fatal error surfaced by the controller

use super::types::{Channel, InvalidChannel};

/// Audience fetch failure for a single channel
///
/// Always recovered inside the scheduler (requeue or abandon).
#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Channel offline or unknown upstream
    NotLive(Channel),
    /// Network, rate-limit or malformed payload
    Transient(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::NotLive(channel) => write!(f, "Channel {} is not live or not found", channel),
            FetchError::Transient(msg) => write!(f, "Transient fetch error: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Transient(err.to_string())
    }
}

/// Upstream API failure for top channels or channel metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    Http(String),
    Status { endpoint: String, status: u16 },
    Decode(String),
    Auth(String),
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamError::Http(msg) => write!(f, "Upstream HTTP error: {}", msg),
            UpstreamError::Status { endpoint, status } => {
                write!(f, "Upstream returned status {} for {}", status, endpoint)
            }
            UpstreamError::Decode(msg) => write!(f, "Upstream response decode error: {}", msg),
            UpstreamError::Auth(msg) => write!(f, "Upstream authorization error: {}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            UpstreamError::Decode(err.to_string())
        } else {
            UpstreamError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for UpstreamError {
    fn from(err: serde_json::Error) -> Self {
        UpstreamError::Decode(err.to_string())
    }
}

impl From<InvalidChannel> for UpstreamError {
    fn from(err: InvalidChannel) -> Self {
        UpstreamError::Decode(err.to_string())
    }
}

/// Database failure
#[derive(Debug)]
pub enum DbError {
    /// SQLITE_BUSY / SQLITE_LOCKED - safe to retry the same write
    Busy(String),
    Database(String),
    Io(std::io::Error),
    Schema(String),
}

impl DbError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Busy(_))
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                DbError::Busy(err.to_string())
            }
            _ => DbError::Database(err.to_string()),
        }
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::Io(err)
    }
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Busy(e) => write!(f, "Database busy: {}", e),
            DbError::Database(e) => write!(f, "Database error: {}", e),
            DbError::Io(e) => write!(f, "IO error: {}", e),
            DbError::Schema(e) => write!(f, "Schema error: {}", e),
        }
    }
}

impl std::error::Error for DbError {}

/// Iteration state persistence failure
#[derive(Debug)]
pub enum StateError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        StateError::Io(err)
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err)
    }
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Io(e) => write!(f, "IO error: {}", e),
            StateError::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for StateError {}

/// Fatal tracker error
///
/// Every variant terminates the runtime; supervision restarts it from the
/// last persisted `IterationState`.
#[derive(Debug)]
pub enum TrackerError {
    /// Iteration state could not be restored at startup
    StateUnreadable(StateError),
    /// Iteration state could not be persisted (pass-integrity)
    StateWrite(StateError),
    /// Top-channel list unavailable at pass start
    Upstream(UpstreamError),
    /// Non-transient (or retry-exhausted) database failure
    Database(DbError),
    /// Snapshot spool could not be cleared
    Spool(std::io::Error),
    /// Overlap computation task failed
    Overlap(String),
}

impl std::fmt::Display for TrackerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerError::StateUnreadable(e) => write!(f, "Iteration state unreadable: {}", e),
            TrackerError::StateWrite(e) => write!(f, "Iteration state write failed: {}", e),
            TrackerError::Upstream(e) => write!(f, "Upstream unavailable: {}", e),
            TrackerError::Database(e) => write!(f, "Database failure: {}", e),
            TrackerError::Spool(e) => write!(f, "Snapshot spool failure: {}", e),
            TrackerError::Overlap(e) => write!(f, "Overlap computation failed: {}", e),
        }
    }
}

impl std::error::Error for TrackerError {}

impl From<UpstreamError> for TrackerError {
    fn from(err: UpstreamError) -> Self {
        TrackerError::Upstream(err)
    }
}

impl From<DbError> for TrackerError {
    fn from(err: DbError) -> Self {
        TrackerError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    #[test]
    fn test_busy_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_BUSY), None);
        let locked = rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_LOCKED), None);
        let constraint =
            rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_CONSTRAINT), None);

        assert!(DbError::from(busy).is_transient());
        assert!(DbError::from(locked).is_transient());
        assert!(!DbError::from(constraint).is_transient());
    }

    #[test]
    fn test_fetch_error_display() {
        let channel = Channel::parse("somebody").unwrap();
        let err = FetchError::NotLive(channel);
        assert_eq!(err.to_string(), "Channel somebody is not live or not found");
    }
}
