//! Loader error taxonomy.
//!
//! Pipelines return `Result<_, LoaderError>` throughout; the top boundary of
//! each pipeline translates the error kind into run/batch state updates and
//! DLQ routing. Retry is decided by [`ErrorKind::is_transient`], never by
//! string matching.

use thiserror::Error;

/// Well-known error codes surfaced in DLQ entries and alerts.
pub const NO_ACTIVE_BATCH: &str = "NO_ACTIVE_BATCH";
pub const UNKNOWN_TICKER: &str = "UNKNOWN_TICKER";
pub const LOCK_UNAVAILABLE: &str = "LOCK_UNAVAILABLE";
pub const LEASE_LOST: &str = "LEASE_LOST";
pub const BREAKER_OPEN: &str = "BREAKER_OPEN";
pub const CONFLICTING_REPLAY: &str = "CONFLICTING_REPLAY";

/// Classification driving retry/DLQ policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Upstream timeout, DB deadlock, lock contention: retry in-pipeline,
    /// then DLQ as retryable.
    Transient,
    /// Unknown ticker, bad decimal scale: DLQ + alert, no automatic retry.
    DataRecoverable,
    /// Missing key, unparseable payload: DLQ as FAILED immediately.
    DataFatal,
    /// Negative quantity where prohibited, conflicting idempotent replay:
    /// fail the run/event, mark the batch FAILED.
    BusinessFatal,
    /// Lock lease lost mid-flight: transaction aborted, treat as transient.
    Consistency,
    /// Circuit breaker open: refuse new work, let in-flight drain.
    Capacity,
}

impl ErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Consistency)
    }

    /// Fatal-for-message errors skip the retry budget entirely.
    pub fn dlq_immediately_failed(&self) -> bool {
        matches!(self, ErrorKind::DataFatal | ErrorKind::BusinessFatal)
    }
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("upstream fetch failed: {0}")]
    Upstream(String),

    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("database error: {0}")]
    Db(Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("lock {name} unavailable within {waited_ms}ms")]
    LockUnavailable { name: String, waited_ms: u64 },

    #[error("lock lease lost for {name}")]
    LeaseLost { name: String },

    #[error("circuit breaker {name} is open")]
    BreakerOpen { name: String },

    #[error("unknown ticker {ticker}")]
    UnknownTicker { ticker: String },

    #[error("no ACTIVE batch for account {account_id}")]
    NoActiveBatch { account_id: i64 },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("idempotency conflict for {external_ref_id}: payload differs from recorded transaction")]
    ConflictingReplay { external_ref_id: String },

    #[error("shutting down; refusing new work")]
    ShuttingDown,

    #[error("account {account_id} is not admitted: {reason}")]
    NotAdmitted { account_id: i64, reason: String },
}

impl LoaderError {
    /// Wrap a database-layer error. Pulling sqlx into this leaf crate would
    /// invert the dependency order, so the concrete error is carried boxed.
    pub fn db(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        LoaderError::Db(Box::new(e))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LoaderError::Upstream(_) => ErrorKind::Transient,
            LoaderError::UpstreamStatus { status, .. } if *status >= 500 => ErrorKind::Transient,
            LoaderError::UpstreamStatus { .. } => ErrorKind::DataRecoverable,
            LoaderError::Db(_) => ErrorKind::Transient,
            LoaderError::LockUnavailable { .. } => ErrorKind::Transient,
            LoaderError::LeaseLost { .. } => ErrorKind::Consistency,
            LoaderError::BreakerOpen { .. } => ErrorKind::Capacity,
            LoaderError::UnknownTicker { .. } => ErrorKind::DataRecoverable,
            LoaderError::NoActiveBatch { .. } => ErrorKind::DataRecoverable,
            LoaderError::Malformed(_) => ErrorKind::DataFatal,
            LoaderError::ValidationFailed(_) => ErrorKind::BusinessFatal,
            LoaderError::ConflictingReplay { .. } => ErrorKind::BusinessFatal,
            LoaderError::ShuttingDown => ErrorKind::Capacity,
            LoaderError::NotAdmitted { .. } => ErrorKind::DataRecoverable,
        }
    }

    /// Stable code recorded in DLQ entries and alerts.
    pub fn code(&self) -> &'static str {
        match self {
            LoaderError::Upstream(_) | LoaderError::UpstreamStatus { .. } => "UPSTREAM",
            LoaderError::Db(_) => "DB",
            LoaderError::LockUnavailable { .. } => LOCK_UNAVAILABLE,
            LoaderError::LeaseLost { .. } => LEASE_LOST,
            LoaderError::BreakerOpen { .. } => BREAKER_OPEN,
            LoaderError::UnknownTicker { .. } => UNKNOWN_TICKER,
            LoaderError::NoActiveBatch { .. } => NO_ACTIVE_BATCH,
            LoaderError::Malformed(_) => "MALFORMED",
            LoaderError::ValidationFailed(_) => "VALIDATION",
            LoaderError::ConflictingReplay { .. } => CONFLICTING_REPLAY,
            LoaderError::ShuttingDown => "SHUTTING_DOWN",
            LoaderError::NotAdmitted { .. } => "NOT_ADMITTED",
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_5xx_is_transient_4xx_is_not() {
        let e500 = LoaderError::UpstreamStatus {
            status: 503,
            body: "unavailable".into(),
        };
        let e404 = LoaderError::UpstreamStatus {
            status: 404,
            body: "no snapshot".into(),
        };
        assert!(e500.is_transient());
        assert!(!e404.is_transient());
    }

    #[test]
    fn lease_lost_retries_fatal_does_not() {
        assert!(LoaderError::LeaseLost { name: "eod:1".into() }.is_transient());
        assert!(LoaderError::Malformed("bad json".into())
            .kind()
            .dlq_immediately_failed());
        assert!(!LoaderError::Upstream("timeout".into())
            .kind()
            .dlq_immediately_failed());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            LoaderError::NoActiveBatch { account_id: 1001 }.code(),
            "NO_ACTIVE_BATCH"
        );
        assert_eq!(
            LoaderError::UnknownTicker { ticker: "ZZZ".into() }.code(),
            "UNKNOWN_TICKER"
        );
    }
}
