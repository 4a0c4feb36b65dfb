//! Lifecycle status machines for batches, EOD runs, and DLQ entries.
//!
//! Transitions are enforced at the type level: callers ask `can_transition`
//! before persisting a status change, and the DB layer refuses the update if
//! the current row no longer matches the expected prior state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of an account batch (blue/green snapshot load).
///
/// ```text
///            promote            supersede
/// STAGING ──────────► ACTIVE ─────────────► ARCHIVED
///    │                  │                      │
///    │ failure          │ rollback             │ re-activate (rollback)
///    ▼                  ▼                      ▼
///  FAILED          ROLLED_BACK              ACTIVE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Staging,
    Active,
    Archived,
    Failed,
    RolledBack,
}

#[derive(Debug, Error)]
#[error("invalid status: {0}")]
pub struct ParseStatusError(pub String);

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Staging => "STAGING",
            BatchStatus::Active => "ACTIVE",
            BatchStatus::Archived => "ARCHIVED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseStatusError> {
        match s {
            "STAGING" => Ok(BatchStatus::Staging),
            "ACTIVE" => Ok(BatchStatus::Active),
            "ARCHIVED" => Ok(BatchStatus::Archived),
            "FAILED" => Ok(BatchStatus::Failed),
            "ROLLED_BACK" => Ok(BatchStatus::RolledBack),
            other => Err(ParseStatusError(other.to_string())),
        }
    }

    /// Legal transitions only; everything else must be rejected before the
    /// UPDATE is issued.
    pub fn can_transition(&self, to: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, to),
            (Staging, Active)
                | (Staging, Failed)
                | (Active, Archived)
                | (Active, RolledBack)
                | (Archived, Active)
        )
    }

    /// Terminal states never leave the batch table again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::RolledBack)
    }
}

/// Lifecycle of one EOD run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    /// Duplicate snapshot detected; no batch was created.
    CompletedNoop,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::CompletedNoop => "COMPLETED_NOOP",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseStatusError> {
        match s {
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "COMPLETED_NOOP" => Ok(RunStatus::CompletedNoop),
            "FAILED" => Ok(RunStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Lifecycle of a dead-letter entry.
///
/// PENDING entries with `next_retry_at <= now` are claimed by the replayer;
/// after `max_retries` exhausted attempts the entry is FAILED and an alert is
/// raised. PROCESSED entries are kept for the retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DlqStatus {
    Pending,
    Processed,
    Failed,
}

impl DlqStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqStatus::Pending => "PENDING",
            DlqStatus::Processed => "PROCESSED",
            DlqStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ParseStatusError> {
        match s {
            "PENDING" => Ok(DlqStatus::Pending),
            "PROCESSED" => Ok(DlqStatus::Processed),
            "FAILED" => Ok(DlqStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}
