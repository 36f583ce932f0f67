use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a batched migration.
///
/// ```text
/// paused <-> active -> finished
///              |  ^
///              v  | (retry)
///            failed -> finalizing -> finalized
/// ```
///
/// `paused` and `active` may also move straight to `finalizing`, and a
/// batch running out of attempts fails a `paused` migration as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum MigrationStatus {
    /// Registered, but workers leave it alone.
    Paused = 0,
    /// Workers pick up its due batches.
    Active = 1,
    /// Every batch succeeded.
    Finished = 3,
    /// A batch ran out of attempts.
    Failed = 4,
    /// The finalizer is draining the remaining batches.
    Finalizing = 5,
    /// The finalizer drained every batch.
    Finalized = 6,
}

impl MigrationStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [MigrationStatus; 6] = [
        Self::Paused,
        Self::Active,
        Self::Finished,
        Self::Failed,
        Self::Finalizing,
        Self::Finalized,
    ];

    /// Whether the migration's work is complete.
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Finished | Self::Finalized)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: MigrationStatus) -> bool {
        use MigrationStatus::*;

        matches!(
            (self, next),
            (Paused, Active)
                | (Active, Paused)
                | (Active, Finished)
                | (Active | Paused, Failed)
                | (Failed, Active)
                | (Paused | Active | Failed, Finalizing)
                | (Finalizing, Finalized)
                | (Finalizing, Failed)
        )
    }

    /// Every status that may legally move to `next`.
    pub fn sources_of(next: MigrationStatus) -> Vec<MigrationStatus> {
        Self::ALL
            .into_iter()
            .filter(|status| status.can_transition_to(next))
            .collect()
    }

    /// Snake-case name used in logs, messages and the CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paused => "paused",
            Self::Active => "active",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Finalizing => "finalizing",
            Self::Finalized => "finalized",
        }
    }

    pub(crate) fn as_i16(self) -> i16 {
        self as i16
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown migration status `{s}`"))
    }
}

/// Outcome of a single batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum JobStatus {
    /// Waiting for its `run_at` time.
    Pending = 0,
    /// The last attempt failed.
    Failed = 2,
    /// Done.
    Succeeded = 3,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 3] = [Self::Pending, Self::Failed, Self::Succeeded];

    /// Snake-case name used in logs and the CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Succeeded => "succeeded",
        }
    }

    pub(crate) fn as_i16(self) -> i16 {
        self as i16
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown batch status `{s}`"))
    }
}
