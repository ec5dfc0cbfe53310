//! Row types for the job and archive tables.
//!
//! These are shared by every [`Store`](crate::Store) implementation, so the
//! PostgreSQL adapter decodes straight into them and the in-memory adapter
//! keeps them as its table rows.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Separator between a queue name and the state marker of derived jobs.
pub const STATE_JOB_DELIMITER: &str = "__state__";

/// Suffix appended to a queue name to form its completion stream.
pub const COMPLETED_JOB_SUFFIX: &str = "__state__complete";

/// Name of the completion stream for `name`.
pub fn completion_name(name: &str) -> String {
    format!("{name}{COMPLETED_JOB_SUFFIX}")
}

/// Whether `name` belongs to a derived (completion) stream.
pub fn is_completion_name(name: &str) -> bool {
    name.contains(STATE_JOB_DELIMITER)
}

/// Lifecycle state of a job.
///
/// Variants are declared in the same order as the database enum, so the
/// derived ordering matches the comparisons used by the queries: everything
/// below [`JobState::Active`] is waiting to be claimed, everything above it is
/// finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Published and waiting for its first claim.
    Created,
    /// Failed or expired with retries left, waiting to be claimed again.
    Retry,
    /// Claimed by a worker.
    Active,
    /// Finished successfully.
    Complete,
    /// Stuck in `active` for longer than `expire_in`, with no retries left.
    Expired,
    /// Cancelled before finishing.
    Cancelled,
    /// Failed with no retries left.
    Failed,
}

impl JobState {
    /// All states, in database order.
    pub const ALL: [Self; 7] = [
        Self::Created,
        Self::Retry,
        Self::Active,
        Self::Complete,
        Self::Expired,
        Self::Cancelled,
        Self::Failed,
    ];

    /// The label stored in the database.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Retry => "retry",
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    /// Whether a job in this state can still be claimed.
    pub fn is_claimable(self) -> bool {
        self < Self::Active
    }

    /// Whether this state ends the job's lifecycle.
    pub fn is_finished(self) -> bool {
        self > Self::Active
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state label that is not part of [`JobState`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown job state `{0}`")]
pub struct UnknownJobState(pub String);

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownJobState(s.to_owned()))
    }
}

impl TryFrom<String> for JobState {
    type Error = UnknownJobState;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Represents a job record in the live table
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned when the job is published
    pub id: Uuid,
    /// Queue name
    pub name: String,
    /// Higher values are claimed first
    pub priority: i32,
    /// JSON payload
    pub data: Option<Value>,
    /// Current lifecycle state
    #[sqlx(try_from = "String")]
    pub state: JobState,
    /// Maximum number of automatic retries
    pub retry_limit: i32,
    /// Number of retries consumed so far
    pub retry_count: i32,
    /// Earliest instant the job can be claimed
    pub start_after: DateTime<Utc>,
    /// When the job was last claimed
    pub started_on: Option<DateTime<Utc>>,
    /// De-duplication key, scoped to `name`
    pub singleton_key: Option<String>,
    /// De-duplication time bucket
    pub singleton_on: Option<NaiveDateTime>,
    /// Seconds an active job may run before the expire sweep reclaims it
    pub expire_in_seconds: i32,
    /// When the job was published
    pub created_on: DateTime<Utc>,
    /// When the job reached a finished state
    pub completed_on: Option<DateTime<Utc>>,
}

impl Job {
    /// Deserialize the payload into `T`, treating a missing payload as `null`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone().unwrap_or(Value::Null))
    }

    /// How long the job may stay active.
    pub fn expire_in(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.expire_in_seconds).unwrap_or_default())
    }

    /// Whether this job is a completion record of another job.
    pub fn is_completion(&self) -> bool {
        is_completion_name(&self.name)
    }

    /// The typed payload of a completion record, or `None` for ordinary jobs.
    pub fn completion(&self) -> Option<Result<CompletionData, serde_json::Error>> {
        self.is_completion().then(|| self.data_as())
    }
}

/// Represents an archived job record
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ArchivedJob {
    /// The job as it was when it left the live table
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub job: Job,
    /// Timestamp when the job was archived
    pub archived_on: DateTime<Utc>,
}

/// Payload of a completion record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionData {
    /// The job that finished
    pub request: CompletionRequest,
    /// Data passed to `complete` or `fail`, `null` for expirations
    pub response: Option<Value>,
    /// State the origin job ended in
    pub state: JobState,
}

/// The origin job as captured in a completion record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Id of the origin job
    pub id: Uuid,
    /// Queue of the origin job
    pub name: String,
    /// Payload of the origin job
    pub data: Option<Value>,
}

/// Job counts per state, excluding completion records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    /// Counts across every queue
    pub all: BTreeMap<JobState, i64>,
    /// Counts per queue
    pub queues: BTreeMap<String, BTreeMap<JobState, i64>>,
    /// Number of jobs across every queue and state
    pub total: i64,
}

impl StateCounts {
    /// Count of `state` in `queue`, zero when absent.
    pub fn queue(&self, queue: &str, state: JobState) -> i64 {
        self.queues
            .get(queue)
            .and_then(|states| states.get(&state))
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered_like_the_database_enum() {
        assert!(JobState::Created < JobState::Retry);
        assert!(JobState::Retry < JobState::Active);
        assert!(JobState::Active < JobState::Complete);
        assert!(JobState::Complete < JobState::Expired);
        assert!(JobState::Expired < JobState::Cancelled);
        assert!(JobState::Cancelled < JobState::Failed);

        assert!(JobState::Retry.is_claimable());
        assert!(!JobState::Active.is_claimable());
        assert!(!JobState::Active.is_finished());
        assert!(JobState::Cancelled.is_finished());
    }

    #[test]
    fn states_parse_from_their_labels() {
        for state in JobState::ALL {
            assert_eq!(state.to_string().parse::<JobState>().ok(), Some(state));
        }
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn completion_names_carry_the_delimiter() {
        assert_eq!(completion_name("email"), "email__state__complete");
        assert!(is_completion_name(&completion_name("email")));
        assert!(!is_completion_name("email_state"));
    }
}
