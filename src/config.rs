use crate::errors::Error;
use crate::options::MAX_SPAN;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

const DEFAULT_SCHEMA: &str = "jobboss";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_EXPIRE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_ARCHIVE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_ARCHIVE_COMPLETED_AFTER: Duration = Duration::from_secs(60 * 60 * 24);
const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_DELETE_ARCHIVED_AFTER: Duration = Duration::from_secs(60 * 60 * 24 * 7);
const DEFAULT_EXPIRE_IN: Duration = Duration::from_secs(15 * 60);

/// Configuration of a [`Boss`](crate::Boss).
///
/// Deserializable from any serde format; durations are written in
/// human-readable form such as `"500ms"`, `"15m"` or `"7days"`. Missing
/// fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BossConfig {
    /// Connection string used by [`Boss::connect`](crate::Boss::connect)
    pub database_url: Option<String>,
    /// Schema holding the job tables
    pub schema: String,
    /// Maximum size of the connection pool
    pub max_connections: u32,
    /// How often idle workers poll for new jobs
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Maximum random jitter added to each poll interval
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
    /// How often stuck active jobs are expired
    #[serde(with = "humantime_serde")]
    pub expire_check_interval: Duration,
    /// How often finished jobs are archived
    #[serde(with = "humantime_serde")]
    pub archive_interval: Duration,
    /// How long finished jobs stay in the live table
    #[serde(with = "humantime_serde")]
    pub archive_completed_after: Duration,
    /// How often old archive rows are deleted
    #[serde(with = "humantime_serde")]
    pub purge_interval: Duration,
    /// How long archived jobs are kept
    #[serde(with = "humantime_serde")]
    pub delete_archived_after: Duration,
    /// How often job counts are published, if at all
    #[serde(with = "humantime_serde::option")]
    pub monitor_states_interval: Option<Duration>,
    /// `expire_in` of jobs published without one
    #[serde(with = "humantime_serde")]
    pub default_expire_in: Duration,
    /// `retry_limit` of jobs published without one
    pub default_retry_limit: i32,
    /// Whether [`Boss::start`](crate::Boss::start) creates missing tables
    pub install_schema: bool,
}

impl Default for BossConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            schema: DEFAULT_SCHEMA.to_owned(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            expire_check_interval: DEFAULT_EXPIRE_CHECK_INTERVAL,
            archive_interval: DEFAULT_ARCHIVE_INTERVAL,
            archive_completed_after: DEFAULT_ARCHIVE_COMPLETED_AFTER,
            purge_interval: DEFAULT_PURGE_INTERVAL,
            delete_archived_after: DEFAULT_DELETE_ARCHIVED_AFTER,
            monitor_states_interval: None,
            default_expire_in: DEFAULT_EXPIRE_IN,
            default_retry_limit: 0,
            install_schema: true,
        }
    }
}

impl BossConfig {
    /// Configuration for the database at `database_url`.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: Some(database_url.into()),
            ..Self::default()
        }
    }

    /// Set the schema holding the job tables.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the maximum size of the connection pool.
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set how often idle workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set how often stuck active jobs are expired.
    pub fn expire_check_interval(mut self, interval: Duration) -> Self {
        self.expire_check_interval = interval;
        self
    }

    /// Set how often, and after how long, finished jobs are archived.
    pub fn archive(mut self, interval: Duration, completed_after: Duration) -> Self {
        self.archive_interval = interval;
        self.archive_completed_after = completed_after;
        self
    }

    /// Set how often, and after how long, archived jobs are deleted.
    pub fn purge(mut self, interval: Duration, archived_after: Duration) -> Self {
        self.purge_interval = interval;
        self.delete_archived_after = archived_after;
        self
    }

    /// Publish job counts on the event channel every `interval`.
    pub fn monitor_states(mut self, interval: Duration) -> Self {
        self.monitor_states_interval = Some(interval);
        self
    }

    /// Set the `expire_in` of jobs published without one.
    pub fn default_expire_in(mut self, expire_in: Duration) -> Self {
        self.default_expire_in = expire_in;
        self
    }

    /// Set the `retry_limit` of jobs published without one.
    pub fn default_retry_limit(mut self, retry_limit: i32) -> Self {
        self.default_retry_limit = retry_limit;
        self
    }

    /// Set whether missing tables are created on start.
    pub fn install_schema(mut self, install: bool) -> Self {
        self.install_schema = install;
        self
    }

    /// Check the configuration for values the queue cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if !is_identifier(&self.schema) {
            return Err(Error::validation(format!(
                "schema `{}` must be a lowercase SQL identifier",
                self.schema
            )));
        }
        if self.max_connections == 0 {
            return Err(Error::validation("max_connections must be at least 1"));
        }

        let intervals = [
            ("poll_interval", self.poll_interval),
            ("expire_check_interval", self.expire_check_interval),
            ("archive_interval", self.archive_interval),
            ("purge_interval", self.purge_interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(Error::validation(format!("{name} must not be zero")));
            }
        }
        if self.monitor_states_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::validation("monitor_states_interval must not be zero"));
        }

        let retentions = [
            ("archive_completed_after", self.archive_completed_after),
            ("delete_archived_after", self.delete_archived_after),
        ];
        for (name, retention) in retentions {
            if retention > MAX_SPAN {
                return Err(Error::validation(format!("{name} must not exceed 100 years")));
            }
        }

        if self.default_expire_in < Duration::from_secs(1)
            || i32::try_from(self.default_expire_in.as_secs()).is_err()
        {
            return Err(Error::validation(
                "default_expire_in must be between one second and i32::MAX seconds",
            ));
        }
        if self.default_retry_limit < 0 {
            return Err(Error::validation("default_retry_limit must not be negative"));
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_well = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    starts_well
        && name.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Serde adapters for durations written with `humantime`.
mod humantime_serde {
    use super::*;

    pub(super) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }

    pub(super) mod option {
        use super::*;

        pub(crate) fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => serializer.collect_str(&humantime::format_duration(*duration)),
                None => serializer.serialize_none(),
            }
        }

        pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|text| humantime::parse_duration(&text).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
