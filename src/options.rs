//! Per-operation option structures.
//!
//! Every public operation takes exactly one options value, built with the
//! chained setters below and validated before anything reaches the store.

use crate::errors::Error;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Longest start delay or retention accepted, roughly a century.
pub(crate) const MAX_SPAN: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// When a published job becomes eligible for claiming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartAfter {
    /// As soon as it is inserted
    #[default]
    Immediately,
    /// After a delay measured from insertion, using the store's clock
    Delay(Duration),
    /// At an absolute instant
    At(DateTime<Utc>),
}

impl StartAfter {
    /// The delay in seconds, zero for immediate or absolute starts.
    pub(crate) fn delay_seconds(&self) -> f64 {
        match self {
            Self::Delay(delay) => delay.as_secs_f64(),
            Self::Immediately | Self::At(_) => 0.0,
        }
    }

    /// The absolute start, if one was requested.
    pub(crate) fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::At(at) => Some(*at),
            Self::Immediately | Self::Delay(_) => None,
        }
    }
}

/// Options for [`Boss::publish`](crate::Boss::publish).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub(crate) priority: i32,
    pub(crate) start_after: StartAfter,
    pub(crate) retry_limit: Option<i32>,
    pub(crate) expire_in: Option<Duration>,
    pub(crate) singleton_key: Option<String>,
    pub(crate) singleton_seconds: Option<u64>,
    pub(crate) singleton_offset: u64,
    pub(crate) singleton_next_slot: bool,
}

impl PublishOptions {
    /// Set the priority. Higher values are claimed first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set when the job becomes eligible for claiming.
    pub fn start_after(mut self, start_after: StartAfter) -> Self {
        self.start_after = start_after;
        self
    }

    /// Delay the job by `delay` from now.
    pub fn start_in(self, delay: Duration) -> Self {
        self.start_after(StartAfter::Delay(delay))
    }

    /// Set how many times the job is retried after failing or expiring.
    ///
    /// Defaults to the configured `default_retry_limit`.
    pub fn retry_limit(mut self, retry_limit: i32) -> Self {
        self.retry_limit = Some(retry_limit);
        self
    }

    /// Set how long the job may stay active before the expire sweep reclaims it.
    ///
    /// Defaults to the configured `default_expire_in`.
    pub fn expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = Some(expire_in);
        self
    }

    /// Only allow one unfinished job per key in this queue.
    ///
    /// Combined with a singleton window, allows one job per key per window.
    pub fn singleton_key(mut self, key: impl Into<String>) -> Self {
        self.singleton_key = Some(key.into());
        self
    }

    /// Only allow one job per window of `seconds`.
    pub fn singleton_seconds(mut self, seconds: u64) -> Self {
        self.singleton_seconds = Some(seconds);
        self
    }

    /// Only allow one job per window of `minutes`.
    pub fn singleton_minutes(self, minutes: u64) -> Self {
        self.singleton_seconds(minutes.saturating_mul(60))
    }

    /// Only allow one job per window of `hours`.
    pub fn singleton_hours(self, hours: u64) -> Self {
        self.singleton_seconds(hours.saturating_mul(60 * 60))
    }

    /// Only allow one job per window of `days`.
    pub fn singleton_days(self, days: u64) -> Self {
        self.singleton_seconds(days.saturating_mul(60 * 60 * 24))
    }

    /// Shift the singleton windows by `seconds`.
    pub fn singleton_offset(mut self, seconds: u64) -> Self {
        self.singleton_offset = seconds;
        self
    }

    /// On a singleton collision, schedule the job in the next window (debounce)
    /// instead of dropping it (throttle).
    pub fn singleton_next_slot(mut self, next_slot: bool) -> Self {
        self.singleton_next_slot = next_slot;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if let Some(retry_limit) = self.retry_limit {
            if retry_limit < 0 {
                return Err(Error::validation("retry_limit must not be negative"));
            }
        }
        if matches!(self.start_after, StartAfter::Delay(delay) if delay > MAX_SPAN) {
            return Err(Error::validation("start_after delay must not exceed 100 years"));
        }
        if let Some(expire_in) = self.expire_in {
            if expire_in < Duration::from_secs(1) {
                return Err(Error::validation("expire_in must be at least one second"));
            }
            if i32::try_from(expire_in.as_secs()).is_err() {
                return Err(Error::validation("expire_in is too large"));
            }
        }
        if let Some(seconds) = self.singleton_seconds {
            if seconds == 0 || i32::try_from(seconds).is_err() {
                return Err(Error::validation(
                    "singleton window must be between one second and i32::MAX seconds",
                ));
            }
        }
        if i32::try_from(self.singleton_offset).is_err() {
            return Err(Error::validation("singleton_offset is too large"));
        }
        if matches!(&self.singleton_key, Some(key) if key.is_empty()) {
            return Err(Error::validation("singleton_key must not be empty"));
        }
        if self.singleton_next_slot && self.singleton_seconds.is_none() {
            return Err(Error::validation(
                "singleton_next_slot requires a singleton window",
            ));
        }
        Ok(())
    }
}

/// Options for [`Boss::subscribe`](crate::Boss::subscribe) and
/// [`Boss::subscribe_batch`](crate::Boss::subscribe_batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub(crate) team_size: usize,
    pub(crate) batch_size: usize,
    pub(crate) poll_interval: Option<Duration>,
    pub(crate) jitter: Option<Duration>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            team_size: 1,
            batch_size: 1,
            poll_interval: None,
            jitter: None,
        }
    }
}

impl SubscribeOptions {
    /// Number of concurrent single-job handlers.
    pub fn team_size(mut self, team_size: usize) -> Self {
        self.team_size = team_size;
        self
    }

    /// Number of jobs handed to each batch handler invocation.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set how often the worker polls for new jobs.
    ///
    /// Defaults to the configured `poll_interval`.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    /// Set the maximum random jitter added to each poll interval.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub(crate) fn validate_team(&self) -> Result<(), Error> {
        if self.team_size == 0 {
            return Err(Error::validation("team_size must be at least 1"));
        }
        if self.batch_size != 1 {
            return Err(Error::validation(
                "batch_size is only supported by subscribe_batch",
            ));
        }
        self.validate_interval()
    }

    pub(crate) fn validate_batch(&self) -> Result<(), Error> {
        if self.batch_size == 0 {
            return Err(Error::validation("batch_size must be at least 1"));
        }
        if self.team_size != 1 {
            return Err(Error::validation("team_size is only supported by subscribe"));
        }
        if i32::try_from(self.batch_size).is_err() {
            return Err(Error::validation("batch_size is too large"));
        }
        self.validate_interval()
    }

    fn validate_interval(&self) -> Result<(), Error> {
        if self.poll_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::validation("poll_interval must not be zero"));
        }
        Ok(())
    }
}
