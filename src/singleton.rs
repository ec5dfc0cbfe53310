//! Singleton window ("slot") computation and the throttle/debounce policy.
//!
//! Time is cut into fixed-width buckets of `seconds`, optionally shifted by
//! `offset`. A job with a singleton window is inserted into the bucket that
//! contains "now"; the store's uniqueness constraint rejects the insert when
//! the bucket is already taken. Debounce gets exactly one more attempt in the
//! following bucket.

use crate::options::StartAfter;
use crate::storage::NewJob;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::time::Duration;

/// The bucket that `now` falls into for a window of `seconds` shifted by `offset`.
///
/// `epoch + seconds * floor((now + offset) / seconds)`, truncated to whole
/// seconds the same way the PostgreSQL plan does.
pub fn slot(now: DateTime<Utc>, seconds: i32, offset: i32) -> NaiveDateTime {
    let seconds = i64::from(seconds.max(1));
    let shifted = now.timestamp() + i64::from(offset);
    let bucket = shifted.div_euclid(seconds) * seconds;
    DateTime::from_timestamp(bucket, 0)
        .unwrap_or_default()
        .naive_utc()
}

/// The inserts to try, in order, for one publish call.
///
/// Throttled jobs and jobs without a window get a single attempt. Debounced
/// jobs get a second attempt that starts one window later and lands in the
/// next bucket.
pub(crate) fn attempts(job: NewJob, next_slot: bool) -> Vec<NewJob> {
    let window = match job.singleton_seconds {
        Some(seconds) if next_slot => seconds,
        _ => return vec![job],
    };

    let next = NewJob {
        start_after: StartAfter::Delay(Duration::from_secs(u64::from(window.unsigned_abs()))),
        singleton_offset: window,
        ..job.clone()
    };
    vec![job, next]
}
