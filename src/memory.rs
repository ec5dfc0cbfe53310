//! An in-process [`Store`] for tests and single-process setups.
//!
//! Every operation runs under one mutex, which gives the same guarantees as
//! the PostgreSQL plans: a claim selects and activates its jobs in one step,
//! and the singleton rules are checked before each insert. State does not
//! survive the process.

use crate::errors::Error;
use crate::options::StartAfter;
use crate::schema::{
    ArchivedJob, COMPLETED_JOB_SUFFIX, CompletionData, CompletionRequest, Job, JobState,
    StateCounts, is_completion_name,
};
use crate::singleton;
use crate::storage::{ArchiveQuery, ExpireResult, NewJob, Store};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug)]
struct Tables {
    jobs: Vec<Job>,
    archive: Vec<ArchivedJob>,
    skew: chrono::Duration,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            archive: Vec::new(),
            skew: chrono::Duration::zero(),
        }
    }
}

impl Tables {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
            .checked_add_signed(self.skew)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn violates_singleton(&self, candidate: &Job) -> bool {
        self.jobs.iter().any(|job| {
            if job.name != candidate.name {
                return false;
            }
            match (&candidate.singleton_key, candidate.singleton_on) {
                (None, None) => false,
                (Some(key), None) => {
                    job.state < JobState::Complete
                        && job.singleton_on.is_none()
                        && job.singleton_key.as_ref() == Some(key)
                }
                (None, Some(on)) => {
                    job.state < JobState::Expired
                        && job.singleton_key.is_none()
                        && job.singleton_on == Some(on)
                }
                (Some(key), Some(on)) => {
                    job.state < JobState::Expired
                        && job.singleton_on == Some(on)
                        && job.singleton_key.as_ref() == Some(key)
                }
            }
        })
    }

    fn push_completion(
        &mut self,
        origin: &Job,
        response: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        if is_completion_name(&origin.name) {
            return Ok(());
        }
        let data = CompletionData {
            request: CompletionRequest {
                id: origin.id,
                name: origin.name.clone(),
                data: origin.data.clone(),
            },
            response,
            state: origin.state,
        };
        self.jobs.push(Job {
            id: Uuid::new_v4(),
            name: format!("{}{COMPLETED_JOB_SUFFIX}", origin.name),
            priority: 0,
            data: Some(serde_json::to_value(data)?),
            state: JobState::Created,
            retry_limit: 0,
            retry_count: 0,
            start_after: now,
            started_on: None,
            singleton_key: None,
            singleton_on: None,
            expire_in_seconds: 15 * 60,
            created_on: now,
            completed_on: None,
        });
        Ok(())
    }

    /// Sends a job back to `retry` when it has retries left, else to `terminal`.
    fn retry_or(job: &mut Job, terminal: JobState, now: DateTime<Utc>) {
        if job.retry_count < job.retry_limit {
            job.state = JobState::Retry;
            job.completed_on = None;
        } else {
            job.state = terminal;
            job.completed_on = Some(now);
        }
    }
}

/// [`Store`] backed by process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move this store's clock forward, so that delays, expirations and
    /// retention windows can elapse without waiting.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut tables = self.lock();
        tables.skew = tables.skew.checked_add(&by).unwrap_or(chrono::Duration::MAX);
    }

    /// The current time as seen by this store.
    pub fn now(&self) -> DateTime<Utc> {
        self.lock().now()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `at` moved by `by`, or `None` when the result is not representable.
fn shift(at: DateTime<Utc>, by: Duration, forward: bool) -> Option<DateTime<Utc>> {
    let by = chrono::Duration::from_std(by).ok()?;
    if forward {
        at.checked_add_signed(by)
    } else {
        at.checked_sub_signed(by)
    }
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

impl Store for MemoryStore {
    async fn ensure_schema(&self, _install: bool) -> Result<(), Error> {
        Ok(())
    }

    async fn insert_job(&self, new_job: &NewJob) -> Result<bool, Error> {
        let mut tables = self.lock();
        let now = tables.now();

        let start_after = match new_job.start_after {
            StartAfter::Immediately => now,
            StartAfter::Delay(delay) => shift(now, delay, true)
                .ok_or_else(|| Error::validation("start_after delay is out of range"))?,
            StartAfter::At(at) => at,
        };
        let singleton_on = new_job
            .singleton_seconds
            .map(|seconds| singleton::slot(now, seconds, new_job.singleton_offset));

        let job = Job {
            id: new_job.id,
            name: new_job.name.clone(),
            priority: new_job.priority,
            data: new_job.data.clone(),
            state: JobState::Created,
            retry_limit: new_job.retry_limit,
            retry_count: 0,
            start_after,
            started_on: None,
            singleton_key: new_job.singleton_key.clone(),
            singleton_on,
            expire_in_seconds: new_job.expire_in_seconds,
            created_on: now,
            completed_on: None,
        };

        if tables.jobs.iter().any(|existing| existing.id == job.id)
            || tables.violates_singleton(&job)
        {
            return Ok(false);
        }
        tables.jobs.push(job);
        Ok(true)
    }

    async fn fetch_next(&self, names: &[String], batch_size: usize) -> Result<Vec<Job>, Error> {
        let mut tables = self.lock();
        let now = tables.now();

        let mut eligible: Vec<usize> = tables
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| {
                job.state.is_claimable() && job.start_after < now && names.contains(&job.name)
            })
            .map(|(index, _)| index)
            .collect();
        eligible.sort_by(|&a, &b| {
            let (a, b) = (&tables.jobs[a], &tables.jobs[b]);
            b.priority
                .cmp(&a.priority)
                .then(a.created_on.cmp(&b.created_on))
                .then(a.id.cmp(&b.id))
        });
        eligible.truncate(batch_size);

        let mut claimed = Vec::with_capacity(eligible.len());
        for index in eligible {
            let job = &mut tables.jobs[index];
            if job.state == JobState::Retry {
                job.retry_count += 1;
            }
            job.state = JobState::Active;
            job.started_on = Some(now);
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, ids: &[Uuid], response: Option<Value>) -> Result<u64, Error> {
        let mut tables = self.lock();
        let now = tables.now();

        let mut finished = Vec::new();
        for job in tables.jobs.iter_mut() {
            if ids.contains(&job.id) && job.state == JobState::Active {
                job.state = JobState::Complete;
                job.completed_on = Some(now);
                finished.push(job.clone());
            }
        }
        for job in &finished {
            tables.push_completion(job, response.clone(), now)?;
        }
        Ok(count(finished.len()))
    }

    async fn fail(&self, ids: &[Uuid], response: Option<Value>) -> Result<u64, Error> {
        let mut tables = self.lock();
        let now = tables.now();

        let mut changed = Vec::new();
        for job in tables.jobs.iter_mut() {
            if ids.contains(&job.id) && job.state < JobState::Complete {
                Tables::retry_or(job, JobState::Failed, now);
                changed.push(job.clone());
            }
        }
        for job in changed.iter().filter(|job| job.state == JobState::Failed) {
            tables.push_completion(job, response.clone(), now)?;
        }
        Ok(count(changed.len()))
    }

    async fn cancel(&self, ids: &[Uuid]) -> Result<u64, Error> {
        let mut tables = self.lock();
        let now = tables.now();

        let mut cancelled = 0;
        for job in tables.jobs.iter_mut() {
            if ids.contains(&job.id) && job.state < JobState::Complete {
                job.state = JobState::Cancelled;
                job.completed_on = Some(now);
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn expire(&self) -> Result<ExpireResult, Error> {
        let mut tables = self.lock();
        let now = tables.now();

        let mut result = ExpireResult::default();
        let mut expired = Vec::new();
        for job in tables.jobs.iter_mut() {
            let Some(started_on) = job.started_on else {
                continue;
            };
            let deadline = started_on
                .checked_add_signed(chrono::Duration::seconds(i64::from(job.expire_in_seconds)));
            if job.state != JobState::Active || deadline.is_none_or(|deadline| deadline >= now) {
                continue;
            }

            Tables::retry_or(job, JobState::Expired, now);
            if job.state == JobState::Expired {
                result.expired += 1;
                expired.push(job.clone());
            } else {
                result.retried += 1;
            }
        }
        for job in &expired {
            tables.push_completion(job, None, now)?;
        }
        Ok(result)
    }

    async fn archive(&self, retention: Duration) -> Result<u64, Error> {
        let mut tables = self.lock();
        let now = tables.now();
        let cutoff = shift(now, retention, false)
            .ok_or_else(|| Error::validation("archive retention is out of range"))?;

        let (archived, kept): (Vec<Job>, Vec<Job>) =
            std::mem::take(&mut tables.jobs).into_iter().partition(|job| {
                let finished_long_ago = job
                    .completed_on
                    .is_some_and(|completed_on| completed_on < cutoff);
                let stale_completion = job.state == JobState::Created
                    && is_completion_name(&job.name)
                    && job.created_on < cutoff;
                finished_long_ago || stale_completion
            });
        tables.jobs = kept;

        let moved = count(archived.len());
        tables
            .archive
            .extend(archived.into_iter().map(|job| ArchivedJob {
                job,
                archived_on: now,
            }));
        Ok(moved)
    }

    async fn purge(&self, retention: Duration) -> Result<u64, Error> {
        let mut tables = self.lock();
        let now = tables.now();
        let cutoff = shift(now, retention, false)
            .ok_or_else(|| Error::validation("purge retention is out of range"))?;

        let before = tables.archive.len();
        tables
            .archive
            .retain(|archived| archived.archived_on >= cutoff);
        Ok(count(before - tables.archive.len()))
    }

    async fn delete_queue(&self, name: &str) -> Result<u64, Error> {
        let mut tables = self.lock();
        let before = tables.jobs.len();
        tables
            .jobs
            .retain(|job| !(job.name == name && job.state.is_claimable()));
        Ok(count(before - tables.jobs.len()))
    }

    async fn delete_all_queues(&self) -> Result<u64, Error> {
        let mut tables = self.lock();
        let before = tables.jobs.len();
        tables.jobs.retain(|job| !job.state.is_claimable());
        Ok(count(before - tables.jobs.len()))
    }

    async fn count_states(&self) -> Result<StateCounts, Error> {
        let tables = self.lock();

        let mut counts = StateCounts::default();
        for job in tables.jobs.iter().filter(|job| !job.is_completion()) {
            *counts.all.entry(job.state).or_default() += 1;
            *counts
                .queues
                .entry(job.name.clone())
                .or_default()
                .entry(job.state)
                .or_default() += 1;
            counts.total += 1;
        }
        Ok(counts)
    }

    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, Error> {
        Ok(self.lock().jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn get_archived_job_by_id(&self, id: Uuid) -> Result<Option<ArchivedJob>, Error> {
        Ok(self
            .lock()
            .archive
            .iter()
            .rev()
            .find(|archived| archived.job.id == id)
            .cloned())
    }

    async fn get_archived_jobs(&self, query: ArchiveQuery) -> Result<Vec<ArchivedJob>, Error> {
        let (queue, limit) = match query {
            ArchiveQuery::All => (None, None),
            ArchiveQuery::Filter { queue, limit } => (queue, limit),
        };
        let limit = limit
            .and_then(|limit| usize::try_from(limit).ok())
            .unwrap_or(usize::MAX);

        Ok(self
            .lock()
            .archive
            .iter()
            .rev()
            .filter(|archived| queue.as_ref().is_none_or(|queue| &archived.job.name == queue))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn archived_job_count(&self) -> Result<i64, Error> {
        Ok(i64::try_from(self.lock().archive.len()).unwrap_or(i64::MAX))
    }
}

/// A [`MemoryStore`] whose claims and expire sweeps can be made to fail.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct FlakyStore {
    pub(crate) inner: MemoryStore,
    failing_fetches: Arc<std::sync::atomic::AtomicUsize>,
    failing_expires: Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
impl FlakyStore {
    /// Fail the next `times` calls to `fetch_next`.
    pub(crate) fn fail_fetches(&self, times: usize) {
        self.failing_fetches.store(times, std::sync::atomic::Ordering::SeqCst);
    }

    /// Fail the next `times` calls to `expire`.
    pub(crate) fn fail_expires(&self, times: usize) {
        self.failing_expires.store(times, std::sync::atomic::Ordering::SeqCst);
    }

    fn trip(counter: &std::sync::atomic::AtomicUsize) -> Result<(), Error> {
        use std::sync::atomic::Ordering::SeqCst;
        match counter.fetch_update(SeqCst, SeqCst, |left| left.checked_sub(1)) {
            Ok(_) => Err(Error::Database(sqlx::Error::PoolTimedOut)),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
impl Store for FlakyStore {
    async fn ensure_schema(&self, install: bool) -> Result<(), Error> {
        self.inner.ensure_schema(install).await
    }

    async fn insert_job(&self, job: &NewJob) -> Result<bool, Error> {
        self.inner.insert_job(job).await
    }

    async fn fetch_next(&self, names: &[String], batch_size: usize) -> Result<Vec<Job>, Error> {
        Self::trip(&self.failing_fetches)?;
        self.inner.fetch_next(names, batch_size).await
    }

    async fn complete(&self, ids: &[Uuid], response: Option<Value>) -> Result<u64, Error> {
        self.inner.complete(ids, response).await
    }

    async fn fail(&self, ids: &[Uuid], response: Option<Value>) -> Result<u64, Error> {
        self.inner.fail(ids, response).await
    }

    async fn cancel(&self, ids: &[Uuid]) -> Result<u64, Error> {
        self.inner.cancel(ids).await
    }

    async fn expire(&self) -> Result<ExpireResult, Error> {
        Self::trip(&self.failing_expires)?;
        self.inner.expire().await
    }

    async fn archive(&self, retention: Duration) -> Result<u64, Error> {
        self.inner.archive(retention).await
    }

    async fn purge(&self, retention: Duration) -> Result<u64, Error> {
        self.inner.purge(retention).await
    }

    async fn delete_queue(&self, name: &str) -> Result<u64, Error> {
        self.inner.delete_queue(name).await
    }

    async fn delete_all_queues(&self) -> Result<u64, Error> {
        self.inner.delete_all_queues().await
    }

    async fn count_states(&self) -> Result<StateCounts, Error> {
        self.inner.count_states().await
    }

    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, Error> {
        self.inner.get_job_by_id(id).await
    }

    async fn get_archived_job_by_id(&self, id: Uuid) -> Result<Option<ArchivedJob>, Error> {
        self.inner.get_archived_job_by_id(id).await
    }

    async fn get_archived_jobs(&self, query: ArchiveQuery) -> Result<Vec<ArchivedJob>, Error> {
        self.inner.get_archived_jobs(query).await
    }

    async fn archived_job_count(&self) -> Result<i64, Error> {
        self.inner.archived_job_count().await
    }
}
