use crate::errors::Error;
use crate::options::StartAfter;
use crate::plans;
use crate::schema::{ArchivedJob, Job, JobState, StateCounts};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// A job ready to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Id assigned by the publisher
    pub id: Uuid,
    /// Queue name
    pub name: String,
    /// JSON payload
    pub data: Option<Value>,
    /// Higher values are claimed first
    pub priority: i32,
    /// Maximum number of automatic retries
    pub retry_limit: i32,
    /// When the job becomes claimable
    pub start_after: StartAfter,
    /// Seconds an active job may run before it is considered stuck
    pub expire_in_seconds: i32,
    /// De-duplication key
    pub singleton_key: Option<String>,
    /// Width of the de-duplication window in seconds
    pub singleton_seconds: Option<i32>,
    /// Shift of the de-duplication window in seconds
    pub singleton_offset: i32,
}

/// Outcome of `complete`, `fail` and `cancel`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Number of ids passed in
    pub requested: u64,
    /// Number of jobs whose state changed
    pub updated: u64,
}

/// Outcome of an expire sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpireResult {
    /// Jobs sent back to `retry`
    pub retried: u64,
    /// Jobs that ended in `expired`
    pub expired: u64,
}

/// Query options for [`Store::get_archived_jobs`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ArchiveQuery {
    /// Every archived job, newest first
    #[default]
    All,
    /// Archived jobs of one queue and/or a limited number of rows
    Filter {
        /// Only jobs of this queue
        queue: Option<String>,
        /// At most this many rows
        limit: Option<i64>,
    },
}

/// The operations the queue needs from a backing store.
///
/// Every method is a single atomic operation. In particular
/// [`fetch_next`](Store::fetch_next) must select, lock and activate the
/// returned jobs as one unit so that concurrent callers never receive the
/// same job.
pub trait Store: Clone + Send + Sync + 'static {
    /// Verify the schema exists at the expected version, creating it first when
    /// `install` is set.
    fn ensure_schema(&self, install: bool) -> impl Future<Output = Result<(), Error>> + Send;

    /// Insert a job. Returns `false` when a singleton constraint rejected it.
    fn insert_job(&self, job: &NewJob) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Claim up to `batch_size` eligible jobs from the given queues.
    fn fetch_next(
        &self,
        names: &[String],
        batch_size: usize,
    ) -> impl Future<Output = Result<Vec<Job>, Error>> + Send;

    /// Complete active jobs. Returns how many changed state.
    fn complete(
        &self,
        ids: &[Uuid],
        response: Option<Value>,
    ) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Fail unfinished jobs. Returns how many changed state.
    fn fail(
        &self,
        ids: &[Uuid],
        response: Option<Value>,
    ) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Cancel unfinished jobs. Returns how many changed state.
    fn cancel(&self, ids: &[Uuid]) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Reclaim active jobs that ran longer than their `expire_in`.
    fn expire(&self) -> impl Future<Output = Result<ExpireResult, Error>> + Send;

    /// Move jobs finished longer than `retention` ago into the archive.
    fn archive(&self, retention: Duration) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Delete archive rows archived longer than `retention` ago.
    fn purge(&self, retention: Duration) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Delete the queued jobs of one queue.
    fn delete_queue(&self, name: &str) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Delete the queued jobs of every queue.
    fn delete_all_queues(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Count jobs per queue and state.
    fn count_states(&self) -> impl Future<Output = Result<StateCounts, Error>> + Send;

    /// Load a job from the live table.
    fn get_job_by_id(&self, id: Uuid) -> impl Future<Output = Result<Option<Job>, Error>> + Send;

    /// Load a job from the archive.
    fn get_archived_job_by_id(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<ArchivedJob>, Error>> + Send;

    /// List archived jobs, newest first.
    fn get_archived_jobs(
        &self,
        query: ArchiveQuery,
    ) -> impl Future<Output = Result<Vec<ArchivedJob>, Error>> + Send;

    /// Count archived jobs.
    fn archived_job_count(&self) -> impl Future<Output = Result<i64, Error>> + Send;
}

/// PostgreSQL implementation of [`Store`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    schema: Arc<str>,
}

impl PgStore {
    /// Wrap an existing pool. `schema` must be a plain SQL identifier.
    pub fn new(pool: PgPool, schema: &str) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Open a pool of at most `max_connections` connections to `database_url`.
    pub async fn connect(
        database_url: &str,
        schema: &str,
        max_connections: u32,
    ) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, schema))
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The schema holding the job tables.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    async fn installed_version(&self) -> Result<Option<i32>, Error> {
        let table = sqlx::query_scalar::<_, Option<String>>(&plans::version_table_exists(
            &self.schema,
        ))
        .fetch_one(&self.pool)
        .await?;
        if table.is_none() {
            return Ok(None);
        }

        let version = sqlx::query_scalar::<_, i32>(&plans::get_version(&self.schema))
            .fetch_optional(&self.pool)
            .await?;
        Ok(version)
    }

    async fn install(&self) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&plans::lock_install(&self.schema))
            .execute(&mut *tx)
            .await?;

        // Another process may have finished installing while we waited for the lock.
        let table = sqlx::query_scalar::<_, Option<String>>(&plans::version_table_exists(
            &self.schema,
        ))
        .fetch_one(&mut *tx)
        .await?;
        if table.is_some() {
            tx.rollback().await?;
            return Ok(());
        }

        for statement in plans::create(&self.schema) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        info!(schema = %self.schema, version = plans::SCHEMA_VERSION, "Installed job schema");
        Ok(())
    }

    /// Record that a maintenance sweep ran.
    pub(crate) async fn touch_maintenance_time(&self) -> Result<(), Error> {
        sqlx::query(&plans::set_maintenance_time(&self.schema))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn execute_with_ids(
        &self,
        sql: &str,
        ids: &[Uuid],
        response: Option<Value>,
    ) -> Result<u64, Error> {
        let updated = sqlx::query_scalar::<_, i64>(sql)
            .bind(ids)
            .bind(response)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(updated).unwrap_or_default())
    }
}

impl Store for PgStore {
    #[instrument(name = "jobboss.ensure_schema", skip(self), fields(schema = %self.schema))]
    async fn ensure_schema(&self, install: bool) -> Result<(), Error> {
        let version = match self.installed_version().await? {
            Some(version) => version,
            None if install => {
                self.install().await?;
                return Ok(());
            }
            None => {
                return Err(Error::NotInstalled {
                    schema: self.schema.to_string(),
                });
            }
        };

        if version != plans::SCHEMA_VERSION {
            return Err(Error::VersionMismatch {
                schema: self.schema.to_string(),
                found: version,
                expected: plans::SCHEMA_VERSION,
            });
        }
        debug!(version, "Job schema is up to date");
        Ok(())
    }

    #[instrument(name = "jobboss.insert_job", skip(self, job), fields(job.id = %job.id, job.name = %job.name))]
    async fn insert_job(&self, job: &NewJob) -> Result<bool, Error> {
        let result = sqlx::query(&plans::insert_job(&self.schema))
            .bind(job.id)
            .bind(&job.name)
            .bind(job.priority)
            .bind(job.retry_limit)
            .bind(job.start_after.at())
            .bind(job.start_after.delay_seconds())
            .bind(job.expire_in_seconds)
            .bind(&job.data)
            .bind(&job.singleton_key)
            .bind(job.singleton_seconds)
            .bind(job.singleton_offset)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fetch_next(&self, names: &[String], batch_size: usize) -> Result<Vec<Job>, Error> {
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let jobs = sqlx::query_as::<_, Job>(&plans::fetch_next_job(&self.schema))
            .bind(names)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn complete(&self, ids: &[Uuid], response: Option<Value>) -> Result<u64, Error> {
        self.execute_with_ids(&plans::complete_jobs(&self.schema), ids, response)
            .await
    }

    async fn fail(&self, ids: &[Uuid], response: Option<Value>) -> Result<u64, Error> {
        self.execute_with_ids(&plans::fail_jobs(&self.schema), ids, response)
            .await
    }

    async fn cancel(&self, ids: &[Uuid]) -> Result<u64, Error> {
        let result = sqlx::query(&plans::cancel_jobs(&self.schema))
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(name = "jobboss.expire", skip(self))]
    async fn expire(&self) -> Result<ExpireResult, Error> {
        let row = sqlx::query(&plans::expire(&self.schema))
            .fetch_one(&self.pool)
            .await?;
        let retried: i64 = row.try_get("retried")?;
        let expired: i64 = row.try_get("expired")?;
        self.touch_maintenance_time().await?;
        Ok(ExpireResult {
            retried: u64::try_from(retried).unwrap_or_default(),
            expired: u64::try_from(expired).unwrap_or_default(),
        })
    }

    #[instrument(name = "jobboss.archive", skip(self))]
    async fn archive(&self, retention: Duration) -> Result<u64, Error> {
        let result = sqlx::query(&plans::archive(&self.schema))
            .bind(retention.as_secs_f64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(name = "jobboss.purge", skip(self))]
    async fn purge(&self, retention: Duration) -> Result<u64, Error> {
        let result = sqlx::query(&plans::purge(&self.schema))
            .bind(retention.as_secs_f64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_queue(&self, name: &str) -> Result<u64, Error> {
        let result = sqlx::query(&plans::delete_queue(&self.schema))
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_all_queues(&self) -> Result<u64, Error> {
        let result = sqlx::query(&plans::delete_all_queues(&self.schema))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_states(&self) -> Result<StateCounts, Error> {
        let rows = sqlx::query(&plans::count_states(&self.schema))
            .fetch_all(&self.pool)
            .await?;

        let mut counts = StateCounts::default();
        for row in rows {
            let name: Option<String> = row.try_get("name")?;
            let state: Option<String> = row.try_get("state")?;
            let size: i64 = row.try_get("size")?;
            let state = state
                .map(|state| state.parse::<JobState>())
                .transpose()
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

            match (name, state) {
                (None, None) => counts.total = size,
                (None, Some(state)) => {
                    counts.all.insert(state, size);
                }
                (Some(name), Some(state)) => {
                    counts.queues.entry(name).or_default().insert(state, size);
                }
                (Some(_), None) => {}
            }
        }
        Ok(counts)
    }

    async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, Error> {
        let job = sqlx::query_as::<_, Job>(&plans::get_job_by_id(&self.schema))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn get_archived_job_by_id(&self, id: Uuid) -> Result<Option<ArchivedJob>, Error> {
        let job = sqlx::query_as::<_, ArchivedJob>(&plans::get_archived_job_by_id(&self.schema))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn get_archived_jobs(&self, query: ArchiveQuery) -> Result<Vec<ArchivedJob>, Error> {
        let (queue, limit) = match query {
            ArchiveQuery::All => (None, None),
            ArchiveQuery::Filter { queue, limit } => (queue, limit),
        };

        let jobs = sqlx::query_as::<_, ArchivedJob>(&plans::get_archived_jobs(&self.schema))
            .bind(queue)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(jobs)
    }

    async fn archived_job_count(&self) -> Result<i64, Error> {
        let count = sqlx::query_scalar::<_, i64>(&plans::archived_job_count(&self.schema))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
