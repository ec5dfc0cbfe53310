use crate::background_job::BackgroundJob;
use crate::config::BossConfig;
use crate::errors::Error;
use crate::events::{Event, Events};
use crate::maintenance;
use crate::options::{PublishOptions, SubscribeOptions};
use crate::schema::{self, ArchivedJob, Job, StateCounts};
use crate::singleton;
use crate::storage::{ArchiveQuery, ExpireResult, NewJob, PgStore, Store, UpdateResult};
use crate::worker::{BatchHandler, Handler, JobHandler, Worker, WorkerGroup};
use futures_util::FutureExt;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

type Subscriptions = HashMap<String, Vec<WorkerGroup>>;

/// The queue: publishes jobs, runs subscriptions and drives maintenance.
///
/// Cloning a `Boss` is cheap; clones share the store, the subscriptions and
/// the event channel.
#[derive(Clone)]
pub struct Boss<S: Store = PgStore> {
    store: S,
    config: Arc<BossConfig>,
    events: Events,
    subscriptions: Arc<Mutex<Subscriptions>>,
    maintenance: Arc<Mutex<Option<WorkerGroup>>>,
}

impl<S: Store + fmt::Debug> fmt::Debug for Boss<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues = lock(&self.subscriptions).keys().cloned().collect::<Vec<_>>();
        f.debug_struct("Boss")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("subscriptions", &queues)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Boss<PgStore> {
    /// Connect to the database named by `config.database_url`.
    ///
    /// Nothing is installed or checked until [`start`](Self::start).
    pub async fn connect(config: BossConfig) -> Result<Self, Error> {
        config.validate()?;
        let database_url = config
            .database_url
            .as_deref()
            .ok_or_else(|| Error::validation("database_url is required to connect"))?;
        let store = PgStore::connect(database_url, &config.schema, config.max_connections).await?;
        Self::with_store(store, config)
    }

    /// Use an existing connection pool.
    pub fn with_pool(pool: PgPool, config: BossConfig) -> Result<Self, Error> {
        let store = PgStore::new(pool, &config.schema);
        Self::with_store(store, config)
    }
}

impl<S: Store> Boss<S> {
    /// Use any [`Store`] implementation.
    pub fn with_store(store: S, config: BossConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            store,
            config: Arc::new(config),
            events: Events::default(),
            subscriptions: Arc::default(),
            maintenance: Arc::default(),
        })
    }

    /// The backing store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The configuration this queue runs with.
    pub fn config(&self) -> &BossConfig {
        &self.config
    }

    /// Receive worker errors and maintenance results.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Install or verify the schema, then start the maintenance sweeps.
    ///
    /// Fails with [`Error::NotInstalled`] or [`Error::VersionMismatch`] when the
    /// tables are missing or outdated; no sweep is started in that case.
    /// Calling `start` on a started queue only re-checks the schema.
    #[instrument(name = "jobboss.start", skip(self))]
    pub async fn start(&self) -> Result<(), Error> {
        self.store.ensure_schema(self.config.install_schema).await?;

        let mut maintenance = lock(&self.maintenance);
        if maintenance.is_none() {
            *maintenance = Some(maintenance::start(&self.store, &self.config, &self.events));
            info!("Started maintenance");
        }
        Ok(())
    }

    /// Stop every subscription and the maintenance sweeps.
    ///
    /// Returns once all handlers that were running have finished.
    #[instrument(name = "jobboss.stop", skip(self))]
    pub async fn stop(&self) {
        let groups = lock(&self.subscriptions)
            .drain()
            .flat_map(|(_, groups)| groups)
            .chain(lock(&self.maintenance).take())
            .collect::<Vec<_>>();

        join_all(groups.into_iter().map(WorkerGroup::stop)).await;
        info!("Stopped");
    }

    /// Publish a job to the queue `name`.
    ///
    /// Returns the id of the new job, or `None` when a singleton window or key
    /// rejected it.
    #[instrument(name = "jobboss.publish", skip(self, data, options), fields(job.name = %name))]
    pub async fn publish<T: Serialize>(
        &self,
        name: &str,
        data: T,
        options: PublishOptions,
    ) -> Result<Option<Uuid>, Error> {
        validate_name(name)?;
        options.validate()?;

        let data = match serde_json::to_value(data)? {
            Value::Null => None,
            data => Some(data),
        };
        let job = self.new_job(name, data, &options)?;

        for attempt in singleton::attempts(job, options.singleton_next_slot) {
            if self.store.insert_job(&attempt).await? {
                debug!(job.id = %attempt.id, "Published job");
                return Ok(Some(attempt.id));
            }
        }

        debug!("Job rejected by singleton constraint");
        Ok(None)
    }

    fn new_job(
        &self,
        name: &str,
        data: Option<Value>,
        options: &PublishOptions,
    ) -> Result<NewJob, Error> {
        let expire_in = options.expire_in.unwrap_or(self.config.default_expire_in);
        let expire_in_seconds = i32::try_from(expire_in.as_secs())
            .map_err(|_| Error::validation("expire_in is too large"))?;
        let singleton_seconds = options
            .singleton_seconds
            .map(i32::try_from)
            .transpose()
            .map_err(|_| Error::validation("singleton window is too large"))?;
        let singleton_offset = i32::try_from(options.singleton_offset)
            .map_err(|_| Error::validation("singleton offset is too large"))?;

        Ok(NewJob {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            data,
            priority: options.priority,
            retry_limit: options.retry_limit.unwrap_or(self.config.default_retry_limit),
            start_after: options.start_after,
            expire_in_seconds,
            singleton_key: options.singleton_key.clone(),
            singleton_seconds,
            singleton_offset,
        })
    }

    /// Run `handler` for every job published to `name`.
    ///
    /// `team_size` independent loops each claim one job at a time. A job is
    /// completed with the handler's response when it returns `Ok`, and failed
    /// with `{"message": ...}` when it returns `Err` or panics.
    pub fn subscribe<F, Fut>(
        &self,
        name: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<(), Error>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        validate_name(name)?;
        options.validate_team()?;

        let handler: JobHandler = Arc::new(move |job: Job| handler(job).boxed());
        self.start_workers(name, &options, Handler::Single(handler), 1, options.team_size);
        Ok(())
    }

    /// Run `handler` for batches of up to `batch_size` jobs published to `name`.
    ///
    /// The handler is responsible for completing the jobs. When it returns
    /// `Err` or panics, every job of the batch that is still unfinished fails.
    pub fn subscribe_batch<F, Fut>(
        &self,
        name: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<(), Error>
    where
        F: Fn(Vec<Job>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        validate_name(name)?;
        options.validate_batch()?;

        let handler: BatchHandler = Arc::new(move |jobs: Vec<Job>| handler(jobs).boxed());
        self.start_workers(name, &options, Handler::Batch(handler), options.batch_size, 1);
        Ok(())
    }

    fn start_workers(
        &self,
        queue: &str,
        options: &SubscribeOptions,
        handler: Handler,
        batch_size: usize,
        num_workers: usize,
    ) {
        let shutdown = CancellationToken::new();
        let mut group = WorkerGroup::new(shutdown.clone());

        let worker = Worker {
            store: self.store.clone(),
            queue: queue.to_owned(),
            handler,
            batch_size,
            poll_interval: options.poll_interval.unwrap_or(self.config.poll_interval),
            jitter: options.jitter.unwrap_or(self.config.jitter),
            events: self.events.clone(),
            shutdown,
        };
        for i in 1..=num_workers {
            group.spawn(format!("jobboss-worker-{queue}-{i}"), worker.clone());
        }

        lock(&self.subscriptions)
            .entry(queue.to_owned())
            .or_default()
            .push(group);
    }

    /// Stop every subscription to `name`, waiting for running handlers.
    ///
    /// Returns `false` when there was no subscription.
    pub async fn unsubscribe(&self, name: &str) -> bool {
        let Some(groups) = lock(&self.subscriptions).remove(name) else {
            return false;
        };
        join_all(groups.into_iter().map(WorkerGroup::stop)).await;
        info!(queue = %name, "Unsubscribed");
        true
    }

    /// Run `handler` for the completion records of `name`.
    pub fn on_complete<F, Fut>(
        &self,
        name: &str,
        options: SubscribeOptions,
        handler: F,
    ) -> Result<(), Error>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        validate_name(name)?;
        options.validate_team()?;

        let handler: JobHandler = Arc::new(move |job: Job| handler(job).boxed());
        let queue = schema::completion_name(name);
        self.start_workers(&queue, &options, Handler::Single(handler), 1, options.team_size);
        Ok(())
    }

    /// Stop the completion subscriptions of `name`.
    pub async fn off_complete(&self, name: &str) -> bool {
        self.unsubscribe(&schema::completion_name(name)).await
    }

    /// Run the [`BackgroundJob`] `J` for every job published under its name.
    pub fn register<J: BackgroundJob>(
        &self,
        context: J::Context,
        options: SubscribeOptions,
    ) -> Result<(), Error> {
        self.subscribe(J::JOB_NAME, options, move |job: Job| {
            let context = context.clone();
            async move {
                let job = serde_json::from_value::<J>(job.data.unwrap_or(Value::Null))?;
                job.run(context).await?;
                anyhow::Ok(None)
            }
        })
    }

    /// Claim the next job of `name`, if any.
    pub async fn fetch(&self, name: &str) -> Result<Option<Job>, Error> {
        Ok(self.fetch_batch(&[name], 1).await?.pop())
    }

    /// Claim up to `batch_size` jobs from any of `names`, highest priority first.
    #[instrument(name = "jobboss.fetch", skip(self))]
    pub async fn fetch_batch(&self, names: &[&str], batch_size: usize) -> Result<Vec<Job>, Error> {
        if names.is_empty() {
            return Err(Error::validation("at least one queue name is required"));
        }
        if batch_size == 0 {
            return Err(Error::validation("batch_size must be at least 1"));
        }
        let names = names.iter().map(|name| (*name).to_owned()).collect::<Vec<_>>();
        self.store.fetch_next(&names, batch_size).await
    }

    /// Claim up to `batch_size` completion records of `name`.
    pub async fn fetch_completed(&self, name: &str, batch_size: usize) -> Result<Vec<Job>, Error> {
        let queue = schema::completion_name(name);
        self.fetch_batch(&[queue.as_str()], batch_size).await
    }

    /// Complete active jobs, storing `data` as the response.
    #[instrument(name = "jobboss.complete", skip(self, data))]
    pub async fn complete(&self, ids: &[Uuid], data: Option<Value>) -> Result<UpdateResult, Error> {
        let requested = validate_ids(ids)?;
        let updated = self.store.complete(ids, data).await?;
        Ok(UpdateResult { requested, updated })
    }

    /// Fail unfinished jobs. Failed jobs with retries left go back to `retry`.
    #[instrument(name = "jobboss.fail", skip(self, data))]
    pub async fn fail(&self, ids: &[Uuid], data: Option<Value>) -> Result<UpdateResult, Error> {
        let requested = validate_ids(ids)?;
        let updated = self.store.fail(ids, data).await?;
        Ok(UpdateResult { requested, updated })
    }

    /// Cancel unfinished jobs.
    #[instrument(name = "jobboss.cancel", skip(self))]
    pub async fn cancel(&self, ids: &[Uuid]) -> Result<UpdateResult, Error> {
        let requested = validate_ids(ids)?;
        let updated = self.store.cancel(ids).await?;
        Ok(UpdateResult { requested, updated })
    }

    /// Delete the jobs of `name` that have not started yet.
    pub async fn delete_queue(&self, name: &str) -> Result<u64, Error> {
        validate_name(name)?;
        self.store.delete_queue(name).await
    }

    /// Delete every job that has not started yet.
    pub async fn delete_all_queues(&self) -> Result<u64, Error> {
        self.store.delete_all_queues().await
    }

    /// Run an expire sweep now.
    pub async fn expire(&self) -> Result<ExpireResult, Error> {
        self.store.expire().await
    }

    /// Run an archive sweep now, using the configured retention.
    pub async fn archive(&self) -> Result<u64, Error> {
        self.store.archive(self.config.archive_completed_after).await
    }

    /// Run a purge now, using the configured retention.
    pub async fn purge(&self) -> Result<u64, Error> {
        self.store.purge(self.config.delete_archived_after).await
    }

    /// Count jobs per queue and state.
    pub async fn count_states(&self) -> Result<StateCounts, Error> {
        self.store.count_states().await
    }

    /// Load a job that has not been archived.
    pub async fn get_job_by_id(&self, id: Uuid) -> Result<Option<Job>, Error> {
        self.store.get_job_by_id(id).await
    }

    /// Load an archived job.
    pub async fn get_archived_job_by_id(&self, id: Uuid) -> Result<Option<ArchivedJob>, Error> {
        self.store.get_archived_job_by_id(id).await
    }

    /// List archived jobs, newest first.
    pub async fn get_archived_jobs(&self, query: ArchiveQuery) -> Result<Vec<ArchivedJob>, Error> {
        self.store.get_archived_jobs(query).await
    }

    /// Count archived jobs.
    pub async fn archived_job_count(&self) -> Result<i64, Error> {
        self.store.archived_job_count().await
    }
}

fn validate_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::validation("queue name must not be empty"));
    }
    if name.contains(schema::STATE_JOB_DELIMITER) {
        return Err(Error::validation(format!(
            "queue name `{name}` must not contain `{}`",
            schema::STATE_JOB_DELIMITER
        )));
    }
    Ok(())
}

fn validate_ids(ids: &[Uuid]) -> Result<u64, Error> {
    if ids.is_empty() {
        return Err(Error::validation("at least one job id is required"));
    }
    Ok(u64::try_from(ids.len()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use claims::{assert_err, assert_matches, assert_none, assert_ok, assert_some};

    fn boss() -> anyhow::Result<Boss<MemoryStore>> {
        Ok(Boss::with_store(MemoryStore::new(), BossConfig::default())?)
    }

    #[tokio::test]
    async fn publish_rejects_reserved_names() -> anyhow::Result<()> {
        let boss = boss()?;
        assert_matches!(
            boss.publish("", (), PublishOptions::default()).await,
            Err(Error::Validation(_))
        );
        assert_matches!(
            boss.publish("a__state__complete", (), PublishOptions::default()).await,
            Err(Error::Validation(_))
        );
        Ok(())
    }

    #[tokio::test]
    async fn null_data_is_stored_as_no_data() -> anyhow::Result<()> {
        let boss = boss()?;
        let id = assert_some!(boss.publish("q", (), PublishOptions::default()).await?);
        let job = assert_some!(boss.get_job_by_id(id).await?);
        assert_none!(job.data);
        assert_eq!(job.expire_in_seconds, 15 * 60);
        Ok(())
    }

    #[tokio::test]
    async fn config_defaults_apply_to_published_jobs() -> anyhow::Result<()> {
        let config = BossConfig::default()
            .default_retry_limit(3)
            .default_expire_in(std::time::Duration::from_secs(30));
        let boss = Boss::with_store(MemoryStore::new(), config)?;

        let id = assert_some!(boss.publish("q", 1, PublishOptions::default()).await?);
        let job = assert_some!(boss.get_job_by_id(id).await?);
        assert_eq!(job.retry_limit, 3);
        assert_eq!(job.expire_in_seconds, 30);

        let id = assert_some!(
            boss.publish("q", 1, PublishOptions::default().retry_limit(0)).await?
        );
        let job = assert_some!(boss.get_job_by_id(id).await?);
        assert_eq!(job.retry_limit, 0);
        Ok(())
    }

    #[tokio::test]
    async fn empty_id_lists_are_rejected() -> anyhow::Result<()> {
        let boss = boss()?;
        assert_err!(boss.complete(&[], None).await);
        assert_err!(boss.fail(&[], None).await);
        assert_err!(boss.cancel(&[]).await);
        assert_err!(boss.fetch_batch(&["q"], 0).await);
        assert_ok!(boss.fetch_batch(&["q"], 1).await);
        Ok(())
    }

    #[tokio::test]
    async fn update_results_count_requested_and_updated() -> anyhow::Result<()> {
        let boss = boss()?;
        let id = assert_some!(boss.publish("q", 1, PublishOptions::default()).await?);
        let job = assert_some!(boss.fetch("q").await?);
        assert_eq!(job.id, id);

        let result = boss.complete(&[id, Uuid::new_v4()], None).await?;
        assert_eq!(result, UpdateResult { requested: 2, updated: 1 });
        Ok(())
    }

    #[tokio::test]
    async fn unsubscribe_without_subscription_is_false() -> anyhow::Result<()> {
        let boss = boss()?;
        assert!(!boss.unsubscribe("q").await);

        boss.subscribe("q", SubscribeOptions::default(), |_| async { Ok(None) })?;
        assert!(boss.unsubscribe("q").await);
        Ok(())
    }

    #[tokio::test]
    async fn connect_requires_a_database_url() {
        let result = Boss::connect(BossConfig::default()).await;
        assert_matches!(result, Err(Error::Validation(_)));
    }
}
