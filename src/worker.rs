use crate::errors::Error;
use crate::events::{ErrorSource, Events};
use crate::schema::Job;
use crate::storage::Store;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use uuid::Uuid;

/// Handler of a team subscription: one job in, an optional response out.
pub(crate) type JobHandler =
    Arc<dyn Fn(Job) -> BoxFuture<'static, anyhow::Result<Option<Value>>> + Send + Sync>;

/// Handler of a batch subscription. Completing the jobs is up to the handler.
pub(crate) type BatchHandler =
    Arc<dyn Fn(Vec<Job>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Handler {
    Single(JobHandler),
    Batch(BatchHandler),
}

#[derive(Clone)]
pub(crate) struct Worker<S> {
    pub(crate) store: S,
    pub(crate) queue: String,
    pub(crate) handler: Handler,
    pub(crate) batch_size: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) events: Events,
    pub(crate) shutdown: CancellationToken,
}

impl<S: Store> Worker<S> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Poll for jobs until the shutdown token is cancelled.
    ///
    /// Cancellation is only observed between jobs, so a job that has been
    /// claimed always runs to completion.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        let names = [self.queue.clone()];
        while !self.shutdown.is_cancelled() {
            let sleep_duration = match self.run_next_jobs(&names).await {
                Ok(true) => continue,
                Ok(false) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No pending jobs found. Polling again in {sleep_duration:?}…");
                    sleep_duration
                }
                Err(error) => {
                    error!("Failed to fetch jobs: {error}");
                    self.events
                        .error(ErrorSource::Fetch, Some(&self.queue), error);
                    self.sleep_duration_with_jitter()
                }
            };

            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = sleep(sleep_duration) => {}
            }
        }
        debug!("Worker stopped");
    }

    /// Claim and handle the next jobs of the queue, if there are any.
    ///
    /// Returns:
    /// - `Ok(true)` if jobs were handled
    /// - `Ok(false)` if no jobs were waiting
    /// - `Err(...)` if there was an error claiming jobs
    async fn run_next_jobs(&self, names: &[String]) -> Result<bool, Error> {
        trace!("Looking for next jobs…");
        let jobs = self.store.fetch_next(names, self.batch_size).await?;
        if jobs.is_empty() {
            return Ok(false);
        }

        match &self.handler {
            Handler::Single(handler) => {
                for job in jobs {
                    self.run_job(handler.clone(), job).await;
                }
            }
            Handler::Batch(handler) => self.run_batch(handler.clone(), jobs).await,
        }
        Ok(true)
    }

    async fn run_job(&self, handler: JobHandler, job: Job) {
        let span = info_span!("job", job.id = %job.id, job.name = %job.name);
        let job_id = job.id;

        let future = with_sentry_transaction(&self.queue, || async move {
            AssertUnwindSafe(async move { handler(job).await })
                .catch_unwind()
                .await
                .map_err(|e| try_to_extract_panic_info(&*e))
                // TODO: Replace with flatten() once that stabilizes
                .and_then(std::convert::identity)
        });

        let result = async {
            debug!("Running job…");
            future.await
        }
        .instrument(span.clone())
        .bind_hub(Hub::current())
        .await;

        self.record_outcome(&[job_id], result)
            .instrument(span)
            .await;
    }

    async fn run_batch(&self, handler: BatchHandler, jobs: Vec<Job>) {
        let ids = jobs.iter().map(|job| job.id).collect::<Vec<_>>();
        let span = info_span!("batch", batch.size = ids.len());
        let queue = self.queue.clone();

        let task = tokio::spawn(
            async move {
                debug!("Running batch…");
                with_sentry_transaction(&queue, || handler(jobs)).await
            }
            .instrument(span.clone())
            .bind_hub(Hub::current()),
        );

        let result = match task.await {
            Ok(result) => result,
            Err(error) if error.is_panic() => Err(try_to_extract_panic_info(&*error.into_panic())),
            Err(error) => Err(anyhow!(error)),
        };

        // A successful batch handler completes its own jobs.
        if let Err(error) = result {
            self.record_outcome(&ids, Err(error)).instrument(span).await;
        }
    }

    /// Complete or fail the given jobs depending on the handler result.
    async fn record_outcome(&self, ids: &[Uuid], result: anyhow::Result<Option<Value>>) {
        let outcome = match result {
            Ok(response) => {
                debug!("Completing job…");
                self.store.complete(ids, response).await
            }
            Err(error) => {
                warn!("Failed to run job: {error:#}");
                let response = json!({ "message": format!("{error:#}") });
                let outcome = self.store.fail(ids, Some(response)).await;
                self.events
                    .error(ErrorSource::Handler, Some(&self.queue), error);
                outcome
            }
        };

        if let Err(error) = outcome {
            error!("Failed to record job outcome: {error}");
            self.events
                .error(ErrorSource::Complete, Some(&self.queue), error);
        }
    }
}

/// Handle to a set of running worker loops sharing one shutdown token.
#[derive(Debug, Default)]
pub(crate) struct WorkerGroup {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub(crate) fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Spawn `worker` as a task named `name`.
    pub(crate) fn spawn<S: Store>(&mut self, name: String, worker: Worker<S>) {
        info!(worker.name = %name, "Starting worker…");

        let span = info_span!("worker", worker.name = %name);
        let handle = tokio::spawn(async move { worker.run().instrument(span).await });
        self.handles.push(handle);
    }

    /// Spawn a task that stops with the group.
    pub(crate) fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Signal every loop to stop and wait until all of them have.
    pub(crate) async fn stop(self) {
        self.shutdown.cancel();
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Worker task panicked");
            }
        });
    }
}
