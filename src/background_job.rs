use crate::boss::Boss;
use crate::errors::Error;
use crate::options::PublishOptions;
use crate::storage::Store;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::instrument;
use uuid::Uuid;

/// Trait for defining typed jobs that can be published and executed asynchronously.
///
/// The job value itself is the payload: it is serialized into the job's data
/// on [`enqueue`](Self::enqueue) and deserialized again before
/// [`run`](Self::run). Handlers are started with [`Boss::register`].
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name of the queue the job is published to.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// Default priority of the job.
    ///
    /// [`Self::publish_options`] can be overridden to pick a value per job.
    const PRIORITY: i32 = 0;

    /// How often a failed job is retried. `None` uses the configured default.
    const RETRY_LIMIT: Option<i32> = None;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Execute the job. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// The options this job is published with.
    fn publish_options(&self) -> PublishOptions {
        let options = PublishOptions::default().priority(Self::PRIORITY);
        match Self::RETRY_LIMIT {
            Some(retry_limit) => options.retry_limit(retry_limit),
            None => options,
        }
    }

    /// Publish this job.
    ///
    /// Returns the job ID if it was published, or `None` if a singleton
    /// setting from [`Self::publish_options`] rejected it.
    #[instrument(name = "jobboss.enqueue", skip(self, boss), fields(message = Self::JOB_NAME))]
    fn enqueue<'a, S: Store>(
        &'a self,
        boss: &'a Boss<S>,
    ) -> BoxFuture<'a, Result<Option<Uuid>, Error>> {
        let options = self.publish_options();
        boss.publish(Self::JOB_NAME, self, options).boxed()
    }
}
