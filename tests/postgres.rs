#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_matches, assert_none, assert_ok, assert_some};
use insta::assert_compact_json_snapshot;
use jobboss::{
    ArchiveQuery, BackgroundJob, Boss, BossConfig, Error, JobState, PublishOptions, StartAfter,
    SubscribeOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Barrier;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Start a PostgreSQL container and return a pool connected to it
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        // Get the connection parameters from the container
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;

        // Use the standard postgres/postgres credentials for testcontainers
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        Ok((pool, container))
    }

    /// Create a started queue on a fresh database
    pub(super) async fn setup_boss(
        config: BossConfig,
    ) -> anyhow::Result<(Boss, PgPool, ContainerAsync<Postgres>)> {
        let (pool, container) = setup_test_db().await?;
        let boss = Boss::with_pool(pool.clone(), config)?;
        boss.start().await?;
        Ok((boss, pool, container))
    }

    pub(super) fn test_config() -> BossConfig {
        BossConfig::default()
            .schema("jobboss_test")
            .poll_interval(Duration::from_millis(50))
            .jitter(Duration::ZERO)
    }
}

async fn state_of(boss: &Boss, id: uuid::Uuid) -> anyhow::Result<Option<JobState>> {
    Ok(boss.get_job_by_id(id).await?.map(|job| job.state))
}

#[tokio::test]
async fn start_installs_the_schema_once() -> anyhow::Result<()> {
    let (boss, pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;

    let table_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables
         WHERE table_name IN ('job', 'archive', 'version')
         AND table_schema = 'jobboss_test'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(table_count, 3, "Expected job, archive and version tables");

    // A second queue on the same database only verifies the schema.
    let other = Boss::with_pool(pool.clone(), test_utils::test_config())?;
    assert_ok!(other.start().await);

    boss.stop().await;
    other.stop().await;
    Ok(())
}

#[tokio::test]
async fn start_without_install_requires_the_schema() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let config = test_utils::test_config()
        .schema("not_installed")
        .install_schema(false);
    let boss = Boss::with_pool(pool, config)?;

    let result = boss.start().await;
    assert_matches!(result, Err(Error::NotInstalled { ref schema }) if schema == "not_installed");
    Ok(())
}

#[tokio::test]
async fn start_rejects_other_schema_versions() -> anyhow::Result<()> {
    let (boss, pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;
    boss.stop().await;

    sqlx::query("UPDATE jobboss_test.version SET version = 99")
        .execute(&pool)
        .await?;

    let result = boss.start().await;
    assert_matches!(result, Err(Error::VersionMismatch { found: 99, .. }));
    Ok(())
}

#[tokio::test]
async fn concurrent_fetches_never_claim_the_same_job() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;

    let mut published = HashSet::new();
    for i in 0..40 {
        published.insert(assert_some!(
            boss.publish("race", json!({ "i": i }), PublishOptions::default())
                .await?
        ));
    }

    let fetchers = (0..6)
        .map(|_| {
            let boss = boss.clone();
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                loop {
                    let jobs = boss.fetch_batch(&["race"], 3).await?;
                    if jobs.is_empty() {
                        break;
                    }
                    claimed.extend(jobs.into_iter().map(|job| job.id));
                }
                anyhow::Ok(claimed)
            })
        })
        .collect::<Vec<_>>();

    let mut claimed = Vec::new();
    for fetcher in fetchers {
        claimed.extend(fetcher.await??);
    }

    let unique = claimed.iter().copied().collect::<HashSet<_>>();
    assert_eq!(claimed.len(), 40);
    assert_eq!(unique, published);
    Ok(())
}

#[tokio::test]
async fn claims_follow_priority_and_skip_future_jobs() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;

    let later = assert_some!(
        boss.publish("q", 1, PublishOptions::default().start_in(Duration::from_secs(3600)))
            .await?
    );
    let low = assert_some!(boss.publish("q", 2, PublishOptions::default()).await?);
    let high = assert_some!(
        boss.publish("q", 3, PublishOptions::default().priority(5))
            .await?
    );

    let jobs = boss.fetch_batch(&["q"], 10).await?;
    let ids = jobs.iter().map(|job| job.id).collect::<Vec<_>>();
    assert_eq!(ids, vec![high, low]);
    assert!(jobs.iter().all(|job| job.state == JobState::Active));
    assert!(jobs.iter().all(|job| job.started_on.is_some()));

    assert_eq!(state_of(&boss, later).await?, Some(JobState::Created));
    Ok(())
}

#[tokio::test]
async fn equal_priorities_are_claimed_oldest_first() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;

    let mut ids = Vec::new();
    for priority in [1, 5, 3, 5] {
        let options = PublishOptions::default().priority(priority);
        ids.push(assert_some!(boss.publish("q", priority, options).await?));
    }
    let (p1, p5_first, p3, p5_second) = (ids[0], ids[1], ids[2], ids[3]);

    let first = boss.fetch_batch(&["q"], 1).await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, p5_first);

    let rest = boss.fetch_batch(&["q"], 4).await?;
    let rest = rest.iter().map(|job| job.id).collect::<Vec<_>>();
    assert_eq!(rest, vec![p5_second, p3, p1]);
    Ok(())
}

#[tokio::test]
async fn a_single_claim_is_fully_ordered() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;

    let mut ids = Vec::new();
    for priority in [1, 5, 3, 5] {
        let options = PublishOptions::default().priority(priority);
        ids.push(assert_some!(boss.publish("q", priority, options).await?));
    }

    let jobs = boss.fetch_batch(&["q"], 4).await?;
    let claimed = jobs.iter().map(|job| job.id).collect::<Vec<_>>();
    assert_eq!(claimed, vec![ids[1], ids[3], ids[2], ids[0]]);
    let priorities = jobs.iter().map(|job| job.priority).collect::<Vec<_>>();
    assert_eq!(priorities, vec![5, 5, 3, 1]);
    Ok(())
}

#[tokio::test]
async fn absolute_start_times_are_stored() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;

    let at = chrono::Utc::now() + chrono::Duration::hours(2);
    let id = assert_some!(
        boss.publish("q", (), PublishOptions::default().start_after(StartAfter::At(at)))
            .await?
    );

    let job = assert_some!(boss.get_job_by_id(id).await?);
    assert_eq!(job.start_after.timestamp(), at.timestamp());
    assert_none!(boss.fetch("q").await?);
    Ok(())
}

#[tokio::test]
async fn failures_retry_until_the_limit() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;
    let id = assert_some!(
        boss.publish("q", (), PublishOptions::default().retry_limit(1))
            .await?
    );

    assert_eq!(assert_some!(boss.fetch("q").await?).retry_count, 0);
    assert_eq!(boss.fail(&[id], None).await?.updated, 1);
    assert_eq!(state_of(&boss, id).await?, Some(JobState::Retry));

    assert_eq!(assert_some!(boss.fetch("q").await?).retry_count, 1);
    boss.fail(&[id], Some(json!({ "message": "still broken" }))).await?;
    assert_eq!(state_of(&boss, id).await?, Some(JobState::Failed));
    assert_none!(boss.fetch("q").await?);

    let completion = assert_some!(boss.fetch_completed("q", 1).await?.pop());
    let data = assert_some!(completion.completion())?;
    assert_eq!(data.state, JobState::Failed);
    assert_eq!(data.response, Some(json!({ "message": "still broken" })));
    Ok(())
}

#[tokio::test]
async fn stuck_jobs_expire_and_retry() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;
    let options = PublishOptions::default()
        .retry_limit(1)
        .expire_in(Duration::from_secs(1));
    let id = assert_some!(boss.publish("q", (), options).await?);

    assert_some!(boss.fetch("q").await?);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let result = boss.expire().await?;
    assert_eq!((result.retried, result.expired), (1, 0));

    let retried = assert_some!(boss.fetch("q").await?);
    assert_eq!(retried.id, id);
    assert_eq!(retried.retry_count, 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let result = boss.expire().await?;
    assert_eq!((result.retried, result.expired), (0, 1));
    assert_eq!(state_of(&boss, id).await?, Some(JobState::Expired));
    Ok(())
}

#[tokio::test]
async fn throttle_and_debounce_use_singleton_windows() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;

    let throttle = PublishOptions::default().singleton_hours(1);
    assert_some!(boss.publish("throttled", 1, throttle.clone()).await?);
    assert_none!(boss.publish("throttled", 2, throttle).await?);

    let debounce = PublishOptions::default()
        .singleton_hours(1)
        .singleton_next_slot(true);
    let first = assert_some!(boss.publish("debounced", 1, debounce.clone()).await?);
    let second = assert_some!(boss.publish("debounced", 2, debounce.clone()).await?);
    assert_none!(boss.publish("debounced", 3, debounce).await?);

    let first = assert_some!(boss.get_job_by_id(first).await?);
    let second = assert_some!(boss.get_job_by_id(second).await?);
    let window = assert_some!(second.singleton_on) - assert_some!(first.singleton_on);
    assert_eq!(window, chrono::Duration::hours(1));

    // Only the first debounced job is claimable right away.
    let claimed = boss.fetch_batch(&["debounced"], 10).await?;
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, first.id);
    Ok(())
}

#[tokio::test]
async fn singleton_slot_matches_the_database() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;

    let before = chrono::Utc::now();
    let id = assert_some!(
        boss.publish("q", (), PublishOptions::default().singleton_minutes(10))
            .await?
    );
    let after = chrono::Utc::now();

    let slot = assert_some!(assert_some!(boss.get_job_by_id(id).await?).singleton_on);
    let expected = [jobboss::slot(before, 600, 0), jobboss::slot(after, 600, 0)];
    assert!(expected.contains(&slot), "{slot} not in {expected:?}");
    Ok(())
}

#[tokio::test]
async fn completion_round_trip() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;
    let id = assert_some!(
        boss.publish("emails", json!({ "to": "ops" }), PublishOptions::default())
            .await?
    );

    assert_some!(boss.fetch("emails").await?);
    let result = boss.complete(&[id], Some(json!({ "sent": true }))).await?;
    assert_eq!((result.requested, result.updated), (1, 1));
    assert_eq!(boss.complete(&[id], None).await?.updated, 0);

    let completed = boss.fetch_completed("emails", 10).await?;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].name, "emails__state__complete");

    let data = assert_some!(completed[0].completion())?;
    assert_eq!(data.request.id, id);

    let mut value = serde_json::to_value(&data)?;
    value["request"]["id"] = json!("[id]");
    assert_compact_json_snapshot!(value, @r#"{"request": {"data": {"to": "ops"}, "id": "[id]", "name": "emails"}, "response": {"sent": true}, "state": "complete"}"#);

    boss.complete(&[completed[0].id], None).await?;
    assert!(boss.fetch_completed("emails__state__complete", 1).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn cancelled_jobs_are_not_claimed() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;
    let id = assert_some!(boss.publish("q", (), PublishOptions::default()).await?);

    assert_eq!(boss.cancel(&[id]).await?.updated, 1);
    assert_none!(boss.fetch("q").await?);
    assert!(boss.fetch_completed("q", 1).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn finished_jobs_are_archived_then_purged() -> anyhow::Result<()> {
    let config = test_utils::test_config()
        .archive(Duration::from_secs(3600), Duration::ZERO)
        .purge(Duration::from_secs(3600), Duration::ZERO);
    let (boss, _pool, _container) = test_utils::setup_boss(config).await?;

    let done = assert_some!(boss.publish("q", (), PublishOptions::default()).await?);
    assert_some!(boss.fetch("q").await?);
    boss.complete(&[done], None).await?;
    let waiting = assert_some!(boss.publish("q", (), PublishOptions::default()).await?);

    // The finished job and its unconsumed completion record.
    assert_eq!(boss.archive().await?, 2);
    assert_none!(boss.get_job_by_id(done).await?);
    assert_some!(boss.get_job_by_id(waiting).await?);

    let archived = assert_some!(boss.get_archived_job_by_id(done).await?);
    assert_eq!(archived.job.state, JobState::Complete);
    assert_eq!(boss.archived_job_count().await?, 2);

    let filtered = boss
        .get_archived_jobs(ArchiveQuery::Filter {
            queue: Some("q".into()),
            limit: Some(10),
        })
        .await?;
    assert_eq!(filtered.len(), 1);
    assert_eq!(boss.get_archived_jobs(ArchiveQuery::All).await?.len(), 2);

    assert_eq!(boss.purge().await?, 2);
    assert_eq!(boss.archived_job_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn state_counts_exclude_completion_records() -> anyhow::Result<()> {
    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;

    let id = assert_some!(boss.publish("a", (), PublishOptions::default()).await?);
    assert_some!(boss.publish("a", (), PublishOptions::default()).await?);
    assert_some!(boss.publish("b", (), PublishOptions::default()).await?);
    assert_eq!(assert_some!(boss.fetch("a").await?).id, id);
    boss.complete(&[id], None).await?;

    let counts = boss.count_states().await?;
    assert_eq!(counts.total, 3);
    assert_eq!(counts.queue("a", JobState::Created), 1);
    assert_eq!(counts.queue("a", JobState::Complete), 1);
    assert_eq!(counts.queue("b", JobState::Created), 1);
    assert_eq!(counts.all.get(&JobState::Created), Some(&2));
    assert!(!counts.queues.contains_key("a__state__complete"));
    Ok(())
}

#[tokio::test]
async fn jobs_stay_claimed_while_the_handler_runs() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        job_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const JOB_NAME: &'static str = "test";
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.job_started_barrier.wait().await;
            ctx.assertions_finished_barrier.wait().await;
            Ok(())
        }
    }

    let test_context = TestContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;
    let id = assert_some!(TestJob.enqueue(&boss).await?);

    boss.register::<TestJob>(test_context.clone(), SubscribeOptions::default())?;
    test_context.job_started_barrier.wait().await;

    assert_eq!(state_of(&boss, id).await?, Some(JobState::Active));
    assert_none!(boss.fetch("test").await?);

    test_context.assertions_finished_barrier.wait().await;
    boss.stop().await;

    assert_eq!(state_of(&boss, id).await?, Some(JobState::Complete));
    Ok(())
}

#[tokio::test]
async fn failed_handlers_are_retried() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct FlakyJob;

    impl BackgroundJob for FlakyJob {
        const JOB_NAME: &'static str = "flaky";
        const RETRY_LIMIT: Option<i32> = Some(3);
        type Context = Arc<AtomicU8>;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            if ctx.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("not yet");
            }
            Ok(())
        }
    }

    let (boss, _pool, _container) = test_utils::setup_boss(test_utils::test_config()).await?;
    let attempts = Arc::new(AtomicU8::new(0));
    let id = assert_some!(FlakyJob.enqueue(&boss).await?);

    boss.register::<FlakyJob>(attempts.clone(), SubscribeOptions::default().team_size(2))?;
    tokio::time::timeout(Duration::from_secs(10), async {
        while state_of(&boss, id).await? != Some(JobState::Complete) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        anyhow::Ok(())
    })
    .await??;
    boss.stop().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let job = assert_some!(boss.get_job_by_id(id).await?);
    assert_eq!(job.retry_count, 2);
    Ok(())
}
