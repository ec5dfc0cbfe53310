use crate::config::BossConfig;
use crate::errors::Error;
use crate::events::{ErrorSource, Event, Events, MaintenanceTask};
use crate::storage::Store;
use crate::worker::WorkerGroup;
use std::future::Future;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span};

/// Start the expire, archive and purge sweeps, plus the state monitor when
/// configured. Each sweep runs on its own timer; a failing tick is reported
/// and the next one runs as scheduled.
pub(crate) fn start<S: Store>(store: &S, config: &BossConfig, events: &Events) -> WorkerGroup {
    let shutdown = CancellationToken::new();
    let mut group = WorkerGroup::new(shutdown.clone());

    let archive_after = config.archive_completed_after;
    let purge_after = config.delete_archived_after;

    group.push(spawn(
        MaintenanceTask::Expire,
        config.expire_check_interval,
        &shutdown,
        events,
        {
            let store = store.clone();
            move || {
                let store = store.clone();
                async move {
                    let result = store.expire().await?;
                    Ok(Event::Expired {
                        retried: result.retried,
                        expired: result.expired,
                    })
                }
            }
        },
    ));

    group.push(spawn(
        MaintenanceTask::Archive,
        config.archive_interval,
        &shutdown,
        events,
        {
            let store = store.clone();
            move || {
                let store = store.clone();
                async move {
                    let count = store.archive(archive_after).await?;
                    Ok(Event::Archived { count })
                }
            }
        },
    ));

    group.push(spawn(
        MaintenanceTask::Purge,
        config.purge_interval,
        &shutdown,
        events,
        {
            let store = store.clone();
            move || {
                let store = store.clone();
                async move {
                    let count = store.purge(purge_after).await?;
                    Ok(Event::Purged { count })
                }
            }
        },
    ));

    if let Some(period) = config.monitor_states_interval {
        group.push(spawn(
            MaintenanceTask::MonitorStates,
            period,
            &shutdown,
            events,
            {
                let store = store.clone();
                move || {
                    let store = store.clone();
                    async move { Ok(Event::MonitorStates(store.count_states().await?)) }
                }
            },
        ));
    }

    group
}

fn spawn<F, Fut>(
    task: MaintenanceTask,
    period: Duration,
    shutdown: &CancellationToken,
    events: &Events,
    run: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Event, Error>> + Send + 'static,
{
    let shutdown = shutdown.clone();
    let events = events.clone();
    let span = info_span!("maintenance", maintenance.task = %task);

    tokio::spawn(
        async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match run().await {
                    Ok(event) => {
                        debug!(?event, "Maintenance finished");
                        events.emit(event);
                    }
                    Err(error) => {
                        error!("Maintenance failed: {error}");
                        events.error(ErrorSource::Maintenance(task), None, error);
                    }
                }
            }
            debug!("Maintenance stopped");
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FlakyStore, MemoryStore};
    use crate::options::StartAfter;
    use crate::schema::JobState;
    use crate::storage::NewJob;
    use claims::assert_some;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn sweeps_run_on_their_timers() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let events = Events::default();
        let mut receiver = events.subscribe();
        let config = BossConfig::default().monitor_states(Duration::from_secs(30));

        let job = NewJob {
            id: Uuid::new_v4(),
            name: "reports".into(),
            data: None,
            priority: 0,
            retry_limit: 0,
            start_after: StartAfter::Immediately,
            expire_in_seconds: 900,
            singleton_key: None,
            singleton_seconds: None,
            singleton_offset: 0,
        };
        store.insert_job(&job).await?;

        let group = start(&store, &config, &events);

        let mut seen = Vec::new();
        while seen.len() < 4 {
            match receiver.recv().await? {
                Event::Expired { .. } => seen.push(MaintenanceTask::Expire),
                Event::Archived { .. } => seen.push(MaintenanceTask::Archive),
                Event::Purged { .. } => seen.push(MaintenanceTask::Purge),
                Event::MonitorStates(counts) => {
                    assert_eq!(counts.queue("reports", JobState::Created), 1);
                    seen.push(MaintenanceTask::MonitorStates);
                }
                Event::Error(error) => panic!("unexpected error: {error}"),
            }
        }
        group.stop().await;

        assert_some!(seen.iter().find(|task| **task == MaintenanceTask::MonitorStates));
        assert_some!(seen.iter().find(|task| **task == MaintenanceTask::Expire));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn a_failing_sweep_is_reported_and_runs_again() -> anyhow::Result<()> {
        let store = FlakyStore::default();
        store.fail_expires(1);
        let events = Events::default();
        let mut receiver = events.subscribe();
        let config = BossConfig::default().expire_check_interval(Duration::from_secs(5));

        let group = start(&store, &config, &events);

        let mut failed = false;
        loop {
            match receiver.recv().await? {
                Event::Error(error) => {
                    assert_eq!(error.source, ErrorSource::Maintenance(MaintenanceTask::Expire));
                    assert_eq!(error.queue, None);
                    failed = true;
                }
                Event::Expired { retried, expired } => {
                    assert!(failed, "the sweep succeeded before its failure was reported");
                    assert_eq!((retried, expired), (0, 0));
                    break;
                }
                _ => {}
            }
        }
        group.stop().await;
        Ok(())
    }
}
