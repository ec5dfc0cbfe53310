//! Notifications published by workers and maintenance tasks.
//!
//! Every [`Boss`](crate::Boss) owns one broadcast channel. Receivers obtained
//! from [`Boss::events`](crate::Boss::events) see every event sent after they
//! subscribed; a receiver that falls behind loses the oldest events.

use crate::schema::StateCounts;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

/// The periodic maintenance sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaintenanceTask {
    /// Reclaiming active jobs past their `expire_in`
    Expire,
    /// Moving finished jobs into the archive
    Archive,
    /// Deleting old archive rows
    Purge,
    /// Counting jobs per queue and state
    MonitorStates,
}

impl fmt::Display for MaintenanceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Expire => "expire",
            Self::Archive => "archive",
            Self::Purge => "purge",
            Self::MonitorStates => "monitor-states",
        })
    }
}

/// Where a reported error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// Claiming jobs from the store
    Fetch,
    /// A subscription handler returned an error or panicked
    Handler,
    /// Recording a job outcome in the store
    Complete,
    /// One of the maintenance sweeps
    Maintenance(MaintenanceTask),
}

/// An error that did not stop the loop it occurred in.
#[derive(Debug)]
pub struct WorkerError {
    /// What was being done when the error happened
    pub source: ErrorSource,
    /// The queue involved, if any
    pub queue: Option<String>,
    /// The underlying error
    pub error: anyhow::Error,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.queue {
            Some(queue) => write!(
                f,
                "{:?} error on queue `{queue}`: {:#}",
                self.source, self.error
            ),
            None => write!(f, "{:?} error: {:#}", self.source, self.error),
        }
    }
}

/// A notification sent on the event channel.
#[derive(Debug, Clone)]
pub enum Event {
    /// A worker or maintenance task hit an error and kept running
    Error(Arc<WorkerError>),
    /// An expire sweep finished
    Expired {
        /// Jobs sent back to `retry`
        retried: u64,
        /// Jobs that ended in `expired`
        expired: u64,
    },
    /// An archive sweep finished
    Archived {
        /// Jobs moved into the archive
        count: u64,
    },
    /// A purge finished
    Purged {
        /// Archive rows deleted
        count: u64,
    },
    /// Periodic job counts
    MonitorStates(StateCounts),
}

/// Sending half of the event channel, shared by every task of one `Boss`.
#[derive(Debug, Clone)]
pub(crate) struct Events {
    sender: broadcast::Sender<Event>,
}

impl Default for Events {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl Events {
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&self, event: Event) {
        // Nobody listening is not an error.
        if self.sender.send(event).is_err() {
            trace!("No event receivers");
        }
    }

    pub(crate) fn error(
        &self,
        source: ErrorSource,
        queue: Option<&str>,
        error: impl Into<anyhow::Error>,
    ) {
        self.emit(Event::Error(Arc::new(WorkerError {
            source,
            queue: queue.map(str::to_owned),
            error: error.into(),
        })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[tokio::test]
    async fn errors_reach_every_receiver() {
        let events = Events::default();
        let mut first = events.subscribe();
        let mut second = events.subscribe();

        events.error(ErrorSource::Handler, Some("emails"), anyhow!("smtp down"));

        for receiver in [&mut first, &mut second] {
            let Ok(Event::Error(error)) = receiver.recv().await else {
                panic!("expected an error event");
            };
            assert_eq!(error.source, ErrorSource::Handler);
            assert_eq!(error.queue.as_deref(), Some("emails"));
            assert_eq!(error.to_string(), "Handler error on queue `emails`: smtp down");
        }
    }

    #[test]
    fn emitting_without_receivers_is_fine() {
        Events::default().emit(Event::Purged { count: 3 });
    }

    #[test]
    fn maintenance_tasks_have_short_names() {
        assert_eq!(MaintenanceTask::MonitorStates.to_string(), "monitor-states");
    }
}
