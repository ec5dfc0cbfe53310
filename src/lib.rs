#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod boss;
mod config;
mod errors;
pub mod events;
mod maintenance;
mod memory;
pub mod options;
pub mod plans;
pub mod schema;
mod singleton;
mod storage;
mod util;
mod worker;

/// The main trait for defining typed jobs.
pub use self::background_job::BackgroundJob;
/// The queue itself.
pub use self::boss::Boss;
/// Queue configuration.
pub use self::config::BossConfig;
/// Error type for queue operations.
pub use self::errors::Error;
/// Notifications broadcast by workers and maintenance.
pub use self::events::Event;
/// In-process store, useful for tests.
pub use self::memory::MemoryStore;
/// Options accepted by publish and subscribe.
pub use self::options::{PublishOptions, StartAfter, SubscribeOptions};
/// Job rows and their states.
pub use self::schema::{ArchivedJob, CompletionData, Job, JobState, StateCounts};
/// Singleton window computation.
pub use self::singleton::slot;
/// The store seam and its PostgreSQL implementation.
pub use self::storage::{ArchiveQuery, ExpireResult, NewJob, PgStore, Store, UpdateResult};
