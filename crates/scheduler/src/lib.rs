//! Job scheduling and state tracking.
//!
//! Jobs are named units of work with a tracked lifecycle
//! (Idle → Requested → Running → Idle) and a capped run history. Batches
//! group jobs under a cron schedule and run them in order. Manually
//! requested jobs are picked up by a polling dispatcher, and a reaper
//! force-fails runs that never completed.

pub mod catalog;
pub mod clock;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod handler;
pub mod handler_command;
pub mod reaper;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod service;
pub mod state;
pub mod stats;
pub mod store;
pub mod store_file;
pub mod store_memory;
pub mod store_sqlite;
#[cfg(feature = "metrics")]
pub mod telemetry;
pub mod triggers;
pub mod types;

#[cfg(test)]
mod test_support;

pub use {
    error::{Context, Error, Result},
    service::Scheduler,
};

/// Run database migrations for the scheduler crate.
///
/// Creates the `jobs` and `batches` tables. Called by
/// [`store_sqlite::SqliteStore::new`]; call it yourself when handing a pool
/// to [`store_sqlite::SqliteStore::with_pool`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
