//! One-shot commands: schedule inspection and a manual reaper sweep.

use std::{sync::Arc, time::Duration};

use {
    anyhow::{Context, Result},
    chrono::{DateTime, Utc},
    chrono_tz::Tz,
    synchro_config::SynchroConfig,
    synchro_scheduler::{
        Scheduler,
        clock::{Clock, SystemClock},
        handler::HandlerRegistry,
        handler_command::register_commands,
        schedule,
        store::open_store,
    },
};

/// Validate `expr`, describe it and print its next fire times.
pub fn check_schedule(expr: &str, timezone: Option<&str>, count: usize) -> Result<()> {
    schedule::validate(expr)?;
    let tz: Tz = match timezone {
        Some(name) => schedule::parse_timezone(name)?,
        None => Tz::UTC,
    };

    println!("{expr}: {}", schedule::describe(expr));
    for at in schedule::upcoming(expr, Some(tz.name()), SystemClock.now_ms(), count)? {
        let when = DateTime::<Utc>::from_timestamp_millis(at as i64)
            .context("fire time out of range")?
            .with_timezone(&tz);
        println!("  {}", when.format("%Y-%m-%d %H:%M %Z"));
    }
    Ok(())
}

/// Sweep stale runs in the configured store and print the report.
pub async fn reap(config: &SynchroConfig, threshold_secs: Option<u64>) -> Result<()> {
    let store = open_store(&config.storage)
        .await
        .context("failed to open scheduler store")?;
    let mut handlers = HandlerRegistry::new();
    register_commands(&mut handlers, &config.handlers);
    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        store,
        handlers,
        None,
    ));

    let report = scheduler
        .sweep(threshold_secs.map(Duration::from_secs))
        .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
