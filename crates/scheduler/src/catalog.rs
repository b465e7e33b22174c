//! Batch configuration catalog. The only writer of persisted batches.

use std::{collections::HashMap, sync::Arc};

use {
    tokio::sync::Mutex,
    tracing::{info, warn},
};

use crate::{
    Error, Result,
    clock::Clock,
    schedule,
    store::SchedulerStore,
    types::{
        BatchConfig, BatchConfigCreate, BatchConfigPatch, DueBatch, ErrorRateEntry,
        ErrorRateKind, Job, ScriptRef, ScriptRefPatch, ratio,
    },
};

pub struct BatchCatalog {
    store: Arc<dyn SchedulerStore>,
    clock: Arc<dyn Clock>,
    default_timezone: String,
    write_lock: Mutex<()>,
}

impl BatchCatalog {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        clock: Arc<dyn Clock>,
        default_timezone: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            default_timezone: default_timezone.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Timezone a batch fires in.
    pub fn timezone_of<'a>(&'a self, batch: &'a BatchConfig) -> &'a str {
        batch.timezone.as_deref().unwrap_or(&self.default_timezone)
    }

    pub async fn create(&self, create: BatchConfigCreate) -> Result<BatchConfig> {
        let name = create.name.trim().to_string();
        if name.is_empty() {
            return Err(Error::validation("name is required"));
        }
        let schedule = create.schedule.trim().to_string();
        if schedule.is_empty() {
            return Err(Error::validation("schedule is required"));
        }
        schedule::validate(&schedule)?;
        if let Some(tz) = &create.timezone {
            schedule::validate_timezone(tz)?;
        }
        validate_scripts(&create.scripts)?;

        let now = self.clock.now_ms();
        let batch = BatchConfig {
            name,
            description: create.description,
            schedule,
            timezone: create.timezone,
            enabled: create.enabled,
            priority: create.priority,
            category: create.category,
            timeout_secs: create.timeout_secs,
            max_retries: create.max_retries,
            notifications: create.notifications,
            scripts: create.scripts,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.store.insert_batch(&batch).await?;
        info!(batch = %batch.name, schedule = %batch.schedule, "batch created");
        Ok(batch)
    }

    pub async fn get(&self, name: &str) -> Result<BatchConfig> {
        self.store
            .get_batch(name)
            .await?
            .ok_or_else(|| Error::batch_not_found(name))
    }

    pub async fn list(&self) -> Result<Vec<BatchConfig>> {
        self.store.load_batches().await
    }

    /// Partial update. A new schedule or timezone is validated first.
    pub async fn update(&self, name: &str, patch: BatchConfigPatch) -> Result<BatchConfig> {
        if let Some(expr) = &patch.schedule {
            schedule::validate(expr)?;
        }
        if let Some(tz) = &patch.timezone {
            schedule::validate_timezone(tz)?;
        }
        if let Some(scripts) = &patch.scripts {
            validate_scripts(scripts)?;
        }

        let batch = self
            .modify(name, |batch| {
                if let Some(description) = patch.description {
                    batch.description = Some(description);
                }
                if let Some(expr) = patch.schedule {
                    batch.schedule = expr.trim().to_string();
                }
                if let Some(tz) = patch.timezone {
                    batch.timezone = Some(tz);
                }
                if let Some(enabled) = patch.enabled {
                    batch.enabled = enabled;
                }
                if let Some(priority) = patch.priority {
                    batch.priority = priority;
                }
                if let Some(category) = patch.category {
                    batch.category = Some(category);
                }
                if let Some(timeout) = patch.timeout_secs {
                    batch.timeout_secs = Some(timeout);
                }
                if let Some(retries) = patch.max_retries {
                    batch.max_retries = retries;
                }
                if let Some(notifications) = patch.notifications {
                    batch.notifications = notifications;
                }
                if let Some(scripts) = patch.scripts {
                    batch.scripts = scripts;
                }
                Ok(())
            })
            .await?;
        info!(batch = %batch.name, "batch updated");
        Ok(batch)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.store.delete_batch(name).await?;
        info!(batch = %name, "batch deleted");
        Ok(())
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<BatchConfig> {
        let batch = self
            .modify(name, |batch| {
                batch.enabled = enabled;
                Ok(())
            })
            .await?;
        info!(batch = %batch.name, enabled, "batch toggled");
        Ok(batch)
    }

    pub async fn add_script(&self, name: &str, script: ScriptRef) -> Result<BatchConfig> {
        if script.name.trim().is_empty() {
            return Err(Error::validation("script name is required"));
        }
        let script_name = script.name.clone();
        let batch = self
            .modify(name, |batch| {
                if batch.scripts.iter().any(|s| s.name == script.name) {
                    return Err(Error::already_exists("script", &script.name));
                }
                batch.scripts.push(script);
                Ok(())
            })
            .await?;
        info!(batch = %batch.name, script = %script_name, "script added");
        Ok(batch)
    }

    pub async fn remove_script(&self, name: &str, script: &str) -> Result<BatchConfig> {
        let batch = self
            .modify(name, |batch| {
                let before = batch.scripts.len();
                batch.scripts.retain(|s| s.name != script);
                if batch.scripts.len() == before {
                    return Err(Error::script_not_found(script));
                }
                Ok(())
            })
            .await?;
        info!(batch = %batch.name, script, "script removed");
        Ok(batch)
    }

    pub async fn update_script(
        &self,
        name: &str,
        script: &str,
        patch: ScriptRefPatch,
    ) -> Result<BatchConfig> {
        let batch = self
            .modify(name, |batch| {
                let entry = batch
                    .scripts
                    .iter_mut()
                    .find(|s| s.name == script)
                    .ok_or_else(|| Error::script_not_found(script))?;
                if let Some(handler) = patch.handler {
                    entry.handler = Some(handler).filter(|h| !h.is_empty());
                }
                if let Some(enabled) = patch.enabled {
                    entry.enabled = enabled;
                }
                if let Some(order) = patch.order {
                    entry.order = order;
                }
                Ok(())
            })
            .await?;
        info!(batch = %batch.name, script, "script updated");
        Ok(batch)
    }

    /// Enabled batches with a fire time in `(since, now]`, highest priority first.
    ///
    /// `since` is the batch's last fire from `last_fired`, or its last update.
    pub async fn find_due(
        &self,
        now_ms: u64,
        last_fired: &HashMap<String, u64>,
    ) -> Result<Vec<DueBatch>> {
        let mut due: Vec<(i32, DueBatch)> = Vec::new();
        for batch in self.list().await?.into_iter().filter(|b| b.enabled) {
            let since = last_fired
                .get(&batch.name)
                .copied()
                .unwrap_or(batch.updated_at_ms);
            let tz = self.timezone_of(&batch).to_string();
            match schedule::next_fire(&batch.schedule, Some(tz.as_str()), since) {
                Ok(Some(at)) if at <= now_ms => due.push((batch.priority, DueBatch {
                    name: batch.name,
                    schedule: batch.schedule,
                    due_at_ms: at,
                })),
                Ok(_) => {},
                Err(e) => {
                    warn!(batch = %batch.name, error = %e, "skipping batch with bad schedule");
                },
            }
        }
        due.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.due_at_ms.cmp(&b.1.due_at_ms)));
        Ok(due.into_iter().map(|(_, d)| d).collect())
    }

    /// Batches and jobs whose error rate is above `threshold` (0.0..=1.0).
    ///
    /// A batch's rate aggregates the stats of its distinct member jobs.
    pub async fn find_high_error_rate(
        &self,
        threshold: f64,
        jobs: &[Job],
    ) -> Result<Vec<ErrorRateEntry>> {
        let by_name: HashMap<&str, &Job> = jobs.iter().map(|j| (j.name.as_str(), j)).collect();
        let mut entries = Vec::new();

        for batch in self.list().await? {
            let mut members: Vec<&str> = batch.scripts.iter().map(ScriptRef::job_name).collect();
            members.sort_unstable();
            members.dedup();
            let (runs, errors) = members
                .iter()
                .filter_map(|m| by_name.get(m))
                .fold((0, 0), |(r, e), j| (r + j.run_count, e + j.error_count));
            let rate = ratio(errors, runs);
            if runs > 0 && rate > threshold {
                entries.push(ErrorRateEntry {
                    kind: ErrorRateKind::Batch,
                    name: batch.name,
                    run_count: runs,
                    error_count: errors,
                    error_rate: rate,
                });
            }
        }

        for job in jobs {
            let rate = job.error_rate();
            if job.run_count > 0 && rate > threshold {
                entries.push(ErrorRateEntry {
                    kind: ErrorRateKind::Job,
                    name: job.name.clone(),
                    run_count: job.run_count,
                    error_count: job.error_count,
                    error_rate: rate,
                });
            }
        }

        entries.sort_by(|a, b| b.error_rate.total_cmp(&a.error_rate));
        Ok(entries)
    }

    async fn modify<F>(&self, name: &str, f: F) -> Result<BatchConfig>
    where
        F: FnOnce(&mut BatchConfig) -> Result<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut batch = self.get(name).await?;
        f(&mut batch)?;
        batch.updated_at_ms = self.clock.now_ms();
        self.store.update_batch(&batch).await?;
        Ok(batch)
    }
}

fn validate_scripts(scripts: &[ScriptRef]) -> Result<()> {
    for (i, script) in scripts.iter().enumerate() {
        if script.name.trim().is_empty() {
            return Err(Error::validation("script name is required"));
        }
        if scripts[..i].iter().any(|s| s.name == script.name) {
            return Err(Error::validation(format!(
                "script {} is listed twice",
                script.name
            )));
        }
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{clock::ManualClock, store_memory::InMemoryStore},
    };

    // 2026-01-19 02:00 UTC
    const T0: u64 = 1_768_788_000_000;
    const HOUR: u64 = 3_600_000;

    fn make_catalog() -> (Arc<ManualClock>, BatchCatalog) {
        let clock = Arc::new(ManualClock::new(T0));
        let catalog = BatchCatalog::new(
            Arc::new(InMemoryStore::new()),
            Arc::clone(&clock) as Arc<dyn Clock>,
            "UTC",
        );
        (clock, catalog)
    }

    fn nightly() -> BatchConfigCreate {
        BatchConfigCreate {
            name: "nightly".into(),
            schedule: "0 3 * * *".into(),
            enabled: true,
            scripts: vec![ScriptRef::new("syncX", 1)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let (_, catalog) = make_catalog();
        let batch = catalog.create(nightly()).await.unwrap();
        assert_eq!(batch.created_at_ms, T0);
        assert_eq!(catalog.get("nightly").await.unwrap(), batch);
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let (_, catalog) = make_catalog();
        catalog.create(nightly()).await.unwrap();
        assert!(matches!(
            catalog.create(nightly()).await.unwrap_err(),
            Error::AlreadyExists { kind: "batch", .. }
        ));
    }

    #[tokio::test]
    async fn create_requires_name_and_schedule() {
        let (_, catalog) = make_catalog();
        let mut c = nightly();
        c.name = " ".into();
        assert!(matches!(
            catalog.create(c).await.unwrap_err(),
            Error::Validation { .. }
        ));

        let mut c = nightly();
        c.schedule = String::new();
        let err = catalog.create(c).await.unwrap_err();
        assert_eq!(err.to_string(), "validation failed: schedule is required");
    }

    #[tokio::test]
    async fn create_rejects_bad_schedule_and_timezone() {
        let (_, catalog) = make_catalog();
        let mut c = nightly();
        c.schedule = "0 3 * *".into();
        assert!(matches!(
            catalog.create(c).await.unwrap_err(),
            Error::InvalidSchedule { .. }
        ));

        let mut c = nightly();
        c.timezone = Some("Europe/Atlantis".into());
        assert!(matches!(
            catalog.create(c).await.unwrap_err(),
            Error::UnknownTimezone { .. }
        ));
        assert!(catalog.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_is_partial_and_revalidates() {
        let (clock, catalog) = make_catalog();
        catalog.create(nightly()).await.unwrap();
        clock.advance(1_000);

        let updated = catalog
            .update("nightly", BatchConfigPatch {
                priority: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(updated.priority, 5);
        assert_eq!(updated.schedule, "0 3 * * *");
        assert_eq!(updated.updated_at_ms, T0 + 1_000);

        let err = catalog
            .update("nightly", BatchConfigPatch {
                schedule: Some("every night".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule { .. }));

        assert!(matches!(
            catalog
                .update("ghost", BatchConfigPatch::default())
                .await
                .unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn delete_and_toggle() {
        let (_, catalog) = make_catalog();
        catalog.create(nightly()).await.unwrap();
        assert!(!catalog.set_enabled("nightly", false).await.unwrap().enabled);
        catalog.delete("nightly").await.unwrap();
        assert!(matches!(
            catalog.delete("nightly").await.unwrap_err(),
            Error::NotFound { .. }
        ));
        assert!(catalog.set_enabled("nightly", true).await.is_err());
    }

    #[tokio::test]
    async fn script_membership() {
        let (_, catalog) = make_catalog();
        catalog.create(nightly()).await.unwrap();

        let batch = catalog
            .add_script("nightly", ScriptRef::new("syncY", 2))
            .await
            .unwrap();
        assert_eq!(batch.scripts.len(), 2);
        assert!(matches!(
            catalog
                .add_script("nightly", ScriptRef::new("syncY", 3))
                .await
                .unwrap_err(),
            Error::AlreadyExists { kind: "script", .. }
        ));

        let batch = catalog
            .update_script("nightly", "syncY", ScriptRefPatch {
                enabled: Some(false),
                order: Some(0),
                ..Default::default()
            })
            .await
            .unwrap();
        let y = batch.scripts.iter().find(|s| s.name == "syncY").unwrap();
        assert!(!y.enabled);
        assert_eq!(y.order, 0);

        assert!(matches!(
            catalog
                .update_script("nightly", "nope", ScriptRefPatch::default())
                .await
                .unwrap_err(),
            Error::NotFound { kind: "script", .. }
        ));

        let batch = catalog.remove_script("nightly", "syncY").await.unwrap();
        assert_eq!(batch.scripts.len(), 1);
        assert!(catalog.remove_script("nightly", "syncY").await.is_err());
        assert!(matches!(
            catalog
                .add_script("ghost", ScriptRef::new("a", 0))
                .await
                .unwrap_err(),
            Error::NotFound { kind: "batch", .. }
        ));
    }

    #[tokio::test]
    async fn find_due_uses_last_fire() {
        let (_, catalog) = make_catalog();
        catalog.create(nightly()).await.unwrap();
        let mut hourly = nightly();
        hourly.name = "hourly".into();
        hourly.schedule = "0 * * * *".into();
        hourly.priority = 10;
        catalog.create(hourly).await.unwrap();

        // Nothing has come due yet at 02:00.
        assert!(catalog.find_due(T0, &HashMap::new()).await.unwrap().is_empty());

        // At 03:30 both are due; hourly first by priority.
        let due = catalog
            .find_due(T0 + HOUR + HOUR / 2, &HashMap::new())
            .await
            .unwrap();
        let names: Vec<_> = due.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["hourly", "nightly"]);
        assert_eq!(due[1].due_at_ms, T0 + HOUR);

        // Once nightly has fired at 03:00 it is no longer due.
        let fired = HashMap::from([("nightly".to_string(), T0 + HOUR)]);
        let due = catalog
            .find_due(T0 + HOUR + HOUR / 2, &fired)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn error_rate_aggregates_member_jobs() {
        let (_, catalog) = make_catalog();
        let mut c = nightly();
        let mut alias = ScriptRef::new("contratAssurance", 2);
        alias.handler = Some("syncX".into());
        c.scripts.push(alias);
        catalog.create(c).await.unwrap();

        let mut x = Job::new("syncX", None, 0);
        x.run_count = 4;
        x.error_count = 3;
        let mut y = Job::new("syncY", None, 0);
        y.run_count = 10;
        y.error_count = 1;

        let entries = catalog.find_high_error_rate(0.5, &[x, y]).await.unwrap();
        assert_eq!(entries.len(), 2);
        // The shared job is counted once for the batch.
        let batch = entries
            .iter()
            .find(|e| e.kind == ErrorRateKind::Batch)
            .unwrap();
        assert_eq!(batch.run_count, 4);
        assert!((batch.error_rate - 0.75).abs() < f64::EPSILON);
        assert!(entries.iter().all(|e| e.name != "syncY"));
    }
}
