//! Cron bindings: one timer task per enabled batch.
//!
//! A binding is `Bound` while it waits for the next fire time and `Firing`
//! while its batch runs. Fires are detached from the binding task, so a
//! reload never cancels a batch that is already running.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use {
    serde::Serialize,
    tokio::{sync::Mutex, task::JoinHandle},
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use crate::telemetry::{gauge, names};
use crate::{
    Error, Result,
    catalog::BatchCatalog,
    clock::Clock,
    runner::BatchRunner,
    schedule,
    types::BatchRunReport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BindingState {
    Bound,
    Firing,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatus {
    pub batch: String,
    pub schedule: String,
    pub timezone: String,
    pub state: BindingState,
    pub next_fire_at_ms: Option<u64>,
    pub last_fired_at_ms: Option<u64>,
    pub last_report: Option<BatchRunReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedBatch {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadReport {
    /// Batches bound after the reload.
    pub active: Vec<String>,
    /// Enabled batches whose schedule could not be bound.
    pub rejected: Vec<RejectedBatch>,
}

#[derive(Debug, Default)]
struct Runtime {
    firing: bool,
    next_fire_at_ms: Option<u64>,
    last_fired_at_ms: Option<u64>,
    last_report: Option<BatchRunReport>,
}

struct Binding {
    schedule: String,
    timezone: String,
    handle: JoinHandle<()>,
}

struct Shared {
    catalog: Arc<BatchCatalog>,
    runner: Arc<BatchRunner>,
    clock: Arc<dyn Clock>,
    runtime: StdMutex<HashMap<String, Runtime>>,
}

pub struct TriggerManager {
    shared: Arc<Shared>,
    bindings: Mutex<BTreeMap<String, Binding>>,
}

impl TriggerManager {
    pub fn new(catalog: Arc<BatchCatalog>, runner: Arc<BatchRunner>, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                catalog,
                runner,
                clock,
                runtime: StdMutex::new(HashMap::new()),
            }),
            bindings: Mutex::new(BTreeMap::new()),
        }
    }

    /// Tear down every binding, then bind each enabled batch of the catalog.
    ///
    /// The bindings lock is held throughout, so no fire can be scheduled
    /// against a half-rebuilt set.
    pub async fn reload(&self) -> Result<ReloadReport> {
        let batches = self.shared.catalog.list().await?;
        let mut bindings = self.bindings.lock().await;
        let torn_down = teardown(std::mem::take(&mut *bindings)).await;

        let now = self.shared.clock.now_ms();
        let mut report = ReloadReport::default();
        for batch in batches.into_iter().filter(|b| b.enabled) {
            let timezone = self.shared.catalog.timezone_of(&batch).to_string();
            let next = match schedule::next_fire(&batch.schedule, Some(&timezone), now) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    report.rejected.push(RejectedBatch {
                        name: batch.name.clone(),
                        reason: format!("schedule {} never fires", batch.schedule),
                    });
                    continue;
                },
                Err(e) => {
                    warn!(batch = %batch.name, error = %e, "batch not bound");
                    report.rejected.push(RejectedBatch {
                        name: batch.name.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                },
            };

            self.shared.update(&batch.name, |rt| rt.next_fire_at_ms = Some(next));
            let handle = tokio::spawn(binding_loop(
                Arc::clone(&self.shared),
                batch.name.clone(),
                batch.schedule.clone(),
                timezone.clone(),
            ));
            bindings.insert(batch.name.clone(), Binding {
                schedule: batch.schedule,
                timezone,
                handle,
            });
            report.active.push(batch.name);
        }

        #[cfg(feature = "metrics")]
        gauge!(names::BOUND_TRIGGERS).set(report.active.len() as f64);

        info!(
            torn_down,
            active = report.active.len(),
            rejected = report.rejected.len(),
            "triggers reloaded"
        );
        Ok(report)
    }

    /// Run a batch now, whether or not it is enabled or bound.
    pub async fn fire(&self, name: &str) -> Result<BatchRunReport> {
        self.shared.fire(name).await
    }

    pub async fn status(&self) -> Vec<TriggerStatus> {
        let bindings = self.bindings.lock().await;
        let runtime = self.shared.runtime.lock().unwrap_or_else(|e| e.into_inner());
        bindings
            .iter()
            .map(|(name, binding)| {
                let rt = runtime.get(name);
                TriggerStatus {
                    batch: name.clone(),
                    schedule: binding.schedule.clone(),
                    timezone: binding.timezone.clone(),
                    state: if rt.is_some_and(|rt| rt.firing) {
                        BindingState::Firing
                    } else {
                        BindingState::Bound
                    },
                    next_fire_at_ms: rt.and_then(|rt| rt.next_fire_at_ms),
                    last_fired_at_ms: rt.and_then(|rt| rt.last_fired_at_ms),
                    last_report: rt.and_then(|rt| rt.last_report.clone()),
                }
            })
            .collect()
    }

    /// Last fire time per batch, as input for due-batch detection.
    #[must_use]
    pub fn last_fired(&self) -> HashMap<String, u64> {
        let runtime = self.shared.runtime.lock().unwrap_or_else(|e| e.into_inner());
        runtime
            .iter()
            .filter_map(|(name, rt)| rt.last_fired_at_ms.map(|t| (name.clone(), t)))
            .collect()
    }

    /// Abort every binding. Fires already running finish on their own.
    pub async fn shutdown(&self) {
        let mut bindings = self.bindings.lock().await;
        teardown(std::mem::take(&mut *bindings)).await;

        #[cfg(feature = "metrics")]
        gauge!(names::BOUND_TRIGGERS).set(0.0);

        info!("triggers shut down");
    }
}

/// Abort every binding task and wait until each has ended, so none can
/// start a fire afterwards. Returns how many were torn down.
async fn teardown(bindings: BTreeMap<String, Binding>) -> usize {
    let count = bindings.len();
    let handles: Vec<_> = bindings
        .into_iter()
        .map(|(name, binding)| {
            binding.handle.abort();
            (name, binding.handle)
        })
        .collect();
    for (name, handle) in handles {
        match handle.await {
            Ok(()) => {},
            Err(e) if e.is_cancelled() => {},
            Err(e) => error!(batch = %name, error = %e, "binding task ended abnormally"),
        }
    }
    count
}

impl Shared {
    fn update(&self, name: &str, f: impl FnOnce(&mut Runtime)) {
        let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        f(runtime.entry(name.to_string()).or_default());
    }

    async fn fire(&self, name: &str) -> Result<BatchRunReport> {
        let batch = self.catalog.get(name).await?;
        let _guard = FiringGuard::acquire(self, name)?;
        let report = self.runner.run(&batch).await;
        self.update(name, |rt| {
            rt.last_fired_at_ms = Some(report.fired_at_ms);
            rt.last_report = Some(report.clone());
        });
        Ok(report)
    }
}

/// Marks a batch as firing for as long as it lives.
struct FiringGuard<'a> {
    shared: &'a Shared,
    name: String,
}

impl<'a> FiringGuard<'a> {
    fn acquire(shared: &'a Shared, name: &str) -> Result<Self> {
        let mut runtime = shared.runtime.lock().unwrap_or_else(|e| e.into_inner());
        let rt = runtime.entry(name.to_string()).or_default();
        if rt.firing {
            return Err(Error::batch_firing(name));
        }
        rt.firing = true;
        Ok(Self {
            shared,
            name: name.to_string(),
        })
    }
}

impl Drop for FiringGuard<'_> {
    fn drop(&mut self) {
        self.shared.update(&self.name, |rt| rt.firing = false);
    }
}

async fn binding_loop(shared: Arc<Shared>, name: String, schedule: String, timezone: String) {
    let mut after = shared.clock.now_ms();
    loop {
        let next = match schedule::next_fire(&schedule, Some(&timezone), after) {
            Ok(Some(next)) => next,
            Ok(None) => {
                warn!(batch = %name, "schedule has no further fire times");
                break;
            },
            Err(e) => {
                error!(batch = %name, error = %e, "binding stopped");
                break;
            },
        };
        shared.update(&name, |rt| rt.next_fire_at_ms = Some(next));

        let wait = next.saturating_sub(shared.clock.now_ms());
        debug!(batch = %name, next_fire_at_ms = next, wait_ms = wait, "binding armed");
        tokio::time::sleep(Duration::from_millis(wait)).await;

        let fire_shared = Arc::clone(&shared);
        let fire_name = name.clone();
        tokio::spawn(async move {
            match fire_shared.fire(&fire_name).await {
                Ok(_) => {},
                Err(Error::BatchFiring { .. }) => {
                    warn!(batch = %fire_name, "previous fire still running, skipping");
                },
                Err(e) => error!(batch = %fire_name, error = %e, "scheduled fire failed"),
            }
        });

        // A late wake-up skips missed fire times instead of replaying them.
        after = next.max(shared.clock.now_ms());
    }
}
