//! Job handlers: the units of work the scheduler invokes by job name.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, RwLock},
};

use {async_trait::async_trait, tracing::warn};

use crate::types::TriggerSource;

/// What a handler is told about the run it is executing.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_name: String,
    pub run_id: String,
    pub trigger: TriggerSource,
    /// 0 for the first attempt, incremented per batch retry.
    pub attempt: u32,
}

/// Result of a successful handler invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub message: Option<String>,
    /// Calls made to external systems, reported for the dashboard.
    pub external_call_count: u64,
}

impl JobOutput {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            external_call_count: 0,
        }
    }

    #[must_use]
    pub fn with_external_calls(mut self, count: u64) -> Self {
        self.external_call_count = count;
        self
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JobOutput>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JobOutput>> + Send,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JobOutput> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<JobOutput>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Builds a handler at discovery time. An `Err` disables the job.
pub type HandlerFactory = Box<dyn Fn() -> anyhow::Result<Arc<dyn JobHandler>> + Send + Sync>;

struct Registration {
    name: String,
    description: Option<String>,
    factory: HandlerFactory,
}

/// Outcome of instantiating one registered handler.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub name: String,
    pub description: Option<String>,
    /// Load failure message, if the factory failed.
    pub error: Option<String>,
}

/// Name to handler mapping, populated explicitly before the scheduler starts.
#[derive(Default)]
pub struct HandlerRegistry {
    registrations: Vec<Registration>,
    resolved: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ready-made handler. A later registration under the same
    /// name replaces the earlier one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        description: Option<String>,
        handler: Arc<dyn JobHandler>,
    ) -> &mut Self {
        self.register_factory(name, description, move || Ok(Arc::clone(&handler)))
    }

    pub fn register_factory<F>(
        &mut self,
        name: impl Into<String>,
        description: Option<String>,
        factory: F,
    ) -> &mut Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn JobHandler>> + Send + Sync + 'static,
    {
        let name = name.into();
        if let Some(pos) = self.registrations.iter().position(|r| r.name == name) {
            warn!(handler = %name, "handler registered twice, keeping the last one");
            self.registrations.remove(pos);
        }
        self.registrations.push(Registration {
            name,
            description,
            factory: Box::new(factory),
        });
        self
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Instantiate every registration. Failures are reported, never raised.
    pub fn discover(&self) -> Vec<Discovered> {
        let mut resolved = self.resolved.write().unwrap_or_else(|e| e.into_inner());
        resolved.clear();

        self.registrations
            .iter()
            .map(|reg| {
                let error = match (reg.factory)() {
                    Ok(handler) => {
                        resolved.insert(reg.name.clone(), handler);
                        None
                    },
                    Err(e) => {
                        warn!(handler = %reg.name, error = %e, "handler failed to load");
                        Some(format!("{e:#}"))
                    },
                };
                Discovered {
                    name: reg.name.clone(),
                    description: reg.description.clone(),
                    error,
                }
            })
            .collect()
    }

    /// Handler for `name`, if it was discovered successfully.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        let resolved = self.resolved.read().unwrap_or_else(|e| e.into_inner());
        resolved.get(name).cloned()
    }
}
