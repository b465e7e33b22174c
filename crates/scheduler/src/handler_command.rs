//! Handlers backed by external commands, configured under `[[handlers]]`.

use std::{process::Stdio, sync::Arc};

use {
    anyhow::{Context as _, bail},
    async_trait::async_trait,
    synchro_config::HandlerConfig,
    tokio::process::Command,
    tracing::debug,
};

use crate::handler::{HandlerRegistry, JobContext, JobHandler, JobOutput};

/// Stdout line a command prints to report its external call volume.
pub const EXTERNAL_CALLS_MARKER: &str = "SYNCHRO_EXTERNAL_CALLS=";

/// Runs a command to completion. Exit code 0 is success.
///
/// The child is killed if the run future is dropped, so a timeout does not
/// leave it behind.
pub struct CommandHandler {
    config: HandlerConfig,
}

impl CommandHandler {
    /// Fails if the config cannot produce a runnable command.
    pub fn new(config: HandlerConfig) -> anyhow::Result<Self> {
        if config.command.trim().is_empty() {
            bail!("handler {} has no command", config.name);
        }
        if let Some(dir) = &config.working_dir
            && !dir.is_dir()
        {
            bail!("working directory {} does not exist", dir.display());
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<JobOutput> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .env("SYNCHRO_JOB", &ctx.job_name)
            .env("SYNCHRO_RUN_ID", &ctx.run_id)
            .env("SYNCHRO_TRIGGER", ctx.trigger.to_string())
            .env("SYNCHRO_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        debug!(job = %ctx.job_name, command = %self.config.command, "spawning handler command");
        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to spawn {}", self.config.command))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            match last_line(&stderr) {
                Some(line) => bail!("{line}"),
                None => bail!("{} exited with {}", self.config.command, output.status),
            }
        }

        Ok(parse_output(&stdout))
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|l| !l.is_empty())
}

fn parse_output(stdout: &str) -> JobOutput {
    let mut out = JobOutput::default();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line.strip_prefix(EXTERNAL_CALLS_MARKER) {
            Some(count) => out.external_call_count = count.trim().parse().unwrap_or(0),
            None => out.message = Some(line.to_string()),
        }
    }
    out
}

/// Register one factory per `[[handlers]]` entry.
pub fn register_commands(registry: &mut HandlerRegistry, handlers: &[HandlerConfig]) {
    for config in handlers {
        let config = config.clone();
        let description = config.description.clone();
        registry.register_factory(config.name.clone(), description, move || {
            Ok(Arc::new(CommandHandler::new(config.clone())?) as Arc<dyn JobHandler>)
        });
    }
}
