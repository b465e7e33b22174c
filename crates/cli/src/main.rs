mod config_commands;
mod schedule_commands;

use std::{path::Path, sync::Arc};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    synchro_config::{Severity, SynchroConfig},
    synchro_scheduler::{
        Scheduler,
        handler::HandlerRegistry,
        handler_command::register_commands,
        runner::NotifyFn,
        store::open_store,
        types::BatchNotification,
    },
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "synchro", about = "Synchro: job scheduling and state tracking")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Config file (overrides discovery in ./ and ~/.config/synchro/).
    #[arg(long, global = true, env = "SYNCHRO_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and the HTTP API (default when no subcommand is provided).
    Serve,
    /// Validate a cron expression and show its next fire times.
    CheckSchedule {
        /// Five-field cron expression, quoted.
        expr: String,
        /// IANA timezone to evaluate the schedule in.
        #[arg(long)]
        timezone: Option<String>,
        /// Number of fire times to print.
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
    /// Force-fail runs left open longer than the stale threshold.
    Reap {
        /// Override the configured stale threshold.
        #[arg(long)]
        threshold_secs: Option<u64>,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Explicit `--config` must load; otherwise discover and fall back to defaults.
pub(crate) fn load_config(path: Option<&Path>) -> anyhow::Result<SynchroConfig> {
    match path {
        Some(path) => synchro_config::load_config(path),
        None => Ok(synchro_config::discover_and_load()),
    }
}

fn log_notification(notification: BatchNotification) {
    match notification {
        BatchNotification::Succeeded { report } => info!(
            batch = %report.batch,
            scripts = report.scripts.len(),
            "batch succeeded"
        ),
        BatchNotification::Failed { report } => {
            let failed: Vec<&str> = report
                .scripts
                .iter()
                .filter(|s| s.status == synchro_scheduler::types::ScriptRunStatus::Failed)
                .map(|s| s.script.as_str())
                .collect();
            warn!(batch = %report.batch, failed = ?failed, "batch failed");
        },
    }
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let validation = synchro_config::validate::validate_config(&config);
    for d in &validation.diagnostics {
        match d.severity {
            Severity::Error => error!(path = %d.path, "{}", d.message),
            _ => warn!(path = %d.path, "{}", d.message),
        }
    }
    if validation.has_errors() {
        anyhow::bail!(
            "configuration has {} error(s); run `synchro config check`",
            validation.count(Severity::Error)
        );
    }

    let bind = cli.bind.unwrap_or(config.server.bind);
    let port = cli.port.unwrap_or(config.server.port);

    let store = open_store(&config.storage)
        .await
        .context("failed to open scheduler store")?;
    let mut handlers = HandlerRegistry::new();
    register_commands(&mut handlers, &config.handlers);
    if handlers.is_empty() {
        warn!("no handlers configured; every job run will fail");
    }

    let notify: NotifyFn = Arc::new(log_notification);
    let scheduler = Arc::new(Scheduler::new(
        config.scheduler,
        store,
        handlers,
        Some(notify),
    ));
    scheduler.start().await?;

    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let app = synchro_gateway::build_app(Arc::clone(&scheduler));
    let served = synchro_gateway::serve(listener, app, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown requested");
    })
    .await;

    scheduler.stop().await;
    served
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "synchro starting");

    match cli.command {
        None | Some(Commands::Serve) => serve(cli).await,
        Some(Commands::CheckSchedule {
            ref expr,
            ref timezone,
            count,
        }) => schedule_commands::check_schedule(expr, timezone.as_deref(), count),
        Some(Commands::Reap { threshold_secs }) => {
            let config = load_config(cli.config.as_deref())?;
            schedule_commands::reap(&config, threshold_secs).await
        },
        Some(Commands::Config { action }) => {
            config_commands::handle_config(action, cli.config.as_deref())
        },
    }
}
