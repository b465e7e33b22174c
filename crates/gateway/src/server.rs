use std::{future::Future, sync::Arc};

use {
    axum::{
        Router,
        routing::{get, patch, post},
    },
    synchro_scheduler::Scheduler,
    tokio::net::TcpListener,
    tower_http::cors::{Any, CorsLayer},
    tracing::info,
};

use crate::routes;

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub version: &'static str,
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the API router (shared between production startup and tests).
pub fn build_app(scheduler: Arc<Scheduler>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = AppState {
        scheduler,
        version: env!("CARGO_PKG_VERSION"),
    };

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/jobs", get(routes::list_jobs))
        .route(
            "/api/jobs/{name}",
            get(routes::get_job)
                .patch(routes::patch_job)
                .delete(routes::delete_job),
        )
        .route("/api/jobs/{name}/history", get(routes::job_history))
        .route("/api/jobs/{name}/run", post(routes::request_run))
        .route(
            "/api/batches",
            get(routes::list_batches).post(routes::create_batch),
        )
        .route("/api/batches/due", get(routes::due_batches))
        .route(
            "/api/batches/{name}",
            get(routes::get_batch)
                .patch(routes::update_batch)
                .delete(routes::delete_batch),
        )
        .route("/api/batches/{name}/enable", post(routes::enable_batch))
        .route("/api/batches/{name}/disable", post(routes::disable_batch))
        .route("/api/batches/{name}/fire", post(routes::fire_batch))
        .route("/api/batches/{name}/scripts", post(routes::add_script))
        .route(
            "/api/batches/{name}/scripts/{script}",
            patch(routes::update_script).delete(routes::remove_script),
        )
        .route("/api/triggers", get(routes::trigger_status))
        .route("/api/reload", post(routes::reload))
        .route("/api/reaper/sweep", post(routes::sweep))
        .route("/api/stats", get(routes::stats))
        .route("/api/stats/error-rate", get(routes::error_rates))
        .layer(cors)
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, "http api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("http api stopped");
    Ok(())
}
