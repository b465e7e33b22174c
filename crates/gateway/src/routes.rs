//! JSON API over the scheduler.
//!
//! Bodies are read as raw bytes and parsed here, so malformed JSON and
//! wrongly typed fields come back as `400 validation` instead of axum's 422.

use std::time::Duration;

use {
    axum::{
        Json,
        body::Bytes,
        extract::{Path, Query, State},
        http::StatusCode,
        response::IntoResponse,
    },
    serde::{Deserialize, de::DeserializeOwned},
    serde_json::{Value, json},
    synchro_scheduler::types::{BatchConfigCreate, BatchConfigPatch, ScriptRef, ScriptRefPatch},
};

use crate::{error::ApiError, server::AppState};

type ApiResult<T> = Result<T, ApiError>;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const DEFAULT_ERROR_RATE_THRESHOLD: f64 = 0.1;

/// Parse a JSON object body. An empty body reads as `{}`.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    let value: Value = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON: {e}")))?
    };
    if !value.is_object() {
        return Err(ApiError::bad_request("expected a JSON object"));
    }
    serde_json::from_value(value).map_err(|e| ApiError::bad_request(e.to_string()))
}

fn enabled_flag(body: &Bytes) -> ApiResult<bool> {
    let value: Value = parse_body(body)?;
    value
        .get("enabled")
        .and_then(Value::as_bool)
        .ok_or_else(|| ApiError::bad_request("enabled must be a boolean"))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": state.version,
        "running": state.scheduler.is_running().await,
    }))
}

// ── Jobs ────────────────────────────────────────────────────────────────────

pub async fn list_jobs(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.list_jobs().await?))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.get_job(&name).await?))
}

pub async fn patch_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let enabled = enabled_flag(&body)?;
    state.scheduler.set_job_enabled(&name, enabled).await?;
    Ok(Json(state.scheduler.get_job(&name).await?))
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.scheduler.remove_job(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

pub async fn job_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Ok(Json(state.scheduler.job_history(&name, limit).await?))
}

pub async fn request_run(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job = state.scheduler.request_run(&name).await?;
    Ok(Json(json!({
        "job": job.name,
        "runId": job.requested_run_id,
        "status": job.status,
    })))
}

// ── Batches ─────────────────────────────────────────────────────────────────

pub async fn list_batches(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.list_batches().await?))
}

pub async fn create_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let create: BatchConfigCreate = parse_body(&body)?;
    let batch = state.scheduler.create_batch(create).await?;
    Ok((StatusCode::CREATED, Json(batch)))
}

pub async fn get_batch(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.get_batch(&name).await?))
}

pub async fn update_batch(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let patch: BatchConfigPatch = parse_body(&body)?;
    Ok(Json(state.scheduler.update_batch(&name, patch).await?))
}

pub async fn delete_batch(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.scheduler.delete_batch(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn enable_batch(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.set_batch_enabled(&name, true).await?))
}

pub async fn disable_batch(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.set_batch_enabled(&name, false).await?))
}

pub async fn fire_batch(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.fire_batch(&name).await?))
}

pub async fn add_script(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let script: ScriptRef = parse_body(&body)?;
    Ok(Json(state.scheduler.add_script(&name, script).await?))
}

pub async fn update_script(
    State(state): State<AppState>,
    Path((name, script)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let patch: ScriptRefPatch = parse_body(&body)?;
    Ok(Json(state.scheduler.update_script(&name, &script, patch).await?))
}

pub async fn remove_script(
    State(state): State<AppState>,
    Path((name, script)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.remove_script(&name, &script).await?))
}

pub async fn due_batches(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.due_batches().await?))
}

// ── Triggers, reaper, stats ─────────────────────────────────────────────────

pub async fn trigger_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.trigger_status().await)
}

pub async fn reload(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.reload().await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SweepRequest {
    threshold_secs: Option<u64>,
}

pub async fn sweep(State(state): State<AppState>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let request: SweepRequest = parse_body(&body)?;
    let threshold = request.threshold_secs.map(Duration::from_secs);
    Ok(Json(state.scheduler.sweep(threshold).await?))
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.stats().await)
}

#[derive(Debug, Deserialize)]
pub struct ErrorRateQuery {
    threshold: Option<f64>,
}

pub async fn error_rates(
    State(state): State<AppState>,
    Query(query): Query<ErrorRateQuery>,
) -> ApiResult<impl IntoResponse> {
    let threshold = query.threshold.unwrap_or(DEFAULT_ERROR_RATE_THRESHOLD);
    Ok(Json(state.scheduler.error_rates(threshold).await?))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use {
        axum::{
            Router,
            body::Body,
            http::{Request, Response},
        },
        synchro_config::SchedulerConfig,
        synchro_scheduler::{
            Scheduler,
            clock::{Clock, ManualClock},
            handler::{HandlerRegistry, JobOutput, handler_fn},
            store_memory::InMemoryStore,
            types::JobStatus,
        },
        tower::ServiceExt,
    };

    use {super::*, crate::server::build_app};

    // 2026-01-19 02:00 UTC
    const T0: u64 = 1_768_788_000_000;

    fn app_with(handlers: HandlerRegistry) -> (Arc<Scheduler>, Router) {
        let scheduler = Arc::new(Scheduler::with_clock(
            SchedulerConfig::default(),
            Arc::new(InMemoryStore::new()),
            handlers,
            Arc::new(ManualClock::new(T0)) as Arc<dyn Clock>,
            None,
        ));
        (Arc::clone(&scheduler), build_app(scheduler))
    }

    fn app() -> (Arc<Scheduler>, Router) {
        let mut handlers = HandlerRegistry::new();
        handlers
            .register(
                "syncX",
                Some("CRM contacts".into()),
                handler_fn(|_| async { Ok(JobOutput::message("12 contacts")) }),
            )
            .register(
                "syncY",
                None,
                handler_fn(|_| async { anyhow::bail!("quota exceeded") }),
            );
        app_with(handlers)
    }

    async fn discovered() -> (Arc<Scheduler>, Router) {
        let (scheduler, app) = app();
        scheduler.discover().await.unwrap();
        (scheduler, app)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Response<Body> {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            },
            None => Body::empty(),
        };
        app.clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap()
    }

    async fn json_body(response: Response<Body>) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn nightly() -> Value {
        json!({
            "name": "nightly",
            "schedule": "0 3 * * *",
            "category": "crm",
            "scripts": [{ "name": "syncX", "order": 1, "enabled": true }],
        })
    }

    #[tokio::test]
    async fn health_reports_running_flag() {
        let (_, app) = app();
        let response = call(&app, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn request_run_returns_run_id() {
        let (_, app) = discovered().await;
        let response = call(&app, "POST", "/api/jobs/syncX/run", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["job"], "syncX");
        assert_eq!(body["status"], "requested");
        assert!(body["runId"].as_str().is_some_and(|id| !id.is_empty()));

        let again = call(&app, "POST", "/api/jobs/syncX/run", None).await;
        assert_eq!(again.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(again).await["error"], "invalid_transition");

        let missing = call(&app, "POST", "/api/jobs/ghost/run", None).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn request_while_running_is_409() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let wait_on = Arc::clone(&gate);
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "syncX",
            None,
            handler_fn(move |_| {
                let gate = Arc::clone(&wait_on);
                async move {
                    gate.notified().await;
                    Ok(JobOutput::default())
                }
            }),
        );
        let (scheduler, app) = app_with(handlers);
        scheduler.discover().await.unwrap();
        scheduler.request_run("syncX").await.unwrap();

        let ticker = Arc::clone(&scheduler);
        let tick = tokio::spawn(async move { ticker.tick().await });
        for _ in 0..100 {
            if scheduler.get_job("syncX").await.unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = call(&app, "POST", "/api/jobs/syncX/run", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["error"], "invalid_transition");

        gate.notify_one();
        assert_eq!(tick.await.unwrap().succeeded, 1);
    }

    #[tokio::test]
    async fn patch_job_requires_boolean() {
        let (_, app) = discovered().await;
        let bad = call(&app, "PATCH", "/api/jobs/syncX", Some(json!({ "enabled": "yes" }))).await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(bad).await["error"], "validation");

        let ok = call(&app, "PATCH", "/api/jobs/syncX", Some(json!({ "enabled": false }))).await;
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(json_body(ok).await["enabled"], false);

        let refused = call(&app, "POST", "/api/jobs/syncX/run", None).await;
        assert_eq!(refused.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn delete_job_outside_batches() {
        let (_, app) = discovered().await;
        call(&app, "POST", "/api/batches", Some(nightly())).await;

        let in_use = call(&app, "DELETE", "/api/jobs/syncX", None).await;
        assert_eq!(in_use.status(), StatusCode::BAD_REQUEST);

        let deleted = call(&app, "DELETE", "/api/jobs/syncY", None).await;
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
        let gone = call(&app, "GET", "/api/jobs/syncY", None).await;
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn batch_crud() {
        let (_, app) = discovered().await;
        let created = call(&app, "POST", "/api/batches", Some(nightly())).await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let body = json_body(created).await;
        assert_eq!(body["enabled"], true);
        assert_eq!(body["scripts"][0]["name"], "syncX");

        let duplicate = call(&app, "POST", "/api/batches", Some(nightly())).await;
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let patched = call(
            &app,
            "PATCH",
            "/api/batches/nightly",
            Some(json!({ "schedule": "*/15 * * * *" })),
        )
        .await;
        assert_eq!(patched.status(), StatusCode::OK);
        assert_eq!(json_body(patched).await["schedule"], "*/15 * * * *");

        let disabled = call(&app, "POST", "/api/batches/nightly/disable", None).await;
        assert_eq!(json_body(disabled).await["enabled"], false);

        let list = json_body(call(&app, "GET", "/api/batches", None).await).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let deleted = call(&app, "DELETE", "/api/batches/nightly", None).await;
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
        let gone = call(&app, "GET", "/api/batches/nightly", None).await;
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn create_batch_validation() {
        let (_, app) = app();
        let cases = [
            json!({ "schedule": "0 3 * * *" }),
            json!({ "name": "x" }),
            json!({ "name": "x", "schedule": "invalid" }),
            json!({ "name": "x", "schedule": "* * * *" }),
            json!({ "name": "x", "schedule": "0 3 * * *", "timezone": "Mars/Olympus" }),
            json!({ "name": "x", "schedule": "0 3 * * *", "enabled": "true" }),
        ];
        for case in cases {
            let response = call(&app, "POST", "/api/batches", Some(case.clone())).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{case}");
        }

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/batches")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn script_routes() {
        let (_, app) = discovered().await;
        call(&app, "POST", "/api/batches", Some(nightly())).await;

        let added = call(
            &app,
            "POST",
            "/api/batches/nightly/scripts",
            Some(json!({ "name": "syncY", "order": 2 })),
        )
        .await;
        assert_eq!(added.status(), StatusCode::OK);
        assert_eq!(json_body(added).await["scripts"].as_array().unwrap().len(), 2);

        let duplicate = call(
            &app,
            "POST",
            "/api/batches/nightly/scripts",
            Some(json!({ "name": "syncY" })),
        )
        .await;
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let updated = call(
            &app,
            "PATCH",
            "/api/batches/nightly/scripts/syncY",
            Some(json!({ "enabled": false })),
        )
        .await;
        assert_eq!(json_body(updated).await["scripts"][1]["enabled"], false);

        let removed = call(&app, "DELETE", "/api/batches/nightly/scripts/syncY", None).await;
        assert_eq!(json_body(removed).await["scripts"].as_array().unwrap().len(), 1);

        let missing = call(&app, "DELETE", "/api/batches/nightly/scripts/syncY", None).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fire_reload_and_stats() {
        let (_, app) = discovered().await;
        let mut batch = nightly();
        batch["scripts"] = json!([
            { "name": "syncY", "order": 1 },
            { "name": "syncX", "order": 2 },
        ]);
        call(&app, "POST", "/api/batches", Some(batch)).await;

        let reload = json_body(call(&app, "POST", "/api/reload", None).await).await;
        assert_eq!(reload["active"], json!(["nightly"]));
        assert_eq!(reload["rejected"], json!([]));

        let triggers = json_body(call(&app, "GET", "/api/triggers", None).await).await;
        assert_eq!(triggers[0]["state"], "bound");

        let report = json_body(call(&app, "POST", "/api/batches/nightly/fire", None).await).await;
        assert_eq!(report["outcome"], "failed");
        assert_eq!(report["scripts"][0]["status"], "failed");
        assert_eq!(report["scripts"][1]["status"], "succeeded");

        let job = json_body(call(&app, "GET", "/api/jobs/syncY", None).await).await;
        assert_eq!(job["lastError"], "quota exceeded");
        assert_eq!(job["frequency"], "daily at 03:00");

        let history = json_body(call(&app, "GET", "/api/jobs/syncX/history?limit=5", None).await).await;
        assert_eq!(history.as_array().unwrap().len(), 1);

        let stats = json_body(call(&app, "GET", "/api/stats", None).await).await;
        assert_eq!(stats["totalRuns"], 2);
        assert_eq!(stats["totalErrors"], 1);
        assert_eq!(stats["categories"]["crm"]["batches"], 1);

        let rates = json_body(call(&app, "GET", "/api/stats/error-rate?threshold=0.9", None).await).await;
        assert_eq!(rates.as_array().unwrap().len(), 1);
        assert_eq!(rates[0]["name"], "syncY");

        let bad = call(&app, "GET", "/api/stats/error-rate?threshold=2", None).await;
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sweep_and_due() {
        let (_, app) = discovered().await;
        let sweep = call(&app, "POST", "/api/reaper/sweep", Some(json!({ "thresholdSecs": 60 }))).await;
        assert_eq!(sweep.status(), StatusCode::OK);
        assert_eq!(json_body(sweep).await["jobsAffected"], 0);

        call(&app, "POST", "/api/batches", Some(nightly())).await;
        let due = json_body(call(&app, "GET", "/api/batches/due", None).await).await;
        assert_eq!(due, json!([]));
    }

    #[tokio::test]
    async fn empty_stats_never_fail() {
        let (_, app) = app();
        let response = call(&app, "GET", "/api/stats", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["totalJobs"], 0);
        assert_eq!(body["errorRate"], 0.0);
    }
}
