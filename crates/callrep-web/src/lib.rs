//! JSON API over the report service: job triggers, monthly queries and admin repairs.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use callrep_core::Period;
use callrep_storage::StoreError;
use callrep_sync::{JobRunner, ReportService, SyncError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "callrep-web";

const DEFAULT_REPORT_LIMIT: usize = 20;
const DEFAULT_SEARCH_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub service: ReportService,
    pub jobs: JobRunner,
}

impl AppState {
    pub fn new(jobs: JobRunner) -> Self {
        Self {
            service: jobs.service().clone(),
            jobs,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ScrapeRequest {
    year: Option<i32>,
    month: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoricalRequest {
    months_back: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    name: String,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PerformanceQuery {
    min_calls: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Listing<T> {
    count: usize,
    items: Vec<T>,
}

impl<T> From<Vec<T>> for Listing<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            count: items.len(),
            items,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/scrape", post(scrape_handler))
        .route("/api/scrape/historical", post(historical_handler))
        .route("/api/results/{run_id}", get(job_status_handler))
        .route("/api/jobs", get(recent_jobs_handler))
        .route("/api/months", get(months_handler))
        .route("/api/agents/names", get(agent_names_handler))
        .route("/api/agents/search", get(agent_search_handler))
        .route("/api/agents/performance", get(agent_performance_handler))
        .route("/api/agents/{year}/{month}", get(agents_by_month_handler))
        .route("/api/agents/{year}/{month}/{name}", get(agent_in_month_handler))
        .route("/api/statistics", get(overall_statistics_handler))
        .route("/api/statistics/{year}/{month}", get(monthly_statistics_handler))
        .route("/api/reports", get(recent_reports_handler))
        .route("/api/reports/run/{run_id}", get(report_by_run_handler))
        .route("/api/reports/{year}/{month}", get(reports_by_month_handler))
        .route("/api/admin/repair-run/{run_id}", post(repair_run_handler))
        .route("/api/admin/repair-period/{year}/{month}", post(repair_period_handler))
        .route("/api/admin/backfill", post(backfill_handler))
        .route("/api/admin/dedupe", post(dedupe_handler))
        .route("/api/admin/migrate-schema", post(migrate_schema_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, backend = state.service.store().backend_name(), "serving report API");
    axum::serve(listener, app(state)).await.context("serving http")?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "store": state.service.store().backend_name(),
        "extractor": state.jobs.extractor_name(),
    }))
    .into_response()
}

async fn scrape_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: ScrapeRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let target = match (request.year, request.month) {
        (None, None) => None,
        (Some(year), Some(month)) => match Period::new(year, month) {
            Some(period) => Some(period),
            None => return sync_error(SyncError::InvalidPeriod { year, month }),
        },
        _ => return bad_request("year and month must be given together"),
    };

    match state.jobs.trigger_scrape(target).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn historical_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: HistoricalRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    match state.jobs.trigger_historical(request.months_back).await {
        Ok(trigger) => (StatusCode::ACCEPTED, Json(trigger)).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Response {
    match state.jobs.job_status(&run_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => not_found(format!("no job {run_id}")),
        Err(err) => sync_error(err),
    }
}

async fn recent_jobs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_REPORT_LIMIT);
    json_or_error(state.jobs.recent_jobs(limit).await.map(Listing::from))
}

async fn months_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(state.service.get_available_months().await.map(Listing::from))
}

async fn agents_by_month_handler(
    State(state): State<Arc<AppState>>,
    Path((year, month)): Path<(i32, u32)>,
) -> Response {
    json_or_error(state.service.get_agents_by_month(year, month).await.map(Listing::from))
}

async fn agent_in_month_handler(
    State(state): State<Arc<AppState>>,
    Path((year, month, name)): Path<(i32, u32, String)>,
) -> Response {
    match state.service.get_agent_by_name_and_month(&name, year, month).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => not_found(format!("no record for {name} in {year}-{month:02}")),
        Err(err) => sync_error(err),
    }
}

async fn agent_names_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(state.service.get_all_agent_names().await.map(Listing::from))
}

async fn agent_search_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    json_or_error(
        state
            .service
            .get_agent_history(&query.name, limit)
            .await
            .map(Listing::from),
    )
}

async fn agent_performance_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PerformanceQuery>,
) -> Response {
    let min_calls = query.min_calls.unwrap_or(0.0);
    json_or_error(
        state
            .service
            .search_agents_by_performance(min_calls)
            .await
            .map(Listing::from),
    )
}

async fn overall_statistics_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(state.service.get_overall_statistics().await)
}

async fn monthly_statistics_handler(
    State(state): State<Arc<AppState>>,
    Path((year, month)): Path<(i32, u32)>,
) -> Response {
    json_or_error(state.service.get_monthly_statistics(year, month).await)
}

async fn recent_reports_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_REPORT_LIMIT);
    json_or_error(state.service.get_recent_reports(limit).await.map(Listing::from))
}

async fn reports_by_month_handler(
    State(state): State<Arc<AppState>>,
    Path((year, month)): Path<(i32, u32)>,
) -> Response {
    json_or_error(state.service.get_reports_by_month(year, month).await.map(Listing::from))
}

async fn report_by_run_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Response {
    match state.service.get_report_by_run_id(&run_id).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => not_found(format!("no report for run {run_id}")),
        Err(err) => sync_error(err),
    }
}

async fn repair_run_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Response {
    json_or_error(state.service.repair_run(&run_id).await)
}

async fn repair_period_handler(
    State(state): State<Arc<AppState>>,
    Path((year, month)): Path<(i32, u32)>,
) -> Response {
    json_or_error(state.service.repair_period(year, month).await)
}

async fn backfill_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(state.service.backfill_missing_periods().await)
}

async fn dedupe_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(state.service.deduplicate_period_records().await)
}

async fn migrate_schema_handler(State(state): State<Arc<AppState>>) -> Response {
    json_or_error(state.service.migrate_to_monthly_schema().await)
}

/// Empty bodies fall back to the request's defaults.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| bad_request(format!("invalid request body: {err}")))
}

fn json_or_error<T: Serialize>(result: Result<T, SyncError>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => sync_error(err),
    }
}

fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::InvalidPeriod { .. } | SyncError::InvalidRow(_) => StatusCode::BAD_REQUEST,
        SyncError::RunNotFound(_)
        | SyncError::NoReportsForPeriod(_)
        | SyncError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        SyncError::Store(StoreError::DuplicateKey(_)) => StatusCode::CONFLICT,
        SyncError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn sync_error(err: SyncError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    error_body(status, err.to_string())
}

fn bad_request(message: impl Into<String>) -> Response {
    error_body(StatusCode::BAD_REQUEST, message.into())
}

fn not_found(message: impl Into<String>) -> Response {
    error_body(StatusCode::NOT_FOUND, message.into())
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use callrep_adapters::FixtureExtractor;
    use callrep_core::JobRecord;
    use callrep_storage::MemoryStore;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::path::{Path as FsPath, PathBuf};
    use std::time::Duration;
    use tower::ServiceExt;

    fn fixture_path(name: &str) -> PathBuf {
        FsPath::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/agent_report")
            .join(name)
    }

    fn state() -> AppState {
        let service = ReportService::new(Arc::new(MemoryStore::new()));
        let extractor = Arc::new(FixtureExtractor::new(fixture_path("basic_run.json")));
        AppState::new(JobRunner::new(service, extractor).with_historical_limits(Duration::ZERO, 3))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn wait_for_job(app: &Router, run_id: &str) -> Value {
        for _ in 0..200 {
            let (status, job) = send(app, "GET", &format!("/api/results/{run_id}"), None).await;
            assert_eq!(status, StatusCode::OK);
            if matches!(job["status"].as_str(), Some("completed" | "failed")) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {run_id} did not finish");
    }

    #[tokio::test]
    async fn scrape_trigger_runs_to_completion_and_feeds_queries() {
        let app = app(state());

        let (status, job) = send(&app, "POST", "/api/scrape", Some(json!({"year": 2024, "month": 12}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job: JobRecord = serde_json::from_value(job).unwrap();
        assert!(job.run_id.starts_with("task_20241201_"));

        let finished = wait_for_job(&app, &job.run_id).await;
        assert_eq!(finished["status"], "completed");
        assert_eq!(finished["agents_saved"], 2);

        let (status, agents) = send(&app, "GET", "/api/agents/2024/12", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(agents["count"], 2);
        assert_eq!(agents["items"][0]["agent_name"], "Ivanova");

        let (status, petrov) = send(&app, "GET", "/api/agents/2024/12/petrov", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(petrov["incoming_calls"]["total"], "12");

        let (_, months) = send(&app, "GET", "/api/months", None).await;
        assert_eq!(months["items"][0]["month_year"], "2024-12");

        let (_, stats) = send(&app, "GET", "/api/statistics/2024/12", None).await;
        assert_eq!(stats["total_agents"], 2);
        assert_eq!(stats["total_incoming_calls"], 17.0);
        assert_eq!(stats["latest_run_id"], job.run_id.as_str());

        let (status, report) = send(&app, "GET", &format!("/api/reports/run/{}", job.run_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["period_source"], "explicit");
    }

    #[tokio::test]
    async fn scrape_without_body_targets_payload_period() {
        let app = app(state());
        let (status, job) = send(&app, "POST", "/api/scrape", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let run_id = job["run_id"].as_str().unwrap().to_string();
        assert_eq!(wait_for_job(&app, &run_id).await["status"], "completed");

        let (_, agents) = send(&app, "GET", "/api/agents/2025/1", None).await;
        assert_eq!(agents["count"], 2);
    }

    #[tokio::test]
    async fn bad_periods_and_bodies_are_rejected() {
        let app = app(state());

        let (status, body) = send(&app, "GET", "/api/agents/2025/13", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid period"));

        let (status, _) = send(&app, "POST", "/api/scrape", Some(json!({"year": 2025}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "POST", "/api/scrape", Some(json!({"year": 2025, "month": 0}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_runs_and_jobs_are_not_found() {
        let app = app(state());

        let (status, _) = send(&app, "GET", "/api/results/task_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, "POST", "/api/admin/repair-run/task_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("task_missing"));

        let (status, _) = send(&app, "POST", "/api/admin/repair-period/2025/1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/api/reports/run/task_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_period_reads_are_empty_not_errors() {
        let app = app(state());
        let (status, agents) = send(&app, "GET", "/api/agents/2025/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(agents["count"], 0);

        let (status, stats) = send(&app, "GET", "/api/statistics/2025/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total_reports"], 0);
    }

    #[tokio::test]
    async fn admin_batches_answer_with_summaries() {
        let state = state();
        state
            .service
            .save_report(
                callrep_adapters::load_payload_file(&fixture_path("basic_run.json")).unwrap(),
                "task_20250115_093000",
                None,
                None,
            )
            .await
            .unwrap();
        let app = app(state);

        let (status, repaired) = send(&app, "POST", "/api/admin/repair-run/task_20250115_093000", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(repaired["agents_before"], 2);
        assert_eq!(repaired["agents_after"], 2);

        let (status, period) = send(&app, "POST", "/api/admin/repair-period/2025/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(period["total_reports"], 1);

        let (status, backfill) = send(&app, "POST", "/api/admin/backfill", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(backfill["inspected"], 0);

        let (status, dedupe) = send(&app, "POST", "/api/admin/dedupe", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(dedupe["records_deleted"], 0);
        assert_eq!(dedupe["index_restored"], true);

        let (status, migration) = send(&app, "POST", "/api/admin/migrate-schema", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(migration["dedupe"]["unique_keys"], 2);
    }

    #[tokio::test]
    async fn name_queries_and_listings() {
        let state = state();
        state
            .service
            .save_report(
                callrep_adapters::load_payload_file(&fixture_path("basic_run.json")).unwrap(),
                "task_20250115_093000",
                None,
                None,
            )
            .await
            .unwrap();
        let app = app(state);

        let (_, names) = send(&app, "GET", "/api/agents/names", None).await;
        assert_eq!(names["items"], json!(["Ivanova", "Petrov"]));

        let (_, search) = send(&app, "GET", "/api/agents/search?name=IVAN", None).await;
        assert_eq!(search["count"], 1);

        let (_, busy) = send(&app, "GET", "/api/agents/performance?min_calls=10", None).await;
        assert_eq!(busy["count"], 1);
        assert_eq!(busy["items"][0]["agent_name"], "Petrov");

        let (_, reports) = send(&app, "GET", "/api/reports?limit=5", None).await;
        assert_eq!(reports["count"], 1);

        let (_, by_month) = send(&app, "GET", "/api/reports/2025/1", None).await;
        assert_eq!(by_month["items"][0]["run_id"], "task_20250115_093000");

        let (_, overall) = send(&app, "GET", "/api/statistics", None).await;
        assert_eq!(overall["total_agents"], 2);
        assert_eq!(overall["months_covered"], 1);
    }

    #[tokio::test]
    async fn historical_trigger_is_accepted_and_clamped() {
        let app = app(state());
        let (status, trigger) = send(&app, "POST", "/api/scrape/historical", Some(json!({"months_back": 10}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(trigger["months_back"], 3);
        assert_eq!(trigger["jobs"].as_array().unwrap().len(), 3);

        let (status, jobs) = send(&app, "GET", "/api/jobs?limit=10", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(jobs["count"], 3);
    }
}
