//! HTTP admin API served by the master.
//!
//! Every endpoint answers with the same envelope:
//!
//! ```json
//! { "errno": 0, "msg": "success", "data": ... }
//! ```
//!
//! `errno` is `-1` on failure and `msg` carries the error text.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{CronError, Result};
use crate::master::{JobManager, LogManager, WorkerManager};
use crate::scheduler::Job;

const DEFAULT_LOG_LIMIT: usize = 20;

#[derive(Clone)]
pub struct ApiState {
    pub jobs: JobManager,
    pub logs: LogManager,
    pub workers: WorkerManager,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub errno: i32,
    pub msg: String,
    pub data: Value,
}

impl ApiResponse {
    pub fn success(data: impl Serialize) -> Self {
        Self {
            errno: 0,
            msg: "success".to_string(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            errno: -1,
            msg: msg.into(),
            data: Value::Null,
        }
    }
}

/// Error side of a handler, rendered into the envelope.
struct ApiError(CronError);

impl From<CronError> for ApiError {
    fn from(e: CronError) -> Self {
        Self(e)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self(CronError::Serialization(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CronError::InvalidJob(_)
            | CronError::InvalidCronExpr { .. }
            | CronError::Serialization(_) => StatusCode::BAD_REQUEST,
            CronError::JobNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "API request failed");
        }
        (status, Json(ApiResponse::failure(self.0.to_string()))).into_response()
    }
}

type ApiResult = std::result::Result<Json<ApiResponse>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct SaveJobForm {
    /// JSON-encoded [`Job`].
    pub job: String,
}

#[derive(Debug, Deserialize)]
pub struct JobNameForm {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub name: String,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

/// API routes with default settings: no static files.
pub fn router(state: ApiState) -> Router {
    router_with_config(state, &ApiConfig::default())
}

/// API routes plus, when `config.webroot` is set, the static files under it
/// for every other path.
pub fn router_with_config(state: ApiState, config: &ApiConfig) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut routes = Router::new()
        .route("/job/save", post(save_job_handler))
        .route("/job/delete", post(delete_job_handler))
        .route("/job/list", get(list_jobs_handler))
        .route("/job/kill", post(kill_job_handler))
        .route("/job/log", get(job_log_handler))
        .route("/worker/list", get(list_workers_handler));

    if let Some(webroot) = &config.webroot {
        routes = routes.fallback_service(ServeDir::new(webroot));
    }

    routes
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_api(config: ApiConfig, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let addr = config.listen_addr;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
        CronError::Io(e)
    })?;
    tracing::info!(addr = %addr, webroot = ?config.webroot, "Admin API listening");

    axum::serve(listener, router_with_config(state, &config))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("Admin API stopped");
    Ok(())
}

async fn save_job_handler(State(state): State<ApiState>, Form(form): Form<SaveJobForm>) -> ApiResult {
    let job: Job = serde_json::from_str(&form.job)?;
    let prev = state.jobs.save_job(job).await?;
    Ok(Json(ApiResponse::success(prev)))
}

async fn delete_job_handler(
    State(state): State<ApiState>,
    Form(form): Form<JobNameForm>,
) -> ApiResult {
    let prev = state.jobs.delete_job(&form.name).await?;
    Ok(Json(ApiResponse::success(prev)))
}

async fn list_jobs_handler(State(state): State<ApiState>) -> ApiResult {
    let jobs = state.jobs.list_jobs().await?;
    Ok(Json(ApiResponse::success(jobs)))
}

async fn kill_job_handler(State(state): State<ApiState>, Form(form): Form<JobNameForm>) -> ApiResult {
    state.jobs.kill_job(&form.name).await?;
    Ok(Json(ApiResponse::success(Value::Null)))
}

async fn job_log_handler(State(state): State<ApiState>, Query(query): Query<LogQuery>) -> ApiResult {
    let logs = state
        .logs
        .list_logs(
            &query.name,
            query.skip.unwrap_or(0),
            query.limit.unwrap_or(DEFAULT_LOG_LIMIT),
        )
        .await?;
    Ok(Json(ApiResponse::success(logs)))
}

async fn list_workers_handler(State(state): State<ApiState>) -> ApiResult {
    let workers = state.workers.list_workers().await?;
    Ok(Json(ApiResponse::success(workers)))
}
