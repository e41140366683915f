use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::controller::{JobController, JobRequest};
use crate::error::WorkerError;
use crate::metrics::PrometheusRecorder;

#[derive(Clone)]
pub struct ApiState {
    pub controller: JobController,
    pub metrics: PrometheusRecorder,
}

#[derive(Serialize)]
struct StartJobResponse {
    success: bool,
    job_id: Option<String>,
    error: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Routes of the operator-facing HTTP surface.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/api/jobs", get(list_jobs_handler).post(start_job_handler))
        .route("/api/jobs/:id", get(query_job_handler))
        .route("/api/jobs/:id/cancel", post(cancel_job_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` is cancelled.
///
/// # Errors
///
/// [`WorkerError::Io`] if the listener cannot bind or the server fails.
pub async fn run_server(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> Result<(), WorkerError> {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting metrics and job control server");

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind metrics server");
        e
    })?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Metrics server failed");
            WorkerError::Io(e)
        })
}

fn error_response(status: StatusCode, error: &WorkerError) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("invalid job id: {}", e),
            }),
        )
            .into_response()
    })
}

async fn metrics_handler(State(state): State<ApiState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, state.metrics.content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode metrics");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.controller.list().await)
}

async fn start_job_handler(
    State(state): State<ApiState>,
    Json(request): Json<JobRequest>,
) -> impl IntoResponse {
    match state.controller.submit(request).await {
        Ok(id) => (
            StatusCode::ACCEPTED,
            Json(StartJobResponse {
                success: true,
                job_id: Some(id.to_string()),
                error: None,
            }),
        ),
        Err(e) => {
            let status = match e {
                WorkerError::JobExists(_) => StatusCode::CONFLICT,
                WorkerError::Config(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(StartJobResponse {
                    success: false,
                    job_id: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn query_job_handler(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.controller.query(id).await {
        Ok(status) => Json(status).into_response(),
        Err(e @ WorkerError::JobNotFound(_)) => error_response(StatusCode::NOT_FOUND, &e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

async fn cancel_job_handler(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.controller.cancel(id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e @ WorkerError::JobNotFound(_)) => error_response(StatusCode::NOT_FOUND, &e),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}
