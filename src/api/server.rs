use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{AggregatorError, ErrorClass};
use crate::model::ProcessStatus;
use crate::pipeline::Orchestrator;

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// HTTP server for the trigger route
pub struct ApiServer {
    state: ApiState,
    bind: SocketAddr,
}

impl ApiServer {
    pub fn new(orchestrator: Arc<Orchestrator>, bind: SocketAddr) -> Self {
        Self {
            state: ApiState { orchestrator },
            bind,
        }
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn serve<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.bind).await?;
        info!("Starting API server on {}", listener.local_addr()?);

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// Build API router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/runs", post(trigger_run))
        .route("/api/v1/runs/{process_uuid}", get(get_run))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn status_for(error: &AggregatorError) -> StatusCode {
    match (error, error.class()) {
        (AggregatorError::RecordNotFound(_), _) => StatusCode::NOT_FOUND,
        (_, ErrorClass::Transient | ErrorClass::Lock) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: AggregatorError) -> Response {
    let status = status_for(&error);
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

// API Handlers

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn trigger_run(State(state): State<Arc<ApiState>>) -> Response {
    match state.orchestrator.trigger().await {
        Ok(record) => {
            let status = match record.status {
                ProcessStatus::Complete => StatusCode::OK,
                _ => StatusCode::ACCEPTED,
            };
            (status, Json(record)).into_response()
        }
        Err(e) => {
            warn!("Run failed: {}", e);
            error_response(e)
        }
    }
}

async fn get_run(
    State(state): State<Arc<ApiState>>,
    Path(process_uuid): Path<String>,
) -> Response {
    match state.orchestrator.records().load(&process_uuid).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => error_response(AggregatorError::RecordNotFound(process_uuid)),
        Err(e) => {
            warn!(process_id = %process_uuid, "Failed to load run: {}", e);
            error_response(e)
        }
    }
}
