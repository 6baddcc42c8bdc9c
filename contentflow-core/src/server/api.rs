//! HTTP API for workflow sessions

use crate::error::WorkflowError;
use crate::models::admission::AdmissionStats;
use crate::workflow::circuit_breaker::BreakerSnapshot;
use crate::workflow::orchestrator::WorkflowOrchestrator;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::Filter;

/// Header carrying the authenticated user id, set by the fronting gateway
pub const USER_ID_HEADER: &str = "x-user-id";

type ApiReply = WithStatus<Json>;

/// Request body for POST /api/v1/workflows
#[derive(Debug, Clone, Deserialize)]
pub struct StartWorkflowRequest {
    pub prompt: String,
}

/// Error body shared by every route
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_wait_ms: Option<u64>,
}

/// Health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub admission: AdmissionStats,
    pub breakers: Vec<BreakerSnapshot>,
}

fn error_reply(err: &WorkflowError) -> ApiReply {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorResponse {
        error: err.code().to_string(),
        message: err.to_string(),
        retryable: err.is_retryable(),
        estimated_wait_ms: err.estimated_wait_ms(),
    };
    warp::reply::with_status(warp::reply::json(&body), status)
}

fn json_reply<T: Serialize>(result: Result<T, WorkflowError>, status: StatusCode) -> ApiReply {
    match result {
        Ok(value) => warp::reply::with_status(warp::reply::json(&value), status),
        Err(e) => error_reply(&e),
    }
}

/// Create HTTP API routes
pub fn create_api_routes(
    orchestrator: WorkflowOrchestrator,
) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
    let orchestrator_filter = warp::any().map(move || orchestrator.clone());

    // POST /api/v1/workflows - Start a workflow
    let start_workflow = warp::path!("api" / "v1" / "workflows")
        .and(warp::post())
        .and(warp::header::optional::<String>(USER_ID_HEADER))
        .and(warp::body::json())
        .and(orchestrator_filter.clone())
        .and_then(handle_start_workflow);

    // GET /api/v1/workflows/:id - Session status
    let get_status = warp::path!("api" / "v1" / "workflows" / Uuid)
        .and(warp::get())
        .and(orchestrator_filter.clone())
        .and_then(handle_get_status);

    // POST /api/v1/workflows/:id/advance - Run the next step
    let advance = warp::path!("api" / "v1" / "workflows" / Uuid / "advance")
        .and(warp::post())
        .and(orchestrator_filter.clone())
        .and_then(handle_advance);

    // POST /api/v1/workflows/:id/steps/:step/regenerate - Re-run one step
    let regenerate = warp::path!("api" / "v1" / "workflows" / Uuid / "steps" / String / "regenerate")
        .and(warp::post())
        .and(orchestrator_filter.clone())
        .and_then(handle_regenerate);

    // POST /api/v1/workflows/:id/cancel - Cancel a session
    let cancel = warp::path!("api" / "v1" / "workflows" / Uuid / "cancel")
        .and(warp::post())
        .and(orchestrator_filter.clone())
        .and_then(handle_cancel);

    // GET /api/v1/users/:user_id/workflows - Sessions of one user
    let list_sessions = warp::path!("api" / "v1" / "users" / String / "workflows")
        .and(warp::get())
        .and(orchestrator_filter.clone())
        .and_then(handle_list_sessions);

    // GET /api/v1/health - Health check endpoint
    let health = warp::path!("api" / "v1" / "health")
        .and(warp::get())
        .and(orchestrator_filter)
        .and_then(handle_health);

    start_workflow
        .or(get_status)
        .or(advance)
        .or(regenerate)
        .or(cancel)
        .or(list_sessions)
        .or(health)
        .recover(handle_rejection)
}

/// Handle POST /api/v1/workflows
async fn handle_start_workflow(
    user_id: Option<String>,
    request: StartWorkflowRequest,
    orchestrator: WorkflowOrchestrator,
) -> Result<ApiReply, warp::Rejection> {
    let Some(user_id) = user_id.filter(|id| !id.trim().is_empty()) else {
        return Ok(error_reply(&WorkflowError::Unauthenticated));
    };

    let result = orchestrator
        .start_workflow(&request.prompt, &user_id)
        .await;
    Ok(json_reply(result, StatusCode::ACCEPTED))
}

/// Handle GET /api/v1/workflows/:id
async fn handle_get_status(
    session_id: Uuid,
    orchestrator: WorkflowOrchestrator,
) -> Result<ApiReply, warp::Rejection> {
    Ok(json_reply(orchestrator.get_status(session_id), StatusCode::OK))
}

/// Handle POST /api/v1/workflows/:id/advance
async fn handle_advance(
    session_id: Uuid,
    orchestrator: WorkflowOrchestrator,
) -> Result<ApiReply, warp::Rejection> {
    Ok(json_reply(
        orchestrator.advance(session_id).await,
        StatusCode::OK,
    ))
}

/// Handle POST /api/v1/workflows/:id/steps/:step/regenerate
async fn handle_regenerate(
    session_id: Uuid,
    step: String,
    orchestrator: WorkflowOrchestrator,
) -> Result<ApiReply, warp::Rejection> {
    Ok(json_reply(
        orchestrator.regenerate_step(session_id, &step).await,
        StatusCode::OK,
    ))
}

/// Handle POST /api/v1/workflows/:id/cancel
async fn handle_cancel(
    session_id: Uuid,
    orchestrator: WorkflowOrchestrator,
) -> Result<ApiReply, warp::Rejection> {
    Ok(json_reply(
        orchestrator.cancel(session_id).await,
        StatusCode::OK,
    ))
}

/// Handle GET /api/v1/users/:user_id/workflows
async fn handle_list_sessions(
    user_id: String,
    orchestrator: WorkflowOrchestrator,
) -> Result<ApiReply, warp::Rejection> {
    Ok(json_reply(
        orchestrator.list_sessions(&user_id),
        StatusCode::OK,
    ))
}

/// Handle GET /api/v1/health
async fn handle_health(orchestrator: WorkflowOrchestrator) -> Result<ApiReply, warp::Rejection> {
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        admission: orchestrator.admission().stats(),
        breakers: orchestrator.breakers().snapshot(),
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&response),
        StatusCode::OK,
    ))
}

/// Turn unmatched routes and malformed bodies into JSON errors
async fn handle_rejection(err: warp::Rejection) -> Result<ApiReply, Infallible> {
    let (status, code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found", "Route not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, "invalid_input", e.to_string())
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "invalid_input",
            "Expected a JSON body".to_string(),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "Method not allowed".to_string(),
        )
    } else {
        tracing::error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "Internal server error".to_string(),
        )
    };

    let body = ErrorResponse {
        error: code.to_string(),
        message,
        retryable: false,
        estimated_wait_ms: None,
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}
