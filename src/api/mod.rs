//! HTTP API.
//!
//! The chat stream rides on Server-Sent Events; everything else is plain
//! JSON. Error bodies always go through the sanitized external form so
//! internal details stay in the logs.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::runner::{AgentPipeline, DagExecutor, RunRegistry};
use crate::storage::SqliteStorage;
use crate::stream::{StreamOrchestrator, StreamRequest};
use crate::workflow::{WorkflowDefinition, WorkflowService};
use crate::Error;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: WorkflowService,
    pub orchestrator: StreamOrchestrator,
    pub pipeline: AgentPipeline,
    pub dag: DagExecutor,
    pub registry: RunRegistry,
    pub storage: SqliteStorage,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(self.to_external_json())).into_response()
    }
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": { "code": "NOT_FOUND", "message": format!("{} not found", what) }
        })),
    )
        .into_response()
}

pub fn create_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
}

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat/stream", get(chat_stream))
        .route("/api/workflows/{id}/run", post(run_pipeline))
        .route("/api/workflows/{id}/status", get(workflow_status))
        .route("/api/workflows/{id}", get(get_workflow).delete(delete_workflow))
        .route("/api/definitions/execute", post(execute_definition))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(64))
        .layer(create_cors_layer())
        .with_state(state)
}

/// Query shape the frontend sends. The workflow id doubles as the chat
/// conversation id; missing ids get server-generated ones. `context` is a
/// JSON string; an unparseable one is dropped rather than failing the
/// stream.
#[derive(Debug, serde::Deserialize)]
struct ChatStreamQuery {
    message: String,
    #[serde(default, alias = "workflowId", alias = "conversationId")]
    workflow_id: Option<String>,
    #[serde(default, alias = "messageId")]
    message_id: Option<String>,
    #[serde(default, alias = "ownerId")]
    owner_id: Option<String>,
    #[serde(default)]
    context: Option<String>,
}

/// SSE chat stream. Each event is one JSON-encoded protocol event; the
/// connection closing stops the driver task.
async fn chat_stream(
    State(state): State<AppState>,
    Query(query): Query<ChatStreamQuery>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let context = query
        .context
        .as_deref()
        .and_then(|c| serde_json::from_str(c).ok())
        .unwrap_or(serde_json::Value::Null);

    let request = StreamRequest {
        workflow_id: query
            .workflow_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        message_id: query
            .message_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        message: query.message,
        owner_id: query.owner_id,
        context,
    };
    let rx = state.orchestrator.stream(request);
    let stream = ReceiverStream::new(rx).map(|event| {
        Ok(Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{}")))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, serde::Deserialize, Default)]
struct RunPipelineBody {
    #[serde(default)]
    title: Option<String>,
}

async fn run_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RunPipelineBody>>,
) -> Result<Json<serde_json::Value>, Error> {
    let title = body
        .and_then(|Json(b)| b.title)
        .unwrap_or_else(|| "Agent pipeline run".to_string());

    let run_id = state.pipeline.start(&id, &title).await?;
    Ok(Json(json!({ "runId": run_id, "workflowId": id })))
}

async fn execute_definition(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Response {
    let report = definition.validate();
    if !report.valid {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": { "code": "VALIDATION_ERROR", "message": "Workflow definition is invalid" },
                "errors": report.errors,
            })),
        )
            .into_response();
    }

    match state.dag.start(definition).await {
        Ok(run_id) => Json(json!({ "runId": run_id })).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_execution(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id).await {
        Some(record) => Json(record).into_response(),
        None => not_found("Execution"),
    }
}

async fn get_workflow(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.load_full_state(&id).await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => not_found("Workflow"),
        Err(e) => e.into_response(),
    }
}

async fn workflow_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.get(&id).await {
        Ok(Some(workflow)) => Json(json!({
            "id": workflow.id,
            "status": workflow.status,
            "progress": workflow.progress,
            "currentStep": workflow.current_step,
            "totalSteps": workflow.total_steps,
            "error": workflow.error,
        }))
        .into_response(),
        Ok(None) => not_found("Workflow"),
        Err(e) => e.into_response(),
    }
}

async fn delete_workflow(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.soft_delete(&id).await {
        Ok(true) => Json(json!({ "deleted": true })).into_response(),
        Ok(false) => not_found("Workflow"),
        Err(e) => e.into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    match state.storage.check_health().await {
        Ok(health) => {
            let healthy = health.foreign_keys_enabled
                && health.integrity_check.eq_ignore_ascii_case("ok");
            Json(json!({
                "status": if healthy { "healthy" } else { "degraded" },
                "database": health,
            }))
            .into_response()
        }
        Err(e) => e.into_response(),
    }
}
