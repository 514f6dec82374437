//! HTTP routes
//!
//! Delegate-facing endpoints (register, heartbeat, poll, acquire, validation,
//! response), task submission and inspection, and the throttle surface.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::delegate::{ConnectionHeartbeat, DelegateScope, DelegateStatus, NewDelegate};
use crate::dispatch::ExecutionOutcome;
use crate::error::Result;
use crate::task::{ConnectionCheck, DelegateTaskResponse, TaskRequest};
use crate::throttle::{ConsumerRequest, ConsumerState, ResourceConstraintInstance};
use crate::AppState;

type SharedState = State<Arc<AppState>>;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        // Delegates
        .route(
            "/accounts/:account/delegates",
            post(register_delegate).get(list_delegates),
        )
        .route(
            "/accounts/:account/delegates/:delegate_id",
            get(get_delegate).delete(delete_delegate),
        )
        .route(
            "/accounts/:account/delegates/:delegate_id/heartbeat",
            post(delegate_heartbeat),
        )
        .route("/accounts/:account/delegates/:delegate_id/tags", put(update_tags))
        .route("/accounts/:account/delegates/:delegate_id/scopes", put(update_scopes))
        .route("/accounts/:account/delegates/:delegate_id/status", put(set_status))
        .route("/accounts/:account/delegates/:delegate_id/tasks", get(pending_tasks))
        .route(
            "/accounts/:account/delegates/:delegate_id/tasks/:task_id/acquire",
            post(acquire_task),
        )
        .route(
            "/accounts/:account/delegates/:delegate_id/tasks/:task_id/validation",
            post(report_validation),
        )
        .route(
            "/accounts/:account/delegates/:delegate_id/tasks/:task_id/response",
            post(task_response),
        )
        // Tasks
        .route("/accounts/:account/tasks", post(queue_task))
        .route("/accounts/:account/tasks/execute", post(execute_task))
        .route("/accounts/:account/tasks/:task_id", get(get_task))
        .route("/accounts/:account/tasks/:task_id/abort", post(abort_task))
        .route(
            "/accounts/:account/tasks/:task_id/selection-logs",
            get(selection_logs),
        )
        // Resource constraints
        .route(
            "/accounts/:account/constraints",
            post(ensure_constraint).get(list_constraints),
        )
        .route("/constraints/instances", get(list_instances))
        .route("/constraints/entities/finish", post(finish_entity))
        .route(
            "/constraints/:constraint_id",
            get(get_constraint).delete(delete_constraint),
        )
        .route("/constraints/:constraint_id/capacity", put(update_capacity))
        .route(
            "/constraints/:constraint_id/units/:unit/acquire",
            post(acquire_permits),
        )
        .route(
            "/constraints/:constraint_id/units/:unit/release",
            post(release_permits),
        )
        .route(
            "/constraints/:constraint_id/units/:unit/promote",
            post(promote_blocked),
        )
}

// Delegates

async fn register_delegate(
    State(state): SharedState,
    Path(account): Path<String>,
    Json(req): Json<NewDelegate>,
) -> Result<impl IntoResponse> {
    let delegate = state.registry.register(&account, req).await?;
    Ok((StatusCode::CREATED, Json(delegate)))
}

async fn list_delegates(
    State(state): SharedState,
    Path(account): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.registry.list(&account).await?))
}

async fn get_delegate(
    State(state): SharedState,
    Path((account, delegate_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.registry.get(&account, delegate_id).await?))
}

async fn delete_delegate(
    State(state): SharedState,
    Path((account, delegate_id)): Path<(String, Uuid)>,
) -> Result<StatusCode> {
    state.registry.delete(&account, delegate_id).await?;
    state
        .coordinator
        .whitelist()
        .clear_for_delegate(&account, delegate_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delegate_heartbeat(
    State(state): SharedState,
    Path((account, delegate_id)): Path<(String, Uuid)>,
    Json(heartbeat): Json<ConnectionHeartbeat>,
) -> Result<impl IntoResponse> {
    let connection = state
        .registry
        .register_heartbeat(&account, delegate_id, heartbeat)
        .await?;
    Ok(Json(connection))
}

#[derive(Debug, Deserialize)]
struct UpdateTagsRequest {
    tags: Vec<String>,
}

async fn update_tags(
    State(state): SharedState,
    Path((account, delegate_id)): Path<(String, Uuid)>,
    Json(req): Json<UpdateTagsRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state.registry.update_tags(&account, delegate_id, req.tags).await?,
    ))
}

#[derive(Debug, Deserialize)]
struct UpdateScopesRequest {
    #[serde(default)]
    include_scopes: Vec<Option<DelegateScope>>,
    #[serde(default)]
    exclude_scopes: Vec<Option<DelegateScope>>,
}

async fn update_scopes(
    State(state): SharedState,
    Path((account, delegate_id)): Path<(String, Uuid)>,
    Json(req): Json<UpdateScopesRequest>,
) -> Result<impl IntoResponse> {
    let delegate = state
        .registry
        .update_scopes(&account, delegate_id, req.include_scopes, req.exclude_scopes)
        .await?;
    Ok(Json(delegate))
}

#[derive(Debug, Deserialize)]
struct SetStatusRequest {
    status: DelegateStatus,
}

async fn set_status(
    State(state): SharedState,
    Path((account, delegate_id)): Path<(String, Uuid)>,
    Json(req): Json<SetStatusRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state.registry.set_status(&account, delegate_id, req.status).await?,
    ))
}

async fn pending_tasks(
    State(state): SharedState,
    Path((account, delegate_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .coordinator
            .pending_task_events(&account, delegate_id)
            .await?,
    ))
}

async fn acquire_task(
    State(state): SharedState,
    Path((account, delegate_id, task_id)): Path<(String, Uuid, Uuid)>,
) -> Result<Response> {
    match state
        .coordinator
        .acquire_delegate_task(&account, delegate_id, task_id)
        .await?
    {
        Some(outcome) => Ok(Json(outcome).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct ValidationReport {
    results: Vec<ConnectionCheck>,
}

async fn report_validation(
    State(state): SharedState,
    Path((account, delegate_id, task_id)): Path<(String, Uuid, Uuid)>,
    Json(report): Json<ValidationReport>,
) -> Result<Response> {
    match state
        .coordinator
        .report_connection_results(&account, delegate_id, task_id, &report.results)
        .await?
    {
        Some(task) => Ok(Json(task).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn task_response(
    State(state): SharedState,
    Path((account, delegate_id, task_id)): Path<(String, Uuid, Uuid)>,
    Json(response): Json<DelegateTaskResponse>,
) -> Result<StatusCode> {
    state
        .coordinator
        .process_delegate_response(&account, delegate_id, task_id, response)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

// Tasks

async fn queue_task(
    State(state): SharedState,
    Path(account): Path<String>,
    Json(req): Json<TaskRequest>,
) -> Result<impl IntoResponse> {
    let task = state.coordinator.queue_task(&account, req, None).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn execute_task(
    State(state): SharedState,
    Path(account): Path<String>,
    Json(req): Json<TaskRequest>,
) -> Result<Response> {
    let outcome = state.coordinator.execute_task(&account, req).await?;
    let status = match outcome {
        ExecutionOutcome::Completed(_) => StatusCode::OK,
        ExecutionOutcome::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn get_task(
    State(state): SharedState,
    Path((account, task_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.coordinator.get_task(&account, task_id).await?))
}

#[derive(Debug, Serialize)]
struct AbortResponse {
    aborted: bool,
}

async fn abort_task(
    State(state): SharedState,
    Path((account, task_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse> {
    let aborted = state.coordinator.abort_task(&account, task_id).await?;
    Ok(Json(AbortResponse { aborted }))
}

async fn selection_logs(
    State(state): SharedState,
    Path((account, task_id)): Path<(String, Uuid)>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .selection_logs
            .fetch_task_selection_logs(&account, task_id)
            .await?,
    ))
}

// Resource constraints

#[derive(Debug, Deserialize)]
struct EnsureConstraintRequest {
    name: String,
    capacity: u32,
}

async fn ensure_constraint(
    State(state): SharedState,
    Path(account): Path<String>,
    Json(req): Json<EnsureConstraintRequest>,
) -> Result<impl IntoResponse> {
    let constraint = state
        .throttle
        .ensure_constraint(&account, &req.name, req.capacity)
        .await?;
    Ok(Json(constraint))
}

async fn list_constraints(
    State(state): SharedState,
    Path(account): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.throttle.usage(&account).await?))
}

async fn get_constraint(
    State(state): SharedState,
    Path(constraint_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.throttle.get(constraint_id).await?))
}

async fn delete_constraint(
    State(state): SharedState,
    Path(constraint_id): Path<Uuid>,
) -> Result<StatusCode> {
    state.throttle.delete(constraint_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct UpdateCapacityRequest {
    capacity: u32,
}

async fn update_capacity(
    State(state): SharedState,
    Path(constraint_id): Path<Uuid>,
    Json(req): Json<UpdateCapacityRequest>,
) -> Result<impl IntoResponse> {
    let promoted = state
        .throttle
        .update_capacity(constraint_id, req.capacity)
        .await?;
    Ok(Json(PromotedResponse { promoted }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcquirePermitsResponse {
    pub state: ConsumerState,
}

async fn acquire_permits(
    State(state): SharedState,
    Path((constraint_id, unit)): Path<(Uuid, String)>,
    Json(req): Json<ConsumerRequest>,
) -> Result<impl IntoResponse> {
    let consumer_state = state.throttle.acquire(constraint_id, &unit, req).await?;
    Ok(Json(AcquirePermitsResponse {
        state: consumer_state,
    }))
}

#[derive(Debug, Deserialize)]
struct ReleasePermitsRequest {
    consumer_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromotedResponse {
    pub promoted: Vec<ResourceConstraintInstance>,
}

async fn release_permits(
    State(state): SharedState,
    Path((constraint_id, unit)): Path<(Uuid, String)>,
    Json(req): Json<ReleasePermitsRequest>,
) -> Result<impl IntoResponse> {
    let promoted = state
        .throttle
        .release(constraint_id, &unit, &req.consumer_id)
        .await?;
    Ok(Json(PromotedResponse { promoted }))
}

async fn promote_blocked(
    State(state): SharedState,
    Path((constraint_id, unit)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse> {
    let promoted = state.throttle.promote_blocked(constraint_id, &unit).await?;
    Ok(Json(PromotedResponse { promoted }))
}

#[derive(Debug, Deserialize)]
struct InstancesQuery {
    entity_type: String,
    unit: String,
}

async fn list_instances(
    State(state): SharedState,
    Query(query): Query<InstancesQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .throttle
            .list_instances(&query.entity_type, &query.unit)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct FinishEntityRequest {
    entity_type: String,
    entity_id: String,
}

#[derive(Debug, Serialize)]
struct FinishEntityResponse {
    released: usize,
}

async fn finish_entity(
    State(state): SharedState,
    Json(req): Json<FinishEntityRequest>,
) -> Result<impl IntoResponse> {
    let released = state
        .throttle
        .finish_entity(&req.entity_type, &req.entity_id)
        .await?;
    Ok(Json(FinishEntityResponse { released }))
}
