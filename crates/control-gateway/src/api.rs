//! REST handlers for the control API.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use orchestration_core::registry::DiscoveryQuery;
use orchestration_core::{
    AgentSpec, AgentTemplate, ExecutionPlan, OptimizationRule, Orchestrator, OrchestrationError,
    TaskSpec, Workflow,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

type ApiError = (StatusCode, String);
type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn into_response(e: OrchestrationError) -> ApiError {
    let status = match &e {
        OrchestrationError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestrationError::InvalidSpec(_) | OrchestrationError::Cyclic => StatusCode::BAD_REQUEST,
        OrchestrationError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
        OrchestrationError::CapabilityMismatch(_) => StatusCode::CONFLICT,
        OrchestrationError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        OrchestrationError::MessageTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        OrchestrationError::InsufficientResources(_) | OrchestrationError::StoreUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        OrchestrationError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
        OrchestrationError::TransportFailure(_) => StatusCode::BAD_GATEWAY,
    };
    (status, e.to_string())
}

fn ok<T: serde::Serialize>(value: T) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// -- service ----------------------------------------------------------------

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "control-gateway",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

pub async fn metrics(State(state): State<AppState>) -> Result<String, ApiError> {
    state
        .orchestrator
        .metrics()
        .gather()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// -- agents -----------------------------------------------------------------

pub async fn register_agent(
    State(state): State<AppState>,
    Json(spec): Json<AgentSpec>,
) -> ApiResult {
    let id = state
        .orchestrator
        .register_agent(spec)
        .await
        .map_err(into_response)?;
    ok(serde_json::json!({"agent_id": id}))
}

pub async fn list_agents(State(state): State<AppState>) -> ApiResult {
    let agents = state.orchestrator.agent_status(None).map_err(into_response)?;
    ok(agents)
}

pub async fn get_agent(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let agents = state
        .orchestrator
        .agent_status(Some(&id))
        .map_err(into_response)?;
    ok(&agents[0])
}

pub async fn unregister_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    state
        .orchestrator
        .unregister_agent(&id)
        .await
        .map_err(into_response)?;
    ok(serde_json::json!({"ok": true}))
}

pub async fn update_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(spec): Json<AgentSpec>,
) -> ApiResult {
    state
        .orchestrator
        .update_agent(&id, spec)
        .await
        .map_err(into_response)?;
    ok(serde_json::json!({"ok": true}))
}

pub async fn discover_agents(
    State(state): State<AppState>,
    Json(query): Json<DiscoveryQuery>,
) -> ApiResult {
    let agents = state
        .orchestrator
        .discover_agents(&query)
        .await
        .map_err(into_response)?;
    ok(agents.as_ref())
}

// -- tasks ------------------------------------------------------------------

pub async fn list_tasks(State(state): State<AppState>) -> ApiResult {
    let tasks = state
        .orchestrator
        .list_tasks()
        .await
        .map_err(into_response)?;
    ok(tasks)
}

pub async fn submit_task(State(state): State<AppState>, Json(spec): Json<TaskSpec>) -> ApiResult {
    let id = state
        .orchestrator
        .submit_task(spec)
        .await
        .map_err(into_response)?;
    ok(serde_json::json!({"task_id": id}))
}

pub async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let task = state
        .orchestrator
        .task_status(&id)
        .await
        .map_err(into_response)?;
    ok(task)
}

pub async fn cancel_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state
        .orchestrator
        .cancel_task(&id)
        .await
        .map_err(into_response)?;
    ok(serde_json::json!({"ok": true}))
}

// -- workflows and plans ----------------------------------------------------

pub async fn submit_workflow(
    State(state): State<AppState>,
    Json(workflow): Json<Workflow>,
) -> ApiResult {
    let (workflow_id, task_ids) = state
        .orchestrator
        .submit_workflow(workflow)
        .await
        .map_err(into_response)?;
    ok(serde_json::json!({"workflow_id": workflow_id, "task_ids": task_ids}))
}

pub async fn submit_plan(
    State(state): State<AppState>,
    Json(plan): Json<ExecutionPlan>,
) -> ApiResult {
    let id = state.orchestrator.submit_plan(plan).map_err(into_response)?;
    ok(serde_json::json!({"plan_id": id}))
}

pub async fn get_plan(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let status = state.orchestrator.plan_status(&id).map_err(into_response)?;
    ok(serde_json::json!({"plan_id": id, "status": status}))
}

pub async fn cancel_plan(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.orchestrator.cancel_plan(&id).map_err(into_response)?;
    ok(serde_json::json!({"ok": true}))
}

// -- observability ----------------------------------------------------------

pub async fn system_metrics(State(state): State<AppState>) -> ApiResult {
    let report = state
        .orchestrator
        .system_metrics()
        .await
        .map_err(into_response)?;
    ok(report)
}

#[derive(Debug, Deserialize)]
pub struct ReportParams {
    #[serde(default = "default_window")]
    pub window_secs: u64,
}

fn default_window() -> u64 {
    3_600
}

pub async fn performance_report(
    State(state): State<AppState>,
    Query(params): Query<ReportParams>,
) -> ApiResult {
    let report = state.orchestrator.generate_report(params.window_secs).await;
    ok(report)
}

// -- optimization rules -----------------------------------------------------

pub async fn add_rule(
    State(state): State<AppState>,
    Json(rule): Json<OptimizationRule>,
) -> ApiResult {
    let id = rule.id.clone();
    state
        .orchestrator
        .optimizer()
        .add_rule(rule)
        .map_err(into_response)?;
    ok(serde_json::json!({"rule_id": id}))
}

pub async fn list_rules(State(state): State<AppState>) -> ApiResult {
    ok(state.orchestrator.optimizer().rules())
}

pub async fn remove_rule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state
        .orchestrator
        .optimizer()
        .remove_rule(&id)
        .map_err(into_response)?;
    ok(serde_json::json!({"ok": true}))
}

// -- lifecycle --------------------------------------------------------------

pub async fn register_template(
    State(state): State<AppState>,
    Json(template): Json<AgentTemplate>,
) -> ApiResult {
    let id = state
        .orchestrator
        .lifecycle()
        .register_template(template)
        .await
        .map_err(into_response)?;
    ok(serde_json::json!({"template_id": id}))
}

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub template_id: String,
    pub replicas: u32,
    #[serde(default)]
    pub env_overrides: HashMap<String, String>,
}

pub async fn create_deployment(
    State(state): State<AppState>,
    Json(request): Json<CreateDeploymentRequest>,
) -> ApiResult {
    let deployment = state
        .orchestrator
        .lifecycle()
        .create_deployment(&request.template_id, request.replicas, request.env_overrides)
        .await
        .map_err(into_response)?;
    ok(deployment)
}

pub async fn list_deployments(State(state): State<AppState>) -> ApiResult {
    ok(state.orchestrator.lifecycle().deployments())
}

pub async fn remove_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    state
        .orchestrator
        .lifecycle()
        .remove_deployment(&id)
        .await
        .map_err(into_response)?;
    ok(serde_json::json!({"ok": true}))
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub replicas: u32,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn scale_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ScaleRequest>,
) -> ApiResult {
    state
        .orchestrator
        .lifecycle()
        .scale(
            &id,
            request.replicas,
            request.reason.as_deref().unwrap_or("operator request"),
        )
        .await
        .map_err(into_response)?;
    ok(serde_json::json!({"ok": true}))
}

pub async fn update_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    state
        .orchestrator
        .lifecycle()
        .update_deployment(&id)
        .await
        .map_err(into_response)?;
    ok(serde_json::json!({"ok": true}))
}

// -- dead letters -----------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeadLetterParams {
    #[serde(default = "default_dlq_limit")]
    pub limit: usize,
}

fn default_dlq_limit() -> usize {
    100
}

pub async fn dead_letters(
    State(state): State<AppState>,
    Query(params): Query<DeadLetterParams>,
) -> ApiResult {
    let tasks = state
        .orchestrator
        .queue()
        .dead_letters(params.limit)
        .await
        .map_err(into_response)?;
    ok(tasks)
}

pub async fn requeue_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    state
        .orchestrator
        .queue()
        .requeue_dead_letter(&id)
        .await
        .map_err(into_response)?;
    ok(serde_json::json!({"ok": true}))
}
