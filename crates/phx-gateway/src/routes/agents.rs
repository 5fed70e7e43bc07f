//! Agent-facing endpoints: long-poll task claim, status reports, heartbeats,
//! and metric/log ingestion. Every route here is reached by the deployed
//! agent binaries, never by a human operator, so authentication is the
//! lightweight `X-Agent-Host-ID` header rather than a JWT bearer token.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use phx_bus::BusMessage;
use phx_core::types::{Agent, AgentStatus, ResourceUsage, Task, TaskStatus};
use serde::Deserialize;
use serde_json::Value;

use crate::api_error::ApiError;
use crate::state::AppState;

const CLAIM_WAIT_MAX: Duration = Duration::from_secs(25);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/agent/tasks", axum::routing::get(claim_tasks))
        .route("/agent/tasks/{task_id}/status", post(report_task_status))
        .route("/agent/heartbeat", post(heartbeat))
        .route("/agent/metrics", post(ingest_metrics))
        .route("/agent/logs", post(ingest_logs))
}

fn agent_host_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-agent-host-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| phx_core::PhoenixError::Unauthorized("missing X-Agent-Host-ID header".into()).into())
}

#[derive(Debug, Deserialize)]
struct ClaimTasksQuery {
    #[serde(default = "default_claim_max")]
    max: u32,
}

fn default_claim_max() -> u32 {
    5
}

async fn claim_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Query(query): axum::extract::Query<ClaimTasksQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let host_id = agent_host_id(&headers)?;
    let tasks = state.queue.claim_for_host(&host_id, query.max, CLAIM_WAIT_MAX).await?;
    Ok(Json(tasks))
}

#[derive(Debug, Deserialize)]
struct ReportStatusRequest {
    status: TaskStatus,
    #[serde(default)]
    result: HashMap<String, Value>,
    error_message: Option<String>,
}

async fn report_task_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(body): Json<ReportStatusRequest>,
) -> Result<StatusCode, ApiError> {
    let host_id = agent_host_id(&headers)?;
    let task = state
        .queue
        .report_status(&task_id, &host_id, body.status, body.result, body.error_message)
        .await?;
    state.bus.publish(BusMessage::new(
        "task_update",
        "tasks",
        serde_json::json!({ "task_id": task.id, "status": task.status, "host_id": host_id }),
    ));
    if task.experiment_id.is_some() {
        state.experiments.on_task_report(&task).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    agent_version: String,
    status: AgentStatus,
    #[serde(default)]
    active_tasks: HashSet<String>,
    #[serde(default)]
    resource_usage: ResourceUsage,
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<HeartbeatRequest>,
) -> Result<StatusCode, ApiError> {
    let host_id = agent_host_id(&headers)?;
    let mut agent = match state.store.get_agent(&host_id).await {
        Ok(existing) => existing,
        Err(_) => Agent::minimal(&host_id),
    };
    agent.agent_version = body.agent_version;
    agent.status = body.status;
    agent.active_tasks = body.active_tasks;
    agent.resource_usage = body.resource_usage;
    agent.last_heartbeat = Utc::now();

    state.store.upsert_agent(&agent).await?;
    state.bus.publish(BusMessage::new(
        "agent_heartbeat",
        "fleet",
        serde_json::json!({ "host_id": agent.host_id, "status": agent.status }),
    ));
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct MetricPoint {
    /// Which experiment this sample belongs to. The wire contract in
    /// spec.md's agent-metrics table doesn't list it explicitly
    /// alongside `name`/`variant`/`value`/`labels`, but `metric_cache`
    /// rows are keyed by experiment — an agent running collector/loadsim
    /// tasks for more than one experiment tags each point with the one
    /// it was sampled for.
    experiment_id: String,
    name: String,
    variant: phx_core::types::Variant,
    value: f64,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct IngestMetricsRequest {
    timestamp: chrono::DateTime<Utc>,
    metrics: Vec<MetricPoint>,
}

async fn ingest_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IngestMetricsRequest>,
) -> Result<StatusCode, ApiError> {
    let host_id = agent_host_id(&headers)?;
    let samples = body
        .metrics
        .into_iter()
        .map(|m| phx_core::types::MetricSample {
            experiment_id: m.experiment_id,
            timestamp: body.timestamp,
            metric_name: m.name,
            variant: m.variant,
            host_id: host_id.clone(),
            value: m.value,
            labels: m.labels,
        })
        .collect();
    state.store.write_metric_samples(samples).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct LogLine {
    timestamp: chrono::DateTime<Utc>,
    level: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct IngestLogsRequest {
    task_id: String,
    logs: Vec<LogLine>,
}

async fn ingest_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<IngestLogsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let host_id = agent_host_id(&headers)?;
    state.bus.publish(BusMessage::new(
        "agent_logs",
        "logs",
        serde_json::json!({
            "host_id": host_id,
            "task_id": body.task_id,
            "logs": body.logs.into_iter().map(|l| serde_json::json!({
                "timestamp": l.timestamp,
                "level": l.level,
                "message": l.message,
            })).collect::<Vec<_>>(),
        }),
    ));
    Ok(StatusCode::ACCEPTED)
}
