//! Operator endpoints for pipeline deployment rollout and rollback.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use phx_control::{CreateDeploymentRequest, DeploymentStatusReport, UpdateDeploymentRequest};
use phx_core::types::{DeploymentStatus, PipelineDeployment};
use serde::Deserialize;

use crate::api_error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/deployments", get(list_deployments).post(create_deployment))
        .route("/deployments/{id}", get(get_deployment).patch(update_deployment).delete(delete_deployment))
        .route("/deployments/{id}/rollback", post(rollback_deployment))
        .route("/deployments/{id}/status", get(get_status))
}

#[derive(Debug, Deserialize)]
struct ListDeploymentsQuery {
    namespace: Option<String>,
    template_name: Option<String>,
    status: Option<DeploymentStatus>,
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

async fn list_deployments(
    State(state): State<AppState>,
    Query(query): Query<ListDeploymentsQuery>,
) -> Result<Json<Vec<PipelineDeployment>>, ApiError> {
    let deployments = state
        .store
        .list_deployments(query.namespace, query.template_name, query.status, query.page, query.page_size)
        .await?;
    Ok(Json(deployments))
}

async fn create_deployment(
    State(state): State<AppState>,
    Json(body): Json<CreateDeploymentRequest>,
) -> Result<Json<PipelineDeployment>, ApiError> {
    let deployment = state.deployments.create_deployment(body).await?;
    Ok(Json(deployment))
}

async fn get_deployment(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<PipelineDeployment>, ApiError> {
    Ok(Json(state.store.get_deployment(&id).await?))
}

async fn update_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateDeploymentRequest>,
) -> Result<Json<PipelineDeployment>, ApiError> {
    Ok(Json(state.deployments.update_deployment(&id, body).await?))
}

async fn delete_deployment(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.deployments.delete_deployment(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Default)]
struct RollbackQuery {
    version: Option<i64>,
}

async fn rollback_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RollbackQuery>,
) -> Result<Json<PipelineDeployment>, ApiError> {
    Ok(Json(state.deployments.rollback_deployment(&id, query.version).await?))
}

async fn get_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<DeploymentStatusReport>, ApiError> {
    Ok(Json(state.deployments.get_status(&id).await?))
}
