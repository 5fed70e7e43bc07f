//! Operator/user endpoints for experiment lifecycle and KPI inspection.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use phx_core::types::{Experiment, ExperimentConfig, ExperimentPhase, MetricSample};
use serde::Deserialize;

use crate::api_error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/experiments", get(list_experiments).post(create_experiment))
        .route("/experiments/{id}", get(get_experiment))
        .route("/experiments/{id}/phase", put(update_experiment_phase))
        .route("/experiments/{id}/start", post(start_experiment))
        .route("/experiments/{id}/stop", post(stop_experiment))
        .route("/experiments/{id}/analyse", post(analyse_experiment))
        .route("/experiments/{id}/promote", post(promote_experiment))
        .route("/experiments/{id}/rollback", post(rollback_experiment))
        .route("/experiments/{id}/metrics", get(get_experiment_metrics))
}

#[derive(Debug, Deserialize)]
struct ListExperimentsQuery {
    phase: Option<ExperimentPhase>,
}

async fn list_experiments(
    State(state): State<AppState>,
    Query(query): Query<ListExperimentsQuery>,
) -> Result<Json<Vec<Experiment>>, ApiError> {
    let experiments = state.store.list_experiments(query.phase).await?;
    Ok(Json(experiments))
}

#[derive(Debug, Deserialize)]
struct CreateExperimentRequest {
    name: String,
    config: ExperimentConfig,
}

async fn create_experiment(
    State(state): State<AppState>,
    Json(body): Json<CreateExperimentRequest>,
) -> Result<Json<Experiment>, ApiError> {
    let experiment = state.experiments.create_experiment(body.name, body.config).await?;
    Ok(Json(experiment))
}

async fn get_experiment(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Experiment>, ApiError> {
    let experiment = state.store.get_experiment(&id).await?;
    Ok(Json(experiment))
}

#[derive(Debug, Deserialize)]
struct UpdatePhaseRequest {
    phase: ExperimentPhase,
}

async fn update_experiment_phase(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdatePhaseRequest>,
) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(state.experiments.update_phase(&id, body.phase).await?))
}

async fn start_experiment(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(state.experiments.start(&id).await?))
}

async fn stop_experiment(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(state.experiments.stop(&id).await?))
}

async fn analyse_experiment(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(state.experiments.analyse(&id).await?))
}

async fn promote_experiment(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(state.experiments.promote(&id).await?))
}

async fn rollback_experiment(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Experiment>, ApiError> {
    Ok(Json(state.experiments.rollback(&id).await?))
}

#[derive(Debug, Deserialize)]
struct GetMetricsQuery {
    /// How far back to look, in seconds. Defaults to an hour, which is
    /// generous next to the handful-of-minutes default experiment
    /// duration and keeps an unbounded `since` out of the query string.
    #[serde(default = "default_metrics_since_secs")]
    since_secs: i64,
}

fn default_metrics_since_secs() -> i64 {
    3600
}

async fn get_experiment_metrics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<GetMetricsQuery>,
) -> Result<Json<Vec<MetricSample>>, ApiError> {
    let since = chrono::Utc::now() - chrono::Duration::seconds(query.since_secs.max(0));
    let samples = state.store.list_recent_samples(&id, since).await?;
    Ok(Json(samples))
}
