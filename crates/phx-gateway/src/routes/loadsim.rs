//! Operator endpoints for standalone load-simulation jobs.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use phx_control::{LoadSimJob, StartLoadSimRequest};

use crate::api_error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/loadsim", get(list_jobs).post(start_job))
        .route("/loadsim/{id}", get(get_job))
        .route("/loadsim/{id}/stop", post(stop_job))
}

async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<LoadSimJob>>, ApiError> {
    Ok(Json(state.loadsim.list().await?))
}

async fn start_job(
    State(state): State<AppState>,
    Json(body): Json<StartLoadSimRequest>,
) -> Result<Json<LoadSimJob>, ApiError> {
    Ok(Json(state.loadsim.start(body).await?))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<LoadSimJob>, ApiError> {
    Ok(Json(state.loadsim.get(&id).await?))
}

async fn stop_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<LoadSimJob>, ApiError> {
    Ok(Json(state.loadsim.stop(&id).await?))
}
