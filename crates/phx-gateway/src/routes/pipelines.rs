//! Pipeline template catalogue: built-ins, operator-registered templates,
//! structural validation, and render previews.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use phx_core::types::Variant;
use phx_store::templates::StoredTemplate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api_error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/pipelines/templates", get(list_templates).post(register_template))
        .route("/pipelines/templates/{name}", get(get_template))
        .route("/pipelines/validate", post(validate_pipeline))
        .route("/pipelines/render", post(render_pipeline))
}

#[derive(Debug, Serialize)]
struct TemplateSummary {
    name: String,
    builtin: bool,
}

async fn list_templates(State(state): State<AppState>) -> Result<Json<Vec<TemplateSummary>>, ApiError> {
    let mut templates: Vec<TemplateSummary> = phx_templates::Renderer::builtin_names()
        .iter()
        .map(|name| TemplateSummary { name: name.to_string(), builtin: true })
        .collect();
    let registered = state.store.list_registered_templates().await?;
    templates.extend(registered.into_iter().map(|t| TemplateSummary { name: t.name, builtin: false }));
    Ok(Json(templates))
}

#[derive(Debug, Deserialize)]
struct RegisterTemplateRequest {
    name: String,
    source: String,
}

async fn register_template(
    State(state): State<AppState>,
    Json(body): Json<RegisterTemplateRequest>,
) -> Result<Json<TemplateSummary>, ApiError> {
    phx_templates::validate::validate(&body.source)?;
    state.store.register_template(&body.name, &body.source).await?;
    state.renderer.register(&body.name, &body.source)?;
    Ok(Json(TemplateSummary { name: body.name, builtin: false }))
}

async fn get_template(State(state): State<AppState>, Path(name): Path<String>) -> Result<Json<StoredTemplate>, ApiError> {
    Ok(Json(state.store.get_registered_template(&name).await?))
}

#[derive(Debug, Deserialize)]
struct ValidateRequest {
    source: String,
}

#[derive(Debug, Serialize)]
struct ValidateResponse {
    valid: bool,
    error: Option<String>,
}

async fn validate_pipeline(Json(body): Json<ValidateRequest>) -> Json<ValidateResponse> {
    match phx_templates::validate::validate(&body.source) {
        Ok(()) => Json(ValidateResponse { valid: true, error: None }),
        Err(e) => Json(ValidateResponse { valid: false, error: Some(e.to_string()) }),
    }
}

#[derive(Debug, Deserialize)]
struct RenderRequest {
    template_name: String,
    experiment_id: String,
    variant: Variant,
    host_id: String,
    #[serde(default)]
    parameters: HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct RenderResponse {
    rendered: String,
}

async fn render_pipeline(
    State(state): State<AppState>,
    Json(body): Json<RenderRequest>,
) -> Result<Json<RenderResponse>, ApiError> {
    let mut data = phx_templates::RenderData::new(body.experiment_id, body.variant, body.host_id);
    data.parameters = body.parameters;
    let rendered = state.renderer.render(&body.template_name, &data)?;
    Ok(Json(RenderResponse { rendered }))
}
