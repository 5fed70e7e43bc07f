//! `POST /api/auth/*` — login, refresh, logout, register, profile.
//!
//! These are the only user-facing routes that run outside the bearer-token
//! [`crate::auth::AuthLayer`] (`login`/`refresh`/`register` cannot require
//! a token the caller doesn't have yet); `logout` and `profile` read the
//! [`Claims`] the layer already inserted into the request extensions.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use phx_auth::{Claims, Profile, TokenPair};
use phx_core::types::UserRole;
use serde::Deserialize;

use crate::api_error::ApiError;
use crate::state::AppState;

pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/register", post(register))
}

pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/auth/logout", post(logout))
        .route("/auth/profile", get(profile))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(State(state): State<AppState>, Json(body): Json<LoginRequest>) -> Result<Json<TokenPair>, ApiError> {
    Ok(Json(state.auth.login(&body.username, &body.password).await?))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn refresh(State(state): State<AppState>, Json(body): Json<RefreshRequest>) -> Result<Json<TokenPair>, ApiError> {
    Ok(Json(state.auth.refresh(&body.refresh_token).await?))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
    #[serde(default = "default_role")]
    role: UserRole,
}

fn default_role() -> UserRole {
    UserRole::Viewer
}

#[derive(Debug, serde::Serialize)]
struct RegisterResponse {
    user_id: String,
    username: String,
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let user = state.auth.register(&body.username, &body.password, body.role).await?;
    Ok(Json(RegisterResponse { user_id: user.id, username: user.username }))
}

#[derive(Debug, Deserialize)]
struct LogoutRequest {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: String,
}

async fn logout(
    State(state): State<AppState>,
    Json(body): Json<LogoutRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.auth.logout(&body.access_token, &body.refresh_token).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn profile(State(state): State<AppState>, Extension(claims): Extension<Claims>) -> Result<Json<Profile>, ApiError> {
    Ok(Json(state.auth.profile(&claims).await?))
}
