//! Maps the shared [`PhoenixError`] taxonomy onto HTTP responses.
//!
//! Everything below the HTTP boundary returns a `PhoenixError`; this is
//! the only place that decides what status code and body a client sees.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use phx_core::PhoenixError;
use serde_json::json;

pub struct ApiError(pub PhoenixError);

impl From<PhoenixError> for ApiError {
    fn from(err: PhoenixError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PhoenixError::NotFound(_) => StatusCode::NOT_FOUND,
            PhoenixError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PhoenixError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            PhoenixError::Conflict(_) => StatusCode::CONFLICT,
            PhoenixError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PhoenixError::Forbidden(_) => StatusCode::FORBIDDEN,
            PhoenixError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PhoenixError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PhoenixError::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
        };

        let body = Json(json!({
            "error": self.0.to_string(),
            "kind": self.0.kind(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let resp = ApiError(PhoenixError::not_found("experiment not found")).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body_str = String::from_utf8(body.to_vec()).unwrap();
        assert!(body_str.contains("\"kind\":\"not_found\""));
    }

    #[tokio::test]
    async fn conflict_maps_to_409() {
        let resp = ApiError(PhoenixError::Conflict("phase mismatch".into())).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn precondition_failed_maps_to_412() {
        let resp = ApiError(PhoenixError::PreconditionFailed("accuracy gate not cleared".into())).into_response();
        assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn unauthorized_maps_to_401() {
        let resp = ApiError(PhoenixError::Unauthorized("bad token".into())).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn forbidden_maps_to_403() {
        let resp = ApiError(PhoenixError::Forbidden("not the task owner".into())).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn internal_maps_to_500() {
        let resp = ApiError(PhoenixError::internal("boom")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
