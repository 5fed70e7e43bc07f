use thiserror::Error;

/// The error taxonomy shared by every control-plane component.
///
/// Components below the HTTP boundary (store, queue, controller,
/// analyser, …) only ever return one of these variants; nothing leaks a
/// raw database or I/O error past the store layer. `phx-gateway` maps each
/// variant onto an HTTP status code.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PhoenixError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timed out: {0}")]
    TimedOut(String),
}

impl PhoenixError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// A short machine-readable tag for the variant, used in log fields and
    /// wire error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Internal(_) => "internal",
            Self::Unavailable(_) => "unavailable",
            Self::TimedOut(_) => "timed_out",
        }
    }
}

pub type PhoenixResult<T> = Result<T, PhoenixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_every_variant() {
        assert_eq!(PhoenixError::not_found("x").kind(), "not_found");
        assert_eq!(PhoenixError::invalid("x").kind(), "invalid_request");
        assert_eq!(PhoenixError::Conflict("x".into()).kind(), "conflict");
        assert_eq!(PhoenixError::internal("x").kind(), "internal");
    }
}
