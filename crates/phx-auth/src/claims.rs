use phx_core::types::UserRole;
use serde::{Deserialize, Serialize};

/// Verified payload of a bearer token.
///
/// Both the access and refresh token share this shape; callers distinguish
/// them by `token_use`, not by a separate struct, so `verify` has a single
/// return type regardless of which token it was handed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject — the user id.
    pub sub: String,
    pub role: UserRole,
    /// JWT id — the unit blacklisting operates on.
    pub jti: String,
    pub iss: String,
    pub token_use: TokenUse,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenUse {
    Access,
    Refresh,
}
