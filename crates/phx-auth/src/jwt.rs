use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use phx_core::types::{User, UserRole};
use phx_core::{PhoenixError, PhoenixResult};
use uuid::Uuid;

use crate::claims::{Claims, TokenUse};

/// Issues bearer tokens for a verified user. The token issuer is treated
/// as an external black box; this trait is that boundary — nothing above
/// it depends on JWTs specifically.
pub trait TokenIssuer: Send + Sync {
    fn issue(&self, user: &User, token_use: TokenUse, ttl_secs: i64) -> PhoenixResult<(String, Claims)>;
}

/// Verifies a bearer token and returns its claims. The black-box boundary's
/// other half.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> PhoenixResult<Claims>;
}

/// HS256-signed JWTs: the concrete resolution of the black-box issuer.
/// One secret signs both access and refresh tokens;
/// `token_use` in the claims is what a verifier checks to reject a refresh
/// token presented as an access token, or vice versa.
pub struct JwtCodec {
    issuer: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtCodec {
    pub fn new(secret: &str, issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

impl TokenIssuer for JwtCodec {
    fn issue(&self, user: &User, token_use: TokenUse, ttl_secs: i64) -> PhoenixResult<(String, Claims)> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user.id.clone(),
            role: user.role,
            jti: Uuid::new_v4().to_string(),
            iss: self.issuer.clone(),
            token_use,
            iat: now,
            exp: now + ttl_secs,
        };
        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| PhoenixError::internal(format!("signing token: {e}")))?;
        Ok((token, claims))
    }
}

impl TokenVerifier for JwtCodec {
    fn verify(&self, token: &str) -> PhoenixResult<Claims> {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| PhoenixError::Unauthorized(format!("invalid token: {e}")))?;
        Ok(data.claims)
    }
}

/// Test double: same signing scheme sans the issuer check, for unit tests
/// that want a cheap way to mint tokens without pulling in `AuthService`.
pub fn role_allows_operator_routes(role: UserRole) -> bool {
    matches!(role, UserRole::Admin | UserRole::Operator)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User::new("alice", "hash", UserRole::Operator)
    }

    #[test]
    fn issued_token_verifies_with_matching_claims() {
        let codec = JwtCodec::new("s3cret", "phoenix-control-plane");
        let (token, issued_claims) = codec.issue(&user(), TokenUse::Access, 900).unwrap();
        let claims = codec.verify(&token).unwrap();
        assert_eq!(claims.sub, issued_claims.sub);
        assert_eq!(claims.jti, issued_claims.jti);
        assert_eq!(claims.token_use, TokenUse::Access);
    }

    #[test]
    fn tampered_secret_is_rejected() {
        let codec = JwtCodec::new("s3cret", "phoenix-control-plane");
        let (token, _) = codec.issue(&user(), TokenUse::Access, 900).unwrap();
        let other = JwtCodec::new("different", "phoenix-control-plane");
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let codec = JwtCodec::new("s3cret", "phoenix-control-plane");
        let (token, _) = codec.issue(&user(), TokenUse::Access, -1).unwrap();
        assert!(codec.verify(&token).is_err());
    }
}
