use std::sync::Arc;

use phx_core::config::AuthConfig;
use phx_core::types::{TokenBlacklistEntry, User, UserRole};
use phx_core::{PhoenixError, PhoenixResult};
use phx_store::Store;
use serde::Serialize;

use crate::claims::{Claims, TokenUse};
use crate::jwt::{JwtCodec, TokenIssuer, TokenVerifier};
use crate::password::{hash_password, verify_password};

/// `{access_token, refresh_token, expires_in}` — the
/// `POST /api/auth/login` and `/refresh` response shape.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// `GET /api/auth/profile` response shape.
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub user_id: String,
    pub username: String,
    pub role: UserRole,
}

/// Glues the token issuer/verifier boundary to the store: password checks,
/// blacklist lookups, and the login/refresh/logout/register/profile flows.
pub struct AuthService {
    store: Arc<Store>,
    codec: Arc<JwtCodec>,
    config: AuthConfig,
}

impl AuthService {
    pub fn new(store: Arc<Store>, config: AuthConfig) -> Self {
        let codec = Arc::new(JwtCodec::new(&config.jwt_secret, config.jwt_issuer.clone()));
        Self { store, codec, config }
    }

    /// Verifies the presented bearer token's signature, issuer, and
    /// expiry, and checks its `jti` has not been blacklisted. Used by
    /// `phx-gateway`'s auth middleware for every non-public route.
    pub async fn authenticate(&self, bearer_token: &str) -> PhoenixResult<Claims> {
        let claims = self.codec.verify(bearer_token)?;
        if claims.token_use != TokenUse::Access {
            return Err(PhoenixError::Unauthorized("token is not an access token".into()));
        }
        if self.store.is_token_blacklisted(&claims.jti).await? {
            return Err(PhoenixError::Unauthorized("token has been revoked".into()));
        }
        Ok(claims)
    }

    pub async fn login(&self, username: &str, password: &str) -> PhoenixResult<TokenPair> {
        let user = self
            .store
            .get_user_by_username(username)
            .await
            .map_err(|_| PhoenixError::Unauthorized("invalid username or password".into()))?;
        if !verify_password(password, &user.password_hash)? {
            return Err(PhoenixError::Unauthorized("invalid username or password".into()));
        }
        self.issue_pair(&user)
    }

    /// Rotates on success: the presented refresh token's `jti` is
    /// blacklisted so it cannot be replayed.
    pub async fn refresh(&self, refresh_token: &str) -> PhoenixResult<TokenPair> {
        let claims = self.codec.verify(refresh_token)?;
        if claims.token_use != TokenUse::Refresh {
            return Err(PhoenixError::Unauthorized("token is not a refresh token".into()));
        }
        if self.store.is_token_blacklisted(&claims.jti).await? {
            return Err(PhoenixError::Unauthorized("refresh token has been revoked".into()));
        }
        let user = self.store.get_user_by_id(&claims.sub).await?;
        self.blacklist(&claims, "refreshed").await?;
        self.issue_pair(&user)
    }

    /// Blacklists both presented token `jti`s. Either argument may be
    /// omitted by the caller passing an empty string; invalid tokens are
    /// ignored rather than surfaced, since logout must succeed even for an
    /// already-expired session.
    pub async fn logout(&self, access_token: &str, refresh_token: &str) -> PhoenixResult<()> {
        for token in [access_token, refresh_token] {
            if token.is_empty() {
                continue;
            }
            if let Ok(claims) = self.codec.verify(token) {
                self.blacklist(&claims, "logout").await?;
            }
        }
        Ok(())
    }

    pub async fn register(&self, username: &str, password: &str, role: UserRole) -> PhoenixResult<User> {
        if !self.config.allow_registration {
            return Err(PhoenixError::Forbidden("registration is disabled".into()));
        }
        let hash = hash_password(password)?;
        let user = User::new(username, hash, role);
        self.store.create_user(&user).await?;
        Ok(user)
    }

    pub async fn profile(&self, claims: &Claims) -> PhoenixResult<Profile> {
        let user = self.store.get_user_by_id(&claims.sub).await?;
        Ok(Profile {
            user_id: user.id,
            username: user.username,
            role: user.role,
        })
    }

    fn issue_pair(&self, user: &User) -> PhoenixResult<TokenPair> {
        let (access_token, _) = self.codec.issue(user, TokenUse::Access, self.config.access_token_ttl_secs)?;
        let (refresh_token, _) = self.codec.issue(user, TokenUse::Refresh, self.config.refresh_token_ttl_secs)?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.config.access_token_ttl_secs,
        })
    }

    async fn blacklist(&self, claims: &Claims, reason: &str) -> PhoenixResult<()> {
        let entry = TokenBlacklistEntry {
            jti: claims.jti.clone(),
            user_id: claims.sub.clone(),
            expires_at: chrono::DateTime::from_timestamp(claims.exp, 0).unwrap_or_else(chrono::Utc::now),
            reason: reason.to_string(),
        };
        self.store.blacklist_token(&entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig {
            jwt_secret: "test-secret".into(),
            jwt_issuer: "phoenix-control-plane".into(),
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 3600,
            allow_registration: true,
            blacklist_gc_period_secs: 600,
        }
    }

    async fn service_with_user(password: &str, role: UserRole) -> (AuthService, User) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let service = AuthService::new(store.clone(), config());
        let user = service.register("alice", password, role).await.unwrap();
        (service, user)
    }

    #[tokio::test]
    async fn login_then_authenticate_round_trips() {
        let (service, _user) = service_with_user("hunter2", UserRole::Operator).await;
        let pair = service.login("alice", "hunter2").await.unwrap();
        let claims = service.authenticate(&pair.access_token).await.unwrap();
        assert_eq!(claims.role, UserRole::Operator);
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let (service, _user) = service_with_user("hunter2", UserRole::Viewer).await;
        assert!(service.login("alice", "wrong").await.is_err());
    }

    #[tokio::test]
    async fn refresh_rotates_and_blacklists_old_refresh_token() {
        let (service, _user) = service_with_user("hunter2", UserRole::Viewer).await;
        let pair = service.login("alice", "hunter2").await.unwrap();
        let rotated = service.refresh(&pair.refresh_token).await.unwrap();
        assert_ne!(rotated.access_token, pair.access_token);
        assert!(service.refresh(&pair.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn logout_blacklists_access_token() {
        let (service, _user) = service_with_user("hunter2", UserRole::Viewer).await;
        let pair = service.login("alice", "hunter2").await.unwrap();
        service.logout(&pair.access_token, &pair.refresh_token).await.unwrap();
        assert!(service.authenticate(&pair.access_token).await.is_err());
    }

    #[tokio::test]
    async fn registration_disabled_is_forbidden() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let mut cfg = config();
        cfg.allow_registration = false;
        let service = AuthService::new(store, cfg);
        let err = service.register("bob", "x", UserRole::Viewer).await.unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }
}
