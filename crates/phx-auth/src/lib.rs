//! Authentication token issuer boundary: a black box of
//! "verify -> claims". This crate supplies the concrete HS256
//! implementation this repository ships plus the
//! login/refresh/logout/register/profile glue that sits between the
//! gateway and the store.

pub mod claims;
pub mod jwt;
pub mod password;
pub mod service;

pub use claims::{Claims, TokenUse};
pub use jwt::{JwtCodec, TokenIssuer, TokenVerifier};
pub use service::{AuthService, Profile, TokenPair};
