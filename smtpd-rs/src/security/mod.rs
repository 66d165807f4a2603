//! TLS, authentication and rate limiting.

pub mod auth;
pub mod rate_limit;
pub mod tls;

pub use auth::{AuthMechanism, AuthProvider, SqliteAuthProvider, StaticAuthProvider};
pub use rate_limit::{LimitKey, RateLimiter};
pub use tls::TlsSettings;
