//! SMTP AUTH support.
//!
//! Supported mechanisms:
//! - PLAIN (RFC 4616)
//! - LOGIN (common but not standardized)
//!
//! Credential verification is a capability: the session only sees
//! [`AuthProvider`]. The bundled providers verify Argon2 hashes, which keeps
//! the comparison constant-time regardless of where the hash lives.

use crate::error::{Result, SmtpError};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// SMTP authentication mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl AuthMechanism {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// Credential verification capability.
///
/// Returns the opaque user identity on success, `None` on mismatch. The
/// session maps `None` to `535 5.7.8` and closes the connection after three
/// consecutive failures.
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    async fn verify(&self, username: &str, password: &str) -> Result<Option<String>>;
}

/// Decode PLAIN authentication data.
///
/// Format: `\0username\0password`, base64 encoded. The leading authorization
/// identity is accepted and ignored.
pub fn decode_plain_auth(auth_data: &str) -> Result<(String, String)> {
    let decoded = BASE64
        .decode(auth_data.trim())
        .map_err(|e| SmtpError::Parameter(format!("invalid base64: {e}")))?;

    let text = std::str::from_utf8(&decoded)
        .map_err(|e| SmtpError::Parameter(format!("invalid UTF-8: {e}")))?;
    let parts: Vec<&str> = text.split('\0').collect();

    if parts.len() != 3 {
        return Err(SmtpError::Parameter("invalid PLAIN response".to_string()));
    }

    Ok((parts[1].to_string(), parts[2].to_string()))
}

/// Decode one LOGIN step (username or password), base64 encoded.
pub fn decode_login_credential(credential: &str) -> Result<String> {
    let decoded = BASE64
        .decode(credential.trim())
        .map_err(|e| SmtpError::Parameter(format!("invalid base64: {e}")))?;

    String::from_utf8(decoded).map_err(|e| SmtpError::Parameter(format!("invalid UTF-8: {e}")))
}

/// Hash a password for storage.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| SmtpError::Config(format!("failed to hash password: {e}")))?;
    Ok(hash.to_string())
}

fn verify_hash(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Credential table in SQLite, verified with Argon2.
#[derive(Clone)]
pub struct SqliteAuthProvider {
    db: SqlitePool,
}

impl SqliteAuthProvider {
    pub async fn connect(database_url: &str) -> Result<Self> {
        // An in-memory database exists per connection, so the pool must not
        // grow past the connection that ran the schema bootstrap.
        let pool_size = if database_url.contains(":memory:") { 1 } else { 5 };
        let db = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(pool_size)
            .connect(database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&db)
        .await?;

        Ok(Self { db })
    }

    pub async fn add_user(&self, username: &str, password: &str) -> Result<()> {
        info!("adding user {}", username);
        let password_hash = hash_password(password)?;

        sqlx::query(
            r#"
            INSERT INTO users (username, password_hash, created_at)
            VALUES (?, ?, datetime('now'))
            "#,
        )
        .bind(username)
        .bind(&password_hash)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl AuthProvider for SqliteAuthProvider {
    async fn verify(&self, username: &str, password: &str) -> Result<Option<String>> {
        debug!("authentication attempt for {}", username);

        let row = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT username, password_hash FROM users WHERE username = ?
            "#,
        )
        .bind(username)
        .fetch_optional(&self.db)
        .await?;

        let Some((user, stored_hash)) = row else {
            warn!("authentication failed: unknown user {}", username);
            return Ok(None);
        };

        if verify_hash(password, &stored_hash) {
            Ok(Some(user))
        } else {
            warn!("authentication failed: bad password for {}", username);
            Ok(None)
        }
    }
}

/// In-memory provider for tests and single-host setups.
#[derive(Default)]
pub struct StaticAuthProvider {
    users: HashMap<String, String>,
}

impl StaticAuthProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: &str, password: &str) -> Result<Self> {
        self.users
            .insert(username.to_string(), hash_password(password)?);
        Ok(self)
    }
}

#[async_trait::async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn verify(&self, username: &str, password: &str) -> Result<Option<String>> {
        match self.users.get(username) {
            Some(hash) if verify_hash(password, hash) => Ok(Some(username.to_string())),
            _ => Ok(None),
        }
    }
}
