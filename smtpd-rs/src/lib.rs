//! smtpd-rs: production SMTP receiver core
//!
//! The crate implements the hard parts of an SMTP receiver (RFC 5321 plus a
//! fixed extension set): the per-connection protocol engine, the concurrent
//! connection supervisor that feeds it, and a durable outbound delivery queue
//! with a retry scheduler.
//!
//! # Features
//!
//! - **Session engine**: command/response state machine with PIPELINING,
//!   STARTTLS, AUTH PLAIN/LOGIN, SIZE, 8BITMIME, SMTPUTF8 and CHUNKING
//! - **Supervisor**: one task per connection, admission cap, four independent
//!   deadlines, graceful shutdown
//! - **Queue**: SQLite-backed store with leases, per-recipient retry state
//!   and exponential backoff delivery workers
//!
//! Credential storage, TLS certificate management, DNS, content filtering and
//! the actual relay client are capability interfaces consumed by the core,
//! not part of it.
//!
//! # Example
//!
//! ```no_run
//! use smtpd_rs::config::Config;
//! use smtpd_rs::queue::store::SqliteQueueStore;
//! use smtpd_rs::security::RateLimiter;
//! use smtpd_rs::smtp::SmtpServer;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(Config::default());
//!     let store = Arc::new(SqliteQueueStore::connect(
//!         &config.queue.database_url,
//!         config.queue.retry_policy(),
//!     ).await?);
//!     let limiter = Arc::new(RateLimiter::new(config.rate_limit.window()));
//!
//!     let server = SmtpServer::bind(config, store, limiter, None, None, CancellationToken::new()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error taxonomy and wire-code mapping
//! - [`smtp`]: Protocol engine and connection supervisor
//! - [`queue`]: Durable queue store and retry scheduler
//! - [`security`]: TLS, authentication and rate limiting

pub mod config;
pub mod error;
pub mod queue;
pub mod security;
pub mod smtp;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, SmtpError};
