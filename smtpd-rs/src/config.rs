use crate::error::{Result, SmtpError};
use crate::queue::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// One or more listening endpoints.
    pub listen: Vec<ListenerConfig>,
    /// Hostname used in the banner and HELO/EHLO replies.
    pub hostname: String,
    /// Hard cap on simultaneously active sessions.
    pub max_connections: usize,
    pub greeting_timeout_s: u64,
    pub command_timeout_s: u64,
    pub data_timeout_s: u64,
    pub global_timeout_s: u64,
    pub shutdown_grace_s: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub addr: String,
    /// TLS handshake before the banner (port 465 semantics) instead of
    /// STARTTLS.
    #[serde(default)]
    pub implicit_tls: bool,
    /// Submission endpoint (typically port 587): authentication is mandatory
    /// when `require_auth_on_submission` is set.
    #[serde(default)]
    pub submission: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    /// Enforced against the SIZE parameter and the actual body.
    pub max_message_size: u64,
    pub max_recipients: usize,
    /// Transaction bodies beyond this many bytes spill to a spool file.
    pub spool_threshold: u64,
    pub require_auth_on_submission: bool,
    pub require_tls_for_auth: bool,
    pub enable_tls: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub enable_auth: bool,
    pub auth_database_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub ip_per_hour: u64,
    pub user_per_hour: u64,
    pub window_s: u64,
    pub sweep_s: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    pub database_url: String,
    /// Delivery worker count; 0 means one per CPU.
    pub workers: usize,
    pub batch_size: i64,
    pub lease_s: u64,
    pub poll_s: u64,
    pub delivery_timeout_s: u64,
    pub drain_timeout_s: u64,
    pub retry_base_s: u64,
    pub retry_max_s: u64,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SmtpError::Config(e.to_string()))?;

        toml::from_str(&content).map_err(|e| SmtpError::Config(e.to_string()))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec![ListenerConfig {
                addr: "0.0.0.0:2525".to_string(),
                implicit_tls: false,
                submission: false,
            }],
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            max_connections: 256,
            greeting_timeout_s: 30,
            command_timeout_s: 300,
            data_timeout_s: 600,
            global_timeout_s: 3600,
            shutdown_grace_s: 30,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            max_message_size: 10 * 1024 * 1024, // 10MB
            max_recipients: 100,
            spool_threshold: 1024 * 1024, // 1MB
            require_auth_on_submission: true,
            require_tls_for_auth: true,
            enable_tls: false,
            tls_cert_path: None,
            tls_key_path: None,
            enable_auth: false,
            auth_database_url: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ip_per_hour: 100,
            user_per_hour: 1000,
            window_s: 3600,
            sweep_s: 300,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://queue.db".to_string(),
            workers: 0,
            batch_size: 16,
            lease_s: 300,
            poll_s: 5,
            delivery_timeout_s: 60,
            drain_timeout_s: 30,
            retry_base_s: 300,       // 5 minutes
            retry_max_s: 4 * 3600,   // 4 hours
            max_attempts: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_secs(self.greeting_timeout_s)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_s)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_s)
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs(self.global_timeout_s)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_s)
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_s)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_s)
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(self.retry_base_s),
            max_delay: Duration::from_secs(self.retry_max_s),
            max_attempts: self.max_attempts,
        }
    }

    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.workers
        }
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_s)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_s)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_s)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_s)
    }
}
