//! smtpd-rs: SMTP receiver daemon
//!
//! Wires the connection supervisor, queue store and retry scheduler together
//! from a TOML configuration file and runs until SIGINT.

use clap::Parser;
use smtpd_rs::config::Config;
use smtpd_rs::queue::store::SqliteQueueStore;
use smtpd_rs::queue::{DeliveryService, LogDelivery, QueueStore, RetryScheduler};
use smtpd_rs::security::auth::{AuthProvider, SqliteAuthProvider};
use smtpd_rs::security::rate_limit::RateLimiter;
use smtpd_rs::security::tls::TlsSettings;
use smtpd_rs::smtp::SmtpServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "smtpd-rs", about = "SMTP receiver with a durable retry queue")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else {
        Config::default()
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("starting smtpd-rs v{}", env!("CARGO_PKG_VERSION"));
    info!("  hostname: {}", config.server.hostname);
    for listener in &config.server.listen {
        info!("  listener: {}", listener.addr);
    }
    info!("  queue database: {}", config.queue.database_url);

    let config = Arc::new(config);
    let shutdown = CancellationToken::new();

    let store: Arc<SqliteQueueStore> = Arc::new(
        SqliteQueueStore::connect(&config.queue.database_url, config.queue.retry_policy()).await?,
    );

    let limiter = Arc::new(RateLimiter::new(config.rate_limit.window()));
    limiter.spawn_sweeper(config.rate_limit.sweep_interval(), shutdown.clone());

    let auth: Option<Arc<dyn AuthProvider>> = if config.smtp.enable_auth {
        match &config.smtp.auth_database_url {
            Some(url) => Some(Arc::new(SqliteAuthProvider::connect(url).await?)),
            None => {
                warn!("AUTH enabled but auth_database_url not configured");
                None
            }
        }
    } else {
        None
    };

    let tls = if config.smtp.enable_tls {
        match (&config.smtp.tls_cert_path, &config.smtp.tls_key_path) {
            (Some(cert), Some(key)) => Some(Arc::new(TlsSettings::from_pem_files(cert, key)?)),
            _ => {
                warn!("TLS enabled but certificate paths not configured");
                None
            }
        }
    } else {
        None
    };

    let scheduler = RetryScheduler::new(
        store.clone() as Arc<dyn QueueStore>,
        Arc::new(LogDelivery) as Arc<dyn DeliveryService>,
        &config.queue,
        shutdown.clone(),
    );
    let scheduler_handle = tokio::spawn(scheduler.run());

    let server = SmtpServer::bind(
        Arc::clone(&config),
        store as Arc<dyn QueueStore>,
        limiter,
        auth,
        tls,
        shutdown.clone(),
    )
    .await?;
    let server_handle = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    shutdown.cancel();

    server_handle.await??;
    scheduler_handle.await?;

    info!("smtpd-rs stopped");
    Ok(())
}
