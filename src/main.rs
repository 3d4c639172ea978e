//! hookline subscription reader.
//!
//! Main entry point for one reader process. Loads configuration, connects
//! the Postgres broker, opens the reader with its init payload and runs it
//! until a shutdown signal arrives.

mod config;
mod forwarder;
mod telemetry;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use config::Config;
use forwarder::HttpForwarder;
use hookline_core::RealClock;
use hookline_reader::{Lifecycle, PgBroker, ReaderService};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config)?;

    info!(
        database_url = %config.database_url_masked(),
        init_payload = %config.init_payload_path.display(),
        batch_size = config.reader_batch_size,
        "Configuration loaded"
    );

    let init_payload = tokio::fs::read(&config.init_payload_path).await.with_context(|| {
        format!("failed to read init payload from {}", config.init_payload_path.display())
    })?;

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let broker = PgBroker::new(db_pool.clone(), config.to_broker_settings());
    let forwarder = HttpForwarder::new(config.to_forwarder_config())?;
    let events = telemetry::event_handler(&config).await?;

    let service = Arc::new(ReaderService::new(
        config.to_reader_config(),
        Arc::new(broker),
        Arc::new(forwarder),
        Arc::new(events),
        Arc::new(RealClock::new()),
    ));

    service.open(&init_payload).await.context("failed to open reader")?;
    if let Some(reader) = service.reader() {
        info!(
            service = %reader.service_name(),
            subscription = %reader.init().subscription_name,
            "Reader opened"
        );
    }

    let cancel = CancellationToken::new();
    let running = {
        let service = service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { service.run(cancel).await })
    };

    tokio::select! {
        () = shutdown_signal() => {},
        result = running => {
            match result {
                Ok(Ok(())) => info!("Reader stopped"),
                Ok(Err(e)) => error!(error = %e, "Reader failed"),
                Err(e) => error!(error = %e, "Reader task panicked"),
            }
        },
    }

    info!("Shutting down");
    cancel.cancel();
    if let Err(e) = service.close().await {
        error!(error = %e, "Failed to close reader cleanly");
    }

    db_pool.close().await;
    info!("Shutdown complete");

    Ok(())
}

fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.rust_log))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < config.database_connect_retries => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = config.database_connect_retries,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
