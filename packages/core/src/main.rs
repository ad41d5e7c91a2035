use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;

use nowcast_monitor::alerts::notifier::{Notification, Notifier, TransportNotifier};
use nowcast_monitor::api::{self, ApiState};
use nowcast_monitor::cli::Cli;
use nowcast_monitor::config::{ConfigSnapshot, Settings, StorageSettings};
use nowcast_monitor::db;
use nowcast_monitor::error::AppError;
use nowcast_monitor::forecast::open_meteo::OpenMeteoSource;
use nowcast_monitor::health::HealthReporter;
use nowcast_monitor::logging::init_logging;
use nowcast_monitor::metrics::AppMetrics;
use nowcast_monitor::scheduler::Monitor;
use nowcast_monitor::store::NowcastStore;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();

    if let Err(err) = run().await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let settings = Settings::from_env()
        .map_err(AppError::Config)?
        .with_overrides(&cli);

    // The store location is fixed for the life of the process; later edits
    // to `storage.sqlite_path` need a restart.
    let initial = match ConfigSnapshot::load(&settings.config_path).await {
        Ok(snapshot) => Some(snapshot),
        Err(err) => {
            tracing::warn!("Initial configuration unusable ({}); using default storage", err);
            None
        }
    };
    let storage = initial
        .as_ref()
        .map(|s| s.storage.clone())
        .unwrap_or_else(StorageSettings::default);

    let pool = db::open_file(&storage.sqlite_path)
        .await
        .map_err(nowcast_monitor::error::StoreError::Open)?;
    let store = Arc::new(NowcastStore::new(pool));
    tracing::info!("Store opened at {}", storage.sqlite_path.display());

    let http = reqwest::Client::builder()
        .user_agent(concat!("nowcast-monitor/", env!("CARGO_PKG_VERSION")))
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| AppError::Network(e.to_string()))?;

    let notifier = Arc::new(TransportNotifier::new(http.clone()));

    if cli.test_notify {
        let snapshot = initial.ok_or_else(|| {
            AppError::Config("a valid configuration is required for --test-notify".to_string())
        })?;
        let notification = Notification::test(&snapshot.notification, chrono::Utc::now());
        notifier
            .notify(&notification, &snapshot.notification)
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;
        tracing::info!("Test notification sent");
        return Ok(());
    }

    let source = Arc::new(OpenMeteoSource::new(settings.forecast_base_url.clone(), http));
    let health = Arc::new(HealthReporter::new(settings.log_dir.clone()));
    let metrics = Arc::new(AppMetrics::new()?);

    let mut monitor = Monitor::new(
        settings.config_path.clone(),
        source,
        notifier,
        store,
        health.clone(),
        metrics.clone(),
    );

    let token = CancellationToken::new();
    tokio::spawn(shutdown_signal(token.clone()));

    if cli.once {
        let report = monitor.run_once(&token).await;
        if !report.ok() {
            tracing::warn!("Single cycle finished with failures");
        }
        return Ok(());
    }

    let server = settings.http_addr.map(|addr| {
        let state = ApiState { health, metrics };
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = api::serve(addr, state, token).await {
                tracing::error!("HTTP server stopped: {}", err);
            }
        })
    });

    monitor.run(token.clone()).await;

    token.cancel();
    if let Some(handle) = server {
        let _ = handle.await;
    }
    Ok(())
}

/// Cancel `token` on SIGINT, or SIGTERM on unix.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Cannot listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received, finishing current cycle");
    token.cancel();
}
