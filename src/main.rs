//! cloudmux -- S3-compatible gateway over many backend storage accounts.
//!
//! Seeds the in-memory account registry from the configuration file, starts
//! the background scheduler, and serves the S3 surface until SIGTERM or
//! SIGINT.  SIGHUP re-reads the `settings` section and re-arms the
//! scheduler.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use cloudmux::backend::factory::{AwsBackendFactory, MemoryBackendFactory};
use cloudmux::backend::memory::MemoryStore;
use cloudmux::backend::BackendFactory;
use cloudmux::config::{BackendKind, LoggingConfig};
use cloudmux::last_used::LastUsedRecorder;
use cloudmux::registry::memory::MemoryRegistry;
use cloudmux::scheduler::Scheduler;
use cloudmux::usage::{ExpirationSweepJob, GraphqlBillingApi, UsageSync, UsageSyncJob};

/// Command-line arguments for the gateway.
#[derive(Parser, Debug)]
#[command(
    name = "cloudmux",
    version,
    about = "S3-compatible gateway over many backend storage accounts"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "cloudmux.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cloudmux::config::load_config(&cli.config)?;

    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    // Initialize Prometheus metrics recorder and register metric descriptions.
    cloudmux::metrics::init_metrics();
    cloudmux::metrics::describe_metrics();

    // Seed the registry.
    let registry = Arc::new(MemoryRegistry::new(config.settings.clone()));
    for account in &config.accounts {
        registry.put_account(account.clone())?;
    }
    for credential in &config.credentials {
        registry.put_credential(credential.clone())?;
    }
    info!(
        "Registry seeded with {} accounts and {} credentials",
        config.accounts.len(),
        config.credentials.len()
    );

    let backends: Arc<dyn BackendFactory> = match config.backend.kind {
        BackendKind::Aws => {
            info!("Using S3-compatible backends (region {})", config.backend.region);
            Arc::new(AwsBackendFactory::new(&config.backend.region))
        }
        BackendKind::Memory => {
            info!("Using the in-memory backend; nothing leaves this process");
            Arc::new(MemoryBackendFactory::new(MemoryStore::new()))
        }
    };

    let (last_used, _last_used_worker) =
        LastUsedRecorder::spawn(registry.clone(), config.last_used_queue_capacity);

    // Background jobs.
    let billing = Arc::new(GraphqlBillingApi::new(&config.billing)?);
    let usage = UsageSync::new(
        registry.clone(),
        registry.clone(),
        backends.clone(),
        billing,
        Duration::from_secs(config.billing.timeout_seconds.max(1)),
    );
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(UsageSyncJob(usage.clone())),
        Arc::new(ExpirationSweepJob(usage)),
    ));
    scheduler.start(&config.settings);

    #[cfg(unix)]
    let _reloader = tokio::spawn(reload_on_hangup(
        cli.config.clone(),
        registry.clone(),
        scheduler.clone(),
    ));

    let state = Arc::new(cloudmux::AppState {
        config: config.clone(),
        registry: registry.clone(),
        credentials: registry,
        backends,
        last_used,
    });

    let app = cloudmux::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("cloudmux listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop();
    info!("cloudmux shut down");

    Ok(())
}

/// Re-read `settings` from the config file on every SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(path: String, registry: Arc<MemoryRegistry>, scheduler: Arc<Scheduler>) {
    let mut hangup =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("SIGHUP handler unavailable, settings reload disabled: {}", e);
                return;
            }
        };
    while hangup.recv().await.is_some() {
        info!("Received SIGHUP, reloading settings from {}", path);
        let result = match cloudmux::config::load_config(&path) {
            Ok(config) => scheduler.apply_settings(registry.as_ref(), config.settings).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Settings reload failed, keeping current settings: {:#}", e);
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
