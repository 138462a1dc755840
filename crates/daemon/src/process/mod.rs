pub mod utils;

use std::time::Duration;

use common::archive::FsArchiveStore;
use common::coordinator::{ConfigError, CoordinatorError, ShareCoordinator, ShareEvent, SyncOutcome};
use common::swarm::IrohSwarm;
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

use crate::ServiceConfig;

/// Coordinator over the filesystem archive store and the iroh swarm.
pub type Coordinator = ShareCoordinator<FsArchiveStore, IrohSwarm>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid coordinator configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

/// Handle for gracefully shutting down the daemon service.
pub struct ShutdownHandle {
    graceful_waiter: tokio::task::JoinHandle<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<()>,
    coordinator: Coordinator,
}

impl ShutdownHandle {
    /// Block until the service shuts down (via signal or explicit shutdown).
    pub async fn wait(self) {
        let _ = self.graceful_waiter.await;
        tracing::info!("shutting down");

        match timeout(FINAL_SHUTDOWN_TIMEOUT, self.coordinator.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("error shutting down coordinator: {}", e),
            Err(_) => {
                tracing::error!(
                    "Failed to shut down within {} seconds",
                    FINAL_SHUTDOWN_TIMEOUT.as_secs()
                );
                std::process::exit(4);
            }
        }

        if timeout(FINAL_SHUTDOWN_TIMEOUT, join_all(self.handles))
            .await
            .is_err()
        {
            tracing::error!(
                "Failed to shut down within {} seconds",
                FINAL_SHUTDOWN_TIMEOUT.as_secs()
            );
            std::process::exit(4);
        }
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program.
fn init_logging(
    service_config: &ServiceConfig,
) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    // Stdout layer
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_env_filter = EnvFilter::builder()
        .with_default_directive(service_config.log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(stdout_env_filter);

    // File layer (if log_dir is set)
    if let Some(log_dir) = &service_config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "dat-share.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(service_config.log_level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(file_env_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    utils::register_panic_logger();
    utils::report_build_info();

    guards
}

/// Build the coordinator described by `service_config`.
pub fn build_coordinator(service_config: &ServiceConfig) -> Result<Coordinator, ConfigError> {
    let mut swarm = IrohSwarm::builder();
    if let Some(secret) = &service_config.node_secret {
        swarm = swarm.secret_key(secret.clone());
    }

    Coordinator::builder()
        .root_dir(service_config.root_dir.clone())
        .port(service_config.swarm_port)
        .archive_store(FsArchiveStore::new())
        .transport(swarm.build())
        .build()
}

fn report_sync(outcome: &SyncOutcome) {
    for result in &outcome.results {
        tracing::info!(
            dir = %result.dir,
            discovery_key = %result.discovery_key,
            archive_key = %result.archive_key,
            "shared"
        );
    }
    for failure in &outcome.errors {
        tracing::error!(dir = %failure.dir, error = %failure.error, "could not share");
    }
}

/// Log coordinator notifications until the swarm closes.
async fn log_events(mut events: tokio::sync::broadcast::Receiver<ShareEvent>) {
    loop {
        match events.recv().await {
            Ok(ShareEvent::Listening { port }) => {
                tracing::info!(port, "accepting peers");
            }
            Ok(ShareEvent::Shared(discovery_key)) => {
                tracing::debug!(discovery_key = %discovery_key, "announced");
            }
            Ok(ShareEvent::Replicating(discovery_key)) => {
                tracing::info!(discovery_key = %discovery_key, "peer replicating");
            }
            Ok(ShareEvent::Closed { operator_initiated }) => {
                tracing::debug!(operator_initiated, "swarm closed");
                return;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "dropped coordinator events");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

/// Re-run sync with the configured directory list on every SIGHUP.
async fn reload_on_hangup(
    coordinator: Coordinator,
    service_config: ServiceConfig,
    mut hangup: tokio::signal::unix::Signal,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
                match service_config.reload_dirs() {
                    Ok(dirs) => {
                        tracing::info!(dirs = dirs.len(), "reloading shared directories");
                        let outcome = coordinator.sync(&dirs).await;
                        report_sync(&outcome);
                    }
                    Err(e) => tracing::error!("failed to reload config: {}", e),
                }
            }
        }
    }
}

/// Build the coordinator, start listening, share the configured
/// directories and spawn background tasks.
///
/// The returned `ShutdownHandle` must be kept alive; dropping it does not stop the service.
pub async fn start_service(
    service_config: &ServiceConfig,
) -> Result<(Coordinator, ShutdownHandle), ServiceError> {
    let (graceful_waiter, shutdown_tx, shutdown_rx) = utils::graceful_shutdown_blocker()?;
    let hangup = utils::reload_signal()?;
    let coordinator = build_coordinator(service_config)?;

    let mut handles = Vec::new();
    handles.push(tokio::spawn(log_events(coordinator.subscribe())));

    coordinator.start_listening().await?;

    let outcome = coordinator.sync(&service_config.dirs).await;
    report_sync(&outcome);

    handles.push(tokio::spawn(reload_on_hangup(
        coordinator.clone(),
        service_config.clone(),
        hangup,
        shutdown_rx,
    )));

    tracing::info!(
        root_dir = %service_config.root_dir.display(),
        swarm_port = service_config.swarm_port,
        sharing = coordinator.num_sharing(),
        "running"
    );

    let handle = ShutdownHandle {
        graceful_waiter,
        handles,
        shutdown_tx,
        coordinator: coordinator.clone(),
    };

    Ok((coordinator, handle))
}

/// Spawns the daemon service and blocks until a shutdown signal is received.
pub async fn spawn_service(service_config: &ServiceConfig) -> Result<(), ServiceError> {
    let _guards = init_logging(service_config);
    let (_, handle) = match start_service(service_config).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!("error starting service: {}", e);
            return Err(e);
        }
    };
    handle.wait().await;
    Ok(())
}
