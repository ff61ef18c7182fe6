//! Quality governor daemon.
//!
//! Runs the governor for the host renderer, which drives it over a Unix
//! socket: workload switches, lifecycle events, measured frame rates and,
//! with the `push` context source, thermal and power state.

use quality_governor::analytics::TracingAnalyticsSink;
use quality_governor::config::{ConfigManager, ContextSource, GovernorConfig};
use quality_governor::controller::DebugOverrides;
use quality_governor::error::{DaemonError, IpcError, StoreError};
use quality_governor::governor::Governor;
use quality_governor::ipc_server::{ContextControl, DaemonState};
use quality_governor::logging;
use quality_governor::platform::{device_identity, SysfsDeviceContext};
use quality_governor::store::{FileKeyValueStore, ProfileStore};
use quality_governor::thermal::{DeviceContext, PushDeviceContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Delay before restarting a failed IPC server
const IPC_RESTART_DELAY_SECS: u64 = 5;

/// Graceful shutdown timeout in seconds
const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    // JSON logs to stderr and a rotating file
    let _log_guard = logging::init_logging().map_err(|e| {
        eprintln!("Failed to initialize logging: {}", e);
        e
    })?;

    info!("Quality governor daemon starting...");

    let result = run_daemon().await;

    match &result {
        Ok(()) => info!("Quality governor daemon shut down gracefully"),
        Err(e) => error!("Quality governor daemon error: {}", e),
    }

    result
}

async fn run_daemon() -> Result<(), DaemonError> {
    let config_path = ConfigManager::default_path();
    let config_manager = Arc::new(ConfigManager::load_or_default(&config_path)?);
    info!("Configuration loaded from {:?}", config_path);

    let config = config_manager.get();
    let (context, control) = build_context(&config);
    let store = open_store();

    let governor = Arc::new(Governor::new(
        config.clone(),
        context,
        store,
        Arc::new(TracingAnalyticsSink),
        DebugOverrides::default(),
    ));

    if let Some(workload_id) = config.initial_workload.as_deref() {
        governor.set_active_workload(workload_id).await;
    }

    let daemon_state = Arc::new(DaemonState::new(
        Arc::clone(&governor),
        control,
        Arc::clone(&config_manager),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = setup_signal_handlers(signal_tx).await {
            error!("Signal handler error: {}", e);
        }
    });

    let ipc_state = Arc::clone(&daemon_state);
    let ipc_shutdown_rx = shutdown_rx.clone();
    let socket_path = config.socket_path.clone();
    let ipc_handle = tokio::spawn(async move {
        run_ipc_server_with_restart(ipc_state, socket_path, ipc_shutdown_rx).await
    });

    info!("Quality governor initialized and running");

    let mut shutdown_rx_main = shutdown_rx.clone();
    shutdown_rx_main.changed().await.ok();

    info!("Shutdown signal received, stopping tasks...");

    // Persist and flush before the IPC task goes away
    governor.shutdown().await;

    let shutdown_timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
    if tokio::time::timeout(shutdown_timeout, ipc_handle).await.is_err() {
        warn!("IPC server did not stop within {:?}", shutdown_timeout);
    }

    info!("All tasks stopped");
    Ok(())
}

/// Device context for the configured source, plus its writable side.
fn build_context(config: &GovernorConfig) -> (Arc<dyn DeviceContext>, ContextControl) {
    match config.context_source {
        ContextSource::Sysfs => {
            let context = Arc::new(SysfsDeviceContext::new());
            info!("Reading thermal state from sysfs");
            let shared: Arc<dyn DeviceContext> = context.clone();
            (shared, ContextControl::Sysfs(context))
        }
        ContextSource::Push => {
            let context = Arc::new(PushDeviceContext::new());
            info!("Thermal state is pushed over IPC");
            let shared: Arc<dyn DeviceContext> = context.clone();
            (shared, ContextControl::Push(context))
        }
    }
}

/// Profile store on disk, or in memory when the medium is unusable.
fn open_store() -> ProfileStore {
    let dir = FileKeyValueStore::default_dir();
    match open_file_store(&dir) {
        Ok(store) => {
            info!("Profiles stored in {:?}", dir);
            store
        }
        Err(e) => {
            warn!("{}; profiles will not survive restart", e);
            ProfileStore::in_memory()
        }
    }
}

fn open_file_store(dir: &std::path::Path) -> Result<ProfileStore, StoreError> {
    let backend = FileKeyValueStore::open(dir)?;
    Ok(ProfileStore::open(Box::new(backend), &device_identity()))
}

/// Set up signal handlers for graceful shutdown on SIGTERM and SIGINT.
#[cfg(unix)]
async fn setup_signal_handlers(
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}

#[cfg(not(unix))]
async fn setup_signal_handlers(
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Run the IPC server, restarting it after failures until shutdown.
async fn run_ipc_server_with_restart(
    state: Arc<DaemonState>,
    socket_path: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("IPC server shutting down");
                    break;
                }
            }
            result = run_ipc_server_inner(Arc::clone(&state), &socket_path) => {
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        error!(
                            "IPC server error: {}, restarting in {} seconds",
                            e, IPC_RESTART_DELAY_SECS
                        );
                        tokio::select! {
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(Duration::from_secs(IPC_RESTART_DELAY_SECS)) => {}
                        }
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
async fn run_ipc_server_inner(state: Arc<DaemonState>, socket_path: &str) -> Result<(), IpcError> {
    let server = quality_governor::ipc_server::IpcServer::new(socket_path).await?;
    info!("IPC server listening on {:?}", server.socket_path());
    server.run(state).await
}

#[cfg(not(unix))]
async fn run_ipc_server_inner(_state: Arc<DaemonState>, _socket_path: &str) -> Result<(), IpcError> {
    warn!("IPC server not available on this platform");
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
