use anyhow::Result;
use proctrack_daemon::{
    collector::LinuxProcessCollector,
    config::Config,
    executor::SignalExecutor,
    handler::DaemonState,
    monitor::{MonitorSettings, ProcessMonitor},
    socket::{handle_client, SocketServer},
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("proctrack daemon starting...");

    // Load configuration
    let config_path = Config::config_path();
    let config = Config::load_or_default(&config_path).unwrap_or_else(|e| {
        warn!("Failed to load config: {:#}, using defaults", e);
        Config::default()
    });

    let monitor = Arc::new(ProcessMonitor::new(
        Arc::new(LinuxProcessCollector::new()),
        Arc::new(SignalExecutor::new()),
        MonitorSettings::from_config(&config),
    ));

    match monitor.refresh().await {
        Ok(Some(processes)) => info!(count = processes.len(), "initial snapshot taken"),
        Ok(None) => {}
        Err(e) => warn!("Initial snapshot failed: {}", e),
    }
    if config.refresh.auto_refresh {
        monitor.start_auto_refresh().await;
    }

    let socket_path = config.socket.path.clone().unwrap_or_else(SocketServer::default_path);
    let server = SocketServer::bind(&socket_path).await?;
    let state = Arc::new(DaemonState::new(Arc::clone(&monitor)));

    info!("Daemon ready, listening for connections...");

    loop {
        tokio::select! {
            accepted = server.accept() => match accepted {
                Ok(stream) => {
                    let state = Arc::clone(&state);
                    let events = monitor.subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, events, state).await;
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    monitor.shutdown().await;
    Ok(())
}
