use handover::config::Config;
use handover::probe::HttpProbe;
use handover::rpc::RpcServer;
use handover::supervisor::Supervisor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

/// Hard limit on waiting for instances to drain at shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("handover=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("handover.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "failed to load configuration");
        e
    })?;

    info!(
        path = %config_path.display(),
        apps = config.apps.len(),
        port_range_from = config.port_range.from,
        port_range_to = config.port_range.to,
        "configuration loaded"
    );

    let supervisor = Supervisor::new(&config, Arc::new(HttpProbe::default()));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bind every app's external listener and start its loops; bind failures
    // here abort startup with a non-zero exit.
    let mut handles = supervisor.serve(&shutdown_rx).await?;

    // Bind the admin RPC
    let rpc_addr: SocketAddr = format!("{}:{}", config.rpc.host, config.rpc.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid rpc bind address: {}", e))?;
    let rpc = RpcServer::bind(rpc_addr, Arc::clone(&supervisor), shutdown_rx.clone()).await?;
    handles.push(tokio::spawn(async move {
        if let Err(e) = rpc.run().await {
            error!(error = %e, "rpc server error");
        }
    }));

    // One instance per app
    supervisor.bootstrap();

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
        info!("received ctrl-c, shutting down");
    }

    // Drain every instance first; the updater loops must keep ticking for
    // instances to reach a terminal status.
    supervisor.shutdown(SHUTDOWN_TIMEOUT).await;

    // Now stop the listeners, updaters and the RPC server
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    info!("shutdown complete");
    Ok(())
}
