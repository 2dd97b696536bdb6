use sessiongate::auth::AuthGuard;
use sessiongate::config::Config;
use sessiongate::pool::PoolConfig;
use sessiongate::process::ProcessSupervisor;
use sessiongate::proxy::ProxyServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sessiongate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("sessiongate.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let listen_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Signals that arrive during startup are queued until the sessions exist
    let mut signals = ShutdownSignals::install()?;

    // Bound before any session starts, so a taken port leaves nothing behind
    let listener = TcpListener::bind(listen_addr).await.map_err(|e| {
        error!(addr = %listen_addr, error = %e, "Failed to bind listener");
        anyhow::anyhow!("Failed to bind {}: {}", listen_addr, e)
    })?;

    let supervisor = ProcessSupervisor::new(&config);
    let registry = match supervisor.start_all(&config.users).await {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(error = %e, "Session startup failed");
            return Err(e.into());
        }
    };

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let auth = AuthGuard::new(config.token.clone(), config.users.clone());
    let proxy = ProxyServer::new(Arc::clone(&registry), auth, shutdown_rx, pool_config);
    let mut proxy_handle = tokio::spawn(proxy.serve(listener));

    // The server only returns after shutdown was requested, so an early
    // return is a failure and tears the sessions down like a signal does
    let server_failure = tokio::select! {
        _ = signals.recv() => None,
        result = &mut proxy_handle => Some(match result {
            Ok(Ok(())) => anyhow::anyhow!("Proxy server stopped unexpectedly"),
            Ok(Err(e)) => e,
            Err(e) => anyhow::anyhow!("Proxy server task failed: {}", e),
        }),
    };
    if let Some(ref e) = server_failure {
        error!(error = %e, "Proxy server stopped, shutting down");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all sessions...");
    let failures = supervisor.terminate_all(&registry).await;
    if !failures.is_empty() {
        warn!(failed = failures.len(), "Some sessions did not shut down cleanly");
    }

    let grace = config.server.shutdown_grace_period();
    info!(grace_secs = grace.as_secs(), "Waiting before exit");
    tokio::time::sleep(grace).await;

    proxy_handle.abort();
    if let Some(e) = server_failure {
        return Err(e);
    }
    info!("Shutdown complete");
    Ok(())
}

/// SIGHUP, SIGTERM and SIGINT, registered up front
#[cfg(unix)]
struct ShutdownSignals {
    sighup: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sigint: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> anyhow::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sighup: signal(SignalKind::hangup())?,
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.sighup.recv() => info!("Received SIGHUP, shutting down..."),
            _ = self.sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            _ = self.sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down..."),
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn install() -> anyhow::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting session gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        env_dir = %config.env_dir.display(),
        setup_script = %config.setup_script.display(),
        start_script = %config.start_script.display(),
        stop_script = ?config.stop_script,
        "Session scripts"
    );
    info!(
        base_port = config.base_port,
        wait_for_ready = config.startup.wait_for_ready,
        ready_timeout_secs = config.startup.ready_timeout_secs,
        shutdown_grace_period_secs = config.server.shutdown_grace_period_secs,
        "Session settings"
    );
    info!(
        user_count = config.users.len(),
        users = ?config.users,
        "Configured users"
    );
}
