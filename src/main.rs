use devgate::config::Config;
use devgate::dirs::DirectoryScope;
use devgate::gateway::{GatewayServer, RouteTable};
use devgate::process::{OutputEvent, OutputSink, ProcessSupervisor};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    let bind_addr = config
        .server
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    let scope = DirectoryScope::for_config(&config_path);
    print_startup_banner(&config, &scope);

    let grace = config.server.shutdown_grace_period();
    let supervisor = ProcessSupervisor::new(&scope, &config.services, grace);
    let routes = Arc::new(RouteTable::from_config(&config, &scope));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = GatewayServer::new(bind_addr, routes, shutdown_rx);
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    supervisor.start_all(|instance| console_sink(instance.name())).await;

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    supervisor.shutdown().await;

    // Wait for the gateway to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), gateway_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Sink that prints a service's output to stdout, one prefixed line at a time
fn console_sink(name: &str) -> Arc<dyn OutputSink> {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputEvent>();
    let prefix = format!("{} | ", name);

    tokio::spawn(async move {
        let mut pending = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                OutputEvent::Text(text) => {
                    pending.push_str(&text);
                    while let Some(idx) = pending.find('\n') {
                        let line: String = pending.drain(..=idx).collect();
                        print!("{}{}", prefix, line);
                    }
                }
                OutputEvent::Clear => {
                    if !pending.is_empty() {
                        println!("{}{}", prefix, pending);
                        pending.clear();
                    }
                }
            }
        }
        if !pending.is_empty() {
            println!("{}{}", prefix, pending);
        }
    });

    Arc::new(tx)
}

fn print_startup_banner(config: &Config, scope: &DirectoryScope) {
    info!(name = PKG_NAME, version = VERSION, "Starting development gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        request_timeout_secs = config.server.request_timeout_secs,
        shutdown_grace_period_secs = config.server.shutdown_grace_period_secs,
        "Server configuration"
    );
    info!(
        runtime_dir = %scope.runtime_dir().display(),
        state_dir = %scope.state_dir().display(),
        "Directory scope"
    );
    info!(
        service_count = config.services.len(),
        services = ?config.service_names(),
        "Configured services"
    );
    info!(
        vhost_count = config.servers.len(),
        default_server = config.default_server.is_some(),
        "Configured virtual hosts"
    );
}
