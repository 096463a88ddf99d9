use proxyfleet::api::{ApiServer, PKG_NAME, VERSION};
use proxyfleet::config::Config;
use proxyfleet::frontdoor;
use proxyfleet::launcher::HelperLauncher;
use proxyfleet::orchestrator::Orchestrator;
use proxyfleet::provider::{NettifyProvisioner, ProxiesFoProvisioner, UpstreamProvisioner};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxyfleet=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("proxyfleet.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        name = PKG_NAME,
        version = VERSION,
        path = %config_path.display(),
        journal = %config.journal.path.display(),
        "Configuration loaded"
    );

    let launcher = Arc::new(HelperLauncher::from_config(&config.launcher)?);
    info!(helper = %launcher.helper_path().display(), "Proxy helper resolved");

    let front_door: Arc<dyn frontdoor::FrontDoor> = Arc::from(frontdoor::from_config(&config.front_door));
    let orchestrator = Arc::new(Orchestrator::open(&config, launcher, front_door).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid API bind address");
            anyhow::anyhow!("Invalid API bind address: {}", e)
        })?;

    let api_token = config.server.api_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated API token (configure server.api_token to set a fixed value)");
        token
    });

    let mut server = ApiServer::new(bind_addr, Arc::clone(&orchestrator), shutdown_rx.clone(), api_token);

    match ProxiesFoProvisioner::from_config(&config.providers.proxiesfo) {
        Some(Ok(p)) => {
            let p: Arc<dyn UpstreamProvisioner> = Arc::new(p);
            server = server.with_proxiesfo(p);
        }
        Some(Err(e)) => warn!(error = %e, "proxies.fo integration disabled"),
        None => warn!("No proxies.fo API key configured; POST /plan is disabled"),
    }
    match NettifyProvisioner::from_config(&config.providers.nettify) {
        Some(Ok(p)) => {
            let p: Arc<dyn UpstreamProvisioner> = Arc::new(p);
            server = server.with_nettify(p);
        }
        Some(Err(e)) => warn!(error = %e, "Nettify integration disabled"),
        None => warn!("No Nettify API key configured; POST /nettify/plan is disabled"),
    }

    if config.restore.on_startup {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            match orchestrator.restore().await {
                Ok(report) => info!(
                    restored = report.restored.len(),
                    already_live = report.already_live.len(),
                    failed = report.failed.len(),
                    "Startup restore complete"
                ),
                Err(e) => error!(error = %e, "Startup restore failed"),
            }
        });
    }

    let api_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Control API error");
        }
    });

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

    // Proxy processes are left running; the next start restores them
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("Shutdown complete");
    Ok(())
}
