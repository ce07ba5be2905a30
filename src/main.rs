use hyper::Method;
use spheregate::config::Config;
use spheregate::module::{ModuleRegistry, ServerModule};
use spheregate::pipeline::Gateway;
use spheregate::repo::{FileSystemProvider, ProviderRegistry, RepoProvider};
use spheregate::server::GatewayServer;
use spheregate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spheregate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Configuration file is optional; environment overrides always apply
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = match &config_path {
        Some(path) => Config::load(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            e
        })?,
        None => Config::default(),
    };
    config.apply_env()?;
    let config = config.with_default_root();
    config.validate()?;

    print_startup_banner(&config);

    let providers = ProviderRegistry::default();
    let platform_repo: Arc<dyn RepoProvider> = match providers.build(&config.repo) {
        Some(repo) => repo,
        None => {
            warn!(
                provider = %config.repo.provider,
                available = ?providers.names(),
                "Unknown repository provider, falling back to FileSystem"
            );
            Arc::new(FileSystemProvider::new(&config.repo.root))
        }
    };

    let gateway = Gateway::new(
        config.server.clone(),
        platform_repo,
        providers,
        starter_modules(),
    );
    if let Err(e) = gateway.load_server_settings().await {
        warn!(error = %e, "Failed to load server configuration, server is unprotected");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bind_addr: SocketAddr = config
        .server
        .listen_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", config.server.listen_addr(), e))?;
    let server = GatewayServer::bind(bind_addr, Arc::clone(&gateway), shutdown_rx).await?;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

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

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!(tenants = gateway.tenants().len(), "Shutdown complete");
    Ok(())
}

/// Modules served by this binary
fn starter_modules() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register("/app/server/endpoint.ts", || {
        ServerModule::new().export("message", Method::GET, |ctx| async move {
            Ok(Some(ctx.response.text("JSphere")))
        })
    });
    registry
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        config_package = %config.server.config_package,
        server_config = ?config.server.server_config,
        max_body_bytes = config.server.max_body_bytes,
        "Server configuration"
    );
    info!(
        provider = %config.repo.provider,
        root = %config.repo.root,
        authenticated = config.repo.credentials.is_some(),
        "Platform repository"
    );
}
