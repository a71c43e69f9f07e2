use rustls::pki_types::CertificateDer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use warmstart::address::Transport;
use warmstart::backend::{factory_fn, Backend, BackendFactory, EphemeralPorts};
use warmstart::cache::{BootstrapCache, CacheSettings};
use warmstart::config::Config;
use warmstart::echo::EchoApp;
use warmstart::forward::{ForwardSettings, Forwarder};
use warmstart::handler::{HandlerSettings, InvocationHandler};
use warmstart::server::InvocationServer;
use warmstart::{tls, PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("warmstart=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("warmstart.toml"));

    let config = Config::load_with_env(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", config.server.bind, e))?;

    let (factory, trusted_roots) = echo_factory(config.server.backend_tls)?;

    let cache_settings = CacheSettings::from_config(&config)?;
    if let Some(address) = &cache_settings.dev_address {
        warn!(%address, "Development mode: forwarding to a pre-started backend, bootstrap disabled");
    }
    let cache = BootstrapCache::new(factory, Arc::new(EphemeralPorts), cache_settings);

    let forwarder = Forwarder::with_tls_roots(ForwardSettings::from_config(&config), &trusted_roots)?;
    let handler = Arc::new(InvocationHandler::new(
        Arc::clone(&cache),
        Arc::new(forwarder),
        HandlerSettings::from_config(&config),
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = InvocationServer::new(bind_addr, handler, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Invocation host error");
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

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping cached backend...");
    let grace = config.defaults.drain_timeout() + config.defaults.shutdown_grace_period();
    if tokio::time::timeout(grace, cache.shutdown()).await.is_err() {
        warn!(timeout_secs = grace.as_secs(), "Backend teardown did not finish in time");
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Factory for the built-in echo backend, plus the roots the forwarder must
/// trust to reach it
fn echo_factory(use_tls: bool) -> anyhow::Result<(Arc<dyn BackendFactory>, Vec<CertificateDer<'static>>)> {
    if !use_tls {
        let factory = factory_fn(|| async { Ok(Backend::managed(Arc::new(EchoApp::default()))) });
        return Ok((Arc::new(factory), Vec::new()));
    }

    let signed = tls::self_signed_acceptor()?;
    warn!("Backend TLS enabled with auto-generated self-signed certificate (not for production)");

    let acceptor = signed.acceptor;
    let factory = factory_fn(move || {
        let transport = Transport::Tls(acceptor.clone());
        async move { Ok(Backend::managed(Arc::new(EchoApp::default())).with_transport(transport)) }
    });
    Ok((Arc::new(factory), vec![signed.certificate]))
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting invocation host");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        backend_tls = config.server.backend_tls,
        "Server configuration"
    );
    info!(
        enable_cache = config.cache.enable_cache,
        environment = %config.cache.environment,
        dev_mode_address = ?config.cache.dev_mode_address,
        "Cache settings"
    );
    info!(
        bootstrap_timeout_secs = config.defaults.bootstrap_timeout_secs,
        request_timeout_secs = config.defaults.request_timeout_secs,
        max_body_bytes = config.defaults.max_body_bytes,
        rewrite_marker = ?config.defaults.rewrite_marker,
        "Request handling defaults"
    );
    info!(
        pool_max_idle = config.defaults.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.defaults.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        shutdown_grace_period_secs = config.defaults.shutdown_grace_period_secs,
        drain_timeout_secs = config.defaults.drain_timeout_secs,
        "Shutdown settings"
    );
}
