use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use ai_relayd::config::{ClientAccess, Config};
use ai_relayd::discovery::browser::ResolutionCache;
use ai_relayd::discovery::{self, RegistryListener};
use ai_relayd::registry::ServiceRegistry;
use ai_relayd::relay::RequestRelay;
use ai_relayd::{api, sweeper};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ai_relayd=info"))
        )
        .init();

    tracing::info!("Starting ai-relayd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/ai-relay/relayd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    if config.api.client_access == ClientAccess::Open {
        tracing::warn!(
            listen = %config.api.listen,
            "Relay is open to every client that can reach it; upstream credit is not protected"
        );
    }

    // One registry for the whole process, handed to each component
    let registry = ServiceRegistry::shared();

    // Create mDNS daemon, optionally pinned to one interface
    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.discovery.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    let advertised = match &config.advertise {
        Some(advertise) => Some(discovery::advertise::register_backend(&mdns_daemon, advertise)?),
        None => None,
    };

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn mDNS browser task
    let resolutions = Arc::new(ResolutionCache::new());
    let listener = Arc::new(RegistryListener::new(registry.clone(), resolutions.clone()));
    let browser_resolutions = resolutions.clone();
    let browser_cancel = cancel.clone();
    let browser_daemon = mdns_daemon.clone();
    let service_types = config.discovery.service_types.clone();
    let browser_handle = tokio::spawn(async move {
        if let Err(e) = discovery::browser::run_browser(
            browser_daemon,
            service_types,
            listener,
            browser_resolutions,
            browser_cancel,
        )
        .await
        {
            tracing::error!("mDNS browser error: {:#}", e);
        }
    });

    // Spawn staleness sweeper when a threshold is configured
    let sweeper_handle = config.registry.stale_after_secs.map(|stale_after_secs| {
        tracing::info!(stale_after_secs, "Evicting services that stop announcing");
        tokio::spawn(sweeper::run_sweeper(
            registry.clone(),
            resolutions.clone(),
            Duration::from_secs(stale_after_secs),
            Duration::from_secs(config.registry.sweep_interval_secs),
            cancel.clone(),
        ))
    });

    // Build API router
    let relay = RequestRelay::new(registry.clone(), &config.relay)?;
    let app_state = api::routes::AppState {
        registry: registry.clone(),
        relay: Arc::new(relay),
        client_access: config.api.client_access,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let tcp_listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            tcp_listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(browser_handle, server_handle);
    if let Some(handle) = sweeper_handle {
        let _ = handle.await;
    }

    // Unregister mDNS advertisement
    if let Some(service_info) = &advertised {
        if let Err(e) = discovery::advertise::unregister_backend(&mdns_daemon, service_info) {
            tracing::error!("Failed to unregister mDNS service: {}", e);
        }
    }

    // Shutdown mDNS daemon
    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!(services = registry.len(), "Shutdown complete");
    Ok(())
}
