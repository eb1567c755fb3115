use std::{path::PathBuf, time::Duration};

use clap::Parser;
use watchllm::{AppState, config::ProxyConfig, observability, routes};

#[derive(Debug, Parser)]
#[command(name = "watchllm", version, about = "OpenAI-compatible caching proxy")]
struct Args {
    /// Path to the TOML configuration file. Without one the proxy runs on
    /// defaults (no providers, no registry entries), which is only useful
    /// for smoke testing.
    #[arg(short, long, env = "WATCHLLM_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address from the config file.
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    };

    observability::init_tracing(&config.server.log_directive, config.server.log_format);

    #[cfg(feature = "prometheus")]
    if let Err(error) = observability::metrics::init_prometheus() {
        tracing::warn!(%error, "Failed to install the Prometheus recorder");
    }

    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| config.server.listen.clone());

    if config.providers.is_empty() {
        tracing::warn!("No providers configured; every model route will fail");
    }
    if config.registry.projects.is_empty() {
        tracing::warn!("Registry is empty; every request will be rejected with 401");
    }

    let state = AppState::new(config)?;
    state.spawn_background_tasks();
    spawn_registry_refresh(&state, args.config.clone());

    let router = routes::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(
        addr = %listen,
        projects = state.registry.len(),
        providers = state.config.providers.len(),
        "watchllm listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down, draining background tasks");
    state.graceful_shutdown(Duration::from_secs(10)).await;

    Ok(())
}

/// Re-read the config file on the registry refresh interval and swap in
/// the fresh project table. The control plane updates the file; running
/// requests keep the snapshot they resolved.
fn spawn_registry_refresh(state: &AppState, config_path: Option<PathBuf>) {
    let interval_secs = state.config.registry.refresh_interval_secs;
    let Some(path) = config_path else { return };
    if interval_secs == 0 {
        return;
    }

    let registry = std::sync::Arc::clone(&state.registry);
    let cache = state.config.cache.clone();
    let shutdown = state.shutdown.clone();
    state.task_tracker.spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match ProxyConfig::from_file(&path) {
                        Ok(fresh) => registry.replace_all(
                            &fresh.registry.projects,
                            cache.ttl_secs,
                            cache.semantic.default_threshold,
                        ),
                        Err(error) => {
                            tracing::warn!(%error, "Registry refresh failed; keeping current snapshot");
                        }
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
