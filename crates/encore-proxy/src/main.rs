mod admin;
mod config;
mod lifecycle;
mod network;
mod proxy;
mod router;

use admin::{admin_router, AdminState};
use clap::Parser;
use config::Config;
use encore_store::CacheStorage;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use lifecycle::{Installer, LifecycleManager};
use network::{Network, UpstreamNetwork};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use parking_lot::Mutex;
use proxy::{proxy_router, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Encore offline-caching proxy.
#[derive(Parser)]
#[command(name = "encore-proxy")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let args = Args::parse();

    let config = if args.config.exists() {
        match Config::load(&args.config) {
            Ok(c) => {
                tracing::info!(path = %args.config.display(), "loaded config");
                c
            }
            Err(e) => {
                tracing::error!(error = %e, path = %args.config.display(), "failed to load config, using defaults");
                Config::default_config()
            }
        }
    } else {
        tracing::info!(path = %args.config.display(), "no config file found, using defaults");
        Config::default_config()
    };

    let worker_config = match config.worker_config() {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "invalid worker config");
            std::process::exit(1);
        }
    };

    let prom_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("prometheus recorder");

    let client = Client::builder(TokioExecutor::new()).build_http();
    let network: Arc<dyn Network> = Arc::new(UpstreamNetwork::new(
        client,
        config.upstream.url.clone(),
        Duration::from_millis(config.upstream.timeout_ms),
    ));

    let storage = Arc::new(CacheStorage::new(config.store.quota_bytes));
    let lifecycle = Arc::new(LifecycleManager::new(storage, Arc::clone(&network)));
    let state = Arc::new(AppState::new(Arc::clone(&lifecycle), network));

    let shutdown = CancellationToken::new();
    let retry = Duration::from_millis(config.lifecycle.install_retry_ms);
    let installer = Arc::new(Installer::new(Arc::clone(&lifecycle), shutdown.clone()));

    // Install runs in the background; until it succeeds requests pass straight
    // through to the upstream.
    installer.start(worker_config, retry);

    let admin = admin_router(AdminState {
        app: Arc::clone(&state),
        prometheus: Some(prom_handle),
    });
    let proxy = proxy_router(Arc::clone(&state));

    let proxy_addr = config.server.listen_addr.clone();
    let admin_addr = config.server.admin_addr.clone();

    tracing::info!(
        proxy = %proxy_addr,
        admin = %admin_addr,
        upstream = %config.upstream.url,
        version = %config.store.version,
        max_cached_songs = config.router.max_cached_songs,
        network_timeout_ms = config.router.network_timeout_ms,
        update_flow = ?config.lifecycle.update_flow,
        "encore proxy starting"
    );

    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind proxy to {proxy_addr}: {e}"));

    let admin_listener = tokio::net::TcpListener::bind(&admin_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind admin to {admin_addr}: {e}"));

    spawn_config_watcher(args.config.clone(), config, installer);

    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(shutdown_clone).await;
    });

    let proxy_future = axum::serve(proxy_listener, proxy)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    let admin_future = axum::serve(admin_listener, admin)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());

    tokio::select! {
        result = proxy_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "proxy server error");
            }
        }
        result = admin_future => {
            if let Err(e) = result {
                tracing::error!(error = %e, "admin server error");
            }
        }
    }

    tracing::info!("encore proxy shut down");
}

/// Listen for SIGINT (Ctrl+C) or SIGTERM and cancel the shutdown token.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    tracing::info!("shutdown signal received, draining connections...");
    token.cancel();
}

/// Watch the config file; a new `store.version` installs a new worker
/// generation in the background, replacing any install still retrying.
fn spawn_config_watcher(config_path: PathBuf, initial_config: Config, installer: Arc<Installer>) {
    let current_config = Arc::new(Mutex::new(initial_config));

    let config_path_clone = config_path.clone();
    let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        let Ok(event) = res else { return };
        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
            return;
        }
        match Config::load(&config_path_clone) {
            Ok(new_config) => {
                let mut old = current_config.lock();
                match config::diff_for_update(&old, &new_config) {
                    Ok(Some(worker)) => {
                        let retry = Duration::from_millis(new_config.lifecycle.install_retry_ms);
                        installer.start(worker, retry);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "reloaded config rejected");
                        return;
                    }
                }
                *old = new_config;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to reload config");
            }
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start config watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&config_path, RecursiveMode::NonRecursive) {
        tracing::warn!(error = %e, path = %config_path.display(), "failed to watch config file");
        return;
    }

    // Leak the watcher so it lives for the process lifetime
    std::mem::forget(watcher);
    tracing::info!("config file watcher started");
}
