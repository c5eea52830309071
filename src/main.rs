use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, path::Path};
use tokio::{fs, net::TcpListener};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{blob_store::BlobStore, sweeper::Sweeper};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting ephemeral-share with config: {:?}", cfg);
    tracing::warn!(
        "Upload metadata is kept in memory only; files from a previous run under {} will not be served",
        cfg.store.upload_dir.display()
    );

    // --- Ensure upload directory exists ---
    ensure_dir(&cfg.store.upload_dir).await?;

    // --- Initialize core store + sweeper ---
    let store = BlobStore::new(cfg.store.clone());
    let shutdown = CancellationToken::new();
    let sweeper = Sweeper::new(store.clone(), cfg.sweep_interval, shutdown.clone()).spawn();

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(store);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // An in-flight sweep may be abandoned; the next run starts from scratch.
    shutdown.cancel();
    if let Err(err) = sweeper.await {
        tracing::warn!("Sweeper task ended abnormally: {}", err);
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn ensure_dir(path: &Path) -> Result<()> {
    if !fs::try_exists(path).await? {
        fs::create_dir_all(path).await?;
        tracing::info!("Created upload directory at {}", path.display());
    }
    Ok(())
}

/// Resolves on Ctrl-C and cancels `token` so background tasks stop too.
async fn shutdown_signal(token: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    token.cancel();
}
