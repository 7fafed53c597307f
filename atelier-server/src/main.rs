//! Atelier sync server.
//!
//! Configuration comes from the environment (see [`ServerConfig::from_env`]);
//! `ATELIER_TOKENS` maps connection tokens to privileges. Ctrl-C stops
//! accepting connections and flushes live documents to storage.

use std::process::ExitCode;
use std::sync::Arc;

use atelier_collab::server::{ServerConfig, SyncServer};
use log::{error, info};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Atelier sync server...");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let tokens = match ServerConfig::tokens_from_env() {
        Ok(tokens) => tokens,
        Err(e) => {
            error!("invalid ATELIER_TOKENS: {e}");
            return ExitCode::FAILURE;
        }
    };
    if tokens.is_empty() {
        info!("no tokens configured, every session is read-only");
    } else {
        info!("{} tokens configured", tokens.len());
    }
    match &config.storage_path {
        Some(path) => info!("storage at {}", path.display()),
        None => info!("no storage configured, documents live in memory only"),
    }

    let server = match SyncServer::new(config, Arc::new(tokens)) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };
    let stats = server.stats().await;
    info!("{} documents resident", stats.live_documents);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                on_signal.cancel();
            }
            Err(e) => error!("cannot listen for ctrl-c: {e}"),
        }
    });

    if let Err(e) = server.run(shutdown).await {
        error!("server stopped: {e}");
        return ExitCode::FAILURE;
    }

    let stats = server.stats().await;
    info!(
        "served {} connections, {} requests, {} accepted batches, {} conflicts, {} denials",
        stats.total_connections, stats.requests, stats.accepted_batches, stats.conflicts, stats.denials
    );
    ExitCode::SUCCESS
}
