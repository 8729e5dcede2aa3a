use clap::Parser;
use metric::Registry;
use netstorage::StorageCluster;
use observability_deps::tracing::{error, info};
use selectd::config::Config;
use selectd::http::HttpDelegate;
use selectd::logging::init_logging;
use selectd::rollup_cache::RollupResultCache;
use selectd::server;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
enum StartError {
    #[error("cannot prepare cache directory {dir:?}: {source}")]
    CacheDir {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot initialize netstorage: {0}")]
    Netstorage(#[from] netstorage::Error),

    #[error("cannot serve HTTP: {0}")]
    Http(#[from] hyper::Error),
}

#[tokio::main]
async fn main() {
    let config = Config::parse();
    init_logging(&config);

    if let Err(err) = run(config).await {
        error!(%err, "startup failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), StartError> {
    let registry = Arc::new(Registry::new());

    info!(storage_nodes = ?config.storage_nodes, "starting netstorage");

    // Any leftover spill files are garbage from a previous crash.
    let spill_dir = match &config.cache_data_path {
        Some(cache_data_path) => {
            let tmp = cache_data_path.join("tmp");
            let _ = std::fs::remove_dir_all(&tmp);
            std::fs::create_dir_all(&tmp).map_err(|source| StartError::CacheDir {
                dir: tmp.clone(),
                source,
            })?;
            Some(tmp)
        }
        None => None,
    };

    let cluster = Arc::new(StorageCluster::new(
        config.storage_nodes.clone(),
        spill_dir,
        &registry,
    )?);
    let rollup_cache = Arc::new(RollupResultCache::new(
        config
            .cache_data_path
            .as_ref()
            .map(|p| p.join("rollupResult")),
    ));

    let delegate = Arc::new(HttpDelegate::new(
        Arc::clone(&cluster),
        Arc::clone(&rollup_cache),
        Arc::clone(&registry),
        config.max_concurrent_requests,
        config.max_queue_duration,
        config.max_query_duration,
    ));

    let frontend_shutdown = CancellationToken::new();
    let (local_addr, server_task) = server::start(
        delegate,
        config.http_listen_addr,
        frontend_shutdown.clone(),
    )?;
    info!(%local_addr, "serving HTTP requests");

    server::wait_for_signal().await;

    info!("gracefully shutting down the HTTP server");
    frontend_shutdown.cancel();
    server_task.await.expect("HTTP server task panicked")?;

    info!("shutting down netstorage");
    cluster.stop();

    info!("shutting down the rollup result cache");
    rollup_cache.stop();

    info!("the select tier has been stopped");
    Ok(())
}
