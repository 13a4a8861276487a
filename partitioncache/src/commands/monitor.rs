//! `partitioncache monitor` — run cache-building workers until
//! interrupted.

use clap_blocks::{store::StoreConfig, worker::WorkerRunConfig};
use data_types::WorkerId;
use evictor::EvictionConfig;
use pcache_store::interface::CacheStore;
use pcache_store::postgres::{PostgresCacheStore, PostgresExecutor};
use populator::{MonitorConfig, WorkerConfig};
use snafu::{ResultExt, Snafu};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cannot connect to the cache store: {source}"))]
    Connect {
        source: pcache_store::interface::Error,
    },
}

impl Error {
    pub fn is_config_error(&self) -> bool {
        false
    }
}

#[derive(Debug, clap::Parser)]
pub struct Config {
    #[clap(flatten)]
    store: StoreConfig,

    #[clap(flatten)]
    worker: WorkerRunConfig,

    #[clap(flatten)]
    eviction: EvictionConfig,
}

pub async fn command(config: Config) -> crate::commands::Result<()> {
    let store = PostgresCacheStore::connect(config.store.connection_options())
        .await
        .context(ConnectSnafu)?;
    store.setup().await.context(ConnectSnafu)?;

    let executor = Arc::new(PostgresExecutor::new(store.pool()));
    let store: Arc<dyn CacheStore> = Arc::new(store);

    let mut worker_config = WorkerConfig::new(
        WorkerId::new(format!("pcache-{}", std::process::id())),
        config.worker.fact_table.clone(),
    );
    worker_config.statement_timeout = config.worker.statement_timeout;
    worker_config.result_limit = config.worker.result_limit;
    worker_config.stale_after = config.worker.stale_after;
    worker_config.variants = config.worker.variant_config();

    let monitor_config = MonitorConfig {
        workers: config.worker.max_parallel_workers,
        poll_interval: config.worker.frequency,
        worker: worker_config,
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("interrupt received, shutting down");
            shutdown.cancel();
        });
    }

    let eviction = if config.eviction.enabled {
        let store = Arc::clone(&store);
        let eviction_config = config.eviction.clone();
        let prefix = config.store.table_prefix.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            evictor::run(store, eviction_config, "postgres".to_string(), Some(prefix), shutdown)
                .await;
        }))
    } else {
        None
    };

    info!(
        workers = monitor_config.workers,
        fact_table = %config.worker.fact_table,
        "starting workers",
    );
    populator::run(
        Arc::clone(&store),
        executor,
        monitor_config,
        shutdown.clone(),
    )
    .await;

    if let Some(handle) = eviction {
        handle.await.ok();
    }
    Ok(())
}
