//! `partitioncache manage` — set up, inspect and prune the cache store.

use clap_blocks::store::StoreConfig;
use data_types::Fingerprint;
use evictor::EvictionPolicy;
use pcache_store::interface::CacheStore;
use pcache_store::postgres::PostgresCacheStore;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cannot connect to the cache store: {source}"))]
    Connect {
        source: pcache_store::interface::Error,
    },

    #[snafu(display("store operation failed: {source}"))]
    Store {
        source: pcache_store::interface::Error,
    },

    #[snafu(display("eviction failed: {source}"))]
    Evict { source: evictor::Error },
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

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Create all store tables (idempotent)
    Setup,

    /// Print queue depths, partitions and live builds
    Status,

    /// List the cache entries of one partition key
    List {
        /// Partition key to list.
        #[clap(long = "--partition-key")]
        partition_key: String,
    },

    /// Delete one entry, or every tombstone, of a partition key
    Delete {
        /// Partition key to delete from.
        #[clap(long = "--partition-key")]
        partition_key: String,

        /// Fingerprint of the entry to delete.
        #[clap(long = "--fingerprint", conflicts_with = "tombstones")]
        fingerprint: Option<String>,

        /// Delete every tombstone (timeout/failed/limit) instead.
        #[clap(long = "--tombstones")]
        tombstones: bool,
    },

    /// Record the distinct-count of a partition key over the fact table,
    /// used for search-space-reduction stats
    TotalKeys {
        /// Partition key to annotate.
        #[clap(long = "--partition-key")]
        partition_key: String,

        /// Distinct count of the key over the fact table.
        #[clap(long = "--count")]
        count: u64,
    },

    /// Run one eviction pass over every partition key
    Evict {
        /// Eviction strategy.
        #[clap(long = "--strategy", arg_enum, default_value = "oldest")]
        strategy: EvictionPolicy,

        /// Entries allowed per partition key.
        #[clap(long = "--threshold", default_value = "1000")]
        threshold: usize,
    },
}

pub async fn command(config: Config) -> crate::commands::Result<()> {
    let store = PostgresCacheStore::connect(config.store.connection_options())
        .await
        .context(ConnectSnafu)?;

    match config.command {
        Command::Setup => {
            store.setup().await.context(StoreSnafu)?;
            println!("store tables ready (prefix: {})", config.store.table_prefix);
        }
        Command::Status => {
            let mut repos = store.repositories().await;
            let depths = repos.queue().depths().await.context(StoreSnafu)?;
            let partitions = repos.partitions().list().await.context(StoreSnafu)?;
            let jobs = repos.active_jobs().list().await.context(StoreSnafu)?;

            println!(
                "queues: {} original, {} fragment",
                depths.original, depths.fragment
            );
            println!("active builds: {}", jobs.len());
            for meta in partitions {
                let entries = repos
                    .entries()
                    .list(&meta.partition_key)
                    .await
                    .context(StoreSnafu)?;
                println!(
                    "partition {} ({}): {} entries{}",
                    meta.partition_key,
                    meta.datatype,
                    entries.len(),
                    meta.bitsize
                        .map(|b| format!(", bitsize {b}"))
                        .unwrap_or_default(),
                );
            }
        }
        Command::List { partition_key } => {
            for info in pcache_store::list_fragments(&store, &partition_key)
                .await
                .context(StoreSnafu)?
            {
                println!(
                    "{}\t{}\t{}\t{}",
                    info.fingerprint, info.status, info.cardinality, info.last_seen_ns
                );
            }
        }
        Command::Delete {
            partition_key,
            fingerprint,
            tombstones,
        } => {
            let mut repos = store.repositories().await;
            let victims: Vec<Fingerprint> = if tombstones {
                repos
                    .entries()
                    .list(&partition_key)
                    .await
                    .context(StoreSnafu)?
                    .into_iter()
                    .filter(|info| info.status.is_tombstone())
                    .map(|info| info.fingerprint)
                    .collect()
            } else {
                match fingerprint {
                    Some(hex) => vec![Fingerprint::new(hex)],
                    None => {
                        return Err(crate::commands::Error::Config {
                            message: "pass --fingerprint or --tombstones".to_string(),
                        })
                    }
                }
            };

            for fp in &victims {
                repos
                    .entries()
                    .delete(&partition_key, fp)
                    .await
                    .context(StoreSnafu)?;
                repos
                    .query_log()
                    .delete(&partition_key, fp)
                    .await
                    .context(StoreSnafu)?;
            }
            println!("deleted {} entries", victims.len());
        }
        Command::TotalKeys {
            partition_key,
            count,
        } => {
            let mut repos = store.repositories().await;
            repos
                .partitions()
                .set_total_keys(&partition_key, count)
                .await
                .context(StoreSnafu)?;
            println!("recorded {count} distinct keys for {partition_key}");
        }
        Command::Evict {
            strategy,
            threshold,
        } => {
            let removed = evictor::evict_all(
                &store,
                strategy,
                threshold,
                "postgres",
                Some(&config.store.table_prefix),
            )
            .await
            .context(EvictSnafu)?;
            println!("evicted {removed} entries");
        }
    }
    Ok(())
}
