//! `partitioncache read` — apply the cache to a query and print the
//! rewritten SQL.

use applicator::{apply_cache, ApplyOptions};
use clap_blocks::store::StoreConfig;
use pcache_store::postgres::PostgresCacheStore;
use snafu::{ResultExt, Snafu};

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

    /// The SQL statement to rewrite.
    #[clap(long = "--query")]
    query: Option<String>,

    /// File containing the SQL statement.
    #[clap(long = "--query-file")]
    query_file: Option<std::path::PathBuf>,

    /// Partition key column to constrain.
    #[clap(long = "--partition-key", env = "PCACHE_PARTITION_KEY")]
    partition_key: String,

    /// Fact table of the query.
    #[clap(long = "--fact-table", env = "PCACHE_FACT_TABLE")]
    fact_table: String,

    /// Sets at or below this cardinality are spliced as literal lists.
    #[clap(
        long = "--materialise-threshold",
        env = "PCACHE_MATERIALISE_THRESHOLD",
        default_value = "8192"
    )]
    materialise_threshold: u64,
}

pub async fn command(config: Config) -> crate::commands::Result<()> {
    let sql = crate::commands::load_query(config.query.clone(), config.query_file.clone())?;

    let store = PostgresCacheStore::connect(config.store.connection_options())
        .await
        .context(ConnectSnafu)?;

    let mut options = ApplyOptions::new(config.fact_table.clone());
    options.materialise_threshold = config.materialise_threshold;

    let (rewritten, stats) = apply_cache(&store, &sql, &config.partition_key, &options).await;

    println!("{rewritten}");
    eprintln!(
        "fragments: {} probed, {} hit; cardinality: {}; method: {}; enhanced: {}",
        stats.fragments_probed,
        stats.fragments_hit,
        stats
            .cardinality
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string()),
        stats
            .method
            .map(|m| format!("{m:?}"))
            .unwrap_or_else(|| "-".to_string()),
        stats.enhanced,
    );
    Ok(())
}
