//! `partitioncache add` — non-blocking enqueue of one query.

use clap_blocks::store::StoreConfig;
use data_types::Datatype;
use pcache_store::interface::CacheStore;
use pcache_store::postgres::PostgresCacheStore;
use snafu::{ResultExt, Snafu};
use std::str::FromStr;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid datatype: {source}"))]
    Datatype { source: data_types::Error },

    #[snafu(display("cannot connect to the cache store: {source}"))]
    Connect {
        source: pcache_store::interface::Error,
    },

    #[snafu(display("enqueue failed: {source}"))]
    Enqueue { source: populator::Error },
}

impl Error {
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Datatype { .. })
    }
}

#[derive(Debug, clap::Parser)]
pub struct Config {
    #[clap(flatten)]
    store: StoreConfig,

    /// The SQL statement to cache fragments of.
    #[clap(long = "--query")]
    query: Option<String>,

    /// File containing the SQL statement.
    #[clap(long = "--query-file")]
    query_file: Option<std::path::PathBuf>,

    /// Partition key column to populate.
    #[clap(long = "--partition-key", env = "PCACHE_PARTITION_KEY")]
    partition_key: String,

    /// Datatype of the partition key: int32, int64, float, text or
    /// timestamp.
    #[clap(long = "--datatype", env = "PCACHE_DATATYPE", default_value = "int64")]
    datatype: String,

    /// Queue priority; larger runs earlier.
    #[clap(long = "--priority", default_value = "0")]
    priority: i32,
}

pub async fn command(config: Config) -> crate::commands::Result<()> {
    let sql = crate::commands::load_query(config.query.clone(), config.query_file.clone())?;
    let datatype = Datatype::from_str(&config.datatype).context(DatatypeSnafu)?;

    let store = PostgresCacheStore::connect(config.store.connection_options())
        .await
        .context(ConnectSnafu)?;
    store.setup().await.context(ConnectSnafu)?;

    let outcome = populator::add_to_queue(
        &store,
        &sql,
        &config.partition_key,
        datatype,
        config.priority,
    )
    .await
    .context(EnqueueSnafu)?;

    println!("{outcome:?}");
    Ok(())
}
