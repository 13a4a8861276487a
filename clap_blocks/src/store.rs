//! Store endpoint and backend selection.

use data_types::BackendKind;
use pcache_store::postgres::PostgresConnectionOptions;

/// Where the cache lives and how its sets are represented.
#[derive(Debug, Clone, clap::Parser)]
pub struct StoreConfig {
    /// Postgres DSN of the cache store (and, by default, of the fact
    /// table's database).
    #[clap(long = "--dsn", env = "PCACHE_DSN")]
    pub dsn: String,

    /// Maximum connections of the store pool.
    #[clap(
        long = "--max-connections",
        env = "PCACHE_MAX_CONNECTIONS",
        default_value = "10"
    )]
    pub max_connections: u32,

    /// Prefix of every table the store creates.
    #[clap(
        long = "--table-prefix",
        env = "PCACHE_TABLE_PREFIX",
        default_value = "partitioncache"
    )]
    pub table_prefix: String,

    /// Set representation: array, bit, roaringbit or generic.
    #[clap(
        long = "--backend",
        env = "PCACHE_BACKEND",
        default_value = "array",
        parse(try_from_str)
    )]
    pub backend: BackendKind,

    /// Initial bit-store bound for newly registered partition keys.
    #[clap(
        long = "--default-bitsize",
        env = "PCACHE_DEFAULT_BITSIZE",
        default_value = "1000000"
    )]
    pub default_bitsize: u64,

    /// Queue back-pressure cap; enqueues fail fast beyond it.
    #[clap(
        long = "--queue-cap",
        env = "PCACHE_QUEUE_CAP",
        default_value = "10000"
    )]
    pub queue_cap: usize,
}

impl StoreConfig {
    /// Convert into connection options for the Postgres store.
    pub fn connection_options(&self) -> PostgresConnectionOptions {
        let mut options = PostgresConnectionOptions::new(self.dsn.clone());
        options.max_connections = self.max_connections;
        options.table_prefix = self.table_prefix.clone();
        options.backend = self.backend;
        options.queue_cap = self.queue_cap;
        options.default_bitsize = self.default_bitsize;
        options
    }
}
