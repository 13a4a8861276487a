//! The write path of the partition cache: admit queries into the queue,
//! expand them into fragments, and build fragment entries with a pool of
//! cooperative workers.
//!
//! Workers are single-item-at-a-time: one call to
//! [`process_once`](worker::process_once) performs at most one unit of
//! work, so scheduling stays external (a thread, a task runtime, or cron).
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{BackendKind, Datatype, EnqueueOutcome, WorkerId};
use pcache_store::interface::CacheStore;
use query_analysis::VariantConfig;
use snafu::Snafu;
use std::time::Duration;

mod dispatch;
pub mod worker;

pub use worker::{process_once, recover_stale_jobs, run, run_item, MonitorConfig};

/// Errors of the write path.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("invalid partition key name: {partition_key}"))]
    InvalidPartitionKey { partition_key: String },

    #[snafu(display("the {backend} store cannot hold {datatype} partition keys"))]
    UnsupportedDatatype {
        backend: BackendKind,
        datatype: Datatype,
    },

    #[snafu(display(
        "partition key {partition_key} is registered as {existing}, got {requested}"
    ))]
    DatatypeMismatch {
        partition_key: String,
        existing: Datatype,
        requested: Datatype,
    },

    #[snafu(display("cache store failure: {source}"))]
    Store {
        source: pcache_store::interface::Error,
    },
}

/// Convenience result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Per-worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity recorded in active-job rows and the query log.
    pub worker_id: WorkerId,
    /// Fact table the analyser roots its join graph at.
    pub fact_table: String,
    /// Statement timeout for fragment execution.
    pub statement_timeout: Duration,
    /// Cardinality cap; fragments producing this many distinct values are
    /// tombstoned as `limit`.
    pub result_limit: Option<usize>,
    /// Active-job rows older than this are considered crashed.
    pub stale_after: Duration,
    /// Upper bound of one idle cleanup sweep.
    pub sweep_limit: usize,
    /// Variant enumeration bounds used during fragment expansion.
    pub variants: VariantConfig,
}

impl WorkerConfig {
    /// Config with the documented defaults.
    pub fn new(worker_id: WorkerId, fact_table: impl Into<String>) -> Self {
        Self {
            worker_id,
            fact_table: fact_table.into(),
            statement_timeout: Duration::from_secs(1800),
            result_limit: None,
            stale_after: Duration::from_secs(300),
            sweep_limit: 100,
            variants: VariantConfig::default(),
        }
    }
}

/// Non-blocking enqueue of an original query (the public write-path entry
/// point).
///
/// The datatype is validated against the store's representation and any
/// existing partition metadata before the queue is touched; values never
/// cross this boundary untagged.
pub async fn add_to_queue(
    store: &dyn CacheStore,
    sql: &str,
    partition_key: &str,
    datatype: Datatype,
    priority: i32,
) -> Result<EnqueueOutcome> {
    if !data_types::is_valid_identifier(partition_key) {
        return InvalidPartitionKeySnafu { partition_key }.fail();
    }
    if !store.backend_kind().supports(datatype) {
        return UnsupportedDatatypeSnafu {
            backend: store.backend_kind(),
            datatype,
        }
        .fail();
    }

    let mut repos = store.repositories().await;
    if let Some(meta) = repos
        .partitions()
        .get(partition_key)
        .await
        .map_err(|source| Error::Store { source })?
    {
        if meta.datatype != datatype {
            return DatatypeMismatchSnafu {
                partition_key,
                existing: meta.datatype,
                requested: datatype,
            }
            .fail();
        }
    }

    repos
        .queue()
        .push_original(sql, partition_key, datatype, priority)
        .await
        .map_err(|source| Error::Store { source })
}
