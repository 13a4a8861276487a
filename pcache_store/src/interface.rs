//! Traits every cache store implements.
//!
//! A [`CacheStore`] hands out [`RepoCollection`]s giving access to five
//! repositories: partition metadata, cache entries, the two queues, active
//! jobs and the query log. All shared mutable state lives behind this seam
//! in the durable store; the process itself holds no cache singleton, so
//! any number of worker processes can cooperate.

use crate::sets::{SetError, ValueSet};
use async_trait::async_trait;
use data_types::{
    ActiveJob, BackendKind, CacheEntryInfo, CacheStatus, Datatype, EnqueueOutcome, Fingerprint,
    FragmentQueueItem, OriginalQueueItem, PartitionMeta, QueryLogRow, QueryLogStatus, WorkerId,
};
use pcache_time::TimeProvider;
use snafu::Snafu;
use std::fmt::Debug;
use std::sync::Arc;

/// Errors of the store seam.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("partition key {partition_key} is not registered"))]
    PartitionNotFound { partition_key: String },

    #[snafu(display(
        "partition key {partition_key} is registered as {existing}, got {requested}"
    ))]
    DatatypeMismatch {
        partition_key: String,
        existing: Datatype,
        requested: Datatype,
    },

    #[snafu(display("wrong datatype for this store: {source}"))]
    WrongDatatype { source: SetError },

    #[snafu(display("set representations diverged: {source}"))]
    SetMismatch { source: SetError },

    #[snafu(display("invalid name: {source}"))]
    Name { source: data_types::Error },

    #[snafu(display("store I/O error: {source}"))]
    Sqlx { source: sqlx::Error },

    #[snafu(display("store corruption: {message}"))]
    Corrupt { message: String },
}

/// Convenience result alias for the store seam.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A durable partition cache store.
#[async_trait]
pub trait CacheStore: Debug + Send + Sync {
    /// Create all tables/structures this store needs. Idempotent; fatal on
    /// failure, so callers propagate setup errors at startup.
    async fn setup(&self) -> Result<()>;

    /// The set representation this store keeps.
    fn backend_kind(&self) -> BackendKind;

    /// Time source used for `created_at` / `last_seen` bookkeeping.
    fn time_provider(&self) -> Arc<dyn TimeProvider>;

    /// Access the repositories.
    async fn repositories(&self) -> Box<dyn RepoCollection>;

    /// SQL subquery enumerating the intersection of the given fragments'
    /// sets, for lazy application. `None` when the sets do not live in the
    /// database the user's query runs against.
    fn lazy_subquery(&self, partition_key: &str, fingerprints: &[Fingerprint]) -> Option<String>;
}

/// One bundle of repository handles.
pub trait RepoCollection: Send + Sync + Debug {
    /// Partition metadata.
    fn partitions(&mut self) -> &mut dyn PartitionRepo;
    /// Cache entries.
    fn entries(&mut self) -> &mut dyn EntryRepo;
    /// Original and fragment queues.
    fn queue(&mut self) -> &mut dyn QueueRepo;
    /// Active-job records.
    fn active_jobs(&mut self) -> &mut dyn ActiveJobRepo;
    /// Query log.
    fn query_log(&mut self) -> &mut dyn QueryLogRepo;
}

/// Per-partition-key metadata.
#[async_trait]
pub trait PartitionRepo: Send + Sync {
    /// Register `partition_key` with `datatype`, or return the existing
    /// row. Registering an existing key with a different datatype fails.
    async fn create_or_get(
        &mut self,
        partition_key: &str,
        datatype: Datatype,
    ) -> Result<PartitionMeta>;

    /// Look up one partition key.
    async fn get(&mut self, partition_key: &str) -> Result<Option<PartitionMeta>>;

    /// All registered partition keys.
    async fn list(&mut self) -> Result<Vec<PartitionMeta>>;

    /// Grow the bit-store bound; never shrinks.
    async fn set_bitsize(&mut self, partition_key: &str, bitsize: u64) -> Result<()>;

    /// Record the distinct-count of the key over the fact table, for
    /// search-space-reduction stats.
    async fn set_total_keys(&mut self, partition_key: &str, total_keys: u64) -> Result<()>;
}

/// Cache entries: `(partition key, fingerprint) -> set of values`.
#[async_trait]
pub trait EntryRepo: Send + Sync {
    /// Idempotent overwrite with a complete value set; status becomes
    /// [`CacheStatus::Ok`] and the cardinality is recorded. A bit store
    /// that observes a value past its bound grows the bound, keeping every
    /// existing entry readable.
    async fn put(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
        values: &[data_types::Value],
    ) -> Result<()>;

    /// Store a no-values tombstone.
    async fn mark(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
        status: CacheStatus,
    ) -> Result<()>;

    /// The value set, if the entry exists with status `ok`.
    async fn get(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ValueSet>>;

    /// Whether an entry or tombstone exists.
    async fn exists(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<bool>;

    /// Intersect the sets of the given fingerprints. Fingerprints without
    /// an `ok` entry are ignored (an unknown set is a superset of
    /// anything); an empty input yields `None`, "no constraint".
    async fn intersect(
        &mut self,
        partition_key: &str,
        fingerprints: &[Fingerprint],
    ) -> Result<Option<ValueSet>>;

    /// Remove an entry or tombstone.
    async fn delete(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<()>;

    /// Summaries of all entries of one partition key.
    async fn list(&mut self, partition_key: &str) -> Result<Vec<CacheEntryInfo>>;
}

/// The two durable queues.
#[async_trait]
pub trait QueueRepo: Send + Sync {
    /// Non-blocking enqueue of an original query. De-duplicates on
    /// `(sql, partition key)` by bumping priority; fails fast with
    /// [`EnqueueOutcome::SkippedLocked`] when the queue is at its
    /// back-pressure cap.
    async fn push_original(
        &mut self,
        sql: &str,
        partition_key: &str,
        datatype: Datatype,
        priority: i32,
    ) -> Result<EnqueueOutcome>;

    /// Take one original query for fragment expansion; the row is removed.
    async fn pop_original(&mut self) -> Result<Option<OriginalQueueItem>>;

    /// Non-blocking enqueue of one fragment. De-duplicates on
    /// `(fingerprint, partition key)` by bumping priority; reports
    /// [`EnqueueOutcome::SkippedConcurrent`] when a worker is already
    /// building the fragment.
    async fn push_fragment(
        &mut self,
        fragment_sql: &str,
        fingerprint: &Fingerprint,
        partition_key: &str,
        datatype: Datatype,
        priority: i32,
    ) -> Result<EnqueueOutcome>;

    /// The best eligible fragment item: highest priority, then oldest,
    /// skipping items whose `(fingerprint, partition key)` already has a
    /// cache entry of any status or a live active job. The item stays in
    /// the queue; admission via [`ActiveJobRepo::try_admit`] is what
    /// establishes ownership.
    async fn pop_eligible_fragment(&mut self) -> Result<Option<FragmentQueueItem>>;

    /// Remove one fragment item after the build concluded.
    async fn remove_fragment(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<()>;

    /// Bounded idle sweep: delete up to `limit` fragment items whose
    /// `(fingerprint, partition key)` has become cached, returning the
    /// removed pairs so the caller can refresh their query-log rows.
    async fn sweep_cached(&mut self, limit: usize) -> Result<Vec<(String, Fingerprint)>>;

    /// Current depths of the original and fragment queues.
    async fn depths(&mut self) -> Result<QueueDepths>;
}

/// Queue depths, for back-pressure and operator status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepths {
    /// Items awaiting fragment expansion.
    pub original: usize,
    /// Fragment items awaiting a worker.
    pub fragment: usize,
}

/// Active-job records enforcing at most one in-flight build per
/// `(fingerprint, partition key)`.
#[async_trait]
pub trait ActiveJobRepo: Send + Sync {
    /// Unique insert. `false` means another worker already holds the job;
    /// exactly one of two racing workers sees `true`.
    async fn try_admit(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
        worker: &WorkerId,
    ) -> Result<bool>;

    /// Drop the record after the build concluded.
    async fn release(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<()>;

    /// Remove records older than the cutoff (crashed workers); their queue
    /// items become eligible again.
    async fn delete_stale(&mut self, cutoff_ns: i64) -> Result<usize>;

    /// All live records.
    async fn list(&mut self) -> Result<Vec<ActiveJob>>;
}

/// The query log, keyed on `(fingerprint, partition key, status)`: the
/// entry-status row records the build outcome, while `skipped`/`expanded`
/// rows coexist with it as bookkeeping.
#[async_trait]
pub trait QueryLogRepo: Send + Sync {
    /// Insert or overwrite the row of this status, stamping `last_seen`
    /// with now.
    async fn upsert(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
        sql: &str,
        status: QueryLogStatus,
    ) -> Result<()>;

    /// Refresh `last_seen` of every row of the pair.
    async fn touch(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<()>;

    /// The most relevant row of the pair: its entry-status row if one
    /// exists, otherwise the most recently seen row.
    async fn get(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<QueryLogRow>>;

    /// All rows of one partition key.
    async fn list(&mut self, partition_key: &str) -> Result<Vec<QueryLogRow>>;

    /// Remove every row of the pair.
    async fn delete(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<()>;
}
