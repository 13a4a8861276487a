//! Eviction keeps each partition key's cache bounded, deleting entries by
//! age or by set cardinality once a threshold is exceeded.
//!
//! One [`evict_once`] pass is side-effect-complete and idempotent; the
//! [`run`] scheduler merely drives passes at a configured frequency, so an
//! external scheduler (cron, a database job runner) can replace it.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{job_name, CacheEntryInfo, CacheStatus};
use pcache_store::interface::CacheStore;
use snafu::Snafu;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors of the eviction path.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("cache store failure: {source}"))]
    Store {
        source: pcache_store::interface::Error,
    },
}

/// Convenience result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which entries go first once the cache exceeds its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ArgEnum)]
pub enum EvictionPolicy {
    /// Delete entries with the smallest `last_seen` first.
    Oldest,
    /// Delete entries with the largest stored set first.
    Largest,
}

impl EvictionPolicy {
    /// Stable lower-case name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Oldest => "oldest",
            Self::Largest => "largest",
        }
    }
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oldest" => Ok(Self::Oldest),
            "largest" => Ok(Self::Largest),
            other => Err(format!("unknown eviction policy: {other}")),
        }
    }
}

/// Eviction parameters; clap-derivable for the CLI.
#[derive(Debug, Clone, clap::Parser)]
pub struct EvictionConfig {
    /// Enable the in-process eviction scheduler.
    #[clap(long = "--eviction-enabled", env = "PCACHE_EVICTION_ENABLED")]
    pub enabled: bool,

    /// Eviction strategy.
    #[clap(
        long = "--eviction-strategy",
        env = "PCACHE_EVICTION_STRATEGY",
        arg_enum,
        default_value = "oldest"
    )]
    pub policy: EvictionPolicy,

    /// Entries allowed per partition key before a pass deletes the excess.
    #[clap(
        long = "--eviction-threshold",
        env = "PCACHE_EVICTION_THRESHOLD",
        default_value = "1000"
    )]
    pub threshold: usize,

    /// Pause between scheduler passes.
    #[clap(
        long = "--eviction-frequency",
        env = "PCACHE_EVICTION_FREQUENCY",
        default_value = "15m",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub frequency: Duration,
}

/// Outcome of one eviction pass over one partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionOutcome {
    /// Entries deleted.
    pub removed: usize,
    /// Entries remaining after the pass.
    pub remaining: usize,
}

/// Run one eviction pass for `partition_key`.
///
/// `limit` tombstones encode a policy decision, not stale data, so they
/// are never candidates; operators delete them explicitly.
pub async fn evict_once(
    store: &dyn CacheStore,
    partition_key: &str,
    policy: EvictionPolicy,
    threshold: usize,
) -> Result<EvictionOutcome> {
    let mut repos = store.repositories().await;
    let entries = repos
        .entries()
        .list(partition_key)
        .await
        .map_err(|source| Error::Store { source })?;

    let total = entries.len();
    let mut candidates: Vec<CacheEntryInfo> = entries
        .into_iter()
        .filter(|e| e.status != CacheStatus::Limit)
        .collect();

    let excess = total.saturating_sub(threshold);
    let victims = excess.min(candidates.len());
    if victims == 0 {
        return Ok(EvictionOutcome {
            removed: 0,
            remaining: total,
        });
    }

    match policy {
        EvictionPolicy::Oldest => {
            candidates.sort_by_key(|e| e.last_seen_ns);
        }
        EvictionPolicy::Largest => {
            candidates.sort_by_key(|e| std::cmp::Reverse(e.cardinality));
        }
    }

    let mut removed = 0;
    for entry in candidates.into_iter().take(victims) {
        repos
            .entries()
            .delete(partition_key, &entry.fingerprint)
            .await
            .map_err(|source| Error::Store { source })?;
        repos
            .query_log()
            .delete(partition_key, &entry.fingerprint)
            .await
            .map_err(|source| Error::Store { source })?;
        removed += 1;
    }

    Ok(EvictionOutcome {
        removed,
        remaining: total - removed,
    })
}

/// Run passes for every registered partition key, logging each like a
/// scheduled job run.
pub async fn evict_all(
    store: &dyn CacheStore,
    policy: EvictionPolicy,
    threshold: usize,
    database: &str,
    prefix: Option<&str>,
) -> Result<usize> {
    let mut repos = store.repositories().await;
    let partitions = repos
        .partitions()
        .list()
        .await
        .map_err(|source| Error::Store { source })?;
    drop(repos);

    let job = job_name(policy.name(), database, prefix);
    let mut removed_total = 0;
    for meta in partitions {
        match evict_once(store, &meta.partition_key, policy, threshold).await {
            Ok(outcome) => {
                info!(
                    job_name = %job,
                    partition_key = %meta.partition_key,
                    removed_count = outcome.removed,
                    status = "ok",
                    "eviction pass finished",
                );
                removed_total += outcome.removed;
            }
            Err(e) => {
                warn!(
                    job_name = %job,
                    partition_key = %meta.partition_key,
                    removed_count = 0_usize,
                    status = "failed",
                    error = %e,
                    "eviction pass failed",
                );
            }
        }
    }
    Ok(removed_total)
}

/// Drive eviction at `config.frequency` until `shutdown` fires.
pub async fn run(
    store: Arc<dyn CacheStore>,
    config: EvictionConfig,
    database: String,
    prefix: Option<String>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.frequency) => {}
        }
        if let Err(e) = evict_all(
            store.as_ref(),
            config.policy,
            config.threshold,
            &database,
            prefix.as_deref(),
        )
        .await
        {
            warn!(error = %e, "eviction sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{BackendKind, Datatype, Fingerprint, Value};
    use pcache_store::mem::MemCacheStore;
    use pcache_time::{MockProvider, Time, TimeProvider};

    const PK: &str = "trip_id";

    fn fp(tag: u32) -> Fingerprint {
        Fingerprint::new(format!("{tag:0>32}"))
    }

    async fn seeded_store(time: Arc<MockProvider>) -> MemCacheStore {
        let store =
            MemCacheStore::with_time_provider(BackendKind::Array, time as Arc<dyn TimeProvider>);
        let mut repos = store.repositories().await;
        repos
            .partitions()
            .create_or_get(PK, Datatype::Int32)
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn oldest_pass_enforces_the_threshold() {
        let time = Arc::new(MockProvider::new(Time::from_timestamp(0, 0)));
        let store = seeded_store(Arc::clone(&time)).await;

        // Five entries, a second apart; ids 0 and 1 are the oldest.
        let mut repos = store.repositories().await;
        for i in 0..5 {
            repos
                .entries()
                .put(PK, &fp(i), &[Value::Int32(i as i32)])
                .await
                .unwrap();
            time.inc(Duration::from_secs(1));
        }
        drop(repos);

        let outcome = evict_once(&store, PK, EvictionPolicy::Oldest, 3)
            .await
            .unwrap();
        assert_eq!(outcome, EvictionOutcome { removed: 2, remaining: 3 });

        let mut repos = store.repositories().await;
        let remaining: Vec<_> = repos
            .entries()
            .list(PK)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.fingerprint)
            .collect();
        assert_eq!(remaining, vec![fp(2), fp(3), fp(4)]);
    }

    #[tokio::test]
    async fn largest_pass_deletes_by_cardinality() {
        let time = Arc::new(MockProvider::new(Time::from_timestamp(0, 0)));
        let store = seeded_store(Arc::clone(&time)).await;

        let mut repos = store.repositories().await;
        for (i, size) in [(0_u32, 10_i32), (1, 50), (2, 5), (3, 30)] {
            let values: Vec<Value> = (0..size).map(Value::Int32).collect();
            repos.entries().put(PK, &fp(i), &values).await.unwrap();
        }
        drop(repos);

        let outcome = evict_once(&store, PK, EvictionPolicy::Largest, 2)
            .await
            .unwrap();
        assert_eq!(outcome.removed, 2);

        // The two biggest sets (50 and 30 values) are gone.
        let mut repos = store.repositories().await;
        let remaining: Vec<_> = repos
            .entries()
            .list(PK)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.fingerprint)
            .collect();
        assert_eq!(remaining, vec![fp(0), fp(2)]);
    }

    #[tokio::test]
    async fn under_threshold_is_a_no_op() {
        let time = Arc::new(MockProvider::new(Time::from_timestamp(0, 0)));
        let store = seeded_store(time).await;

        let mut repos = store.repositories().await;
        repos
            .entries()
            .put(PK, &fp(0), &[Value::Int32(1)])
            .await
            .unwrap();
        drop(repos);

        let outcome = evict_once(&store, PK, EvictionPolicy::Oldest, 10)
            .await
            .unwrap();
        assert_eq!(outcome, EvictionOutcome { removed: 0, remaining: 1 });
    }

    #[tokio::test]
    async fn limit_tombstones_survive_eviction() {
        let time = Arc::new(MockProvider::new(Time::from_timestamp(0, 0)));
        let store = seeded_store(Arc::clone(&time)).await;

        let mut repos = store.repositories().await;
        repos
            .entries()
            .mark(PK, &fp(0), CacheStatus::Limit)
            .await
            .unwrap();
        time.inc(Duration::from_secs(1));
        for i in 1..4 {
            repos
                .entries()
                .put(PK, &fp(i), &[Value::Int32(i as i32)])
                .await
                .unwrap();
            time.inc(Duration::from_secs(1));
        }
        drop(repos);

        // Threshold 2 with 4 entries: the limit tombstone is the oldest
        // row but must survive; the two oldest regular entries go.
        let outcome = evict_once(&store, PK, EvictionPolicy::Oldest, 2)
            .await
            .unwrap();
        assert_eq!(outcome.removed, 2);

        let mut repos = store.repositories().await;
        let statuses: Vec<_> = repos
            .entries()
            .list(PK)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.fingerprint, e.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (fp(0), CacheStatus::Limit),
                (fp(3), CacheStatus::Ok),
            ]
        );
    }

    #[tokio::test]
    async fn evict_all_covers_every_partition() {
        let time = Arc::new(MockProvider::new(Time::from_timestamp(0, 0)));
        let store = seeded_store(Arc::clone(&time)).await;

        let mut repos = store.repositories().await;
        repos
            .partitions()
            .create_or_get("other_key", Datatype::Int32)
            .await
            .unwrap();
        for i in 0..3 {
            repos
                .entries()
                .put(PK, &fp(i), &[Value::Int32(1)])
                .await
                .unwrap();
            repos
                .entries()
                .put("other_key", &fp(100 + i), &[Value::Int32(1)])
                .await
                .unwrap();
            time.inc(Duration::from_secs(1));
        }
        drop(repos);

        let removed = evict_all(&store, EvictionPolicy::Oldest, 1, "ssb", Some("pcache"))
            .await
            .unwrap();
        assert_eq!(removed, 4);
    }
}
