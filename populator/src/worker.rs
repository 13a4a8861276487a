//! The cooperative worker: one fragment build (or one expansion, or one
//! cleanup sweep) per tick.

use crate::dispatch::expand_original;
use crate::{Error, Result, WorkerConfig};
use data_types::{CacheStatus, FragmentQueueItem, ProcessOutcome, QueryLogStatus, WorkerId};
use pcache_store::executor::{ExecError, FetchOutcome, FragmentExecutor};
use pcache_store::interface::{CacheStore, Error as StoreError, RepoCollection};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Perform at most one unit of work:
///
/// 1. expand one original-queue item, if any;
/// 2. otherwise build one eligible fragment;
/// 3. otherwise sweep already-cached fragment-queue items.
pub async fn process_once(
    store: &dyn CacheStore,
    executor: &dyn FragmentExecutor,
    config: &WorkerConfig,
) -> Result<ProcessOutcome> {
    let mut repos = store.repositories().await;

    if let Some(original) = repos
        .queue()
        .pop_original()
        .await
        .map_err(store_err)?
    {
        expand_original(repos.as_mut(), &original, config).await?;
        return Ok(ProcessOutcome::Processed);
    }

    let item = match repos
        .queue()
        .pop_eligible_fragment()
        .await
        .map_err(store_err)?
    {
        Some(item) => item,
        None => return idle_sweep(repos.as_mut(), config).await,
    };
    drop(repos);

    run_item(store, executor, config, item).await
}

/// Build one claimed fragment item end to end.
///
/// Exposed separately from [`process_once`] so that tests can interleave
/// two workers over the same item.
pub async fn run_item(
    store: &dyn CacheStore,
    executor: &dyn FragmentExecutor,
    config: &WorkerConfig,
    item: FragmentQueueItem,
) -> Result<ProcessOutcome> {
    let mut repos = store.repositories().await;
    let pk = item.partition_key.as_str();
    let fp = &item.fingerprint;

    // Admission: the unique insert is what makes two racing workers
    // resolve to exactly one build.
    let admitted = repos
        .active_jobs()
        .try_admit(pk, fp, &config.worker_id)
        .await
        .map_err(store_err)?;
    if !admitted {
        repos
            .query_log()
            .upsert(pk, fp, &item.fragment_sql, QueryLogStatus::Skipped)
            .await
            .map_err(store_err)?;
        debug!(
            fingerprint = %fp,
            partition_key = pk,
            worker = %config.worker_id,
            "another worker is building this fragment",
        );
        return Ok(ProcessOutcome::Skipped);
    }

    // The fragment may have been built between our pop and the admission.
    if repos.entries().exists(pk, fp).await.map_err(store_err)? {
        repos
            .active_jobs()
            .release(pk, fp)
            .await
            .map_err(store_err)?;
        repos
            .queue()
            .remove_fragment(pk, fp)
            .await
            .map_err(store_err)?;
        repos
            .query_log()
            .upsert(pk, fp, &item.fragment_sql, QueryLogStatus::Skipped)
            .await
            .map_err(store_err)?;
        return Ok(ProcessOutcome::Skipped);
    }

    // Register the partition key on first use. A datatype conflict means
    // the fragment can never build; tombstone it.
    let registered = repos
        .partitions()
        .create_or_get(pk, item.datatype)
        .await;
    if let Err(StoreError::DatatypeMismatch { .. }) = &registered {
        conclude(repos.as_mut(), &item, CacheStatus::Failed).await?;
        return Ok(ProcessOutcome::Processed);
    }
    registered.map_err(store_err)?;

    let started = store.time_provider().now();
    let fetched = executor
        .fetch_values(
            &item.fragment_sql,
            item.datatype,
            config.result_limit,
            config.statement_timeout,
        )
        .await;

    let status = match fetched {
        Ok(FetchOutcome::Values(values)) => {
            store_values(repos.as_mut(), &item, &values).await?
        }
        Ok(FetchOutcome::LimitExceeded { limit }) => {
            warn!(
                fingerprint = %fp,
                partition_key = pk,
                limit,
                "fragment produced too many values",
            );
            CacheStatus::Limit
        }
        Err(ExecError::Timeout { timeout }) => {
            // Terminal: the tombstone keeps the queue from re-admitting
            // this fragment until an operator deletes it.
            warn!(
                fingerprint = %fp,
                partition_key = pk,
                timeout_secs = timeout.as_secs(),
                "fragment execution timed out",
            );
            CacheStatus::Timeout
        }
        Err(ExecError::Execution { message }) => {
            warn!(
                fingerprint = %fp,
                partition_key = pk,
                error = %message,
                "fragment execution failed",
            );
            CacheStatus::Failed
        }
    };

    if status != CacheStatus::Ok {
        conclude(repos.as_mut(), &item, status).await?;
    } else {
        finish_item(repos.as_mut(), &item, QueryLogStatus::Ok).await?;
    }

    let duration = store
        .time_provider()
        .now()
        .checked_duration_since(started)
        .unwrap_or_default();
    info!(
        fingerprint = %fp,
        partition_key = pk,
        status = %status,
        duration_ms = duration.as_millis() as u64,
        "fragment build finished",
    );
    Ok(ProcessOutcome::Processed)
}

/// Store fetched values. Bit stores grow their bound inside `put`, so the
/// only non-fatal failures left are representation mismatches, which
/// tombstone the fragment.
async fn store_values(
    repos: &mut dyn RepoCollection,
    item: &FragmentQueueItem,
    values: &[data_types::Value],
) -> Result<CacheStatus> {
    match repos
        .entries()
        .put(&item.partition_key, &item.fingerprint, values)
        .await
    {
        Ok(()) => Ok(CacheStatus::Ok),
        Err(StoreError::WrongDatatype { .. } | StoreError::DatatypeMismatch { .. }) => {
            Ok(CacheStatus::Failed)
        }
        // Store I/O failures leave the active job in place; stale-job
        // recovery re-admits the item once the store is reachable again.
        Err(e) => Err(store_err(e)),
    }
}

/// Tombstone + log + remove item + release job.
async fn conclude(
    repos: &mut dyn RepoCollection,
    item: &FragmentQueueItem,
    status: CacheStatus,
) -> Result<()> {
    let pk = item.partition_key.as_str();
    let fp = &item.fingerprint;
    repos
        .entries()
        .mark(pk, fp, status)
        .await
        .map_err(store_err)?;
    finish_item(repos, item, status.into()).await
}

async fn finish_item(
    repos: &mut dyn RepoCollection,
    item: &FragmentQueueItem,
    status: QueryLogStatus,
) -> Result<()> {
    let pk = item.partition_key.as_str();
    let fp = &item.fingerprint;
    repos
        .query_log()
        .upsert(pk, fp, &item.fragment_sql, status)
        .await
        .map_err(store_err)?;
    repos
        .queue()
        .remove_fragment(pk, fp)
        .await
        .map_err(store_err)?;
    repos
        .active_jobs()
        .release(pk, fp)
        .await
        .map_err(store_err)?;
    Ok(())
}

async fn idle_sweep(
    repos: &mut dyn RepoCollection,
    config: &WorkerConfig,
) -> Result<ProcessOutcome> {
    let removed = repos
        .queue()
        .sweep_cached(config.sweep_limit)
        .await
        .map_err(store_err)?;
    if removed.is_empty() {
        return Ok(ProcessOutcome::NoJobs);
    }

    for (pk, fp) in &removed {
        repos.query_log().touch(pk, fp).await.map_err(store_err)?;
    }
    debug!(removed = removed.len(), "swept already-cached queue items");
    Ok(ProcessOutcome::Cleanup)
}

/// Delete active-job rows older than `stale_after`; their queue items
/// become eligible again.
pub async fn recover_stale_jobs(
    store: &dyn CacheStore,
    stale_after: Duration,
) -> Result<usize> {
    let cutoff = (store.time_provider().now() - stale_after).timestamp_nanos();
    let mut repos = store.repositories().await;
    let removed = repos
        .active_jobs()
        .delete_stale(cutoff)
        .await
        .map_err(store_err)?;
    if removed > 0 {
        warn!(removed, "recovered stale fragment builds");
    }
    Ok(removed)
}

fn store_err(source: StoreError) -> Error {
    Error::Store { source }
}

/// Configuration of the worker pool driver.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Sleep between ticks when the queue is empty.
    pub poll_interval: Duration,
    /// Template for the per-worker config; worker ids get a suffix per
    /// worker index.
    pub worker: WorkerConfig,
}

/// Drive a pool of workers until `shutdown` fires. Worker errors are
/// logged and never abort the loop.
pub async fn run(
    store: Arc<dyn CacheStore>,
    executor: Arc<dyn FragmentExecutor>,
    config: MonitorConfig,
    shutdown: CancellationToken,
) {
    let mut handles = Vec::with_capacity(config.workers + 1);

    for index in 0..config.workers {
        let store = Arc::clone(&store);
        let executor = Arc::clone(&executor);
        let shutdown = shutdown.clone();
        let mut worker_config = config.worker.clone();
        worker_config.worker_id =
            WorkerId::new(format!("{}-{index}", config.worker.worker_id));
        let poll_interval = config.poll_interval;

        handles.push(tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                match process_once(store.as_ref(), executor.as_ref(), &worker_config).await {
                    Ok(ProcessOutcome::Processed | ProcessOutcome::Skipped) => {}
                    Ok(ProcessOutcome::NoJobs | ProcessOutcome::Cleanup) => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                    Err(e) => {
                        warn!(worker = %worker_config.worker_id, error = %e, "worker tick failed");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                }
            }
        }));
    }

    // Janitor: periodic stale-job recovery.
    {
        let store = Arc::clone(&store);
        let shutdown = shutdown.clone();
        let stale_after = config.worker.stale_after;
        handles.push(tokio::spawn(async move {
            let interval = stale_after / 2;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = recover_stale_jobs(store.as_ref(), stale_after).await {
                    warn!(error = %e, "stale-job recovery failed");
                }
            }
        }));
    }

    for handle in handles {
        handle.await.ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::add_to_queue;
    use data_types::{BackendKind, Datatype, EnqueueOutcome, Fingerprint, Value};
    use pcache_store::executor::MockExecutor;
    use pcache_store::mem::MemCacheStore;

    const PK: &str = "trip_id";
    const FRAGMENT: &str = "SELECT DISTINCT taxi_trips.trip_id FROM taxi_trips WHERE fare > 10";

    fn config() -> WorkerConfig {
        let mut config = WorkerConfig::new(WorkerId::new("w1"), "taxi_trips");
        config.statement_timeout = Duration::from_secs(30);
        config
    }

    fn ints(values: &[i32]) -> Vec<Value> {
        values.iter().copied().map(Value::Int32).collect()
    }

    async fn enqueue_fragment(store: &MemCacheStore, sql: &str) -> Fingerprint {
        let fp = fingerprint::fingerprint(sql).unwrap();
        let mut repos = store.repositories().await;
        repos
            .partitions()
            .create_or_get(PK, Datatype::Int32)
            .await
            .unwrap();
        repos
            .queue()
            .push_fragment(sql, &fp, PK, Datatype::Int32, 0)
            .await
            .unwrap();
        fp
    }

    #[tokio::test]
    async fn successful_build_stores_values_and_logs() {
        let store = MemCacheStore::new(BackendKind::Array);
        let executor = MockExecutor::new().with_response(FRAGMENT, ints(&[4, 2, 7]));
        let fp = enqueue_fragment(&store, FRAGMENT).await;

        let outcome = process_once(&store, &executor, &config()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);

        let mut repos = store.repositories().await;
        let set = repos.entries().get(PK, &fp).await.unwrap().unwrap();
        assert_eq!(set.values(), ints(&[2, 4, 7]));

        let row = repos.query_log().get(PK, &fp).await.unwrap().unwrap();
        assert_eq!(row.status, QueryLogStatus::Ok);

        // Queue item and active job are gone.
        assert_eq!(repos.queue().depths().await.unwrap().fragment, 0);
        assert!(repos.active_jobs().list().await.unwrap().is_empty());

        // Nothing left to do.
        let outcome = process_once(&store, &executor, &config()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::NoJobs);
    }

    #[tokio::test]
    async fn worker_collision_yields_one_build_one_skip() {
        let store = MemCacheStore::new(BackendKind::Array);
        let executor = MockExecutor::new().with_response(FRAGMENT, ints(&[1]));
        enqueue_fragment(&store, FRAGMENT).await;

        // Both workers take the same item off the queue before either has
        // admitted it.
        let mut repos_a = store.repositories().await;
        let item_a = repos_a.queue().pop_eligible_fragment().await.unwrap().unwrap();
        let mut repos_b = store.repositories().await;
        let item_b = repos_b.queue().pop_eligible_fragment().await.unwrap().unwrap();
        assert_eq!(item_a, item_b);
        drop(repos_a);
        drop(repos_b);

        let mut config_a = config();
        config_a.worker_id = WorkerId::new("worker-a");
        let mut config_b = config();
        config_b.worker_id = WorkerId::new("worker-b");

        let outcome_a = run_item(&store, &executor, &config_a, item_a).await.unwrap();
        let outcome_b = run_item(&store, &executor, &config_b, item_b).await.unwrap();

        let mut outcomes = vec![outcome_a, outcome_b];
        outcomes.sort_by_key(|o| format!("{o:?}"));
        assert_eq!(
            outcomes,
            vec![ProcessOutcome::Processed, ProcessOutcome::Skipped]
        );

        // Exactly one cache entry, exactly one execution, and a skipped
        // log row for the loser next to the winner's ok row.
        let mut repos = store.repositories().await;
        assert_eq!(repos.entries().list(PK).await.unwrap().len(), 1);
        assert_eq!(executor.calls().len(), 1);

        let rows = repos.query_log().list(PK).await.unwrap();
        let skipped = rows
            .iter()
            .filter(|r| r.status == QueryLogStatus::Skipped)
            .count();
        let ok = rows
            .iter()
            .filter(|r| r.status == QueryLogStatus::Ok)
            .count();
        assert_eq!((ok, skipped), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn statement_timeout_is_terminal() {
        let store = MemCacheStore::new(BackendKind::Array);
        let executor = MockExecutor::new()
            .with_default(ints(&[1]))
            .with_delay(Duration::from_secs(3600));
        let fp = enqueue_fragment(&store, FRAGMENT).await;

        let outcome = process_once(&store, &executor, &config()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);

        let mut repos = store.repositories().await;
        let row = repos.query_log().get(PK, &fp).await.unwrap().unwrap();
        assert_eq!(row.status, QueryLogStatus::Timeout);

        // Tombstone, not values.
        assert!(repos.entries().exists(PK, &fp).await.unwrap());
        assert_eq!(repos.entries().get(PK, &fp).await.unwrap(), None);
        drop(repos);

        // Re-enqueueing does not trigger a second execution: the tombstone
        // keeps the item ineligible until an operator deletes it.
        let mut repos = store.repositories().await;
        let outcome = repos
            .queue()
            .push_fragment(FRAGMENT, &fp, PK, Datatype::Int32, 0)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Inserted);
        drop(repos);

        let outcome = process_once(&store, &executor, &config()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Cleanup);
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn result_limit_tombstones_without_values() {
        let store = MemCacheStore::new(BackendKind::Array);
        let executor = MockExecutor::new().with_default(ints(&(0..150).collect::<Vec<_>>()));
        let fp = enqueue_fragment(&store, FRAGMENT).await;

        let mut config = config();
        config.result_limit = Some(100);
        let outcome = process_once(&store, &executor, &config).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);

        let mut repos = store.repositories().await;
        let row = repos.query_log().get(PK, &fp).await.unwrap().unwrap();
        assert_eq!(row.status, QueryLogStatus::Limit);
        assert_eq!(repos.entries().get(PK, &fp).await.unwrap(), None);
    }

    #[tokio::test]
    async fn execution_failure_tombstones_as_failed() {
        let store = MemCacheStore::new(BackendKind::Array);
        // No canned response: every execution fails.
        let executor = MockExecutor::new();
        let fp = enqueue_fragment(&store, FRAGMENT).await;

        let outcome = process_once(&store, &executor, &config()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);

        let mut repos = store.repositories().await;
        let row = repos.query_log().get(PK, &fp).await.unwrap().unwrap();
        assert_eq!(row.status, QueryLogStatus::Failed);
    }

    #[tokio::test]
    async fn expansion_then_builds() {
        let store = MemCacheStore::new(BackendKind::Array);
        let executor = MockExecutor::new().with_default(ints(&[1, 2]));

        let outcome = add_to_queue(
            &store,
            "SELECT trip_id FROM taxi_trips WHERE fare > 10 AND passengers = 2",
            PK,
            Datatype::Int32,
            0,
        )
        .await
        .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Inserted);

        // First tick expands, the next three build the 3 fragments.
        let outcome = process_once(&store, &executor, &config()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);
        let mut repos = store.repositories().await;
        assert_eq!(repos.queue().depths().await.unwrap().fragment, 3);
        drop(repos);

        for _ in 0..3 {
            let outcome = process_once(&store, &executor, &config()).await.unwrap();
            assert_eq!(outcome, ProcessOutcome::Processed);
        }
        let outcome = process_once(&store, &executor, &config()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::NoJobs);

        let mut repos = store.repositories().await;
        assert_eq!(repos.entries().list(PK).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unsupported_datatype_is_rejected_at_the_boundary() {
        let store = MemCacheStore::new(BackendKind::RoaringBit);
        let result = add_to_queue(&store, "SELECT 1", PK, Datatype::Text, 0).await;
        assert!(matches!(
            result,
            Err(Error::UnsupportedDatatype { .. })
        ));
    }

    #[tokio::test]
    async fn stale_jobs_free_their_queue_items() {
        use pcache_time::{MockProvider, Time};

        let time = Arc::new(MockProvider::new(Time::from_timestamp(0, 0)));
        let store = MemCacheStore::with_time_provider(
            BackendKind::Array,
            Arc::clone(&time) as Arc<dyn pcache_time::TimeProvider>,
        );
        let executor = MockExecutor::new().with_default(ints(&[1]));
        let fp = enqueue_fragment(&store, FRAGMENT).await;

        // A crashed worker left an active job behind.
        let mut repos = store.repositories().await;
        repos
            .active_jobs()
            .try_admit(PK, &fp, &WorkerId::new("crashed"))
            .await
            .unwrap();
        drop(repos);

        // Item is ineligible while the job is live.
        let outcome = process_once(&store, &executor, &config()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::NoJobs);

        // After stale_after elapses the janitor frees it.
        time.inc(Duration::from_secs(600));
        let removed = recover_stale_jobs(&store, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let outcome = process_once(&store, &executor, &config()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Processed);
    }
}
