//! In-memory [`CacheStore`] used by tests and single-process deployments.

use crate::interface::{
    ActiveJobRepo, CacheStore, DatatypeMismatchSnafu, EntryRepo, Error, PartitionNotFoundSnafu,
    PartitionRepo, QueryLogRepo, QueueDepths, QueueRepo, RepoCollection, Result,
};
use crate::sets::{intersect_all, ValueSet};
use async_trait::async_trait;
use data_types::{
    ActiveJob, BackendKind, CacheEntryInfo, CacheStatus, Datatype, EnqueueOutcome, Fingerprint,
    FragmentQueueItem, OriginalQueueItem, PartitionMeta, QueryLogRow, QueryLogStatus, Value,
    WorkerId,
};
use parking_lot::Mutex;
use pcache_time::{SystemProvider, TimeProvider};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Bit-store bound applied when a partition key is first registered.
pub const DEFAULT_BITSIZE: u64 = 1_000_000;

/// Default queue back-pressure cap.
pub const DEFAULT_QUEUE_CAP: usize = 10_000;

#[derive(Debug)]
struct MemEntry {
    set: Option<ValueSet>,
    status: CacheStatus,
    created_at_ns: i64,
    last_seen_ns: i64,
    cardinality: u64,
}

#[derive(Debug, Default)]
struct MemState {
    partitions: Vec<PartitionMeta>,
    entries: BTreeMap<(String, Fingerprint), MemEntry>,
    original_queue: Vec<OriginalQueueItem>,
    fragment_queue: Vec<FragmentQueueItem>,
    active_jobs: Vec<ActiveJob>,
    query_log: Vec<QueryLogRow>,
    next_id: i64,
}

impl MemState {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn partition(&self, partition_key: &str) -> Option<&PartitionMeta> {
        self.partitions
            .iter()
            .find(|p| p.partition_key == partition_key)
    }

    fn partition_mut(&mut self, partition_key: &str) -> Option<&mut PartitionMeta> {
        self.partitions
            .iter_mut()
            .find(|p| p.partition_key == partition_key)
    }
}

/// In-memory store; all state lives behind one mutex, so readers see
/// entries atomically.
#[derive(Debug)]
pub struct MemCacheStore {
    state: Arc<Mutex<MemState>>,
    kind: BackendKind,
    time_provider: Arc<dyn TimeProvider>,
    queue_cap: usize,
    default_bitsize: u64,
}

impl MemCacheStore {
    /// Create a store with the given set representation and wall-clock
    /// time.
    pub fn new(kind: BackendKind) -> Self {
        Self::with_time_provider(kind, Arc::new(SystemProvider::new()))
    }

    /// Create a store with an explicit time source (tests).
    pub fn with_time_provider(kind: BackendKind, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemState::default())),
            kind,
            time_provider,
            queue_cap: DEFAULT_QUEUE_CAP,
            default_bitsize: DEFAULT_BITSIZE,
        }
    }

    /// Override the queue back-pressure cap.
    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.queue_cap = cap;
        self
    }

    /// Override the initial bit-store bound.
    pub fn with_default_bitsize(mut self, bitsize: u64) -> Self {
        self.default_bitsize = bitsize;
        self
    }
}

#[async_trait]
impl CacheStore for MemCacheStore {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    fn time_provider(&self) -> Arc<dyn TimeProvider> {
        Arc::clone(&self.time_provider)
    }

    async fn repositories(&self) -> Box<dyn RepoCollection> {
        Box::new(MemRepos {
            state: Arc::clone(&self.state),
            kind: self.kind,
            time_provider: Arc::clone(&self.time_provider),
            queue_cap: self.queue_cap,
            default_bitsize: self.default_bitsize,
        })
    }

    fn lazy_subquery(&self, _partition_key: &str, _fingerprints: &[Fingerprint]) -> Option<String> {
        // Sets live in process memory, not in the queried database.
        None
    }
}

#[derive(Debug)]
struct MemRepos {
    state: Arc<Mutex<MemState>>,
    kind: BackendKind,
    time_provider: Arc<dyn TimeProvider>,
    queue_cap: usize,
    default_bitsize: u64,
}

impl MemRepos {
    fn now_ns(&self) -> i64 {
        self.time_provider.now().timestamp_nanos()
    }
}

impl RepoCollection for MemRepos {
    fn partitions(&mut self) -> &mut dyn PartitionRepo {
        self
    }

    fn entries(&mut self) -> &mut dyn EntryRepo {
        self
    }

    fn queue(&mut self) -> &mut dyn QueueRepo {
        self
    }

    fn active_jobs(&mut self) -> &mut dyn ActiveJobRepo {
        self
    }

    fn query_log(&mut self) -> &mut dyn QueryLogRepo {
        self
    }
}

#[async_trait]
impl PartitionRepo for MemRepos {
    async fn create_or_get(
        &mut self,
        partition_key: &str,
        datatype: Datatype,
    ) -> Result<PartitionMeta> {
        let now = self.now_ns();
        let mut state = self.state.lock();

        if let Some(existing) = state.partition(partition_key) {
            if existing.datatype != datatype {
                return DatatypeMismatchSnafu {
                    partition_key,
                    existing: existing.datatype,
                    requested: datatype,
                }
                .fail();
            }
            return Ok(existing.clone());
        }

        let meta = PartitionMeta {
            partition_key: partition_key.to_string(),
            datatype,
            bitsize: self.kind.needs_bitsize().then_some(self.default_bitsize),
            total_keys: None,
            created_at_ns: now,
        };
        state.partitions.push(meta.clone());
        Ok(meta)
    }

    async fn get(&mut self, partition_key: &str) -> Result<Option<PartitionMeta>> {
        Ok(self.state.lock().partition(partition_key).cloned())
    }

    async fn list(&mut self) -> Result<Vec<PartitionMeta>> {
        Ok(self.state.lock().partitions.clone())
    }

    async fn set_bitsize(&mut self, partition_key: &str, bitsize: u64) -> Result<()> {
        let mut state = self.state.lock();
        let meta = state
            .partition_mut(partition_key)
            .ok_or_else(|| PartitionNotFoundSnafu { partition_key }.build())?;
        // Monotone growth only.
        meta.bitsize = Some(meta.bitsize.unwrap_or(0).max(bitsize));
        Ok(())
    }

    async fn set_total_keys(&mut self, partition_key: &str, total_keys: u64) -> Result<()> {
        let mut state = self.state.lock();
        let meta = state
            .partition_mut(partition_key)
            .ok_or_else(|| PartitionNotFoundSnafu { partition_key }.build())?;
        meta.total_keys = Some(total_keys);
        Ok(())
    }
}

#[async_trait]
impl EntryRepo for MemRepos {
    async fn put(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
        values: &[Value],
    ) -> Result<()> {
        let now = self.now_ns();
        let mut state = self.state.lock();

        let meta = state
            .partition(partition_key)
            .ok_or_else(|| PartitionNotFoundSnafu { partition_key }.build())?
            .clone();

        if let Some(offending) = values.iter().find(|v| v.datatype() != meta.datatype) {
            return DatatypeMismatchSnafu {
                partition_key,
                existing: meta.datatype,
                requested: offending.datatype(),
            }
            .fail();
        }

        let set = ValueSet::from_values(self.kind, meta.datatype, values)
            .map_err(|source| Error::WrongDatatype { source })?;

        // A value past the bit bound grows the bound; existing entries keep
        // their own bits and stay readable.
        if self.kind.needs_bitsize() {
            if let Some(max) = set.max_index() {
                let bitsize = meta.bitsize.unwrap_or(0);
                if max >= bitsize {
                    state
                        .partition_mut(partition_key)
                        .expect("partition row just read")
                        .bitsize = Some(max + 1);
                }
            }
        }

        let cardinality = set.cardinality();
        state.entries.insert(
            (partition_key.to_string(), fingerprint.clone()),
            MemEntry {
                set: Some(set),
                status: CacheStatus::Ok,
                created_at_ns: now,
                last_seen_ns: now,
                cardinality,
            },
        );
        Ok(())
    }

    async fn mark(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
        status: CacheStatus,
    ) -> Result<()> {
        let now = self.now_ns();
        let mut state = self.state.lock();
        state.entries.insert(
            (partition_key.to_string(), fingerprint.clone()),
            MemEntry {
                set: None,
                status,
                created_at_ns: now,
                last_seen_ns: now,
                cardinality: 0,
            },
        );
        Ok(())
    }

    async fn get(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ValueSet>> {
        let state = self.state.lock();
        Ok(state
            .entries
            .get(&(partition_key.to_string(), fingerprint.clone()))
            .filter(|e| e.status.is_ok())
            .and_then(|e| e.set.clone()))
    }

    async fn exists(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<bool> {
        let state = self.state.lock();
        Ok(state
            .entries
            .contains_key(&(partition_key.to_string(), fingerprint.clone())))
    }

    async fn intersect(
        &mut self,
        partition_key: &str,
        fingerprints: &[Fingerprint],
    ) -> Result<Option<ValueSet>> {
        let state = self.state.lock();
        let sets: Vec<ValueSet> = fingerprints
            .iter()
            .filter_map(|fp| {
                state
                    .entries
                    .get(&(partition_key.to_string(), fp.clone()))
                    .filter(|e| e.status.is_ok())
                    .and_then(|e| e.set.clone())
            })
            .collect();
        intersect_all(sets).map_err(|source| Error::SetMismatch { source })
    }

    async fn delete(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<()> {
        let mut state = self.state.lock();
        state
            .entries
            .remove(&(partition_key.to_string(), fingerprint.clone()));
        Ok(())
    }

    async fn list(&mut self, partition_key: &str) -> Result<Vec<CacheEntryInfo>> {
        let state = self.state.lock();
        Ok(state
            .entries
            .iter()
            .filter(|((pk, _), _)| pk == partition_key)
            .map(|((_, fp), entry)| CacheEntryInfo {
                fingerprint: fp.clone(),
                cardinality: entry.cardinality,
                last_seen_ns: entry.last_seen_ns,
                status: entry.status,
            })
            .collect())
    }
}

#[async_trait]
impl QueueRepo for MemRepos {
    async fn push_original(
        &mut self,
        sql: &str,
        partition_key: &str,
        datatype: Datatype,
        priority: i32,
    ) -> Result<EnqueueOutcome> {
        let now = self.now_ns();
        let mut state = self.state.lock();

        if let Some(existing) = state
            .original_queue
            .iter_mut()
            .find(|item| item.sql == sql && item.partition_key == partition_key)
        {
            existing.priority += 1;
            return Ok(EnqueueOutcome::Updated);
        }

        if state.original_queue.len() >= self.queue_cap {
            return Ok(EnqueueOutcome::SkippedLocked);
        }

        let id = state.id();
        state.original_queue.push(OriginalQueueItem {
            id,
            sql: sql.to_string(),
            partition_key: partition_key.to_string(),
            datatype,
            priority,
            created_at_ns: now,
        });
        Ok(EnqueueOutcome::Inserted)
    }

    async fn pop_original(&mut self) -> Result<Option<OriginalQueueItem>> {
        let mut state = self.state.lock();
        let best = state
            .original_queue
            .iter()
            .enumerate()
            .min_by_key(|(_, item)| (-item.priority, item.created_at_ns, item.id))
            .map(|(i, _)| i);
        Ok(best.map(|i| state.original_queue.remove(i)))
    }

    async fn push_fragment(
        &mut self,
        fragment_sql: &str,
        fingerprint: &Fingerprint,
        partition_key: &str,
        datatype: Datatype,
        priority: i32,
    ) -> Result<EnqueueOutcome> {
        let now = self.now_ns();
        let mut state = self.state.lock();

        let in_flight = state
            .active_jobs
            .iter()
            .any(|j| j.fingerprint == *fingerprint && j.partition_key == partition_key);
        if in_flight {
            return Ok(EnqueueOutcome::SkippedConcurrent);
        }

        if let Some(existing) = state.fragment_queue.iter_mut().find(|item| {
            item.fingerprint == *fingerprint && item.partition_key == partition_key
        }) {
            existing.priority += 1;
            return Ok(EnqueueOutcome::Updated);
        }

        if state.fragment_queue.len() >= self.queue_cap {
            return Ok(EnqueueOutcome::SkippedLocked);
        }

        let id = state.id();
        state.fragment_queue.push(FragmentQueueItem {
            id,
            fingerprint: fingerprint.clone(),
            partition_key: partition_key.to_string(),
            fragment_sql: fragment_sql.to_string(),
            datatype,
            priority,
            created_at_ns: now,
        });
        Ok(EnqueueOutcome::Inserted)
    }

    async fn pop_eligible_fragment(&mut self) -> Result<Option<FragmentQueueItem>> {
        let state = self.state.lock();
        let eligible = state.fragment_queue.iter().filter(|item| {
            let key = (item.partition_key.clone(), item.fingerprint.clone());
            let cached = state.entries.contains_key(&key);
            let building = state
                .active_jobs
                .iter()
                .any(|j| j.fingerprint == item.fingerprint && j.partition_key == item.partition_key);
            !cached && !building
        });
        Ok(eligible
            .min_by_key(|item| (-item.priority, item.created_at_ns, item.id))
            .cloned())
    }

    async fn remove_fragment(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.fragment_queue.retain(|item| {
            !(item.fingerprint == *fingerprint && item.partition_key == partition_key)
        });
        Ok(())
    }

    async fn sweep_cached(&mut self, limit: usize) -> Result<Vec<(String, Fingerprint)>> {
        let mut state = self.state.lock();
        let mut removed = Vec::new();

        let cached: Vec<usize> = state
            .fragment_queue
            .iter()
            .enumerate()
            .filter(|(_, item)| {
                state
                    .entries
                    .contains_key(&(item.partition_key.clone(), item.fingerprint.clone()))
            })
            .map(|(i, _)| i)
            .take(limit)
            .collect();

        for i in cached.into_iter().rev() {
            let item = state.fragment_queue.remove(i);
            removed.push((item.partition_key, item.fingerprint));
        }
        removed.reverse();
        Ok(removed)
    }

    async fn depths(&mut self) -> Result<QueueDepths> {
        let state = self.state.lock();
        Ok(QueueDepths {
            original: state.original_queue.len(),
            fragment: state.fragment_queue.len(),
        })
    }
}

#[async_trait]
impl ActiveJobRepo for MemRepos {
    async fn try_admit(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
        worker: &WorkerId,
    ) -> Result<bool> {
        let now = self.now_ns();
        let mut state = self.state.lock();

        let held = state
            .active_jobs
            .iter()
            .any(|j| j.fingerprint == *fingerprint && j.partition_key == partition_key);
        if held {
            return Ok(false);
        }

        state.active_jobs.push(ActiveJob {
            fingerprint: fingerprint.clone(),
            partition_key: partition_key.to_string(),
            worker_id: worker.clone(),
            started_at_ns: now,
        });
        Ok(true)
    }

    async fn release(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<()> {
        let mut state = self.state.lock();
        state
            .active_jobs
            .retain(|j| !(j.fingerprint == *fingerprint && j.partition_key == partition_key));
        Ok(())
    }

    async fn delete_stale(&mut self, cutoff_ns: i64) -> Result<usize> {
        let mut state = self.state.lock();
        let before = state.active_jobs.len();
        state.active_jobs.retain(|j| j.started_at_ns >= cutoff_ns);
        Ok(before - state.active_jobs.len())
    }

    async fn list(&mut self) -> Result<Vec<ActiveJob>> {
        Ok(self.state.lock().active_jobs.clone())
    }
}

#[async_trait]
impl QueryLogRepo for MemRepos {
    async fn upsert(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
        sql: &str,
        status: QueryLogStatus,
    ) -> Result<()> {
        let now = self.now_ns();
        let mut state = self.state.lock();
        state.query_log.retain(|r| {
            !(r.fingerprint == *fingerprint
                && r.partition_key == partition_key
                && r.status == status)
        });
        state.query_log.push(QueryLogRow {
            fingerprint: fingerprint.clone(),
            partition_key: partition_key.to_string(),
            sql: sql.to_string(),
            status,
            last_seen_ns: now,
        });
        Ok(())
    }

    async fn touch(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<()> {
        let now = self.now_ns();
        let mut state = self.state.lock();
        for row in state
            .query_log
            .iter_mut()
            .filter(|r| r.fingerprint == *fingerprint && r.partition_key == partition_key)
        {
            row.last_seen_ns = now;
        }
        Ok(())
    }

    async fn get(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<QueryLogRow>> {
        let state = self.state.lock();
        let rows = state
            .query_log
            .iter()
            .filter(|r| r.fingerprint == *fingerprint && r.partition_key == partition_key);

        // Prefer the build-outcome row over skipped/expanded bookkeeping.
        let mut best: Option<&QueryLogRow> = None;
        for row in rows {
            best = Some(match best {
                None => row,
                Some(current) => {
                    let row_entry = row.status.is_entry_status();
                    let current_entry = current.status.is_entry_status();
                    if (row_entry, row.last_seen_ns) > (current_entry, current.last_seen_ns) {
                        row
                    } else {
                        current
                    }
                }
            });
        }
        Ok(best.cloned())
    }

    async fn list(&mut self, partition_key: &str) -> Result<Vec<QueryLogRow>> {
        let state = self.state.lock();
        Ok(state
            .query_log
            .iter()
            .filter(|r| r.partition_key == partition_key)
            .cloned()
            .collect())
    }

    async fn delete(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<()> {
        let mut state = self.state.lock();
        state
            .query_log
            .retain(|r| !(r.fingerprint == *fingerprint && r.partition_key == partition_key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pcache_time::{MockProvider, Time};

    const PK: &str = "lo_custkey";

    fn fp(tag: &str) -> Fingerprint {
        Fingerprint::new(format!("{tag:0>32}"))
    }

    fn ints(values: &[i32]) -> Vec<Value> {
        values.iter().copied().map(Value::Int32).collect()
    }

    async fn array_store() -> (MemCacheStore, Box<dyn RepoCollection>) {
        let store = MemCacheStore::new(BackendKind::Array);
        let mut repos = store.repositories().await;
        repos
            .partitions()
            .create_or_get(PK, Datatype::Int32)
            .await
            .unwrap();
        (store, repos)
    }

    #[tokio::test]
    async fn put_is_idempotent() {
        let (_store, mut repos) = array_store().await;
        let h = fp("a");

        repos.entries().put(PK, &h, &ints(&[1, 2, 3])).await.unwrap();
        repos.entries().put(PK, &h, &ints(&[1, 2, 3])).await.unwrap();

        let set = repos.entries().get(PK, &h).await.unwrap().unwrap();
        assert_eq!(set.values(), ints(&[1, 2, 3]));
        assert_eq!(repos.entries().list(PK).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn put_overwrites_atomically() {
        let (_store, mut repos) = array_store().await;
        let h = fp("a");

        repos.entries().put(PK, &h, &ints(&[1, 2])).await.unwrap();
        repos.entries().put(PK, &h, &ints(&[7])).await.unwrap();

        let set = repos.entries().get(PK, &h).await.unwrap().unwrap();
        assert_eq!(set.values(), ints(&[7]));
    }

    #[tokio::test]
    async fn tombstones_exist_but_return_no_values() {
        let (_store, mut repos) = array_store().await;
        let h = fp("t");

        repos
            .entries()
            .mark(PK, &h, CacheStatus::Timeout)
            .await
            .unwrap();

        assert!(repos.entries().exists(PK, &h).await.unwrap());
        assert_eq!(repos.entries().get(PK, &h).await.unwrap(), None);

        let infos = repos.entries().list(PK).await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].status, CacheStatus::Timeout);
        assert_eq!(infos[0].cardinality, 0);
    }

    #[tokio::test]
    async fn put_requires_registered_partition() {
        let store = MemCacheStore::new(BackendKind::Array);
        let mut repos = store.repositories().await;
        assert_matches!(
            repos.entries().put("unknown", &fp("a"), &ints(&[1])).await,
            Err(Error::PartitionNotFound { .. })
        );
    }

    #[tokio::test]
    async fn put_enforces_the_declared_datatype() {
        let (_store, mut repos) = array_store().await;
        assert_matches!(
            repos
                .entries()
                .put(PK, &fp("a"), &[Value::Text("oops".into())])
                .await,
            Err(Error::DatatypeMismatch { .. })
        );
    }

    #[tokio::test]
    async fn registering_a_key_twice_with_another_datatype_fails() {
        let (_store, mut repos) = array_store().await;
        assert_matches!(
            repos.partitions().create_or_get(PK, Datatype::Text).await,
            Err(Error::DatatypeMismatch { .. })
        );
    }

    #[tokio::test]
    async fn bit_store_grows_its_bound_monotonically() {
        let store = MemCacheStore::new(BackendKind::Bit).with_default_bitsize(1000);
        let mut repos = store.repositories().await;
        repos
            .partitions()
            .create_or_get(PK, Datatype::Int32)
            .await
            .unwrap();

        let small = fp("a");
        repos.entries().put(PK, &small, &ints(&[3, 7])).await.unwrap();

        // A value past the bound grows it to max(value) + 1.
        let big = fp("b");
        repos
            .entries()
            .put(PK, &big, &ints(&[3, 7, 1200]))
            .await
            .unwrap();

        let meta = repos.partitions().get(PK).await.unwrap().unwrap();
        assert_eq!(meta.bitsize, Some(1201));

        // Existing entries stay readable with the same semantics.
        let set = repos.entries().get(PK, &small).await.unwrap().unwrap();
        assert_eq!(set.values(), ints(&[3, 7]));
        let set = repos.entries().get(PK, &big).await.unwrap().unwrap();
        assert_eq!(set.values(), ints(&[3, 7, 1200]));
    }

    #[tokio::test]
    async fn bitsize_never_shrinks() {
        let store = MemCacheStore::new(BackendKind::Bit).with_default_bitsize(1000);
        let mut repos = store.repositories().await;
        repos
            .partitions()
            .create_or_get(PK, Datatype::Int32)
            .await
            .unwrap();

        repos.partitions().set_bitsize(PK, 500).await.unwrap();
        let meta = repos.partitions().get(PK).await.unwrap().unwrap();
        assert_eq!(meta.bitsize, Some(1000));
    }

    #[tokio::test]
    async fn intersect_identities() {
        let (_store, mut repos) = array_store().await;
        let a = fp("a");
        let b = fp("b");
        repos.entries().put(PK, &a, &ints(&[1, 2, 3])).await.unwrap();
        repos.entries().put(PK, &b, &ints(&[2, 3, 4])).await.unwrap();

        // Empty input: no constraint.
        assert_eq!(repos.entries().intersect(PK, &[]).await.unwrap(), None);

        // Single input: same as get.
        let single = repos
            .entries()
            .intersect(PK, &[a.clone()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(single, repos.entries().get(PK, &a).await.unwrap().unwrap());

        // Two inputs: the intersection.
        let both = repos
            .entries()
            .intersect(PK, &[a.clone(), b.clone()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(both.values(), ints(&[2, 3]));

        // Tombstoned or missing members are ignored.
        let t = fp("t");
        repos.entries().mark(PK, &t, CacheStatus::Limit).await.unwrap();
        let with_tombstone = repos
            .entries()
            .intersect(PK, &[a, b, t, fp("missing")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(with_tombstone.values(), ints(&[2, 3]));
    }

    #[tokio::test]
    async fn fragment_queue_deduplicates_and_bumps_priority() {
        let (_store, mut repos) = array_store().await;
        let h = fp("a");

        let outcome = repos
            .queue()
            .push_fragment("SELECT 1", &h, PK, Datatype::Int32, 0)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Inserted);

        let outcome = repos
            .queue()
            .push_fragment("SELECT 1", &h, PK, Datatype::Int32, 0)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Updated);

        let item = repos.queue().pop_eligible_fragment().await.unwrap().unwrap();
        assert_eq!(item.priority, 1);
        assert_eq!(repos.queue().depths().await.unwrap().fragment, 1);
    }

    #[tokio::test]
    async fn queue_cap_fails_fast() {
        let store = MemCacheStore::new(BackendKind::Array).with_queue_cap(1);
        let mut repos = store.repositories().await;
        repos
            .partitions()
            .create_or_get(PK, Datatype::Int32)
            .await
            .unwrap();

        repos
            .queue()
            .push_fragment("SELECT 1", &fp("a"), PK, Datatype::Int32, 0)
            .await
            .unwrap();
        let outcome = repos
            .queue()
            .push_fragment("SELECT 2", &fp("b"), PK, Datatype::Int32, 0)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::SkippedLocked);
    }

    #[tokio::test]
    async fn enqueue_while_building_is_skipped_concurrent() {
        let (_store, mut repos) = array_store().await;
        let h = fp("a");
        let worker = WorkerId::new("w1");

        assert!(repos.active_jobs().try_admit(PK, &h, &worker).await.unwrap());
        let outcome = repos
            .queue()
            .push_fragment("SELECT 1", &h, PK, Datatype::Int32, 0)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::SkippedConcurrent);
    }

    #[tokio::test]
    async fn pop_prefers_priority_then_age() {
        let (_store, mut repos) = array_store().await;

        repos
            .queue()
            .push_fragment("SELECT 1", &fp("a"), PK, Datatype::Int32, 0)
            .await
            .unwrap();
        repos
            .queue()
            .push_fragment("SELECT 2", &fp("b"), PK, Datatype::Int32, 5)
            .await
            .unwrap();

        let item = repos.queue().pop_eligible_fragment().await.unwrap().unwrap();
        assert_eq!(item.fingerprint, fp("b"));
    }

    #[tokio::test]
    async fn pop_skips_cached_and_building_fragments() {
        let (_store, mut repos) = array_store().await;
        let cached = fp("a");
        let tombstoned = fp("b");
        let building = fp("c");
        let free = fp("d");

        for (h, sql) in [
            (&cached, "SELECT a"),
            (&tombstoned, "SELECT b"),
            (&building, "SELECT c"),
            (&free, "SELECT d"),
        ] {
            repos
                .queue()
                .push_fragment(sql, h, PK, Datatype::Int32, 0)
                .await
                .unwrap();
        }

        repos.entries().put(PK, &cached, &ints(&[1])).await.unwrap();
        repos
            .entries()
            .mark(PK, &tombstoned, CacheStatus::Timeout)
            .await
            .unwrap();
        repos
            .active_jobs()
            .try_admit(PK, &building, &WorkerId::new("w1"))
            .await
            .unwrap();

        let item = repos.queue().pop_eligible_fragment().await.unwrap().unwrap();
        assert_eq!(item.fingerprint, free);
    }

    #[tokio::test]
    async fn sweep_removes_cached_queue_items() {
        let (_store, mut repos) = array_store().await;
        let cached = fp("a");
        let pending = fp("b");

        repos
            .queue()
            .push_fragment("SELECT a", &cached, PK, Datatype::Int32, 0)
            .await
            .unwrap();
        repos
            .queue()
            .push_fragment("SELECT b", &pending, PK, Datatype::Int32, 0)
            .await
            .unwrap();
        repos.entries().put(PK, &cached, &ints(&[1])).await.unwrap();

        let removed = repos.queue().sweep_cached(100).await.unwrap();
        assert_eq!(removed, vec![(PK.to_string(), cached)]);
        assert_eq!(repos.queue().depths().await.unwrap().fragment, 1);
    }

    #[tokio::test]
    async fn admission_is_exclusive() {
        let (_store, mut repos) = array_store().await;
        let h = fp("a");

        assert!(repos
            .active_jobs()
            .try_admit(PK, &h, &WorkerId::new("w1"))
            .await
            .unwrap());
        assert!(!repos
            .active_jobs()
            .try_admit(PK, &h, &WorkerId::new("w2"))
            .await
            .unwrap());

        repos.active_jobs().release(PK, &h).await.unwrap();
        assert!(repos
            .active_jobs()
            .try_admit(PK, &h, &WorkerId::new("w2"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stale_jobs_are_recovered() {
        let time = Arc::new(MockProvider::new(Time::from_timestamp(1000, 0)));
        let store =
            MemCacheStore::with_time_provider(BackendKind::Array, Arc::<MockProvider>::clone(&time));
        let mut repos = store.repositories().await;
        repos
            .partitions()
            .create_or_get(PK, Datatype::Int32)
            .await
            .unwrap();

        repos
            .active_jobs()
            .try_admit(PK, &fp("a"), &WorkerId::new("w1"))
            .await
            .unwrap();
        time.inc(std::time::Duration::from_secs(600));
        repos
            .active_jobs()
            .try_admit(PK, &fp("b"), &WorkerId::new("w1"))
            .await
            .unwrap();

        let cutoff = Time::from_timestamp(1300, 0).timestamp_nanos();
        let removed = repos.active_jobs().delete_stale(cutoff).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = repos.active_jobs().list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].fingerprint, fp("b"));
    }

    #[tokio::test]
    async fn query_log_upsert_and_touch() {
        let time = Arc::new(MockProvider::new(Time::from_timestamp(0, 0)));
        let store =
            MemCacheStore::with_time_provider(BackendKind::Array, Arc::<MockProvider>::clone(&time));
        let mut repos = store.repositories().await;
        let h = fp("a");

        repos
            .query_log()
            .upsert(PK, &h, "SELECT 1", QueryLogStatus::Ok)
            .await
            .unwrap();
        time.inc(std::time::Duration::from_secs(10));
        repos.query_log().touch(PK, &h).await.unwrap();

        let row = repos.query_log().get(PK, &h).await.unwrap().unwrap();
        assert_eq!(row.status, QueryLogStatus::Ok);
        assert_eq!(row.last_seen_ns, 10_000_000_000);
    }
}
