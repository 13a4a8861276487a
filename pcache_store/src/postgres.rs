//! Postgres-backed [`CacheStore`]: the durable reference implementation.
//!
//! Table names derive from a configured prefix; the per-partition-key cache
//! tables are shaped by the backend variant (value arrays, or byte blobs
//! for the bit and roaring representations). All identifiers that reach a
//! `format!`ed statement have passed [`TableNames`] validation.

use crate::executor::{ExecError, FetchOutcome, FragmentExecutor};
use crate::interface::{
    ActiveJobRepo, CacheStore, DatatypeMismatchSnafu, EntryRepo, Error, PartitionNotFoundSnafu,
    PartitionRepo, QueryLogRepo, QueueDepths, QueueRepo, RepoCollection, Result, SqlxSnafu,
};
use crate::sets::{intersect_all, ValueSet};
use async_trait::async_trait;
use bitvec::prelude::{BitVec, Lsb0};
use data_types::{
    ActiveJob, BackendKind, CacheEntryInfo, CacheStatus, Datatype, EnqueueOutcome, Fingerprint,
    FragmentQueueItem, OriginalQueueItem, PartitionMeta, QueryLogRow, QueryLogStatus, TableNames,
    Value, WorkerId,
};
use futures::TryStreamExt;
use pcache_time::{SystemProvider, TimeProvider};
use roaring::RoaringBitmap;
use snafu::ResultExt;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Connection options for [`PostgresCacheStore::connect`].
#[derive(Debug, Clone)]
pub struct PostgresConnectionOptions {
    /// `postgres://` DSN.
    pub dsn: String,
    /// Pool size.
    pub max_connections: u32,
    /// Prefix of every table this store creates.
    pub table_prefix: String,
    /// Set representation.
    pub backend: BackendKind,
    /// Queue back-pressure cap.
    pub queue_cap: usize,
    /// Initial bit-store bound for new partition keys.
    pub default_bitsize: u64,
}

impl PostgresConnectionOptions {
    /// Options with the defaults used across deployments.
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            max_connections: 10,
            table_prefix: "partitioncache".to_string(),
            backend: BackendKind::Array,
            queue_cap: crate::mem::DEFAULT_QUEUE_CAP,
            default_bitsize: crate::mem::DEFAULT_BITSIZE,
        }
    }
}

/// Postgres-backed store.
#[derive(Debug)]
pub struct PostgresCacheStore {
    pool: PgPool,
    names: TableNames,
    kind: BackendKind,
    time_provider: Arc<dyn TimeProvider>,
    queue_cap: usize,
    default_bitsize: u64,
}

impl PostgresCacheStore {
    /// Connect a pool and build the store.
    pub async fn connect(options: PostgresConnectionOptions) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .connect(&options.dsn)
            .await
            .context(SqlxSnafu)?;
        info!(prefix = %options.table_prefix, backend = %options.backend, "connected cache store");
        Self::new(pool, options)
    }

    /// Build the store over an existing pool.
    pub fn new(pool: PgPool, options: PostgresConnectionOptions) -> Result<Self> {
        let names =
            TableNames::new(options.table_prefix).map_err(|source| Error::Name { source })?;
        Ok(Self {
            pool,
            names,
            kind: options.backend,
            time_provider: Arc::new(SystemProvider::new()),
            queue_cap: options.queue_cap,
            default_bitsize: options.default_bitsize,
        })
    }

    /// The underlying pool, for executors sharing the database.
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}

#[async_trait]
impl CacheStore for PostgresCacheStore {
    async fn setup(&self) -> Result<()> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    partition_key TEXT PRIMARY KEY,
                    datatype TEXT NOT NULL,
                    bitsize BIGINT,
                    total_keys BIGINT,
                    created_at_ns BIGINT NOT NULL
                )",
                self.names.metadata()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    fingerprint TEXT NOT NULL,
                    partition_key TEXT NOT NULL,
                    query_sql TEXT NOT NULL,
                    status TEXT NOT NULL,
                    last_seen_ns BIGINT NOT NULL,
                    PRIMARY KEY (fingerprint, partition_key, status)
                )",
                self.names.queries()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    query_sql TEXT NOT NULL,
                    partition_key TEXT NOT NULL,
                    datatype TEXT NOT NULL,
                    priority INT NOT NULL DEFAULT 0,
                    created_at_ns BIGINT NOT NULL,
                    UNIQUE (query_sql, partition_key)
                )",
                self.names.original_queue()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    fingerprint TEXT NOT NULL,
                    partition_key TEXT NOT NULL,
                    fragment_sql TEXT NOT NULL,
                    datatype TEXT NOT NULL,
                    priority INT NOT NULL DEFAULT 0,
                    created_at_ns BIGINT NOT NULL,
                    UNIQUE (fingerprint, partition_key)
                )",
                self.names.fragment_queue()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    fingerprint TEXT NOT NULL,
                    partition_key TEXT NOT NULL,
                    worker_id TEXT NOT NULL,
                    started_at_ns BIGINT NOT NULL,
                    PRIMARY KEY (fingerprint, partition_key)
                )",
                self.names.active_jobs()
            ),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context(SqlxSnafu)?;
        }
        Ok(())
    }

    fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    fn time_provider(&self) -> Arc<dyn TimeProvider> {
        Arc::clone(&self.time_provider)
    }

    async fn repositories(&self) -> Box<dyn RepoCollection> {
        Box::new(PgRepos {
            pool: self.pool.clone(),
            names: self.names.clone(),
            kind: self.kind,
            time_provider: Arc::clone(&self.time_provider),
            queue_cap: self.queue_cap,
            default_bitsize: self.default_bitsize,
        })
    }

    fn lazy_subquery(&self, partition_key: &str, fingerprints: &[Fingerprint]) -> Option<String> {
        // Only the array-shaped tables can enumerate their sets in SQL.
        if !matches!(self.kind, BackendKind::Array | BackendKind::Generic) {
            return None;
        }
        if fingerprints.is_empty() {
            return None;
        }
        let table = self.names.cache(partition_key).ok()?;

        let mut hashes = Vec::with_capacity(fingerprints.len());
        for fingerprint in fingerprints {
            if !fingerprint.as_str().chars().all(|c| c.is_ascii_hexdigit()) {
                return None;
            }
            hashes.push(format!("'{}'", fingerprint.as_str()));
        }

        // Per-hash sets are distinct, so counting hashes per value computes
        // the intersection.
        Some(format!(
            "SELECT pk_value FROM (SELECT unnest(partition_keys) AS pk_value, query_hash \
             FROM {table} WHERE query_hash IN ({hashes}) AND status = 'ok') candidate_sets \
             GROUP BY pk_value HAVING count(DISTINCT query_hash) = {count}",
            hashes = hashes.join(", "),
            count = fingerprints.len(),
        ))
    }
}

#[derive(Debug)]
struct PgRepos {
    pool: PgPool,
    names: TableNames,
    kind: BackendKind,
    time_provider: Arc<dyn TimeProvider>,
    queue_cap: usize,
    default_bitsize: u64,
}

impl PgRepos {
    fn now_ns(&self) -> i64 {
        self.time_provider.now().timestamp_nanos()
    }

    fn cache_table(&self, partition_key: &str) -> Result<String> {
        self.names
            .cache(partition_key)
            .map_err(|source| Error::Name { source })
    }

    /// SQL type of the value column for this store and datatype.
    fn value_column(&self, datatype: Datatype) -> &'static str {
        match self.kind {
            BackendKind::Bit | BackendKind::RoaringBit => "set_bytes BYTEA",
            BackendKind::Array | BackendKind::Generic => match datatype {
                Datatype::Int32 => "partition_keys INT4[]",
                Datatype::Int64 => "partition_keys INT8[]",
                Datatype::Float => "partition_keys FLOAT8[]",
                Datatype::Text | Datatype::Timestamp => "partition_keys TEXT[]",
            },
        }
    }

    async fn meta(&self, partition_key: &str) -> Result<PartitionMeta> {
        let row = sqlx::query(&format!(
            "SELECT partition_key, datatype, bitsize, total_keys, created_at_ns FROM {} \
             WHERE partition_key = $1",
            self.names.metadata()
        ))
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;

        row.map(|r| decode_meta(&r))
            .transpose()?
            .ok_or_else(|| PartitionNotFoundSnafu { partition_key }.build())
    }
}

fn decode_meta(row: &PgRow) -> Result<PartitionMeta> {
    let datatype: String = row.try_get("datatype").context(SqlxSnafu)?;
    Ok(PartitionMeta {
        partition_key: row.try_get("partition_key").context(SqlxSnafu)?,
        datatype: Datatype::from_str(&datatype).map_err(|e| Error::Corrupt {
            message: e.to_string(),
        })?,
        bitsize: row
            .try_get::<Option<i64>, _>("bitsize")
            .context(SqlxSnafu)?
            .map(|b| b as u64),
        total_keys: row
            .try_get::<Option<i64>, _>("total_keys")
            .context(SqlxSnafu)?
            .map(|t| t as u64),
        created_at_ns: row.try_get("created_at_ns").context(SqlxSnafu)?,
    })
}

fn decode_fragment_item(row: &PgRow) -> Result<FragmentQueueItem> {
    let datatype: String = row.try_get("datatype").context(SqlxSnafu)?;
    Ok(FragmentQueueItem {
        id: row.try_get("id").context(SqlxSnafu)?,
        fingerprint: Fingerprint::new(row.try_get::<String, _>("fingerprint").context(SqlxSnafu)?),
        partition_key: row.try_get("partition_key").context(SqlxSnafu)?,
        fragment_sql: row.try_get("fragment_sql").context(SqlxSnafu)?,
        datatype: Datatype::from_str(&datatype).map_err(|e| Error::Corrupt {
            message: e.to_string(),
        })?,
        priority: row.try_get("priority").context(SqlxSnafu)?,
        created_at_ns: row.try_get("created_at_ns").context(SqlxSnafu)?,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(inner) = e {
        if let Some(code) = inner.code() {
            return code == "23505";
        }
    }
    false
}

impl RepoCollection for PgRepos {
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
impl PartitionRepo for PgRepos {
    async fn create_or_get(
        &mut self,
        partition_key: &str,
        datatype: Datatype,
    ) -> Result<PartitionMeta> {
        let table = self.cache_table(partition_key)?;
        let bitsize = self
            .kind
            .needs_bitsize()
            .then_some(self.default_bitsize as i64);

        let insert = sqlx::query(&format!(
            "INSERT INTO {} (partition_key, datatype, bitsize, created_at_ns) \
             VALUES ($1, $2, $3, $4) ON CONFLICT (partition_key) DO NOTHING",
            self.names.metadata()
        ))
        .bind(partition_key)
        .bind(datatype.name())
        .bind(bitsize)
        .bind(self.now_ns())
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;

        if insert.rows_affected() == 1 {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    query_hash TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    cardinality BIGINT NOT NULL DEFAULT 0,
                    created_at_ns BIGINT NOT NULL,
                    last_seen_ns BIGINT NOT NULL,
                    {value_column}
                )",
                value_column = self.value_column(datatype),
            ))
            .execute(&self.pool)
            .await
            .context(SqlxSnafu)?;
            debug!(partition_key, %datatype, "registered partition key");
        }

        let meta = self.meta(partition_key).await?;
        if meta.datatype != datatype {
            return DatatypeMismatchSnafu {
                partition_key,
                existing: meta.datatype,
                requested: datatype,
            }
            .fail();
        }
        Ok(meta)
    }

    async fn get(&mut self, partition_key: &str) -> Result<Option<PartitionMeta>> {
        match self.meta(partition_key).await {
            Ok(meta) => Ok(Some(meta)),
            Err(Error::PartitionNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&mut self) -> Result<Vec<PartitionMeta>> {
        let rows = sqlx::query(&format!(
            "SELECT partition_key, datatype, bitsize, total_keys, created_at_ns FROM {} \
             ORDER BY partition_key",
            self.names.metadata()
        ))
        .fetch_all(&self.pool)
        .await
        .context(SqlxSnafu)?;
        rows.iter().map(decode_meta).collect()
    }

    async fn set_bitsize(&mut self, partition_key: &str, bitsize: u64) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET bitsize = GREATEST(COALESCE(bitsize, 0), $2) WHERE partition_key = $1",
            self.names.metadata()
        ))
        .bind(partition_key)
        .bind(bitsize as i64)
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;
        Ok(())
    }

    async fn set_total_keys(&mut self, partition_key: &str, total_keys: u64) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET total_keys = $2 WHERE partition_key = $1",
            self.names.metadata()
        ))
        .bind(partition_key)
        .bind(total_keys as i64)
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;
        Ok(())
    }
}

#[async_trait]
impl EntryRepo for PgRepos {
    async fn put(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
        values: &[Value],
    ) -> Result<()> {
        let meta = self.meta(partition_key).await?;
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

        if self.kind.needs_bitsize() {
            if let Some(max) = set.max_index() {
                if max >= meta.bitsize.unwrap_or(0) {
                    self.set_bitsize(partition_key, max + 1).await?;
                }
            }
        }

        let table = self.cache_table(partition_key)?;
        let now = self.now_ns();
        let cardinality = set.cardinality() as i64;

        match &set {
            ValueSet::Bits { bits, .. } => {
                let bytes: Vec<u8> = bits.clone().into_vec();
                self.put_bytes(&table, fingerprint, cardinality, now, bytes)
                    .await
            }
            ValueSet::Roaring { bitmap } => {
                let mut bytes = Vec::new();
                bitmap.serialize_into(&mut bytes).map_err(|e| Error::Corrupt {
                    message: e.to_string(),
                })?;
                self.put_bytes(&table, fingerprint, cardinality, now, bytes)
                    .await
            }
            _ => {
                self.put_array(&table, fingerprint, cardinality, now, meta.datatype, &set)
                    .await
            }
        }
    }

    async fn mark(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
        status: CacheStatus,
    ) -> Result<()> {
        let table = self.cache_table(partition_key)?;
        let column = self.value_column_name();
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, status, cardinality, created_at_ns, last_seen_ns, {column}) \
             VALUES ($1, $2, 0, $3, $3, NULL) \
             ON CONFLICT (query_hash) DO UPDATE SET \
             status = EXCLUDED.status, cardinality = 0, last_seen_ns = EXCLUDED.last_seen_ns, \
             {column} = NULL",
        ))
        .bind(fingerprint.as_str())
        .bind(status.name())
        .bind(self.now_ns())
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;
        Ok(())
    }

    async fn get(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<ValueSet>> {
        let meta = self.meta(partition_key).await?;
        let table = self.cache_table(partition_key)?;
        let column = self.value_column_name();

        let row = sqlx::query(&format!(
            "SELECT status, {column} FROM {table} WHERE query_hash = $1",
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let status: String = row.try_get("status").context(SqlxSnafu)?;
        if status != CacheStatus::Ok.name() {
            return Ok(None);
        }

        self.decode_set(&row, meta.datatype).map(Some)
    }

    async fn exists(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<bool> {
        let table = self.cache_table(partition_key)?;
        let row = sqlx::query(&format!(
            "SELECT 1 AS present FROM {table} WHERE query_hash = $1"
        ))
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;
        Ok(row.is_some())
    }

    async fn intersect(
        &mut self,
        partition_key: &str,
        fingerprints: &[Fingerprint],
    ) -> Result<Option<ValueSet>> {
        let mut sets = Vec::with_capacity(fingerprints.len());
        for fingerprint in fingerprints {
            if let Some(set) = EntryRepo::get(self, partition_key, fingerprint).await? {
                sets.push(set);
            }
        }
        intersect_all(sets).map_err(|source| Error::SetMismatch { source })
    }

    async fn delete(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<()> {
        let table = self.cache_table(partition_key)?;
        sqlx::query(&format!("DELETE FROM {table} WHERE query_hash = $1"))
            .bind(fingerprint.as_str())
            .execute(&self.pool)
            .await
            .context(SqlxSnafu)?;
        Ok(())
    }

    async fn list(&mut self, partition_key: &str) -> Result<Vec<CacheEntryInfo>> {
        let table = self.cache_table(partition_key)?;
        let rows = sqlx::query(&format!(
            "SELECT query_hash, cardinality, last_seen_ns, status FROM {table} ORDER BY query_hash"
        ))
        .fetch_all(&self.pool)
        .await
        .context(SqlxSnafu)?;

        rows.into_iter()
            .map(|row| {
                let status: String = row.try_get("status").context(SqlxSnafu)?;
                Ok(CacheEntryInfo {
                    fingerprint: Fingerprint::new(
                        row.try_get::<String, _>("query_hash").context(SqlxSnafu)?,
                    ),
                    cardinality: row.try_get::<i64, _>("cardinality").context(SqlxSnafu)? as u64,
                    last_seen_ns: row.try_get("last_seen_ns").context(SqlxSnafu)?,
                    status: CacheStatus::from_str(&status).map_err(|e| Error::Corrupt {
                        message: e.to_string(),
                    })?,
                })
            })
            .collect()
    }
}

impl PgRepos {
    fn value_column_name(&self) -> &'static str {
        match self.kind {
            BackendKind::Bit | BackendKind::RoaringBit => "set_bytes",
            BackendKind::Array | BackendKind::Generic => "partition_keys",
        }
    }

    async fn put_bytes(
        &self,
        table: &str,
        fingerprint: &Fingerprint,
        cardinality: i64,
        now: i64,
        bytes: Vec<u8>,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, status, cardinality, created_at_ns, last_seen_ns, set_bytes) \
             VALUES ($1, 'ok', $2, $3, $3, $4) \
             ON CONFLICT (query_hash) DO UPDATE SET \
             status = 'ok', cardinality = EXCLUDED.cardinality, \
             last_seen_ns = EXCLUDED.last_seen_ns, set_bytes = EXCLUDED.set_bytes",
        ))
        .bind(fingerprint.as_str())
        .bind(cardinality)
        .bind(now)
        .bind(bytes)
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;
        Ok(())
    }

    async fn put_array(
        &self,
        table: &str,
        fingerprint: &Fingerprint,
        cardinality: i64,
        now: i64,
        datatype: Datatype,
        set: &ValueSet,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} (query_hash, status, cardinality, created_at_ns, last_seen_ns, partition_keys) \
             VALUES ($1, 'ok', $2, $3, $3, $4) \
             ON CONFLICT (query_hash) DO UPDATE SET \
             status = 'ok', cardinality = EXCLUDED.cardinality, \
             last_seen_ns = EXCLUDED.last_seen_ns, partition_keys = EXCLUDED.partition_keys",
        );
        let values = set.values();
        let query = sqlx::query(&sql)
            .bind(fingerprint.as_str())
            .bind(cardinality)
            .bind(now);

        let query = match datatype {
            Datatype::Int32 => {
                let array: Vec<i32> = values
                    .iter()
                    .filter_map(|v| match v {
                        Value::Int32(i) => Some(*i),
                        _ => None,
                    })
                    .collect();
                query.bind(array)
            }
            Datatype::Int64 => {
                let array: Vec<i64> = values
                    .iter()
                    .filter_map(|v| match v {
                        Value::Int64(i) => Some(*i),
                        _ => None,
                    })
                    .collect();
                query.bind(array)
            }
            Datatype::Float => {
                let array: Vec<f64> = values
                    .iter()
                    .filter_map(|v| match v {
                        Value::Float(f) => Some(f.into_inner()),
                        _ => None,
                    })
                    .collect();
                query.bind(array)
            }
            Datatype::Text | Datatype::Timestamp => {
                let array: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                query.bind(array)
            }
        };

        query.execute(&self.pool).await.context(SqlxSnafu)?;
        Ok(())
    }

    fn decode_set(&self, row: &PgRow, datatype: Datatype) -> Result<ValueSet> {
        match self.kind {
            BackendKind::Bit => {
                let bytes: Vec<u8> = row
                    .try_get::<Option<Vec<u8>>, _>("set_bytes")
                    .context(SqlxSnafu)?
                    .unwrap_or_default();
                let bits: BitVec<u8, Lsb0> = BitVec::from_vec(bytes);
                Ok(ValueSet::Bits { datatype, bits })
            }
            BackendKind::RoaringBit => {
                let bytes: Vec<u8> = row
                    .try_get::<Option<Vec<u8>>, _>("set_bytes")
                    .context(SqlxSnafu)?
                    .unwrap_or_default();
                let bitmap = if bytes.is_empty() {
                    RoaringBitmap::new()
                } else {
                    RoaringBitmap::deserialize_from(&bytes[..]).map_err(|e| Error::Corrupt {
                        message: e.to_string(),
                    })?
                };
                Ok(ValueSet::Roaring { bitmap })
            }
            BackendKind::Array | BackendKind::Generic => {
                let values = self.decode_array(row, datatype)?;
                ValueSet::from_values(self.kind, datatype, &values)
                    .map_err(|source| Error::WrongDatatype { source })
            }
        }
    }

    fn decode_array(&self, row: &PgRow, datatype: Datatype) -> Result<Vec<Value>> {
        Ok(match datatype {
            Datatype::Int32 => row
                .try_get::<Option<Vec<i32>>, _>("partition_keys")
                .context(SqlxSnafu)?
                .unwrap_or_default()
                .into_iter()
                .map(Value::Int32)
                .collect(),
            Datatype::Int64 => row
                .try_get::<Option<Vec<i64>>, _>("partition_keys")
                .context(SqlxSnafu)?
                .unwrap_or_default()
                .into_iter()
                .map(Value::Int64)
                .collect(),
            Datatype::Float => row
                .try_get::<Option<Vec<f64>>, _>("partition_keys")
                .context(SqlxSnafu)?
                .unwrap_or_default()
                .into_iter()
                .map(|f| Value::Float(f.into()))
                .collect(),
            Datatype::Text | Datatype::Timestamp => {
                let strings = row
                    .try_get::<Option<Vec<String>>, _>("partition_keys")
                    .context(SqlxSnafu)?
                    .unwrap_or_default();
                let mut values = Vec::with_capacity(strings.len());
                for s in strings {
                    values.push(Value::parse(datatype, &s).map_err(|e| Error::Corrupt {
                        message: e.to_string(),
                    })?);
                }
                values
            }
        })
    }
}

#[async_trait]
impl QueueRepo for PgRepos {
    async fn push_original(
        &mut self,
        sql: &str,
        partition_key: &str,
        datatype: Datatype,
        priority: i32,
    ) -> Result<EnqueueOutcome> {
        // De-duplicate before the back-pressure check: bumping an existing
        // item never grows the queue.
        let updated = sqlx::query(&format!(
            "UPDATE {} SET priority = priority + 1 WHERE query_sql = $1 AND partition_key = $2",
            self.names.original_queue()
        ))
        .bind(sql)
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;
        if updated.rows_affected() == 1 {
            return Ok(EnqueueOutcome::Updated);
        }

        let depths = self.depths().await?;
        if depths.original >= self.queue_cap {
            return Ok(EnqueueOutcome::SkippedLocked);
        }

        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (query_sql, partition_key, datatype, priority, created_at_ns) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT (query_sql, partition_key) DO NOTHING",
            self.names.original_queue()
        ))
        .bind(sql)
        .bind(partition_key)
        .bind(datatype.name())
        .bind(priority)
        .bind(self.now_ns())
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;

        if inserted.rows_affected() == 1 {
            Ok(EnqueueOutcome::Inserted)
        } else {
            // Lost a race against an identical enqueue.
            Ok(EnqueueOutcome::Updated)
        }
    }

    async fn pop_original(&mut self) -> Result<Option<OriginalQueueItem>> {
        let table = self.names.original_queue();
        let row = sqlx::query(&format!(
            "DELETE FROM {table} WHERE id = (\
                SELECT id FROM {table} \
                ORDER BY priority DESC, created_at_ns ASC, id ASC \
                LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING id, query_sql, partition_key, datatype, priority, created_at_ns",
        ))
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;

        row.map(|row| {
            let datatype: String = row.try_get("datatype").context(SqlxSnafu)?;
            Ok(OriginalQueueItem {
                id: row.try_get("id").context(SqlxSnafu)?,
                sql: row.try_get("query_sql").context(SqlxSnafu)?,
                partition_key: row.try_get("partition_key").context(SqlxSnafu)?,
                datatype: Datatype::from_str(&datatype).map_err(|e| Error::Corrupt {
                    message: e.to_string(),
                })?,
                priority: row.try_get("priority").context(SqlxSnafu)?,
                created_at_ns: row.try_get("created_at_ns").context(SqlxSnafu)?,
            })
        })
        .transpose()
    }

    async fn push_fragment(
        &mut self,
        fragment_sql: &str,
        fingerprint: &Fingerprint,
        partition_key: &str,
        datatype: Datatype,
        priority: i32,
    ) -> Result<EnqueueOutcome> {
        let in_flight = sqlx::query(&format!(
            "SELECT 1 AS held FROM {} WHERE fingerprint = $1 AND partition_key = $2",
            self.names.active_jobs()
        ))
        .bind(fingerprint.as_str())
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;
        if in_flight.is_some() {
            return Ok(EnqueueOutcome::SkippedConcurrent);
        }

        let updated = sqlx::query(&format!(
            "UPDATE {} SET priority = priority + 1 WHERE fingerprint = $1 AND partition_key = $2",
            self.names.fragment_queue()
        ))
        .bind(fingerprint.as_str())
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;
        if updated.rows_affected() == 1 {
            return Ok(EnqueueOutcome::Updated);
        }

        let depths = self.depths().await?;
        if depths.fragment >= self.queue_cap {
            return Ok(EnqueueOutcome::SkippedLocked);
        }

        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (fingerprint, partition_key, fragment_sql, datatype, priority, created_at_ns) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (fingerprint, partition_key) DO NOTHING",
            self.names.fragment_queue()
        ))
        .bind(fingerprint.as_str())
        .bind(partition_key)
        .bind(fragment_sql)
        .bind(datatype.name())
        .bind(priority)
        .bind(self.now_ns())
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;

        if inserted.rows_affected() == 1 {
            Ok(EnqueueOutcome::Inserted)
        } else {
            Ok(EnqueueOutcome::Updated)
        }
    }

    async fn pop_eligible_fragment(&mut self) -> Result<Option<FragmentQueueItem>> {
        // The query log stands in for "a cache entry of any status exists":
        // workers write both in the same tick. Ownership is established by
        // the active-job insert, not by this read; SKIP LOCKED merely keeps
        // concurrent pops from colliding on the same row.
        let row = sqlx::query(&format!(
            "SELECT q.id, q.fingerprint, q.partition_key, q.fragment_sql, q.datatype, \
                    q.priority, q.created_at_ns \
             FROM {fq} q \
             WHERE NOT EXISTS (\
                SELECT 1 FROM {aj} a \
                WHERE a.fingerprint = q.fingerprint AND a.partition_key = q.partition_key) \
             AND NOT EXISTS (\
                SELECT 1 FROM {ql} l \
                WHERE l.fingerprint = q.fingerprint AND l.partition_key = q.partition_key \
                AND l.status IN ('ok', 'timeout', 'failed', 'limit')) \
             ORDER BY q.priority DESC, q.created_at_ns ASC, q.id ASC \
             LIMIT 1 FOR UPDATE OF q SKIP LOCKED",
            fq = self.names.fragment_queue(),
            aj = self.names.active_jobs(),
            ql = self.names.queries(),
        ))
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;

        row.map(|row| decode_fragment_item(&row)).transpose()
    }

    async fn remove_fragment(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE fingerprint = $1 AND partition_key = $2",
            self.names.fragment_queue()
        ))
        .bind(fingerprint.as_str())
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;
        Ok(())
    }

    async fn sweep_cached(&mut self, limit: usize) -> Result<Vec<(String, Fingerprint)>> {
        let rows = sqlx::query(&format!(
            "DELETE FROM {fq} WHERE id IN (\
                SELECT q.id FROM {fq} q JOIN {ql} l \
                ON l.fingerprint = q.fingerprint AND l.partition_key = q.partition_key \
                WHERE l.status IN ('ok', 'timeout', 'failed', 'limit') \
                LIMIT $1) \
             RETURNING partition_key, fingerprint",
            fq = self.names.fragment_queue(),
            ql = self.names.queries(),
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context(SqlxSnafu)?;

        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get("partition_key").context(SqlxSnafu)?,
                    Fingerprint::new(
                        row.try_get::<String, _>("fingerprint").context(SqlxSnafu)?,
                    ),
                ))
            })
            .collect()
    }

    async fn depths(&mut self) -> Result<QueueDepths> {
        let original: i64 =
            sqlx::query_scalar(&format!("SELECT count(*) FROM {}", self.names.original_queue()))
                .fetch_one(&self.pool)
                .await
                .context(SqlxSnafu)?;
        let fragment: i64 =
            sqlx::query_scalar(&format!("SELECT count(*) FROM {}", self.names.fragment_queue()))
                .fetch_one(&self.pool)
                .await
                .context(SqlxSnafu)?;
        Ok(QueueDepths {
            original: original as usize,
            fragment: fragment as usize,
        })
    }
}

#[async_trait]
impl ActiveJobRepo for PgRepos {
    async fn try_admit(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
        worker: &WorkerId,
    ) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO {} (fingerprint, partition_key, worker_id, started_at_ns) \
             VALUES ($1, $2, $3, $4)",
            self.names.active_jobs()
        ))
        .bind(fingerprint.as_str())
        .bind(partition_key)
        .bind(worker.as_str())
        .bind(self.now_ns())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(Error::Sqlx { source: e }),
        }
    }

    async fn release(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE fingerprint = $1 AND partition_key = $2",
            self.names.active_jobs()
        ))
        .bind(fingerprint.as_str())
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;
        Ok(())
    }

    async fn delete_stale(&mut self, cutoff_ns: i64) -> Result<usize> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE started_at_ns < $1",
            self.names.active_jobs()
        ))
        .bind(cutoff_ns)
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;
        Ok(result.rows_affected() as usize)
    }

    async fn list(&mut self) -> Result<Vec<ActiveJob>> {
        let rows = sqlx::query(&format!(
            "SELECT fingerprint, partition_key, worker_id, started_at_ns FROM {} \
             ORDER BY started_at_ns",
            self.names.active_jobs()
        ))
        .fetch_all(&self.pool)
        .await
        .context(SqlxSnafu)?;

        rows.into_iter()
            .map(|row| {
                Ok(ActiveJob {
                    fingerprint: Fingerprint::new(
                        row.try_get::<String, _>("fingerprint").context(SqlxSnafu)?,
                    ),
                    partition_key: row.try_get("partition_key").context(SqlxSnafu)?,
                    worker_id: WorkerId::new(
                        row.try_get::<String, _>("worker_id").context(SqlxSnafu)?,
                    ),
                    started_at_ns: row.try_get("started_at_ns").context(SqlxSnafu)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl QueryLogRepo for PgRepos {
    async fn upsert(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
        sql: &str,
        status: QueryLogStatus,
    ) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (fingerprint, partition_key, query_sql, status, last_seen_ns) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (fingerprint, partition_key, status) DO UPDATE SET \
             query_sql = EXCLUDED.query_sql, last_seen_ns = EXCLUDED.last_seen_ns",
            self.names.queries()
        ))
        .bind(fingerprint.as_str())
        .bind(partition_key)
        .bind(sql)
        .bind(status.name())
        .bind(self.now_ns())
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;
        Ok(())
    }

    async fn touch(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET last_seen_ns = $3 WHERE fingerprint = $1 AND partition_key = $2",
            self.names.queries()
        ))
        .bind(fingerprint.as_str())
        .bind(partition_key)
        .bind(self.now_ns())
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;
        Ok(())
    }

    async fn get(
        &mut self,
        partition_key: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<QueryLogRow>> {
        let row = sqlx::query(&format!(
            "SELECT fingerprint, partition_key, query_sql, status, last_seen_ns FROM {} \
             WHERE fingerprint = $1 AND partition_key = $2 \
             ORDER BY (status IN ('ok', 'timeout', 'failed', 'limit')) DESC, \
                      last_seen_ns DESC \
             LIMIT 1",
            self.names.queries()
        ))
        .bind(fingerprint.as_str())
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await
        .context(SqlxSnafu)?;

        row.map(|row| decode_log_row(&row)).transpose()
    }

    async fn list(&mut self, partition_key: &str) -> Result<Vec<QueryLogRow>> {
        let rows = sqlx::query(&format!(
            "SELECT fingerprint, partition_key, query_sql, status, last_seen_ns FROM {} \
             WHERE partition_key = $1 ORDER BY last_seen_ns DESC",
            self.names.queries()
        ))
        .bind(partition_key)
        .fetch_all(&self.pool)
        .await
        .context(SqlxSnafu)?;
        rows.iter().map(decode_log_row).collect()
    }

    async fn delete(&mut self, partition_key: &str, fingerprint: &Fingerprint) -> Result<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE fingerprint = $1 AND partition_key = $2",
            self.names.queries()
        ))
        .bind(fingerprint.as_str())
        .bind(partition_key)
        .execute(&self.pool)
        .await
        .context(SqlxSnafu)?;
        Ok(())
    }
}

fn decode_log_row(row: &PgRow) -> Result<QueryLogRow> {
    let status: String = row.try_get("status").context(SqlxSnafu)?;
    Ok(QueryLogRow {
        fingerprint: Fingerprint::new(row.try_get::<String, _>("fingerprint").context(SqlxSnafu)?),
        partition_key: row.try_get("partition_key").context(SqlxSnafu)?,
        sql: row.try_get("query_sql").context(SqlxSnafu)?,
        status: QueryLogStatus::from_str(&status).map_err(|e| Error::Corrupt {
            message: e.to_string(),
        })?,
        last_seen_ns: row.try_get("last_seen_ns").context(SqlxSnafu)?,
    })
}

/// Executes fragments on the database that owns the fact table, under a
/// server-side statement timeout.
#[derive(Debug)]
pub struct PostgresExecutor {
    pool: PgPool,
}

impl PostgresExecutor {
    /// Build over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a dedicated pool.
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self, ExecError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await
            .map_err(|e| ExecError::Execution {
                message: e.to_string(),
            })?;
        Ok(Self::new(pool))
    }
}

fn is_statement_timeout(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(inner) = e {
        if let Some(code) = inner.code() {
            // 57014: query_canceled, raised by statement_timeout.
            return code == "57014";
        }
    }
    false
}

#[async_trait]
impl FragmentExecutor for PostgresExecutor {
    async fn fetch_values(
        &self,
        sql: &str,
        datatype: Datatype,
        limit: Option<usize>,
        timeout: Duration,
    ) -> Result<FetchOutcome, ExecError> {
        let map_err = |e: sqlx::Error| {
            if is_statement_timeout(&e) {
                ExecError::Timeout { timeout }
            } else {
                ExecError::Execution {
                    message: e.to_string(),
                }
            }
        };

        let mut tx = self.pool.begin().await.map_err(map_err)?;
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            timeout.as_millis()
        ))
        .execute(&mut tx)
        .await
        .map_err(map_err)?;

        let mut distinct: BTreeSet<Value> = BTreeSet::new();
        {
            let mut rows = sqlx::query(sql).fetch(&mut tx);
            while let Some(row) = rows.try_next().await.map_err(map_err)? {
                if let Some(value) = decode_first_column(&row, datatype).map_err(|e| {
                    ExecError::Execution {
                        message: e.to_string(),
                    }
                })? {
                    distinct.insert(value);
                }
                if let Some(limit) = limit {
                    if distinct.len() >= limit {
                        return Ok(FetchOutcome::LimitExceeded { limit });
                    }
                }
            }
        }

        Ok(FetchOutcome::Values(distinct.into_iter().collect()))
    }
}

fn decode_first_column(row: &PgRow, datatype: Datatype) -> Result<Option<Value>> {
    Ok(match datatype {
        Datatype::Int32 => row
            .try_get::<Option<i32>, _>(0)
            .context(SqlxSnafu)?
            .map(Value::Int32),
        Datatype::Int64 => row
            .try_get::<Option<i64>, _>(0)
            .context(SqlxSnafu)?
            .map(Value::Int64),
        Datatype::Float => row
            .try_get::<Option<f64>, _>(0)
            .context(SqlxSnafu)?
            .map(|f| Value::Float(f.into())),
        Datatype::Text => row
            .try_get::<Option<String>, _>(0)
            .context(SqlxSnafu)?
            .map(Value::Text),
        Datatype::Timestamp => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(0)
            .context(SqlxSnafu)?
            .map(Value::Timestamp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_helpers::maybe_skip_integration;

    async fn connect_test_store(dsn: String) -> PostgresCacheStore {
        let mut options = PostgresConnectionOptions::new(dsn);
        options.table_prefix = format!("pcachetest_{}", std::process::id());
        let store = PostgresCacheStore::connect(options).await.unwrap();
        store.setup().await.unwrap();
        store
    }

    #[tokio::test]
    async fn setup_round_trip_and_queue() {
        let dsn = maybe_skip_integration!();
        let store = connect_test_store(dsn).await;
        let mut repos = store.repositories().await;

        repos
            .partitions()
            .create_or_get("pk_int", Datatype::Int32)
            .await
            .unwrap();

        let h = Fingerprint::new("00000000000000000000000000000001");
        repos
            .entries()
            .put("pk_int", &h, &[Value::Int32(1), Value::Int32(5)])
            .await
            .unwrap();
        let set = repos.entries().get("pk_int", &h).await.unwrap().unwrap();
        assert_eq!(set.values(), vec![Value::Int32(1), Value::Int32(5)]);

        let outcome = repos
            .queue()
            .push_fragment("SELECT 1", &h, "pk_int", Datatype::Int32, 0)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Inserted);

        // The entry exists, so the item is ineligible only once the query
        // log records it; without a log row it is still poppable.
        let item = repos.queue().pop_eligible_fragment().await.unwrap();
        assert!(item.is_some());

        repos
            .query_log()
            .upsert("pk_int", &h, "SELECT 1", QueryLogStatus::Ok)
            .await
            .unwrap();
        let item = repos.queue().pop_eligible_fragment().await.unwrap();
        assert!(item.is_none());
    }

    #[tokio::test]
    async fn lazy_subquery_shape() {
        let dsn = maybe_skip_integration!();
        let store = connect_test_store(dsn).await;

        let h = Fingerprint::new("00000000000000000000000000000002");
        let lazy = store.lazy_subquery("pk_int", &[h]).unwrap();
        assert!(lazy.contains("unnest(partition_keys)"));
        assert!(lazy.contains("count(DISTINCT query_hash) = 1"));
    }
}
