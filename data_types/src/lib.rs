//! Shared data types used by all partition cache crates.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::NaiveDateTime;
use ordered_float::OrderedFloat;
use snafu::Snafu;
use std::fmt::{Display, Formatter};

/// Errors raised when converting external input into domain types.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("unknown datatype: {name}"))]
    UnknownDatatype { name: String },

    #[snafu(display("unknown cache status: {name}"))]
    UnknownStatus { name: String },

    #[snafu(display("unknown backend kind: {name}"))]
    UnknownBackend { name: String },

    #[snafu(display("cannot parse {input:?} as {datatype}"))]
    InvalidValue { input: String, datatype: Datatype },

    #[snafu(display(
        "invalid SQL identifier {ident:?}: only [A-Za-z0-9_] starting with a letter or underscore"
    ))]
    InvalidIdentifier { ident: String },
}

/// Convenience result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The datatype of a partition key column.
///
/// Every partition key is tagged with its datatype at registration time and
/// every value crossing the cache boundary is checked against the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Datatype {
    /// 32 bit signed integer.
    Int32,
    /// 64 bit signed integer.
    Int64,
    /// 64 bit float.
    Float,
    /// UTF-8 text.
    Text,
    /// Timestamp without timezone.
    Timestamp,
}

impl Datatype {
    /// Stable lower-case name, used on the wire and in metadata tables.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float => "float",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
        }
    }

    /// Whether values of this datatype are integers.
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Int32 | Self::Int64)
    }

    /// All datatypes, in declaration order.
    pub fn all() -> [Self; 5] {
        [
            Self::Int32,
            Self::Int64,
            Self::Float,
            Self::Text,
            Self::Timestamp,
        ]
    }
}

impl Display for Datatype {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Datatype {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "int32" => Ok(Self::Int32),
            "int64" => Ok(Self::Int64),
            "float" => Ok(Self::Float),
            "text" => Ok(Self::Text),
            "timestamp" => Ok(Self::Timestamp),
            other => UnknownDatatypeSnafu { name: other }.fail(),
        }
    }
}

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d",
];

/// One partition key value, tagged with its datatype.
///
/// Values are totally ordered. Ordering across datatypes exists only so that
/// heterogeneous containers stay deterministic; the cache never mixes
/// datatypes within one partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    /// 32 bit signed integer.
    Int32(i32),
    /// 64 bit signed integer.
    Int64(i64),
    /// 64 bit float, ordered via [`OrderedFloat`].
    Float(OrderedFloat<f64>),
    /// UTF-8 text.
    Text(String),
    /// Timestamp without timezone.
    Timestamp(NaiveDateTime),
}

impl Value {
    /// The datatype tag of this value.
    pub fn datatype(&self) -> Datatype {
        match self {
            Self::Int32(_) => Datatype::Int32,
            Self::Int64(_) => Datatype::Int64,
            Self::Float(_) => Datatype::Float,
            Self::Text(_) => Datatype::Text,
            Self::Timestamp(_) => Datatype::Timestamp,
        }
    }

    /// Parse `input` as a value of `datatype`.
    pub fn parse(datatype: Datatype, input: &str) -> Result<Self> {
        let invalid = || {
            InvalidValueSnafu {
                input: input.to_string(),
                datatype,
            }
            .build()
        };

        match datatype {
            Datatype::Int32 => input.parse().map(Self::Int32).map_err(|_| invalid()),
            Datatype::Int64 => input.parse().map(Self::Int64).map_err(|_| invalid()),
            Datatype::Float => input
                .parse()
                .map(|f| Self::Float(OrderedFloat(f)))
                .map_err(|_| invalid()),
            Datatype::Text => Ok(Self::Text(input.to_string())),
            Datatype::Timestamp => TIMESTAMP_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
                .or_else(|| {
                    input
                        .parse::<chrono::NaiveDate>()
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })
                .map(Self::Timestamp)
                .ok_or_else(invalid),
        }
    }

    /// Render this value as a SQL literal suitable for splicing into an
    /// `IN (...)` list.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Self::Int32(v) => v.to_string(),
            Self::Int64(v) => v.to_string(),
            Self::Float(v) => {
                let f = v.into_inner();
                if f == f.trunc() && f.is_finite() {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Self::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Self::Timestamp(ts) => format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }

    /// The non-negative integer index of this value, if it has one.
    ///
    /// Bit-vector and roaring representations address values by index, so
    /// only non-negative integer values are representable there.
    pub fn to_index(&self) -> Option<u64> {
        match self {
            Self::Int32(v) if *v >= 0 => Some(*v as u64),
            Self::Int64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    /// Reconstruct an integer value of `datatype` from a bit/roaring index.
    pub fn from_index(datatype: Datatype, index: u64) -> Option<Self> {
        match datatype {
            Datatype::Int32 => i32::try_from(index).ok().map(Self::Int32),
            Datatype::Int64 => i64::try_from(index).ok().map(Self::Int64),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int32(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

/// Canonical-form hash identifying one fragment query.
///
/// 32 lower-case hex characters (128 bits). Two fragments share a
/// fingerprint iff their canonical forms are identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already-computed hex digest.
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// The hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    /// Values are present and complete.
    Ok,
    /// Fragment execution exceeded the statement timeout; no values stored.
    Timeout,
    /// Fragment execution failed; no values stored.
    Failed,
    /// Fragment produced more values than the configured limit; no values
    /// stored.
    Limit,
}

impl CacheStatus {
    /// Stable lower-case name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
            Self::Limit => "limit",
        }
    }

    /// Whether this entry carries values.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Whether this entry is a tombstone (no values).
    pub fn is_tombstone(&self) -> bool {
        !self.is_ok()
    }
}

impl Display for CacheStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CacheStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ok" => Ok(Self::Ok),
            "timeout" => Ok(Self::Timeout),
            "failed" => Ok(Self::Failed),
            "limit" => Ok(Self::Limit),
            other => UnknownStatusSnafu { name: other }.fail(),
        }
    }
}

/// Status recorded in the query log.
///
/// A superset of [`CacheStatus`]: `skipped` marks a worker that lost the
/// admission race and never executed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryLogStatus {
    /// Fragment built and stored.
    Ok,
    /// Fragment tombstoned as timed out.
    Timeout,
    /// Fragment tombstoned as failed.
    Failed,
    /// Fragment tombstoned as over the result limit.
    Limit,
    /// A concurrent worker was already building this fragment.
    Skipped,
    /// An original query that has been expanded into fragments; retained
    /// for audit.
    Expanded,
}

impl QueryLogStatus {
    /// Stable lower-case name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
            Self::Limit => "limit",
            Self::Skipped => "skipped",
            Self::Expanded => "expanded",
        }
    }

    /// Whether a row of this status corresponds to a cache entry
    /// (values or tombstone) rather than a bookkeeping record.
    pub fn is_entry_status(&self) -> bool {
        matches!(self, Self::Ok | Self::Timeout | Self::Failed | Self::Limit)
    }
}

impl From<CacheStatus> for QueryLogStatus {
    fn from(s: CacheStatus) -> Self {
        match s {
            CacheStatus::Ok => Self::Ok,
            CacheStatus::Timeout => Self::Timeout,
            CacheStatus::Failed => Self::Failed,
            CacheStatus::Limit => Self::Limit,
        }
    }
}

impl Display for QueryLogStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for QueryLogStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ok" => Ok(Self::Ok),
            "timeout" => Ok(Self::Timeout),
            "failed" => Ok(Self::Failed),
            "limit" => Ok(Self::Limit),
            "skipped" => Ok(Self::Skipped),
            "expanded" => Ok(Self::Expanded),
            other => UnknownStatusSnafu { name: other }.fail(),
        }
    }
}

/// Identity of a cache backend's set representation.
///
/// The applicator dispatches on this tag when deciding between lazy and
/// materialised application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Sorted array of values; all datatypes.
    Array,
    /// Dense bit vector addressed by value; non-negative integers only,
    /// bounded by a growable bitsize.
    Bit,
    /// Compressed roaring bitmap; non-negative 32 bit integers.
    RoaringBit,
    /// Opaque unordered set; all datatypes.
    Generic,
}

impl BackendKind {
    /// Stable lower-case name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::Bit => "bit",
            Self::RoaringBit => "roaringbit",
            Self::Generic => "generic",
        }
    }

    /// Whether this representation can hold values of `datatype`.
    pub fn supports(&self, datatype: Datatype) -> bool {
        match self {
            Self::Array | Self::Generic => true,
            Self::Bit => datatype.is_integer(),
            Self::RoaringBit => datatype == Datatype::Int32,
        }
    }

    /// Whether this representation needs a bitsize bound in partition
    /// metadata.
    pub fn needs_bitsize(&self) -> bool {
        matches!(self, Self::Bit)
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "array" => Ok(Self::Array),
            "bit" => Ok(Self::Bit),
            "roaringbit" => Ok(Self::RoaringBit),
            "generic" => Ok(Self::Generic),
            other => UnknownBackendSnafu { name: other }.fail(),
        }
    }
}

/// Identifier of one worker process/task, recorded in active-job rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    /// Wrap an externally chosen identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-partition-key metadata row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMeta {
    /// Partition key column name.
    pub partition_key: String,
    /// Datatype of the key.
    pub datatype: Datatype,
    /// Current bit backend upper bound; `None` for non-bit backends.
    pub bitsize: Option<u64>,
    /// Optional distinct-count of the key over the fact table, used for
    /// search-space-reduction stats.
    pub total_keys: Option<u64>,
    /// Creation time, epoch nanoseconds.
    pub created_at_ns: i64,
}

/// One pending entry of the original-query queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalQueueItem {
    /// Queue-assigned id.
    pub id: i64,
    /// The user-facing SQL awaiting fragment expansion.
    pub sql: String,
    /// Partition key the cache should be populated for.
    pub partition_key: String,
    /// Datatype of the key.
    pub datatype: Datatype,
    /// Larger runs earlier.
    pub priority: i32,
    /// Enqueue time, epoch nanoseconds.
    pub created_at_ns: i64,
}

/// One pending entry of the fragment queue, unique on
/// `(fingerprint, partition_key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentQueueItem {
    /// Queue-assigned id.
    pub id: i64,
    /// Fingerprint of the fragment.
    pub fingerprint: Fingerprint,
    /// Partition key the fragment populates.
    pub partition_key: String,
    /// The fragment SELECT to execute.
    pub fragment_sql: String,
    /// Datatype of the key.
    pub datatype: Datatype,
    /// Larger runs earlier; bumped on duplicate enqueue.
    pub priority: i32,
    /// Enqueue time, epoch nanoseconds.
    pub created_at_ns: i64,
}

/// Record of an in-flight fragment build, unique on
/// `(fingerprint, partition_key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveJob {
    /// Fingerprint being built.
    pub fingerprint: Fingerprint,
    /// Partition key being built.
    pub partition_key: String,
    /// Worker holding the job.
    pub worker_id: WorkerId,
    /// Admission time, epoch nanoseconds.
    pub started_at_ns: i64,
}

/// One row of the query log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLogRow {
    /// Fingerprint the row describes.
    pub fingerprint: Fingerprint,
    /// Partition key.
    pub partition_key: String,
    /// Fragment SQL, or the original statement for expansion audit rows.
    pub sql: String,
    /// Outcome.
    pub status: QueryLogStatus,
    /// Last time this fragment was seen, epoch nanoseconds.
    pub last_seen_ns: i64,
}

/// Summary of one cache entry as returned by listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
    /// Fingerprint of the entry.
    pub fingerprint: Fingerprint,
    /// Number of values stored; 0 for tombstones.
    pub cardinality: u64,
    /// Last refresh, epoch nanoseconds.
    pub last_seen_ns: i64,
    /// Entry status.
    pub status: CacheStatus,
}

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new queue item was created.
    Inserted,
    /// An existing item's priority was bumped.
    Updated,
    /// The queue is at its back-pressure cap.
    SkippedLocked,
    /// A worker is already building this fragment.
    SkippedConcurrent,
}

/// Outcome of one worker tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A fragment was executed and committed/tombstoned, or an original
    /// query was expanded.
    Processed,
    /// The admission race was lost to a concurrent worker.
    Skipped,
    /// Nothing to do.
    NoJobs,
    /// No jobs, but the idle sweep removed already-cached queue items.
    Cleanup,
}

/// How a cache hit was spliced into the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMethod {
    /// Literal `IN (v1, v2, ...)` list.
    Materialised,
    /// `IN (SELECT ... FROM <cache table> ...)` subquery.
    Lazy,
}

/// Statistics returned by the applicator alongside the rewritten SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyStats {
    /// Fragments generated for the incoming query.
    pub fragments_generated: usize,
    /// Fragments probed against the cache.
    pub fragments_probed: usize,
    /// Fragments with an `ok` entry.
    pub fragments_hit: usize,
    /// Cardinality of the intersected constraint, if one was applied.
    pub cardinality: Option<u64>,
    /// Splice method, if a rewrite happened.
    pub method: Option<ApplyMethod>,
    /// `1 - cardinality / count_distinct(fact.P)`, when the distinct count
    /// is known from partition metadata.
    pub reduction_pct: Option<f64>,
    /// Whether the query was rewritten at all.
    pub enhanced: bool,
}

impl ApplyStats {
    /// Stats for a query that bypassed the cache entirely.
    pub fn miss(fragments_generated: usize, fragments_probed: usize) -> Self {
        Self {
            fragments_generated,
            fragments_probed,
            fragments_hit: 0,
            cardinality: None,
            method: None,
            reduction_pct: None,
            enhanced: false,
        }
    }
}

/// Returns true iff `ident` is a plain SQL identifier.
///
/// Table and column names are spliced into generated SQL, so anything else
/// is rejected at the boundary.
pub fn is_valid_identifier(ident: &str) -> bool {
    let mut chars = ident.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Derives the concrete table names of one store prefix.
///
/// All names are `{prefix}_{suffix}`; per-key cache tables append the
/// partition key name. Both parts must be plain identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    prefix: String,
}

impl TableNames {
    /// Create a name deriver for `prefix`.
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if !is_valid_identifier(&prefix) {
            return InvalidIdentifierSnafu { ident: prefix }.fail();
        }
        Ok(Self { prefix })
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Partition metadata table.
    pub fn metadata(&self) -> String {
        format!("{}_partition_metadata", self.prefix)
    }

    /// Query log table.
    pub fn queries(&self) -> String {
        format!("{}_queries", self.prefix)
    }

    /// Original-query queue table.
    pub fn original_queue(&self) -> String {
        format!("{}_original_queue", self.prefix)
    }

    /// Fragment queue table.
    pub fn fragment_queue(&self) -> String {
        format!("{}_fragment_queue", self.prefix)
    }

    /// Active-job table.
    pub fn active_jobs(&self) -> String {
        format!("{}_active_jobs", self.prefix)
    }

    /// Cache table of one partition key.
    pub fn cache(&self, partition_key: &str) -> Result<String> {
        if !is_valid_identifier(partition_key) {
            return InvalidIdentifierSnafu {
                ident: partition_key,
            }
            .fail();
        }
        Ok(format!("{}_cache_{partition_key}", self.prefix))
    }
}

/// Maximum length of a derived job name; matches common identifier limits
/// of the scheduling stores.
pub const MAX_JOB_NAME_LEN: usize = 63;

/// Derives a scheduled-job name:
/// `partitioncache_<operation>_<database>[_<prefix_suffix>]`, truncated to
/// [`MAX_JOB_NAME_LEN`] characters.
pub fn job_name(operation: &str, database: &str, prefix_suffix: Option<&str>) -> String {
    let mut name = match prefix_suffix {
        Some(suffix) => format!("partitioncache_{operation}_{database}_{suffix}"),
        None => format!("partitioncache_{operation}_{database}"),
    };
    name.truncate(MAX_JOB_NAME_LEN);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::str::FromStr;

    #[test]
    fn datatype_round_trip() {
        for dt in Datatype::all() {
            assert_eq!(Datatype::from_str(dt.name()).unwrap(), dt);
        }
        assert_matches!(
            Datatype::from_str("int8"),
            Err(Error::UnknownDatatype { .. })
        );
    }

    #[test]
    fn value_parse_and_render() {
        let v = Value::parse(Datatype::Int32, "42").unwrap();
        assert_eq!(v, Value::Int32(42));
        assert_eq!(v.to_sql_literal(), "42");

        let v = Value::parse(Datatype::Text, "O'Brien").unwrap();
        assert_eq!(v.to_sql_literal(), "'O''Brien'");

        let v = Value::parse(Datatype::Timestamp, "2021-06-01 12:30:00").unwrap();
        assert_eq!(v.to_sql_literal(), "'2021-06-01 12:30:00'");

        let v = Value::parse(Datatype::Timestamp, "2021-06-01").unwrap();
        assert_eq!(v.to_sql_literal(), "'2021-06-01 00:00:00'");

        assert_matches!(
            Value::parse(Datatype::Int64, "forty"),
            Err(Error::InvalidValue { .. })
        );
    }

    #[test]
    fn value_ordering_is_total_within_datatype() {
        let mut values = vec![Value::Int32(5), Value::Int32(-3), Value::Int32(17)];
        values.sort();
        assert_eq!(
            values,
            vec![Value::Int32(-3), Value::Int32(5), Value::Int32(17)]
        );
    }

    #[test]
    fn value_index_round_trip() {
        assert_eq!(Value::Int32(7).to_index(), Some(7));
        assert_eq!(Value::Int32(-7).to_index(), None);
        assert_eq!(Value::Text("x".into()).to_index(), None);
        assert_eq!(
            Value::from_index(Datatype::Int32, 7),
            Some(Value::Int32(7))
        );
        assert_eq!(Value::from_index(Datatype::Text, 7), None);
    }

    #[test]
    fn backend_capabilities() {
        assert!(BackendKind::Array.supports(Datatype::Timestamp));
        assert!(BackendKind::Bit.supports(Datatype::Int64));
        assert!(!BackendKind::Bit.supports(Datatype::Text));
        assert!(BackendKind::RoaringBit.supports(Datatype::Int32));
        assert!(!BackendKind::RoaringBit.supports(Datatype::Int64));
        assert!(BackendKind::Bit.needs_bitsize());
        assert!(!BackendKind::Array.needs_bitsize());
    }

    #[test]
    fn table_name_derivation() {
        let names = TableNames::new("pcache").unwrap();
        assert_eq!(names.metadata(), "pcache_partition_metadata");
        assert_eq!(names.fragment_queue(), "pcache_fragment_queue");
        assert_eq!(names.cache("lo_custkey").unwrap(), "pcache_cache_lo_custkey");

        assert_matches!(
            names.cache("lo_custkey; DROP TABLE x"),
            Err(Error::InvalidIdentifier { .. })
        );
        assert_matches!(
            TableNames::new("p-cache"),
            Err(Error::InvalidIdentifier { .. })
        );
    }

    #[test]
    fn job_name_truncation() {
        assert_eq!(
            job_name("evict", "ssb", Some("pcache")),
            "partitioncache_evict_ssb_pcache"
        );

        let long = job_name("evict", &"d".repeat(100), None);
        assert_eq!(long.len(), MAX_JOB_NAME_LEN);
        assert!(long.starts_with("partitioncache_evict_ddd"));
    }

    #[test]
    fn status_round_trip() {
        for s in [
            CacheStatus::Ok,
            CacheStatus::Timeout,
            CacheStatus::Failed,
            CacheStatus::Limit,
        ] {
            assert_eq!(CacheStatus::from_str(s.name()).unwrap(), s);
        }
        assert!(CacheStatus::Ok.is_ok());
        assert!(CacheStatus::Limit.is_tombstone());
        assert_eq!(QueryLogStatus::from(CacheStatus::Timeout).name(), "timeout");
    }
}
