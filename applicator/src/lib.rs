//! The read path: given an incoming query, find the cached fragments it
//! contains, intersect their partition key sets and splice the resulting
//! `IN` filter back into the query.
//!
//! [`apply_cache`] is total by contract: every cache-related failure
//! degrades to "no rewrite" and the caller gets their query back
//! unchanged. Errors surface only as debug logs.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{ApplyMethod, ApplyStats, Value};
use pcache_store::interface::CacheStore;
use pcache_store::sets::{intersect_all, ValueSet};
use query_analysis::{
    analyze, generate_variants, whole_where_fragment, Error as AnalysisError, FragmentQuery,
    VariantConfig,
};
use snafu::{ResultExt, Snafu};
use sqlparser::ast::{self, Expr, Ident, SetExpr, Statement};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};

/// Options of one [`apply_cache`] call.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Fact table the analyser roots its join graph at.
    pub fact_table: String,
    /// Variant enumeration bounds.
    pub variants: VariantConfig,
    /// Sets at or below this cardinality are spliced as literal `IN`
    /// lists; larger ones prefer the lazy subquery form.
    pub materialise_threshold: u64,
}

impl ApplyOptions {
    /// Options with the documented defaults.
    pub fn new(fact_table: impl Into<String>) -> Self {
        Self {
            fact_table: fact_table.into(),
            variants: VariantConfig::default(),
            materialise_threshold: 8192,
        }
    }
}

#[derive(Debug, Snafu)]
enum ApplyError {
    #[snafu(display("query analysis failed: {source}"))]
    Analysis { source: AnalysisError },

    #[snafu(display("cache store failed: {source}"))]
    Store {
        source: pcache_store::interface::Error,
    },

    #[snafu(display("set intersection failed: {source}"))]
    Sets { source: pcache_store::sets::SetError },

    #[snafu(display("query is not re-parseable for rewriting: {message}"))]
    Rewrite { message: String },
}

type Result<T, E = ApplyError> = std::result::Result<T, E>;

/// Rewrite `sql` with the best-covering cached fragments of
/// `partition_key`, returning the (possibly unchanged) SQL and stats.
pub async fn apply_cache(
    store: &dyn CacheStore,
    sql: &str,
    partition_key: &str,
    options: &ApplyOptions,
) -> (String, ApplyStats) {
    match try_apply(store, sql, partition_key, options).await {
        Ok(applied) => applied,
        Err(e) => {
            debug!(partition_key, error = %e, "cache application degraded to no rewrite");
            (sql.to_string(), ApplyStats::miss(0, 0))
        }
    }
}

async fn try_apply(
    store: &dyn CacheStore,
    sql: &str,
    partition_key: &str,
    options: &ApplyOptions,
) -> Result<(String, ApplyStats)> {
    let analyzed = analyze(sql, &options.fact_table).context(AnalysisSnafu)?;

    let fragments = match generate_variants(&analyzed, partition_key, &options.variants) {
        Ok(fragments) => fragments,
        Err(AnalysisError::VariantExplosion { .. }) => {
            whole_where_fragment(&analyzed, partition_key)
                .into_iter()
                .collect()
        }
        Err(e) => return Err(ApplyError::Analysis { source: e }),
    };

    if fragments.is_empty() {
        return Ok((sql.to_string(), ApplyStats::miss(0, 0)));
    }

    // Probe: fetching the set doubles as the status check, `get` only
    // returns entries with status ok.
    let mut repos = store.repositories().await;
    let mut hits: Vec<(&FragmentQuery, ValueSet)> = Vec::new();
    for fragment in &fragments {
        if let Some(set) = repos
            .entries()
            .get(partition_key, &fragment.fingerprint)
            .await
            .context(StoreSnafu)?
        {
            hits.push((fragment, set));
        }
    }

    let generated = fragments.len();
    if hits.is_empty() {
        return Ok((sql.to_string(), ApplyStats::miss(generated, generated)));
    }

    // Keep the maximal hits: fragments whose conjunct subset is not
    // strictly contained in another hit's.
    let maximal: Vec<(&FragmentQuery, ValueSet)> = hits
        .iter()
        .filter(|(fragment, _)| {
            !hits.iter().any(|(other, _)| {
                other.bundle_indices.len() > fragment.bundle_indices.len()
                    && other.covers(fragment)
            })
        })
        .map(|(fragment, set)| (*fragment, set.clone()))
        .collect();

    let constraint = intersect_all(maximal.iter().map(|(_, set)| set.clone()))
        .context(SetsSnafu)?
        .expect("at least one maximal hit");
    let cardinality = constraint.cardinality();

    // Materialise small sets; prefer the lazy in-database form otherwise.
    let fingerprints: Vec<_> = maximal
        .iter()
        .map(|(fragment, _)| fragment.fingerprint.clone())
        .collect();
    let lazy = if cardinality > options.materialise_threshold {
        store.lazy_subquery(partition_key, &fingerprints)
    } else {
        None
    };
    let method = match &lazy {
        Some(_) => ApplyMethod::Lazy,
        None => {
            if cardinality > options.materialise_threshold {
                warn!(
                    partition_key,
                    cardinality,
                    threshold = options.materialise_threshold,
                    "materialising a large set, store has no lazy form",
                );
            }
            ApplyMethod::Materialised
        }
    };

    let constraint_expr = match &lazy {
        Some(subquery) => lazy_expr(&analyzed.fact.alias, partition_key, subquery)?,
        None => materialised_expr(&analyzed.fact.alias, partition_key, &constraint),
    };
    let rewritten = splice_constraint(sql, constraint_expr)?;

    let reduction_pct = match repos
        .partitions()
        .get(partition_key)
        .await
        .context(StoreSnafu)?
        .and_then(|meta| meta.total_keys)
    {
        Some(total) if total > 0 => Some(1.0 - (cardinality as f64 / total as f64)),
        _ => None,
    };

    let stats = ApplyStats {
        fragments_generated: generated,
        fragments_probed: generated,
        fragments_hit: hits.len(),
        cardinality: Some(cardinality),
        method: Some(method),
        reduction_pct,
        enhanced: true,
    };
    debug!(
        partition_key,
        hits = stats.fragments_hit,
        probed = stats.fragments_probed,
        cardinality,
        ?method,
        "applied cache",
    );
    Ok((rewritten, stats))
}

fn partition_column(fact_alias: &str, partition_key: &str) -> Expr {
    Expr::CompoundIdentifier(vec![
        Ident::new(fact_alias.to_string()),
        Ident::new(partition_key.to_string()),
    ])
}

/// `fact.P IN (v1, v2, ...)`; an empty set becomes a constant-false
/// predicate, which is the empty set's exact meaning.
fn materialised_expr(fact_alias: &str, partition_key: &str, set: &ValueSet) -> Expr {
    let values = set.values();
    if values.is_empty() {
        return Expr::Value(ast::Value::Boolean(false));
    }

    let list = values.iter().map(value_literal).collect();
    Expr::InList {
        expr: Box::new(partition_column(fact_alias, partition_key)),
        list,
        negated: false,
    }
}

fn value_literal(value: &Value) -> Expr {
    match value {
        Value::Int32(v) => Expr::Value(ast::Value::Number(v.to_string(), false)),
        Value::Int64(v) => Expr::Value(ast::Value::Number(v.to_string(), false)),
        Value::Float(v) => Expr::Value(ast::Value::Number(v.to_string(), false)),
        Value::Text(s) => Expr::Value(ast::Value::SingleQuotedString(s.clone())),
        Value::Timestamp(ts) => Expr::Value(ast::Value::SingleQuotedString(
            ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        )),
    }
}

/// `fact.P IN (<lazy subquery>)`.
fn lazy_expr(fact_alias: &str, partition_key: &str, subquery: &str) -> Result<Expr> {
    let statements =
        Parser::parse_sql(&GenericDialect {}, subquery).map_err(|e| ApplyError::Rewrite {
            message: e.to_string(),
        })?;
    let query = match statements.into_iter().next() {
        Some(Statement::Query(query)) => query,
        _ => {
            return RewriteSnafu {
                message: "lazy subquery is not a SELECT".to_string(),
            }
            .fail()
        }
    };
    Ok(Expr::InSubquery {
        expr: Box::new(partition_column(fact_alias, partition_key)),
        subquery: query,
        negated: false,
    })
}

/// Add `constraint` as one extra top-level AND, leaving every original
/// clause and the projection untouched.
fn splice_constraint(sql: &str, constraint: Expr) -> Result<String> {
    let mut statements =
        Parser::parse_sql(&GenericDialect {}, sql).map_err(|e| ApplyError::Rewrite {
            message: e.to_string(),
        })?;
    let statement = match statements.len() {
        1 => statements.remove(0),
        n => {
            return RewriteSnafu {
                message: format!("expected one statement, got {n}"),
            }
            .fail()
        }
    };

    let mut query = match statement {
        Statement::Query(query) => query,
        _ => {
            return RewriteSnafu {
                message: "not a SELECT".to_string(),
            }
            .fail()
        }
    };

    match &mut *query.body {
        SetExpr::Select(select) => {
            select.selection = Some(match select.selection.take() {
                // Parenthesise the original WHERE so a top-level OR keeps
                // its meaning under the extra AND.
                Some(existing) => Expr::BinaryOp {
                    left: Box::new(Expr::Nested(Box::new(existing))),
                    op: ast::BinaryOperator::And,
                    right: Box::new(constraint),
                },
                None => constraint,
            });
        }
        _ => {
            return RewriteSnafu {
                message: "not a plain SELECT".to_string(),
            }
            .fail()
        }
    }

    Ok(Statement::Query(query).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{BackendKind, Datatype, Fingerprint};
    use pcache_store::mem::MemCacheStore;

    const PK: &str = "lo_custkey";
    const QUERY: &str = "SELECT lo_custkey, lo_revenue FROM lineorder \
        WHERE lo_custkey IN (SELECT c_custkey FROM customer WHERE c_region = 'ASIA') \
        AND lo_suppkey IN (SELECT s_suppkey FROM supplier WHERE s_region = 'ASIA') \
        AND lo_orderdate IN (SELECT d_datekey FROM date_dim WHERE d_year BETWEEN 1992 AND 1997)";

    fn ints(values: &[i32]) -> Vec<Value> {
        values.iter().copied().map(Value::Int32).collect()
    }

    fn fragments() -> Vec<FragmentQuery> {
        let analyzed = analyze(QUERY, "lineorder").unwrap();
        generate_variants(&analyzed, PK, &VariantConfig::default()).unwrap()
    }

    async fn store_with_partition() -> MemCacheStore {
        let store = MemCacheStore::new(BackendKind::Array);
        let mut repos = store.repositories().await;
        repos
            .partitions()
            .create_or_get(PK, Datatype::Int32)
            .await
            .unwrap();
        store
    }

    async fn put(store: &MemCacheStore, fingerprint: &Fingerprint, values: &[Value]) {
        let mut repos = store.repositories().await;
        repos.entries().put(PK, fingerprint, values).await.unwrap();
    }

    #[tokio::test]
    async fn miss_returns_the_query_unchanged() {
        let store = store_with_partition().await;
        let (rewritten, stats) =
            apply_cache(&store, QUERY, PK, &ApplyOptions::new("lineorder")).await;

        assert_eq!(rewritten, QUERY);
        assert!(!stats.enhanced);
        assert_eq!(stats.fragments_probed, 7);
        assert_eq!(stats.fragments_hit, 0);
    }

    #[tokio::test]
    async fn single_hit_is_spliced_as_a_literal_list() {
        let store = store_with_partition().await;
        let all = fragments();
        // Cache only the single-conjunct date fragment.
        let date_only = all
            .iter()
            .find(|f| f.bundle_indices == vec![2])
            .unwrap();
        put(&store, &date_only.fingerprint, &ints(&[5, 7])).await;

        let (rewritten, stats) =
            apply_cache(&store, QUERY, PK, &ApplyOptions::new("lineorder")).await;

        assert!(stats.enhanced);
        assert_eq!(stats.fragments_hit, 1);
        assert_eq!(stats.cardinality, Some(2));
        assert_eq!(stats.method, Some(ApplyMethod::Materialised));
        assert!(rewritten.contains("lineorder.lo_custkey IN (5, 7)"));
        // The original clauses survive.
        assert!(rewritten.contains("c_region = 'ASIA'"));
        assert!(rewritten.contains("s_region = 'ASIA'"));
    }

    #[tokio::test]
    async fn maximal_hit_shadows_its_subsets() {
        let store = store_with_partition().await;
        let all = fragments();
        let full = all.iter().find(|f| f.bundle_indices.len() == 3).unwrap();
        let singleton = all
            .iter()
            .find(|f| f.bundle_indices == vec![2])
            .unwrap();

        put(&store, &full.fingerprint, &ints(&[1, 2])).await;
        put(&store, &singleton.fingerprint, &ints(&[1, 2, 3, 4])).await;

        let (rewritten, stats) =
            apply_cache(&store, QUERY, PK, &ApplyOptions::new("lineorder")).await;

        // Both hit, but only the maximal (full) set constrains the query.
        assert_eq!(stats.fragments_hit, 2);
        assert_eq!(stats.cardinality, Some(2));
        assert!(rewritten.contains("lineorder.lo_custkey IN (1, 2)"));
    }

    #[tokio::test]
    async fn incomparable_maximal_hits_are_intersected() {
        let store = store_with_partition().await;
        let all = fragments();
        let a = all.iter().find(|f| f.bundle_indices == vec![0, 1]).unwrap();
        let b = all.iter().find(|f| f.bundle_indices == vec![1, 2]).unwrap();

        put(&store, &a.fingerprint, &ints(&[1, 2, 3])).await;
        put(&store, &b.fingerprint, &ints(&[2, 3, 4])).await;

        let (rewritten, stats) =
            apply_cache(&store, QUERY, PK, &ApplyOptions::new("lineorder")).await;

        assert_eq!(stats.fragments_hit, 2);
        assert_eq!(stats.cardinality, Some(2));
        assert!(rewritten.contains("lineorder.lo_custkey IN (2, 3)"));
    }

    #[tokio::test]
    async fn empty_intersection_becomes_constant_false() {
        let store = store_with_partition().await;
        let all = fragments();
        let a = all.iter().find(|f| f.bundle_indices == vec![0, 1]).unwrap();
        let b = all.iter().find(|f| f.bundle_indices == vec![1, 2]).unwrap();

        put(&store, &a.fingerprint, &ints(&[1])).await;
        put(&store, &b.fingerprint, &ints(&[2])).await;

        let (rewritten, stats) =
            apply_cache(&store, QUERY, PK, &ApplyOptions::new("lineorder")).await;

        assert_eq!(stats.cardinality, Some(0));
        assert!(stats.enhanced);
        assert!(rewritten.contains("AND false"));
    }

    #[tokio::test]
    async fn tombstones_are_misses() {
        let store = store_with_partition().await;
        let all = fragments();
        let date_only = all
            .iter()
            .find(|f| f.bundle_indices == vec![2])
            .unwrap();

        let mut repos = store.repositories().await;
        repos
            .entries()
            .mark(PK, &date_only.fingerprint, data_types::CacheStatus::Limit)
            .await
            .unwrap();
        drop(repos);

        let (rewritten, stats) =
            apply_cache(&store, QUERY, PK, &ApplyOptions::new("lineorder")).await;
        assert!(!stats.enhanced);
        assert_eq!(rewritten, QUERY);
    }

    #[tokio::test]
    async fn unanalysable_queries_degrade_to_no_rewrite() {
        let store = store_with_partition().await;
        let sql = "SELECT a FROM x UNION SELECT a FROM y";
        let (rewritten, stats) =
            apply_cache(&store, sql, PK, &ApplyOptions::new("lineorder")).await;
        assert_eq!(rewritten, sql);
        assert!(!stats.enhanced);
    }

    #[tokio::test]
    async fn reduction_percentage_uses_recorded_total() {
        let store = store_with_partition().await;
        let mut repos = store.repositories().await;
        repos.partitions().set_total_keys(PK, 100).await.unwrap();
        drop(repos);

        let all = fragments();
        let date_only = all
            .iter()
            .find(|f| f.bundle_indices == vec![2])
            .unwrap();
        put(&store, &date_only.fingerprint, &ints(&[1, 2, 3, 4, 5])).await;

        let (_, stats) = apply_cache(&store, QUERY, PK, &ApplyOptions::new("lineorder")).await;
        let reduction = stats.reduction_pct.unwrap();
        assert!((reduction - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn large_sets_materialise_when_no_lazy_form_exists() {
        let store = store_with_partition().await;
        let all = fragments();
        let date_only = all
            .iter()
            .find(|f| f.bundle_indices == vec![2])
            .unwrap();
        put(&store, &date_only.fingerprint, &ints(&[1, 2, 3])).await;

        let mut options = ApplyOptions::new("lineorder");
        options.materialise_threshold = 2;
        let (rewritten, stats) = apply_cache(&store, QUERY, PK, &options).await;

        // The in-memory store cannot enumerate inside the database, so the
        // rewrite still materialises.
        assert_eq!(stats.method, Some(ApplyMethod::Materialised));
        assert!(rewritten.contains("IN (1, 2, 3)"));
    }

    #[tokio::test]
    async fn queries_without_where_have_nothing_to_probe() {
        let store = store_with_partition().await;
        let sql = "SELECT lo_custkey FROM lineorder";
        let (rewritten, stats) =
            apply_cache(&store, sql, PK, &ApplyOptions::new("lineorder")).await;

        // No conjuncts: nothing to probe, nothing to rewrite.
        assert_eq!(rewritten, sql);
        assert!(!stats.enhanced);
        assert_eq!(stats.fragments_probed, 0);
    }
}
