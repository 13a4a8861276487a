//! End-to-end scenarios over the in-memory store: populate the cache
//! through the queue + worker pipeline, then apply it to related queries.

use applicator::{apply_cache, ApplyOptions};
use data_types::{BackendKind, Datatype, ProcessOutcome, Value, WorkerId};
use pcache_store::executor::MockExecutor;
use pcache_store::interface::CacheStore;
use pcache_store::mem::MemCacheStore;
use populator::{add_to_queue, process_once, WorkerConfig};
use query_analysis::{analyze, generate_variants, VariantConfig};

fn ints(values: &[i32]) -> Vec<Value> {
    values.iter().copied().map(Value::Int32).collect()
}

async fn drain(store: &MemCacheStore, executor: &MockExecutor, config: &WorkerConfig) {
    for _ in 0..64 {
        match process_once(store, executor, config).await.unwrap() {
            ProcessOutcome::NoJobs => return,
            _ => continue,
        }
    }
    panic!("worker did not drain the queue");
}

/// Star-schema cross-dimension reuse: after populating the fragments of an
/// ASIA/ASIA/1992-1997 query, a UNITED STATES variant with the same date
/// range hits exactly the date-only fragment.
#[tokio::test]
async fn star_schema_cross_dimension_reuse() {
    test_helpers::maybe_start_logging();

    const POPULATE: &str = "SELECT lo_custkey FROM lineorder \
        WHERE lo_custkey IN (SELECT c_custkey FROM customer WHERE c_region = 'ASIA') \
        AND lo_suppkey IN (SELECT s_suppkey FROM supplier WHERE s_region = 'ASIA') \
        AND lo_orderdate IN (SELECT d_datekey FROM date_dim WHERE d_year BETWEEN 1992 AND 1997)";
    const READ: &str = "SELECT lo_custkey FROM lineorder \
        WHERE lo_custkey IN (SELECT c_custkey FROM customer WHERE c_nation = 'UNITED STATES') \
        AND lo_suppkey IN (SELECT s_suppkey FROM supplier WHERE s_nation = 'UNITED STATES') \
        AND lo_orderdate IN (SELECT d_datekey FROM date_dim WHERE d_year BETWEEN 1992 AND 1997)";

    let store = MemCacheStore::new(BackendKind::Array);
    let config = WorkerConfig::new(WorkerId::new("scenario"), "lineorder");

    // Canned execution results: the date-only fragment gets recognisable
    // values, everything else a default set.
    let analyzed = analyze(POPULATE, "lineorder").unwrap();
    let fragments = generate_variants(&analyzed, "lo_custkey", &VariantConfig::default()).unwrap();
    assert_eq!(fragments.len(), 7);
    let date_only = fragments
        .iter()
        .find(|f| f.bundle_indices == vec![2])
        .unwrap();
    let executor = MockExecutor::new()
        .with_default(ints(&[1, 2, 3]))
        .with_response(date_only.sql.clone(), ints(&[42, 99]));

    // Write path: enqueue, expand, build all 7 fragments.
    add_to_queue(&store, POPULATE, "lo_custkey", Datatype::Int32, 0)
        .await
        .unwrap();
    drain(&store, &executor, &config).await;

    let mut repos = store.repositories().await;
    assert_eq!(repos.entries().list("lo_custkey").await.unwrap().len(), 7);
    drop(repos);

    // Read path: only the date fragment carries over to the US query.
    let (rewritten, stats) =
        apply_cache(&store, READ, "lo_custkey", &ApplyOptions::new("lineorder")).await;

    assert_eq!(stats.fragments_probed, 7);
    assert_eq!(stats.fragments_hit, 1);
    assert!(stats.enhanced);
    assert_eq!(stats.cardinality, Some(2));
    assert!(rewritten.contains("lineorder.lo_custkey IN (42, 99)"));
    assert!(rewritten.contains("c_nation = 'UNITED STATES'"));
}

/// Dual-duty partition key: the same key constrained through two
/// independent subqueries yields independent fragments, and dropping one
/// conjunct still hits the other's fragment.
#[tokio::test]
async fn dual_duty_partition_key() {
    test_helpers::maybe_start_logging();

    const POPULATE: &str = "SELECT l_orderkey FROM lineitem \
        WHERE l_orderkey IN (SELECT o_orderkey FROM orders WHERE o_custkey IN \
            (SELECT c_custkey FROM customer WHERE c_nation = 'FRANCE')) \
        AND l_orderkey IN (SELECT o_orderkey FROM orders WHERE o_orderdate >= '1995-01-01')";
    const READ: &str = "SELECT l_orderkey FROM lineitem \
        WHERE l_orderkey IN (SELECT o_orderkey FROM orders WHERE o_custkey IN \
            (SELECT c_custkey FROM customer WHERE c_nation = 'FRANCE'))";

    let store = MemCacheStore::new(BackendKind::Array);
    let config = WorkerConfig::new(WorkerId::new("scenario"), "lineitem");

    // Both membership tests target l_orderkey yet stay independent
    // conjuncts.
    let analyzed = analyze(POPULATE, "lineitem").unwrap();
    assert_eq!(analyzed.bundles.len(), 2);
    let fragments = generate_variants(&analyzed, "l_orderkey", &VariantConfig::default()).unwrap();
    assert_eq!(fragments.len(), 3);

    let customer_only = fragments
        .iter()
        .find(|f| f.bundle_indices == vec![0])
        .unwrap();
    let executor = MockExecutor::new()
        .with_default(ints(&[10, 20]))
        .with_response(customer_only.sql.clone(), ints(&[7, 8, 9]));

    add_to_queue(&store, POPULATE, "l_orderkey", Datatype::Int32, 0)
        .await
        .unwrap();
    drain(&store, &executor, &config).await;

    // The narrower query consists of exactly the customer conjunct, so its
    // whole-WHERE fragment is the cached customer-only fragment.
    let (rewritten, stats) =
        apply_cache(&store, READ, "l_orderkey", &ApplyOptions::new("lineitem")).await;

    assert_eq!(stats.fragments_probed, 1);
    assert_eq!(stats.fragments_hit, 1);
    assert_eq!(stats.cardinality, Some(3));
    assert!(rewritten.contains("lineitem.l_orderkey IN (7, 8, 9)"));
}
