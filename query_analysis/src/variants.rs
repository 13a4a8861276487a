//! Enumeration of the conjunct-subset lattice into fragment queries.

use crate::{analyzer::AnalyzedQuery, Result, VariantExplosionSnafu};
use data_types::Fingerprint;
use std::collections::HashSet;
use tracing::debug;

/// Bounds on variant enumeration.
#[derive(Debug, Clone, Copy)]
pub struct VariantConfig {
    /// Maximum number of conjunct bundles before the query is refused.
    pub max_conjuncts: usize,
    /// Maximum number of variants per (query, partition key); beyond it only
    /// small subsets and the full set are generated.
    pub variant_cap: usize,
}

impl Default for VariantConfig {
    fn default() -> Self {
        Self {
            max_conjuncts: 10,
            variant_cap: 1024,
        }
    }
}

/// One enumerated fragment: a SELECT producing the distinct partition key
/// values satisfying a subset of the query's conjunct bundles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentQuery {
    /// Fingerprint of the fragment.
    pub fingerprint: Fingerprint,
    /// The executable fragment SQL.
    pub sql: String,
    /// Indices into [`AnalyzedQuery::bundles`] covered by this fragment.
    pub bundle_indices: Vec<usize>,
}

impl FragmentQuery {
    /// Whether this fragment's conjunct subset contains `other`'s.
    pub fn covers(&self, other: &Self) -> bool {
        other
            .bundle_indices
            .iter()
            .all(|i| self.bundle_indices.contains(i))
    }
}

/// Enumerate all fragment queries of `analyzed` for `partition_key`,
/// largest conjunct subsets first.
///
/// Fragments that cannot be fingerprinted are dropped; their siblings
/// survive. The empty subset is never emitted: it denotes "all partition
/// keys" and can never shrink a scan.
pub fn generate_variants(
    analyzed: &AnalyzedQuery,
    partition_key: &str,
    config: &VariantConfig,
) -> Result<Vec<FragmentQuery>> {
    let n = analyzed.bundles.len();
    if n == 0 {
        return Ok(vec![]);
    }
    if n > config.max_conjuncts {
        return VariantExplosionSnafu {
            conjuncts: n,
            bound: config.max_conjuncts,
        }
        .fail();
    }

    let total = (1_usize << n) - 1;
    let k_max = if total > config.variant_cap {
        let k = max_subset_size(n, config.variant_cap);
        debug!(
            conjuncts = n,
            cap = config.variant_cap,
            k_max = k,
            "variant cap reached, limiting subset sizes"
        );
        k
    } else {
        n
    };

    let mut fragments = Vec::new();
    let mut seen: HashSet<Fingerprint> = HashSet::new();

    for size in (1..=n).rev() {
        if size != n && size > k_max {
            continue;
        }
        for_each_combination(n, size, |indices| {
            let sql = fragment_sql(analyzed, partition_key, indices);
            match fingerprint::fingerprint(&sql) {
                Ok(fp) => {
                    if seen.insert(fp.clone()) {
                        fragments.push(FragmentQuery {
                            fingerprint: fp,
                            sql,
                            bundle_indices: indices.to_vec(),
                        });
                    }
                }
                Err(e) => debug!(%sql, error = %e, "dropping unhashable fragment"),
            }
        });
    }

    Ok(fragments)
}

/// The fragment covering every bundle at once.
///
/// Callers fall back to this when the subset lattice exceeds the conjunct
/// bound: the whole-WHERE fragment is the most selective one and always
/// safe to cache on its own.
pub fn whole_where_fragment(
    analyzed: &AnalyzedQuery,
    partition_key: &str,
) -> Option<FragmentQuery> {
    let n = analyzed.bundles.len();
    if n == 0 {
        return None;
    }
    let indices: Vec<usize> = (0..n).collect();
    let sql = fragment_sql(analyzed, partition_key, &indices);
    match fingerprint::fingerprint(&sql) {
        Ok(fp) => Some(FragmentQuery {
            fingerprint: fp,
            sql,
            bundle_indices: indices,
        }),
        Err(e) => {
            debug!(%sql, error = %e, "whole-WHERE fragment is unhashable");
            None
        }
    }
}

/// Render the fragment SELECT of one conjunct subset. Dimension bundles are
/// already collapsed into fact-only predicates, so the FROM clause needs
/// nothing beyond the fact table.
fn fragment_sql(analyzed: &AnalyzedQuery, partition_key: &str, indices: &[usize]) -> String {
    let predicates: Vec<&str> = indices
        .iter()
        .map(|&i| analyzed.bundles[i].predicate_sql.as_str())
        .collect();

    format!(
        "SELECT DISTINCT {}.{} FROM {} WHERE {}",
        analyzed.fact.alias,
        partition_key,
        analyzed.fact.render_from(),
        predicates.join(" AND ")
    )
}

/// Largest `k` such that all subsets of size `<= k` (plus the full set) fit
/// within `cap`.
fn max_subset_size(n: usize, cap: usize) -> usize {
    let mut count = 1_usize; // the full set
    let mut k = 0;
    for size in 1..n {
        count = count.saturating_add(binomial(n, size));
        if count > cap {
            break;
        }
        k = size;
    }
    k.max(1)
}

fn binomial(n: usize, k: usize) -> usize {
    let k = k.min(n - k);
    let mut result = 1_usize;
    for i in 0..k {
        result = result.saturating_mul(n - i) / (i + 1);
    }
    result
}

/// Visit every `k`-combination of `0..n` in lexicographic order.
fn for_each_combination(n: usize, k: usize, mut f: impl FnMut(&[usize])) {
    let mut indices: Vec<usize> = (0..k).collect();
    loop {
        f(&indices);

        // Advance to the next combination.
        let mut i = k;
        loop {
            if i == 0 {
                return;
            }
            i -= 1;
            if indices[i] != i + n - k {
                break;
            }
        }
        indices[i] += 1;
        for j in i + 1..k {
            indices[j] = indices[j - 1] + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;
    use crate::Error;
    use assert_matches::assert_matches;

    const SSB_QUERY: &str = "SELECT lo_custkey FROM lineorder \
        WHERE lo_custkey IN (SELECT c_custkey FROM customer WHERE c_region = 'ASIA') \
        AND lo_suppkey IN (SELECT s_suppkey FROM supplier WHERE s_region = 'ASIA') \
        AND lo_orderdate IN (SELECT d_datekey FROM date_dim WHERE d_year BETWEEN 1992 AND 1997)";

    #[test]
    fn three_conjuncts_give_seven_fragments() {
        let analyzed = analyze(SSB_QUERY, "lineorder").unwrap();
        let fragments =
            generate_variants(&analyzed, "lo_custkey", &VariantConfig::default()).unwrap();

        assert_eq!(fragments.len(), 7);

        // Largest subsets first.
        assert_eq!(fragments[0].bundle_indices, vec![0, 1, 2]);
        let sizes: Vec<_> = fragments.iter().map(|f| f.bundle_indices.len()).collect();
        assert_eq!(sizes, vec![3, 2, 2, 2, 1, 1, 1]);

        // Every fragment projects the partition key off the fact table.
        for fragment in &fragments {
            assert!(fragment
                .sql
                .starts_with("SELECT DISTINCT lineorder.lo_custkey FROM lineorder WHERE "));
        }
    }

    #[test]
    fn fingerprints_ignore_the_projected_key() {
        let analyzed = analyze(SSB_QUERY, "lineorder").unwrap();
        let custkey =
            generate_variants(&analyzed, "lo_custkey", &VariantConfig::default()).unwrap();
        let suppkey =
            generate_variants(&analyzed, "lo_suppkey", &VariantConfig::default()).unwrap();

        // The canonical form strips the projection, so the same conjunct
        // subset fingerprints identically for every partition key; entries
        // are namespaced by (fingerprint, partition key).
        for (a, b) in custkey.iter().zip(&suppkey) {
            assert_eq!(a.bundle_indices, b.bundle_indices);
            assert_ne!(a.sql, b.sql);
            assert_eq!(a.fingerprint, b.fingerprint);
        }
    }

    #[test]
    fn single_fragment_fingerprint_matches_standalone_hash() {
        let analyzed = analyze(
            "SELECT trip_id FROM taxi_trips WHERE fare > 10",
            "taxi_trips",
        )
        .unwrap();
        let fragments =
            generate_variants(&analyzed, "trip_id", &VariantConfig::default()).unwrap();

        assert_eq!(fragments.len(), 1);
        assert_eq!(
            fragments[0].fingerprint,
            fingerprint::fingerprint(&fragments[0].sql).unwrap()
        );
    }

    #[test]
    fn too_many_conjuncts_is_an_explosion() {
        let conditions: Vec<String> = (0..11).map(|i| format!("c{i} = {i}")).collect();
        let sql = format!("SELECT k FROM f WHERE {}", conditions.join(" AND "));
        let analyzed = analyze(&sql, "f").unwrap();

        assert_matches!(
            generate_variants(&analyzed, "k", &VariantConfig::default()),
            Err(Error::VariantExplosion {
                conjuncts: 11,
                bound: 10
            })
        );
    }

    #[test]
    fn variant_cap_limits_subset_sizes() {
        let conditions: Vec<String> = (0..5).map(|i| format!("c{i} = {i}")).collect();
        let sql = format!("SELECT k FROM f WHERE {}", conditions.join(" AND "));
        let analyzed = analyze(&sql, "f").unwrap();

        let config = VariantConfig {
            max_conjuncts: 10,
            variant_cap: 10,
        };
        let fragments = generate_variants(&analyzed, "k", &config).unwrap();

        // Full set plus the 5 singletons: C(5,2) = 10 would blow the cap.
        assert_eq!(fragments.len(), 6);
        assert_eq!(fragments[0].bundle_indices.len(), 5);
        assert!(fragments[1..].iter().all(|f| f.bundle_indices.len() == 1));
    }

    #[test]
    fn no_bundles_no_fragments() {
        let analyzed = analyze("SELECT k FROM f", "f").unwrap();
        let fragments =
            generate_variants(&analyzed, "k", &VariantConfig::default()).unwrap();
        assert!(fragments.is_empty());
    }

    #[test]
    fn covers_is_subset_containment() {
        let analyzed = analyze(SSB_QUERY, "lineorder").unwrap();
        let fragments =
            generate_variants(&analyzed, "lo_custkey", &VariantConfig::default()).unwrap();

        let full = &fragments[0];
        for other in &fragments {
            assert!(full.covers(other));
        }
        assert!(!fragments[6].covers(full));
    }

    #[test]
    fn combination_enumeration_is_exhaustive() {
        let mut seen = Vec::new();
        for_each_combination(4, 2, |c| seen.push(c.to_vec()));
        assert_eq!(
            seen,
            vec![
                vec![0, 1],
                vec![0, 2],
                vec![0, 3],
                vec![1, 2],
                vec![1, 3],
                vec![2, 3]
            ]
        );
    }

    #[test]
    fn binomial_basics() {
        assert_eq!(binomial(5, 2), 10);
        assert_eq!(binomial(10, 1), 10);
        assert_eq!(binomial(6, 6), 1);
        assert_eq!(max_subset_size(5, 10), 1);
        assert_eq!(max_subset_size(11, 1024), 5);
    }
}
