//! Expansion of original-queue items into fragment-queue items.

use crate::{Result, WorkerConfig};
use data_types::{OriginalQueueItem, QueryLogStatus};
use pcache_store::interface::RepoCollection;
use query_analysis::{analyze, generate_variants, whole_where_fragment, Error as AnalysisError};
use tracing::{debug, info, warn};

/// Expand one original query into fragment-queue items. Unanalysable
/// queries are logged and dropped; the queue item is already consumed.
pub(crate) async fn expand_original(
    repos: &mut dyn RepoCollection,
    item: &OriginalQueueItem,
    config: &WorkerConfig,
) -> Result<usize> {
    let analyzed = match analyze(&item.sql, &config.fact_table) {
        Ok(analyzed) => analyzed,
        Err(e) => {
            warn!(
                partition_key = %item.partition_key,
                error = %e,
                "original query is not analysable, dropping",
            );
            return Ok(0);
        }
    };

    let fragments = match generate_variants(&analyzed, &item.partition_key, &config.variants) {
        Ok(fragments) => fragments,
        Err(AnalysisError::VariantExplosion { conjuncts, bound }) => {
            // Too wide a lattice: fall back to the single whole-WHERE
            // fragment, which is always safe to cache.
            warn!(
                conjuncts,
                bound, "variant explosion, falling back to the whole-WHERE fragment"
            );
            whole_where_fragment(&analyzed, &item.partition_key)
                .into_iter()
                .collect()
        }
        Err(e) => {
            warn!(error = %e, "variant generation failed, dropping");
            return Ok(0);
        }
    };

    if fragments.is_empty() {
        debug!(partition_key = %item.partition_key, "query has no cacheable conjuncts");
        return Ok(0);
    }

    repos
        .partitions()
        .create_or_get(&item.partition_key, item.datatype)
        .await
        .map_err(|source| crate::Error::Store { source })?;

    let mut queued = 0;
    for fragment in &fragments {
        let outcome = repos
            .queue()
            .push_fragment(
                &fragment.sql,
                &fragment.fingerprint,
                &item.partition_key,
                item.datatype,
                item.priority,
            )
            .await
            .map_err(|source| crate::Error::Store { source })?;
        debug!(
            fingerprint = %fragment.fingerprint,
            ?outcome,
            "queued fragment",
        );
        queued += 1;
    }

    // Keep the original statement for audit, keyed by its own fingerprint.
    if let Ok(original_fp) = fingerprint::fingerprint(&item.sql) {
        repos
            .query_log()
            .upsert(
                &item.partition_key,
                &original_fp,
                &item.sql,
                QueryLogStatus::Expanded,
            )
            .await
            .map_err(|source| crate::Error::Store { source })?;
    }

    info!(
        partition_key = %item.partition_key,
        fragments = fragments.len(),
        "expanded original query",
    );
    Ok(queued)
}
