//! Worker pool parameters.

use query_analysis::VariantConfig;
use std::time::Duration;

/// Knobs of the queue + worker pipeline.
#[derive(Debug, Clone, clap::Parser)]
pub struct WorkerRunConfig {
    /// Fact table the analyser roots its join graph at.
    #[clap(long = "--fact-table", env = "PCACHE_FACT_TABLE")]
    pub fact_table: String,

    /// Number of concurrent workers.
    #[clap(
        long = "--max-parallel-workers",
        env = "PCACHE_MAX_PARALLEL_WORKERS",
        default_value = "2"
    )]
    pub max_parallel_workers: usize,

    /// Sleep between worker ticks when the queue is empty.
    #[clap(
        long = "--frequency",
        env = "PCACHE_FREQUENCY",
        default_value = "1s",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub frequency: Duration,

    /// Statement timeout of one fragment execution.
    #[clap(
        long = "--statement-timeout",
        env = "PCACHE_STATEMENT_TIMEOUT",
        default_value = "1800s",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub statement_timeout: Duration,

    /// Fragments producing at least this many distinct values are
    /// tombstoned instead of cached.
    #[clap(long = "--result-limit", env = "PCACHE_RESULT_LIMIT")]
    pub result_limit: Option<usize>,

    /// Active-job rows older than this are treated as crashed workers.
    #[clap(
        long = "--stale-after",
        env = "PCACHE_STALE_AFTER",
        default_value = "5m",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub stale_after: Duration,

    /// Maximum cacheable conjuncts per query before expansion refuses.
    #[clap(
        long = "--max-conjuncts",
        env = "PCACHE_MAX_CONJUNCTS",
        default_value = "10"
    )]
    pub max_conjuncts: usize,

    /// Maximum fragment variants per (query, partition key).
    #[clap(
        long = "--variant-cap",
        env = "PCACHE_VARIANT_CAP",
        default_value = "1024"
    )]
    pub variant_cap: usize,
}

impl WorkerRunConfig {
    /// Variant generation bounds from the configured limits.
    pub fn variant_config(&self) -> VariantConfig {
        VariantConfig {
            max_conjuncts: self.max_conjuncts,
            variant_cap: self.variant_cap,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_match_the_documented_values() {
        let config =
            WorkerRunConfig::try_parse_from(["prog", "--fact-table", "lineorder"]).unwrap();
        assert_eq!(config.max_parallel_workers, 2);
        assert_eq!(config.statement_timeout, Duration::from_secs(1800));
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert_eq!(config.result_limit, None);
        assert_eq!(config.variant_config().max_conjuncts, 10);
        assert_eq!(config.variant_config().variant_cap, 1024);
    }

    #[test]
    fn durations_parse_humantime() {
        let config = WorkerRunConfig::try_parse_from([
            "prog",
            "--fact-table",
            "lineorder",
            "--statement-timeout",
            "30m",
        ])
        .unwrap();
        assert_eq!(config.statement_timeout, Duration::from_secs(1800));
    }
}
