//! Decomposition of analytical SQL into cacheable fragment queries.
//!
//! The [analyzer](analyzer::analyze) locates the fact table in a SELECT,
//! walks its join graph and extracts *conjunct bundles*: self-contained
//! predicates over the fact table, each restricting the set of partition
//! key values the query can produce. The [variant generator](variants)
//! then enumerates the subset lattice of those bundles into fragment
//! queries, each with a stable fingerprint.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::Snafu;

pub mod analyzer;
pub mod variants;

pub use analyzer::{analyze, AnalyzedQuery, BundleKind, ConjunctBundle, TableOccurrence};
pub use variants::{generate_variants, whole_where_fragment, FragmentQuery, VariantConfig};

/// Errors for queries the analyser cannot decompose; such queries bypass
/// the cache.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("query is not parseable SQL: {source}"))]
    Parse {
        source: sqlparser::parser::ParserError,
    },

    #[snafu(display("expected exactly one SELECT statement, got {count}"))]
    StatementCount { count: usize },

    #[snafu(display("statement is not a SELECT"))]
    NotASelect,

    #[snafu(display("set operations (UNION/INTERSECT/EXCEPT) are not analysable"))]
    SetOperation,

    #[snafu(display("WITH clauses are not analysable"))]
    WithClause,

    #[snafu(display("top-level WHERE is a disjunction, not a conjunction"))]
    NotConjunctive,

    #[snafu(display("fact table {table} does not appear in the query"))]
    FactTableMissing { table: String },

    #[snafu(display(
        "query has {conjuncts} cacheable conjuncts, more than the configured bound {bound}"
    ))]
    VariantExplosion { conjuncts: usize, bound: usize },
}

/// Convenience result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
