//! Stable fingerprints for fragment queries.
//!
//! A fragment's fingerprint is a 128 bit hash over its canonical form.
//! Fragments that differ only in alias names, conjunct order, `IN`-list
//! element order or whitespace share a fingerprint; fragments that differ
//! in any semantically relevant token do not.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::Fingerprint;
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};
use sqlparser::{ast::Statement, dialect::GenericDialect, parser::Parser};
use std::fmt::Write;

mod canon;

/// Errors for fragments that cannot be canonicalised and therefore cannot
/// be hashed.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("fragment is not parseable SQL: {source}"))]
    Parse {
        source: sqlparser::parser::ParserError,
    },

    #[snafu(display("fragment must be exactly one SELECT statement, got {count}"))]
    StatementCount { count: usize },

    #[snafu(display("fragment is not a SELECT statement"))]
    NotASelect,

    #[snafu(display("fragment cannot be canonicalised: {reason}"))]
    Unsupported { reason: String },
}

/// Convenience result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Compute the canonical form of a fragment SELECT.
///
/// Exposed separately from [`fingerprint`] so that tests and diagnostics can
/// inspect what actually gets hashed.
pub fn canonicalize(sql: &str) -> Result<String> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql).context(ParseSnafu)?;
    if statements.len() != 1 {
        return StatementCountSnafu {
            count: statements.len(),
        }
        .fail();
    }

    let query = match statements.into_iter().next().expect("one statement") {
        Statement::Query(query) => query,
        _ => return NotASelectSnafu.fail(),
    };

    let mut lowered = canon::lower_statement(&query)
        .map_err(|reason| Error::Unsupported { reason })?;
    canon::normalize_query(&mut lowered.query, &lowered.tables);

    let mut out = String::new();
    canon::Serializer::canonical(&lowered.tables).query(&lowered.query, &mut out);
    Ok(out)
}

/// Compute the fingerprint of a fragment SELECT.
pub fn fingerprint(sql: &str) -> Result<Fingerprint> {
    let canonical = canonicalize(sql)?;
    let digest = Sha256::digest(canonical.as_bytes());

    // 128 bits are plenty for collision resistance here; hex-encode the
    // first half of the digest.
    let mut hex = String::with_capacity(32);
    for byte in &digest[..16] {
        write!(hex, "{byte:02x}").expect("write to string");
    }
    Ok(Fingerprint::new(hex))
}
