//! The partition cache store: persists, per partition key and fragment
//! fingerprint, the set of partition key values the fragment produces.
//!
//! The [interface] module defines the capability seam every store
//! implements; [mem] is the in-memory store used by tests and
//! single-process deployments; [postgres] is the durable reference store.
//! [sets] holds the value-set representations and their intersection
//! kernels, and [executor] the seam through which workers run fragment
//! queries against the user's database.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod executor;
pub mod interface;
pub mod mem;
pub mod postgres;
pub mod sets;

use data_types::CacheEntryInfo;

/// List all fragments of one partition key: fingerprint, cardinality,
/// last-seen and status per entry.
pub async fn list_fragments(
    store: &dyn interface::CacheStore,
    partition_key: &str,
) -> interface::Result<Vec<CacheEntryInfo>> {
    let mut repos = store.repositories().await;
    repos.entries().list(partition_key).await
}
