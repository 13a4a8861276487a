//! Building blocks for the partition cache CLI: clap config structs shared
//! by every subcommand, each mappable from `PCACHE_*` environment
//! variables.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod store;
pub mod worker;
