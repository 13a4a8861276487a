//! Shared bring-up for tests: tracing installation and gating of
//! integration tests on externally provided databases.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

/// Re-exported so macros can reach it without the caller depending on
/// `dotenvy`.
pub use dotenvy;

static LOGGING: Lazy<()> = Lazy::new(|| {
    tracing_log::LogTracer::init().ok();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
});

/// Install a tracing subscriber honouring `RUST_LOG` once per process.
///
/// Safe to call from every test; later calls are no-ops.
pub fn maybe_start_logging() {
    Lazy::force(&LOGGING);
}

/// Name of the environment variable gating Postgres integration tests.
pub const DSN_ENV: &str = "TEST_PCACHE_DSN";

/// Fetch the integration-test DSN, if configured.
pub fn integration_dsn() -> Option<String> {
    dotenvy::dotenv().ok();
    match std::env::var(DSN_ENV) {
        Ok(dsn) if !dsn.is_empty() => Some(dsn),
        _ => None,
    }
}

/// Skip the current test unless a Postgres DSN was provided via
/// [`DSN_ENV`]; evaluates to the DSN otherwise.
#[macro_export]
macro_rules! maybe_skip_integration {
    () => {{
        $crate::maybe_start_logging();
        match $crate::integration_dsn() {
            Some(dsn) => dsn,
            None => {
                eprintln!(
                    "skipping integration test; set {} to run against Postgres",
                    $crate::DSN_ENV
                );
                return;
            }
        }
    }};
}
