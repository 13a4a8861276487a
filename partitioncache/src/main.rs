//! `partitioncache` — the thin command-line surface over the cache core:
//! enqueue queries, apply the cache, run workers, manage entries.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;

/// Process exit codes: 0 success, 2 configuration error, 3 runtime error.
#[derive(Debug, Clone, Copy)]
enum ReturnCode {
    ConfigError = 2,
    RuntimeError = 3,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "partitioncache",
    about = "Cache partition-key sets of analytical SQL and rewrite queries against them",
    version
)]
struct Config {
    /// Increase log verbosity (-v: debug, -vv: trace).
    #[clap(short = 'v', long = "verbose", parse(from_occurrences), global = true)]
    verbose: usize,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Enqueue a query for asynchronous cache population
    Add(commands::add::Config),

    /// Apply the cache to a query and print the rewritten SQL
    Read(commands::read::Config),

    /// Run cache-building workers until interrupted
    Monitor(commands::monitor::Config),

    /// Set up, inspect and prune the cache store
    Manage(commands::manage::Config),
}

fn init_logging(verbose: usize) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    // Load a local .env before clap resolves `env =` fallbacks.
    dotenvy::dotenv().ok();

    let config = Config::parse();
    init_logging(config.verbose);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(ReturnCode::RuntimeError as i32);
        }
    };

    let result = runtime.block_on(async {
        match config.command {
            Command::Add(config) => commands::add::command(config).await,
            Command::Read(config) => commands::read::command(config).await,
            Command::Monitor(config) => commands::monitor::command(config).await,
            Command::Manage(config) => commands::manage::command(config).await,
        }
    });

    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            let code = if e.is_config_error() {
                ReturnCode::ConfigError
            } else {
                ReturnCode::RuntimeError
            };
            std::process::exit(code as i32);
        }
    }
}
