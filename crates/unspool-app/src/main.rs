#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]

//! Binary entrypoint that loads the configuration and runs the orchestrator
//! until a shutdown signal arrives.

use clap::Parser;
use unspool_app::{AppResult, Cli, run_app};

/// Parse arguments and block until shutdown.
#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();
    run_app(cli).await
}
