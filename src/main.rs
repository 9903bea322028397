//! Bulk-data tester CLI
//!
//! Runs a conformance catalog against a bulk data export server and reports
//! the result of every test.

use bdt::common::logging;
use bdt::{cli, commands};
use clap::Parser;
use commands::Commands;

#[derive(Parser)]
#[command(name = "bdt", about = "Bulk data export conformance tester")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    logging::init_cli(cli.command.verbose());

    if let Err(e) = cli::dispatch(cli.command).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
