//! CLI command definitions
//!
//! Defines the clap commands for the bulk-data tester.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Print the test catalog as JSON
    #[command(alias = "ls")]
    List,

    /// Run the whole catalog or the group/test at PATH
    Run {
        /// Dot-separated path of the node to run (e.g. "0" or "0.2")
        path: Option<String>,

        /// Settings file (default: the user config directory)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Verbose output
        #[arg(long, short)]
        verbose: bool,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    /// Whether debug logging was requested
    pub fn verbose(&self) -> bool {
        matches!(self, Commands::Run { verbose: true, .. })
    }
}
