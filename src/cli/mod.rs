//! CLI command handling
//!
//! Loads settings, runs the catalog and streams progress to the terminal.

mod reporter;

use std::path::PathBuf;

use crate::commands::Commands;
use crate::common::{Error, Result, Settings};
use crate::suites;
use crate::testing::{Runner, Status};

pub use reporter::{render_event, render_summary};

/// Dispatch a CLI command
pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::List => {
            let catalog = suites::catalog().catalog();
            println!("{}", serde_json::to_string_pretty(&catalog)?);
            Ok(())
        }

        Commands::Run {
            path,
            config,
            verbose: _,
            json,
        } => run(path.unwrap_or_default(), config, json).await,
    }
}

async fn run(path: String, config: Option<PathBuf>, json: bool) -> Result<()> {
    let settings = Settings::load(config.as_deref())?;
    tracing::debug!("Testing server at {}", settings.base_url);

    let tree = suites::catalog();
    let runner = Runner::new(settings);
    let reporter = tokio::spawn(reporter::stream(runner.subscribe(), json));

    let cancel = runner.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, finishing the current test");
            cancel.cancel();
        }
    });

    let outcome = runner.run(&tree, &path).await;
    interrupt.abort();

    // Dropping the runner closes the event channel and ends the reporter
    drop(runner);
    reporter
        .await
        .map_err(|e| Error::Internal(format!("Reporter task failed: {}", e)))?;

    let report = outcome?;
    if !json {
        println!("{}", render_summary(&report));
    }

    let failed = report.count(Status::Failed);
    if failed > 0 {
        return Err(Error::RunFailed {
            failed,
            total: report.tests.len(),
        });
    }
    Ok(())
}
