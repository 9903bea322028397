//! Console and JSON-lines rendering of run events

use colored::Colorize;
use tokio::sync::mpsc;

use crate::testing::{NodeSnapshot, RunEvent, RunReport, RunState, Status};

/// Print events until the runner closes the channel
pub async fn stream(mut events: mpsc::UnboundedReceiver<RunEvent>, json: bool) {
    while let Some(event) = events.recv().await {
        let line = if json {
            match serde_json::to_string(&event) {
                Ok(line) => Some(line),
                Err(e) => {
                    tracing::warn!("Failed to serialize event: {}", e);
                    None
                }
            }
        } else {
            render_event(&event)
        };
        if let Some(line) = line {
            println!("{}", line);
        }
    }
}

fn indent(node: &NodeSnapshot) -> String {
    "  ".repeat(node.depth().saturating_sub(1))
}

/// Console line for an event; `None` for events that print nothing
pub fn render_event(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::GroupStart(group) if !group.path.is_empty() => Some(format!(
            "{}{}",
            indent(group),
            group.name.cyan().bold()
        )),
        RunEvent::TestEnd(test) => {
            let record = test.record.as_ref()?;
            let symbol = match record.status {
                Status::Succeeded => "✓".green(),
                Status::Failed => "✗".red(),
                Status::Warned => "!".yellow(),
                Status::NotSupported => "-".dimmed(),
                Status::NotImplemented => "?".dimmed(),
                Status::Loading => "…".dimmed(),
            };
            let mut line = format!("{}{} {}", indent(test), symbol, test.name);
            if let Some(error) = &record.error {
                line.push_str(&format!("\n{}    {}", indent(test), error.message.red()));
            }
            for warning in &record.warnings {
                line.push_str(&format!("\n{}    {}", indent(test), warning.yellow().dimmed()));
            }
            Some(line)
        }
        _ => None,
    }
}

/// Final tally of a run
pub fn render_summary(report: &RunReport) -> String {
    let counts = [
        (Status::Succeeded, "passed"),
        (Status::Failed, "failed"),
        (Status::Warned, "warned"),
        (Status::NotSupported, "not supported"),
        (Status::NotImplemented, "not implemented"),
    ];
    let parts: Vec<String> = counts
        .iter()
        .filter_map(|(status, label)| {
            let count = report.count(*status);
            (count > 0).then(|| format!("{} {}", count, label))
        })
        .collect();

    let tally = if parts.is_empty() {
        "no tests ran".to_string()
    } else {
        parts.join(", ")
    };
    let headline = match report.state {
        RunState::Canceled => "Run canceled".yellow().bold(),
        _ if report.count(Status::Failed) > 0 => "Tests Failed".red().bold(),
        _ => "Tests Passed".green().bold(),
    };
    format!("\n{}: {}", headline, tally)
}
