use crate::{
    campaign::{CampaignReport, RunStatus},
    sweep::{RunDescriptor, SweepPlan},
};
use colored::*;
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};

fn run_cells(run: &RunDescriptor) -> Vec<TableCell> {
    vec![
        TableCell::new(run.index),
        TableCell::new(run.application.clone()),
        TableCell::new(run.exec_kind),
        TableCell::new(run.unit_count),
        TableCell::new(run.threads),
        TableCell::new(format!("{}s", run.duration)),
        TableCell::new(run.initial_size),
        TableCell::new(run.noise),
        TableCell::new(run.repeat_index),
    ]
}

fn header(extra: &[&str]) -> Row {
    let cells = [
        "Run", "Application", "Env", "Units", "Threads", "Duration", "Size", "Noise", "Repeat",
    ]
    .iter()
    .chain(extra.iter())
    .map(|h| TableCell::builder(h.bold()).build())
    .collect::<Vec<_>>();
    Row::new(cells)
}

/// The runs a campaign will execute, in order.
pub fn render_plan(plan: &SweepPlan) -> String {
    let mut table_rows = vec![header(&[])];
    table_rows.extend(plan.runs().iter().map(|run| Row::new(run_cells(run))));

    let table = Table::builder()
        .rows(table_rows)
        .style(TableStyle::rounded())
        .build();
    format!(
        "{}\n{}",
        format!(" {} runs planned ", plan.len()).reversed().green(),
        table.render()
    )
}

/// One row per run with its status and the metrics of its first unit.
pub fn render_report(report: &CampaignReport) -> String {
    let mut table_rows = vec![header(&["Status", "Metrics"])];
    for outcome in report.outcomes.iter() {
        let mut cells = run_cells(&outcome.run);
        match &outcome.status {
            RunStatus::Completed => {
                cells.push(TableCell::new("ok".green()));
                let metrics = outcome
                    .lines
                    .first()
                    .map(|line| line.len().to_string())
                    .unwrap_or_else(|| "--".to_string());
                cells.push(TableCell::new(metrics));
            }
            RunStatus::Failed(reason) => {
                cells.push(TableCell::new("failed".red()));
                cells.push(TableCell::new(reason.bright_black()));
            }
        }
        table_rows.push(Row::new(cells));
    }

    let table = Table::builder()
        .rows(table_rows)
        .style(TableStyle::rounded())
        .build();

    let failed = report.failed_runs();
    let totals = rows![row![
        TableCell::new(format!("{} runs", report.outcomes.len())),
        TableCell::new(match failed {
            0 => "all completed".green(),
            n => format!("{} failed", n).red(),
        }),
        TableCell::new(report.root.display())
    ]];
    let totals = Table::builder()
        .rows(totals)
        .style(TableStyle::rounded())
        .build();

    format!(
        "\n{}\n{}{}",
        " Summary ".reversed().green(),
        table.render(),
        totals.render()
    )
}
