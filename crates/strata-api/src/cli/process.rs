//! Process record inspection: list and show.

use anyhow::{Context, Result, anyhow};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use strata_core::checkpoint::CheckpointError;
use strata_types::context::{ContextEntry, ContextValue};
use strata_types::node::Link;
use strata_types::process::{ProcessFilter, ProcessKind, ProcessRecord, ProcessStatus};

use super::{parse_node_id, preview};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn list_processes(
    state: &AppState,
    status: Option<String>,
    kind: Option<String>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let filter = build_filter(status.as_deref(), kind.as_deref(), limit)?;
    let records = state
        .checkpoints
        .list(filter)
        .await
        .context("failed to list processes")?;

    if json {
        let out: Vec<_> = records.iter().map(record_summary).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  No processes recorded.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Kind"),
            Cell::new("Label"),
            Cell::new("Status"),
            Cell::new("Step"),
            Cell::new("Rev"),
            Cell::new("Updated"),
        ]);

    for r in &records {
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(r.kind),
            Cell::new(&r.label),
            Cell::new(r.status).fg(status_color(r.status)),
            Cell::new(r.next_step_index),
            Cell::new(r.revision),
            Cell::new(r.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn build_filter(status: Option<&str>, kind: Option<&str>, limit: u32) -> Result<ProcessFilter> {
    Ok(ProcessFilter {
        status: status
            .map(|s| s.parse::<ProcessStatus>().map_err(|e| anyhow!(e)))
            .transpose()?,
        kind: kind
            .map(|k| k.parse::<ProcessKind>().map_err(|e| anyhow!(e)))
            .transpose()?,
        limit: Some(limit),
    })
}

fn status_color(status: ProcessStatus) -> Color {
    match status {
        ProcessStatus::Finished => Color::Green,
        ProcessStatus::Failed => Color::Red,
        ProcessStatus::Running | ProcessStatus::Waiting => Color::Yellow,
        ProcessStatus::Created => Color::Reset,
    }
}

fn record_summary(r: &ProcessRecord) -> serde_json::Value {
    serde_json::json!({
        "id": r.id.to_string(),
        "kind": r.kind,
        "label": r.label,
        "status": r.status,
        "next_step_index": r.next_step_index,
        "revision": r.revision,
        "created_at": r.created_at.to_rfc3339(),
        "updated_at": r.updated_at.to_rfc3339(),
    })
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

pub async fn show_process(state: &AppState, id: &str, json: bool) -> Result<()> {
    let id = parse_node_id(id)?;
    let record = match state.checkpoints.load(id).await {
        Ok(record) => record,
        Err(CheckpointError::ProcessNotFound(_)) => {
            anyhow::bail!("no process with id {id}")
        }
        Err(e) => return Err(e).context("failed to load process"),
    };
    let inputs = state.graph.get_inputs(id).await?;
    let outputs = state.graph.get_outputs(id).await?;

    if json {
        let out = process_detail(&record, &inputs, &outputs)?;
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} '{}'",
        style(record.kind).bold(),
        style(record.id).dim(),
        style(&record.label).cyan()
    );
    println!("  Status:   {}", styled_status(record.status));
    println!("  Revision: {}", record.revision);
    if record.kind == ProcessKind::Chain {
        println!("  Cursor:   step {}", record.next_step_index);
    }
    if let Some(job) = &record.job_id {
        println!("  Job:      {job}");
    }
    println!("  Created:  {}", record.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:  {}", record.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(error) = &record.error {
        println!("  Error:    {}", style(error).red());
    }
    if let Some(wait) = &record.waiting_on {
        println!(
            "  Waiting:  {} ({:?})",
            wait.names.join(", "),
            wait.policy
        );
    }

    print_links("Inputs", &inputs);
    print_links("Outputs", &outputs);

    if !record.context.is_empty() {
        println!();
        println!("  {}", style("── Context ──").dim());
        for (name, entry) in &record.context {
            println!("  {name}: {}", describe_entry(entry));
        }
    }
    println!();
    Ok(())
}

fn styled_status(status: ProcessStatus) -> console::StyledObject<ProcessStatus> {
    match status {
        ProcessStatus::Finished => style(status).green(),
        ProcessStatus::Failed => style(status).red(),
        ProcessStatus::Running | ProcessStatus::Waiting => style(status).yellow(),
        ProcessStatus::Created => style(status),
    }
}

fn print_links(title: &str, links: &[Link]) {
    if links.is_empty() {
        return;
    }
    println!();
    println!("  {}", style(format!("── {title} ──")).dim());
    for link in links {
        println!("  {:<7} {:<16} {}", link.kind, link.label, link.node);
    }
}

fn describe_entry(entry: &ContextEntry) -> String {
    match entry {
        ContextEntry::Pending { process_id } => format!("pending on {process_id}"),
        ContextEntry::Resolved { value } => match value {
            ContextValue::Json { value } => preview(value, 60),
            ContextValue::Node { id } => format!("node {id}"),
            ContextValue::Outputs { process_id, outputs } => format!(
                "outputs of {process_id} [{}]",
                outputs.labels().collect::<Vec<_>>().join(", ")
            ),
            ContextValue::Failed { process_id, error } => {
                format!("{process_id} failed: {error}")
            }
        },
    }
}

fn links_json(links: &[Link]) -> Vec<serde_json::Value> {
    links
        .iter()
        .map(|l| {
            serde_json::json!({
                "kind": l.kind,
                "label": l.label,
                "node": l.node.to_string(),
            })
        })
        .collect()
}

fn process_detail(
    record: &ProcessRecord,
    inputs: &[Link],
    outputs: &[Link],
) -> Result<serde_json::Value> {
    let mut out = serde_json::to_value(record)?;
    out["inputs"] = serde_json::Value::Array(links_json(inputs));
    out["outputs"] = serde_json::Value::Array(links_json(outputs));
    Ok(out)
}
