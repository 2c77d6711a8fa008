//! Store summary command.

use anyhow::Result;
use console::style;

use crate::state::AppState;

/// Display node counts by kind and process counts by status.
pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let nodes = state.repo.count_nodes().await?;
    let processes = state.repo.count_processes().await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status_report(state, &nodes, &processes))?
        );
        return Ok(());
    }

    println!();
    println!("  {} Strata v{}", style("◆").bold(), env!("CARGO_PKG_VERSION"));
    println!();

    println!("  {}", style("── Nodes ──").dim());
    println!("  Total:    {}", style(total(&nodes)).bold());
    for (kind, count) in &nodes {
        println!("  {:<22}{count}", format!("{kind}:"));
    }
    println!();

    println!("  {}", style("── Processes ──").dim());
    println!("  Total:    {}", style(total(&processes)).bold());
    for (status, count) in &processes {
        let label = format!("{status}:");
        let count = match status.as_str() {
            "finished" => style(count.to_string()).green(),
            "failed" => style(count.to_string()).red(),
            "running" | "waiting" => style(count.to_string()).yellow(),
            _ => style(count.to_string()),
        };
        println!("  {label:<22}{count}");
    }
    println!();

    println!("  {}", style("── System ──").dim());
    println!("  Data dir: {}", style(state.data_dir.display()).dim());
    println!("  Database: {}", style(&state.database_url).dim());
    println!();

    Ok(())
}

fn total(counts: &[(String, i64)]) -> i64 {
    counts.iter().map(|(_, n)| n).sum()
}

fn status_report(
    state: &AppState,
    nodes: &[(String, i64)],
    processes: &[(String, i64)],
) -> serde_json::Value {
    let by_key = |counts: &[(String, i64)]| {
        counts
            .iter()
            .map(|(k, n)| (k.clone(), serde_json::json!(n)))
            .collect::<serde_json::Map<_, _>>()
    };
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "data_dir": state.data_dir.display().to_string(),
        "database_url": state.database_url,
        "nodes": {
            "total": total(nodes),
            "by_kind": by_key(nodes),
        },
        "processes": {
            "total": total(processes),
            "by_status": by_key(processes),
        },
    })
}
