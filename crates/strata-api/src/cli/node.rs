//! Node inspection.

use anyhow::{Result, bail};
use console::style;

use strata_types::error::RepositoryError;
use strata_types::node::{Link, NodeKind};

use super::parse_node_id;
use crate::state::AppState;

pub async fn show_node(state: &AppState, id: &str, json: bool) -> Result<()> {
    let id = parse_node_id(id)?;
    let node = match state.graph.node(id).await {
        Ok(node) => node,
        Err(RepositoryError::NotFound) => bail!("no node with id {id}"),
        Err(e) => return Err(e.into()),
    };
    let incoming = state.graph.get_inputs(id).await?;
    let outgoing = state.graph.get_outputs(id).await?;

    if json {
        let mut out = serde_json::to_value(&node)?;
        out["incoming"] = serde_json::to_value(&incoming)?;
        out["outgoing"] = serde_json::to_value(&outgoing)?;
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {} {}", style(node.kind).bold(), style(node.id).dim());
    if !node.label.is_empty() {
        println!("  Label:   {}", style(&node.label).cyan());
    }
    println!("  Sealed:  {}", node.sealed);
    println!("  Created: {}", node.created_at.format("%Y-%m-%d %H:%M:%S"));
    if node.kind == NodeKind::Data {
        println!();
        println!("  {}", style("── Value ──").dim());
        let pretty = serde_json::to_string_pretty(&node.payload)?;
        for line in pretty.lines() {
            println!("  {line}");
        }
    }

    print_edges("Incoming", "<-", &incoming);
    print_edges("Outgoing", "->", &outgoing);
    println!();
    Ok(())
}

fn print_edges(title: &str, arrow: &str, links: &[Link]) {
    if links.is_empty() {
        return;
    }
    println!();
    println!("  {}", style(format!("── {title} ──")).dim());
    for link in links {
        println!("  {arrow} {} {}: {}", link.kind, link.label, link.node);
    }
}
