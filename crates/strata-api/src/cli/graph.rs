//! Provenance graph rendering.

use anyhow::Result;

use strata_core::provenance::{Lineage, Walk};
use strata_types::node::NodeKind;

use super::{WalkArg, parse_node_id};
use crate::state::AppState;

pub async fn show_graph(
    state: &AppState,
    id: &str,
    depth: usize,
    walk: WalkArg,
    json: bool,
) -> Result<()> {
    let id = parse_node_id(id)?;
    let lineage = state.graph.subgraph(id, depth, Walk::from(walk)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&lineage_json(&lineage))?);
        return Ok(());
    }

    println!();
    for line in lineage.render().lines() {
        println!("  {line}");
    }
    println!();
    Ok(())
}

fn lineage_json(lineage: &Lineage) -> serde_json::Value {
    let graph = lineage.graph();
    let nodes: Vec<_> = graph
        .node_weights()
        .map(|n| {
            let mut entry = serde_json::json!({
                "id": n.id.to_string(),
                "kind": n.kind,
                "label": n.label,
            });
            if n.kind == NodeKind::Data {
                entry["value"] = n.payload.clone();
            } else if let Some(status) = lineage.status(n.id) {
                entry["status"] = serde_json::json!(status);
            }
            entry
        })
        .collect();
    let edges: Vec<_> = graph
        .raw_edges()
        .iter()
        .map(|e| {
            serde_json::json!({
                "source": graph[e.source()].id.to_string(),
                "target": graph[e.target()].id.to_string(),
                "kind": e.weight.kind,
                "label": e.weight.label,
            })
        })
        .collect();

    serde_json::json!({
        "root": lineage.root().to_string(),
        "acyclic": lineage.is_acyclic(),
        "nodes": nodes,
        "edges": edges,
    })
}
