//! Effective configuration display.

use anyhow::Result;
use console::style;

use strata_infra::filesystem::{config_path, jobs_dir};

use crate::state::AppState;

pub fn show_config(state: &AppState, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "data_dir": state.data_dir.display().to_string(),
            "config_file": config_path(&state.data_dir).display().to_string(),
            "database_url": state.database_url,
            "jobs_dir": jobs_dir(&state.data_dir).display().to_string(),
            "config": state.config,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let path = config_path(&state.data_dir);
    println!();
    println!("  {} {}", style("Config file:").bold(), path.display());
    if !path.exists() {
        println!("  {}", style("(not present, using defaults)").dim());
    }
    println!("  {} {}", style("Database:").bold(), state.database_url);
    println!();
    for line in toml::to_string_pretty(&state.config)?.lines() {
        println!("  {line}");
    }
    println!();
    Ok(())
}
