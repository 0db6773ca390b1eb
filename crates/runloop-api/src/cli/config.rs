//! Effective configuration display.

use anyhow::Result;
use console::style;

use crate::state::AppState;

pub fn show(state: &AppState, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "data_dir": state.data_dir.display().to_string(),
            "database_url": state.database_url(),
            "config": state.config,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {} runloop v{}", style("⚡").bold(), env!("CARGO_PKG_VERSION"));
    println!("  data dir: {}", style(state.data_dir.display()).cyan());
    println!();
    print!("{}", toml::to_string_pretty(&state.config)?);
    println!();
    Ok(())
}
