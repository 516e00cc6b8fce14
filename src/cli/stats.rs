use anyhow::Result;

use crate::config::MnemaConfig;
use crate::workspace;

/// Display workspace statistics in the terminal.
pub fn stats(config: &MnemaConfig, slug: &str) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = crate::db::open_database(&db_path)?;

    let Some(workspace_id) = workspace::find(&conn, slug)? else {
        anyhow::bail!("workspace '{slug}' not found");
    };
    let stats = crate::stats::collect(&conn, workspace_id, slug)?;

    println!("Workspace '{slug}'");
    println!("{}", "=".repeat(40));
    println!("  Observations:        {}", stats.observations);
    println!(
        "  Clusters:            {} ({} open)",
        stats.clusters.total, stats.clusters.open
    );
    println!("  Actors:              {}", stats.actors);
    println!("  Entities:            {}", stats.entities);
    println!();

    if !stats.by_type.is_empty() {
        println!("By Type:");
        for (ty, count) in &stats.by_type {
            println!("  {ty:<16} {count}");
        }
        println!();
    }

    if !stats.by_source.is_empty() {
        println!("By Source:");
        for (source, count) in &stats.by_source {
            println!("  {source:<16} {count}");
        }
        println!();
    }

    println!("Capture Log:");
    println!("  stored           {}", stats.capture.stored);
    println!("  deduplicated     {}", stats.capture.deduplicated);
    println!("  discarded        {}", stats.capture.discarded);
    println!();

    if let Some(range) = &stats.time_range {
        println!("Oldest observation:    {}", range.from);
        println!("Newest observation:    {}", range.to);
    }
    println!("Database size:         {} bytes", stats.db_size_bytes);

    Ok(())
}
