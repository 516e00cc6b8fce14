use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::capability::CapabilityIndex;
use crate::config::MnemaConfig;
use crate::event::SourceEvent;
use crate::pipeline::{fanout, CaptureOutcome, Pipeline};
use crate::vector::SqliteVectorStore;

/// Capture one or more events from a JSON file (or stdin) into a workspace.
///
/// The input is either a single event object or an array of them.
pub async fn capture(config: MnemaConfig, workspace: &str, file: Option<&Path>) -> Result<()> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => std::io::read_to_string(std::io::stdin()).context("failed to read stdin")?,
    };
    let events: Vec<SourceEvent> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(&raw).context("invalid event array")?
    } else {
        vec![serde_json::from_str(&raw).context("invalid event")?]
    };

    let db_path = config.resolved_db_path();
    let conn = crate::db::open_database(&db_path)?;
    let db = Arc::new(Mutex::new(conn));
    let vectors: Arc<dyn crate::vector::VectorStore> =
        Arc::new(SqliteVectorStore::new(db.clone()));
    let embedder: Arc<dyn crate::embedding::EmbeddingProvider> =
        Arc::from(crate::embedding::create_provider(&config.embedding)?);
    let config = Arc::new(config);
    let capabilities = Arc::new(CapabilityIndex::new(db.clone()));
    let (handle, worker) = fanout::spawn(config.clone(), db.clone(), vectors.clone());
    let pipeline = Pipeline::new(config, db, embedder, vectors, capabilities, handle);

    let mut stored = 0usize;
    for event in events {
        let label = format!("{}:{}", event.source, event.source_id);
        match pipeline.capture(workspace, event).await {
            Ok(CaptureOutcome::Stored {
                public_id,
                observation_type,
                significance,
                cluster_public_id,
                cluster_created,
                ..
            }) => {
                stored += 1;
                let marker = if cluster_created { "new cluster" } else { "joined" };
                println!(
                    "  stored    {label} -> {public_id} [{observation_type}, significance {significance}, {marker} {cluster_public_id}]"
                );
            }
            Ok(CaptureOutcome::Deduplicated { public_id }) => {
                println!("  duplicate {label} -> {public_id}");
            }
            Ok(CaptureOutcome::Discarded { significance }) => {
                println!("  discarded {label} (significance {significance})");
            }
            Err(e) => {
                eprintln!("  FAILED    {label}: {e}");
            }
        }
    }

    // Dropping the pipeline closes the fanout channel; wait for the worker
    // to drain profile and centroid updates before exiting.
    drop(pipeline);
    if tokio::time::timeout(Duration::from_secs(10), worker)
        .await
        .is_err()
    {
        eprintln!("warning: fanout did not drain in time");
    }

    println!("{stored} observation(s) stored in '{workspace}'");
    Ok(())
}
