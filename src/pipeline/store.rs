//! Atomic observation persistence.
//!
//! One transaction writes the observation row, its entities, the cluster
//! create-or-link, the cluster count increment, and the capture audit row.
//! All-or-nothing: a failure anywhere leaves no trace and the event is safe
//! to redeliver. Redelivery of an already-stored `source_id` short-circuits
//! into a dedup result, backfilling any vector keys the first pass degraded.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

use crate::event::SourceEvent;
use crate::pipeline::actor::ResolvedActor;
use crate::pipeline::cluster::ClusterDecision;
use crate::pipeline::embed::EmbeddedViews;
use crate::pipeline::entities::ExtractedEntity;
use crate::pipeline::gate::Gating;

/// Everything the transaction needs, assembled by the capture coordinator.
pub struct NewObservation<'a> {
    pub workspace_id: i64,
    pub event: &'a SourceEvent,
    pub gating: &'a Gating,
    pub actor: &'a ResolvedActor,
    pub entities: &'a [ExtractedEntity],
    pub views: &'a EmbeddedViews,
    pub decision: ClusterDecision,
}

/// A committed observation, with the cluster facts the post-commit steps
/// (centroid upsert, fanout) need.
#[derive(Debug, Clone)]
pub struct StoredObservation {
    pub id: i64,
    pub public_id: String,
    pub cluster_id: i64,
    pub cluster_public_id: String,
    /// Key the centroid lives under in the cluster vector layer.
    pub centroid_key: String,
    /// True when this observation seeded the cluster.
    pub cluster_created: bool,
}

#[derive(Debug, Clone)]
pub enum StoreOutcome {
    Stored(StoredObservation),
    /// The idempotency key already existed; nothing new was written apart
    /// from vector-key backfill.
    Deduplicated { public_id: String },
}

/// Run the all-or-nothing store transaction.
pub fn persist(conn: &mut Connection, input: NewObservation<'_>) -> Result<StoreOutcome> {
    let tx = conn.transaction().context("failed to begin transaction")?;

    // Idempotency check on (workspace, source, source_id).
    let existing: Option<(i64, String)> = tx
        .query_row(
            "SELECT id, public_id FROM observations
             WHERE workspace_id = ?1 AND source = ?2 AND source_id = ?3",
            params![input.workspace_id, input.event.source, input.event.source_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((id, public_id)) = existing {
        backfill_vector_keys(&tx, id, input.views)?;
        log_capture(&tx, input.workspace_id, "dedup", input.event, None)?;
        tx.commit()?;
        tracing::debug!(public_id = %public_id, "duplicate delivery deduplicated");
        return Ok(StoreOutcome::Deduplicated { public_id });
    }

    // Cluster create-or-link.
    let now = chrono::Utc::now().to_rfc3339();
    let (cluster_id, cluster_public_id, centroid_key, cluster_created) = match input.decision {
        ClusterDecision::Join { cluster_id } => {
            let (public_id, centroid_key): (String, String) = tx.query_row(
                "SELECT public_id, centroid_vector_id FROM clusters WHERE id = ?1",
                params![cluster_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            (cluster_id, public_id, centroid_key, false)
        }
        ClusterDecision::Create {
            ref topic_label,
            ref keywords,
        } => {
            let public_id = format!("cl_{}", uuid::Uuid::now_v7());
            let centroid_key = format!("ws{}:{}", input.workspace_id, public_id);
            tx.execute(
                "INSERT INTO clusters
                     (public_id, workspace_id, topic_label, keywords, status,
                      observation_count, centroid_vector_id, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, 'open', 0, ?5, ?6, ?6)",
                params![
                    public_id,
                    input.workspace_id,
                    topic_label,
                    serde_json::to_string(keywords)?,
                    centroid_key,
                    now
                ],
            )?;
            (tx.last_insert_rowid(), public_id, centroid_key, true)
        }
    };

    // Observation row.
    let public_id = format!("obs_{}", uuid::Uuid::now_v7());
    tx.execute(
        "INSERT INTO observations
             (public_id, workspace_id, occurred_at, captured_at, observation_type,
              title, content, topics, significance, actor_id, actor_name,
              actor_confidence, source, source_type, source_id, source_refs,
              cluster_id, title_vector_id, content_vector_id, summary_vector_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                 ?17, ?18, ?19, ?20)",
        params![
            public_id,
            input.workspace_id,
            input.event.occurred_at.to_rfc3339(),
            now,
            input.gating.observation_type.as_str(),
            input.event.title,
            input.event.body,
            serde_json::to_string(&input.gating.topics)?,
            input.gating.significance,
            input.actor.actor_id,
            input.actor.actor_name,
            input.actor.confidence,
            input.event.source,
            input.event.source_type,
            input.event.source_id,
            serde_json::to_string(&input.event.references)?,
            cluster_id,
            input.views.title_key,
            input.views.content_key,
            input.views.summary_key,
        ],
    )?;
    let observation_id = tx.last_insert_rowid();

    // Entities, same transaction.
    {
        let mut stmt = tx.prepare(
            "INSERT INTO entities (workspace_id, observation_id, kind, value)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for entity in input.entities {
            stmt.execute(params![
                input.workspace_id,
                observation_id,
                entity.kind.as_str(),
                entity.value
            ])?;
        }
    }

    // Membership accounting: a single atomic increment, safe under
    // concurrent writers landing in the same cluster.
    tx.execute(
        "UPDATE clusters
         SET observation_count = observation_count + 1,
             last_activity_at = max(last_activity_at, ?2)
         WHERE id = ?1",
        params![cluster_id, input.event.occurred_at.to_rfc3339()],
    )?;

    log_capture(
        &tx,
        input.workspace_id,
        "store",
        input.event,
        Some(json!({
            "observation_type": input.gating.observation_type.as_str(),
            "significance": input.gating.significance,
            "entities": input.entities.len(),
            "cluster_created": cluster_created,
        })),
    )?;

    tx.commit().context("failed to commit capture transaction")?;

    Ok(StoreOutcome::Stored(StoredObservation {
        id: observation_id,
        public_id,
        cluster_id,
        cluster_public_id,
        centroid_key,
        cluster_created,
    }))
}

/// Record a below-floor discard in the audit log. Outside any transaction;
/// the discard writes nothing else.
pub fn log_discard(
    conn: &Connection,
    workspace_id: i64,
    event: &SourceEvent,
    significance: u8,
) -> Result<()> {
    log_capture(
        conn,
        workspace_id,
        "discard",
        event,
        Some(json!({ "significance": significance })),
    )
}

fn log_capture(
    conn: &Connection,
    workspace_id: i64,
    outcome: &str,
    event: &SourceEvent,
    details: Option<serde_json::Value>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO capture_log (workspace_id, outcome, source, source_id, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            workspace_id,
            outcome,
            event.source,
            event.source_id,
            details.map(|d| d.to_string()),
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Fill in vector keys the first delivery left null (degraded views that
/// succeeded on retry). Never overwrites a present key.
fn backfill_vector_keys(conn: &Connection, observation_id: i64, views: &EmbeddedViews) -> Result<()> {
    conn.execute(
        "UPDATE observations
         SET title_vector_id = COALESCE(title_vector_id, ?2),
             content_vector_id = COALESCE(content_vector_id, ?3),
             summary_vector_id = COALESCE(summary_vector_id, ?4)
         WHERE id = ?1",
        params![
            observation_id,
            views.title_key,
            views.content_key,
            views.summary_key
        ],
    )?;
    Ok(())
}
