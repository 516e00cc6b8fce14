//! Cluster assignment.
//!
//! Decides whether a new observation joins an existing topic cluster or
//! seeds a new one. Candidates are the top-K open clusters by centroid
//! similarity (vector store, workspace-scoped); each is scored with four
//! weighted signals — embedding similarity, entity overlap, actor overlap,
//! and temporal proximity — all tunable via [`ClusterConfig`]. The highest
//! scorer at or above the join threshold wins, ties broken by most recent
//! activity; otherwise the decision is to create.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::ClusterConfig;
use crate::pipeline::actor::ResolvedActor;
use crate::pipeline::entities::ExtractedEntity;
use crate::pipeline::gate::Gating;
use crate::vector::{VectorLayer, VectorMatch, VectorStore};
use crate::workspace;

/// An open cluster under consideration, hydrated with the overlap sets the
/// scorer needs.
#[derive(Debug, Clone)]
pub struct ClusterCandidate {
    pub id: i64,
    pub topic_label: String,
    pub last_activity_at: DateTime<Utc>,
    /// Cosine similarity between the observation's content embedding and
    /// this cluster's centroid.
    pub similarity: f64,
    /// Lowercased entity values accumulated across member observations.
    pub entity_values: HashSet<String>,
    /// Canonical actor ids that have contributed to this cluster.
    pub actor_ids: HashSet<i64>,
}

/// The assigner's verdict, executed inside the store transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterDecision {
    Join { cluster_id: i64 },
    Create { topic_label: String, keywords: Vec<String> },
}

/// KNN over the cluster-centroid layer for the top-K candidates. Runs against
/// the vector store only; the caller must NOT hold the connection guard here,
/// because the embedded store takes the same lock internally.
pub fn nearest_centroids(
    vectors: &dyn VectorStore,
    workspace_id: i64,
    content_embedding: &[f32],
    config: &ClusterConfig,
) -> Result<Vec<VectorMatch>> {
    vectors.query(
        VectorLayer::Clusters,
        content_embedding,
        config.candidate_limit,
        &workspace::vector_prefix(workspace_id),
    )
}

/// Hydrate centroid matches into scorable candidates. Centroid keys missing
/// a relational row (deleted or closed clusters) are skipped.
pub fn hydrate_candidates(
    conn: &Connection,
    workspace_id: i64,
    matches: &[VectorMatch],
) -> Result<Vec<ClusterCandidate>> {
    let mut candidates = Vec::with_capacity(matches.len());
    for m in matches {
        let row: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT id, topic_label, last_activity_at FROM clusters
                 WHERE workspace_id = ?1 AND centroid_vector_id = ?2 AND status = 'open'",
                params![workspace_id, m.key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((id, topic_label, last_activity_at)) = row else {
            continue;
        };

        candidates.push(ClusterCandidate {
            id,
            topic_label,
            last_activity_at: last_activity_at
                .parse()
                .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC),
            similarity: m.cosine(),
            entity_values: member_entities(conn, id)?,
            actor_ids: member_actors(conn, id)?,
        });
    }
    Ok(candidates)
}

fn member_entities(conn: &Connection, cluster_id: i64) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT lower(e.value)
         FROM entities e
         JOIN observations o ON o.id = e.observation_id
         WHERE o.cluster_id = ?1",
    )?;
    let values = stmt
        .query_map(params![cluster_id], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(values)
}

fn member_actors(conn: &Connection, cluster_id: i64) -> Result<HashSet<i64>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT actor_id FROM observations
         WHERE cluster_id = ?1 AND actor_id IS NOT NULL",
    )?;
    let ids = stmt
        .query_map(params![cluster_id], |row| row.get::<_, i64>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

/// Weighted score for one candidate against the incoming observation.
pub fn score(
    candidate: &ClusterCandidate,
    entities: &[ExtractedEntity],
    actor_id: Option<i64>,
    occurred_at: DateTime<Utc>,
    config: &ClusterConfig,
) -> f64 {
    let entity_overlap = if entities.is_empty() {
        0.0
    } else {
        let shared = entities
            .iter()
            .filter(|e| candidate.entity_values.contains(&e.value.to_lowercase()))
            .count();
        shared as f64 / entities.len() as f64
    };

    let actor_overlap = match actor_id {
        Some(id) if candidate.actor_ids.contains(&id) => 1.0,
        _ => 0.0,
    };

    // Half-life decay over time since the cluster was last active. Events
    // arriving out of order can predate it; clamp to "now-ish".
    let idle_hours = (occurred_at - candidate.last_activity_at)
        .num_minutes()
        .max(0) as f64
        / 60.0;
    let temporal = (-idle_hours * std::f64::consts::LN_2 / config.half_life_hours).exp();

    config.embedding_weight * candidate.similarity
        + config.entity_weight * entity_overlap
        + config.actor_weight * actor_overlap
        + config.temporal_weight * temporal
}

/// Pick the best candidate at or above the join threshold, or decide to
/// create. Ties break to the most recently active cluster.
pub fn decide(
    candidates: &[ClusterCandidate],
    gating: &Gating,
    entities: &[ExtractedEntity],
    actor: &ResolvedActor,
    occurred_at: DateTime<Utc>,
    config: &ClusterConfig,
) -> ClusterDecision {
    let mut best: Option<(&ClusterCandidate, f64)> = None;
    for candidate in candidates {
        let s = score(candidate, entities, actor.actor_id, occurred_at, config);
        let better = match best {
            None => true,
            Some((current, current_score)) => {
                s > current_score
                    || (s == current_score
                        && candidate.last_activity_at > current.last_activity_at)
            }
        };
        if better {
            best = Some((candidate, s));
        }
    }

    match best {
        Some((candidate, s)) if s >= config.join_threshold => {
            tracing::debug!(
                cluster_id = candidate.id,
                score = s,
                label = %candidate.topic_label,
                "joining cluster"
            );
            ClusterDecision::Join {
                cluster_id: candidate.id,
            }
        }
        _ => ClusterDecision::Create {
            topic_label: topic_label(gating),
            keywords: keywords(gating, entities),
        },
    }
}

/// Label a new cluster after the observation that seeds it.
fn topic_label(gating: &Gating) -> String {
    gating
        .topics
        .first()
        .cloned()
        .unwrap_or_else(|| gating.observation_type.to_string())
}

/// Seed keywords: topics first, then entity values, bounded.
fn keywords(gating: &Gating, entities: &[ExtractedEntity]) -> Vec<String> {
    const MAX_KEYWORDS: usize = 12;
    let mut out: Vec<String> = gating.topics.clone();
    for e in entities {
        let value = e.value.to_lowercase();
        if !out.contains(&value) {
            out.push(value);
        }
        if out.len() >= MAX_KEYWORDS {
            break;
        }
    }
    out
}
