//! Four-path retrieval governor.
//!
//! A query fans out over up to four concurrent paths — vector similarity,
//! entity match, cluster context, actor profiles — then merges, filters,
//! and reranks. The cluster and actor paths are skipped outright when the
//! workspace's capability flags say they cannot produce results. Every path
//! catches its own errors and degrades to an empty set; a single path
//! failing never fails the query. Per-path latency, the parallel-phase
//! bottleneck, and total wall time are reported on every response.

pub mod rerank;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::capability::CapabilityIndex;
use crate::config::MnemaConfig;
use crate::embedding::EmbeddingProvider;
use crate::vector::{VectorLayer, VectorStore};
use crate::workspace;

use rerank::{RerankBackend, RerankCandidate, RerankOptions};

/// Rerank strategy selector. Paths run the same regardless of mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchMode {
    Fast,
    #[default]
    Balanced,
    Thorough,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Thorough => "thorough",
        }
    }
}

/// Optional result filters, applied after the merge.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    pub source_types: Vec<String>,
    pub observation_types: Vec<String>,
    pub actor_names: Vec<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl SearchFilters {
    fn is_empty(&self) -> bool {
        self.source_types.is_empty()
            && self.observation_types.is_empty()
            && self.actor_names.is_empty()
            && self.date_from.is_none()
            && self.date_to.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default)]
    pub filters: SearchFilters,
}

#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub snippet: String,
    pub observation_type: String,
    pub occurred_at: String,
    pub actor: Option<String>,
    pub cluster: Option<String>,
    pub source: String,
    pub source_type: String,
    pub topics: Vec<String>,
    pub significance: i64,
    pub score: f64,
    /// Which paths surfaced this observation.
    pub paths: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct SearchMeta {
    pub total: usize,
    pub took_ms: u64,
    pub mode: &'static str,
    /// Paths that actually executed.
    pub paths: Vec<&'static str>,
    /// Candidates dropped by the rerank threshold.
    pub filtered: usize,
    /// True when the minimum-results fallback bypassed the threshold.
    pub fallback: bool,
}

#[derive(Debug, Serialize)]
pub struct LatencyReport {
    pub vector_ms: u64,
    pub entity_ms: u64,
    pub cluster_ms: u64,
    pub actor_ms: u64,
    pub rerank_ms: u64,
    /// Bottleneck of the concurrent phase: max of the four path latencies.
    pub max_parallel_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub data: Vec<SearchResult>,
    pub meta: SearchMeta,
    pub latency: LatencyReport,
}

/// One path's vote for an observation.
#[derive(Debug, Clone, Copy)]
struct PathHit {
    observation_id: i64,
    score: f64,
}

/// How many clusters / actor profiles the indirect paths expand.
const INDIRECT_TOP_K: usize = 3;
/// Score assigned to observations reached via a name-matched actor.
const NAME_MATCH_SCORE: f64 = 0.75;

pub struct Searcher {
    config: Arc<MnemaConfig>,
    db: Arc<Mutex<Connection>>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    capabilities: Arc<CapabilityIndex>,
}

impl Searcher {
    pub fn new(
        config: Arc<MnemaConfig>,
        db: Arc<Mutex<Connection>>,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        capabilities: Arc<CapabilityIndex>,
    ) -> Self {
        Self {
            config,
            db,
            embedder,
            vectors,
            capabilities,
        }
    }

    pub async fn search(
        &self,
        workspace_slug: &str,
        request: SearchRequest,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        let limit = request
            .limit
            .unwrap_or(self.config.search.default_limit)
            .min(self.config.search.max_limit)
            .max(1);

        let workspace_id = {
            let db = self.db.clone();
            let slug = workspace_slug.to_string();
            tokio::task::spawn_blocking(move || {
                let conn = lock(&db)?;
                workspace::find(&conn, &slug)
            })
            .await??
        };
        let Some(workspace_id) = workspace_id else {
            // Unknown workspace: an empty result set, not an error.
            return Ok(empty_response(request.mode, started));
        };

        let caps = self.capabilities.get(workspace_id)?;

        // One query embedding feeds the vector, cluster, and actor paths.
        // Its failure degrades those paths to empty rather than failing the
        // query (the entity path needs no embedding).
        let query_embedding = self.embed_query(&request.query).await;

        let terms = query_terms(&request.query);
        let k = self.config.search.candidate_limit;

        let (vector, entity, cluster, actor) = tokio::join!(
            self.vector_path(workspace_id, query_embedding.clone(), k),
            self.entity_path(workspace_id, terms.clone(), k),
            async {
                if caps.has_clusters {
                    self.cluster_path(workspace_id, query_embedding.clone(), k)
                        .await
                } else {
                    (Vec::new(), 0)
                }
            },
            async {
                if caps.has_actors {
                    self.actor_path(workspace_id, query_embedding.clone(), terms.clone(), k)
                        .await
                } else {
                    (Vec::new(), 0)
                }
            },
        );

        let mut executed: Vec<&'static str> = vec!["vector", "entity"];
        if caps.has_clusters {
            executed.push("cluster");
        }
        if caps.has_actors {
            executed.push("actor");
        }

        // Merge and deduplicate by observation, keeping the best score and
        // the provenance of every path that found it.
        let mut merged: HashMap<i64, (f64, Vec<&'static str>)> = HashMap::new();
        for (name, hits) in [
            ("vector", &vector.0),
            ("entity", &entity.0),
            ("cluster", &cluster.0),
            ("actor", &actor.0),
        ] {
            for hit in hits {
                let entry = merged
                    .entry(hit.observation_id)
                    .or_insert((hit.score, Vec::new()));
                entry.0 = entry.0.max(hit.score);
                if !entry.1.contains(&name) {
                    entry.1.push(name);
                }
            }
        }

        // Hydrate rows and apply filters.
        let rows = {
            let db = self.db.clone();
            let ids: Vec<i64> = merged.keys().copied().collect();
            let filters = request.filters.clone();
            tokio::task::spawn_blocking(move || {
                let conn = lock(&db)?;
                hydrate(&conn, workspace_id, &ids, &filters)
            })
            .await??
        };

        let candidates: Vec<RerankCandidate> = rows
            .values()
            .map(|row| RerankCandidate {
                observation_id: row.id,
                raw_score: merged.get(&row.id).map(|(s, _)| *s).unwrap_or(0.0),
                title: row.title.clone(),
                content: row.content.clone(),
            })
            .collect();

        let rerank_started = Instant::now();
        let (backend, threshold) = RerankBackend::for_mode(request.mode, &self.config.rerank);
        let reranked = backend
            .rerank(
                &request.query,
                candidates,
                RerankOptions {
                    top_k: self.config.search.max_limit,
                    threshold,
                    min_results: self.config.rerank.min_results,
                },
            )
            .await;
        let rerank_ms = rerank_started.elapsed().as_millis() as u64;

        let total = reranked.results.len();
        let data: Vec<SearchResult> = reranked
            .results
            .iter()
            .skip(request.offset)
            .take(limit)
            .filter_map(|(id, score)| {
                let row = rows.get(id)?;
                let (_, paths) = merged.get(id)?;
                Some(row.to_result(*score, paths.clone()))
            })
            .collect();

        let (vector_ms, entity_ms, cluster_ms, actor_ms) = (vector.1, entity.1, cluster.1, actor.1);
        let max_parallel_ms = vector_ms.max(entity_ms).max(cluster_ms).max(actor_ms);
        let total_ms = started.elapsed().as_millis() as u64;

        Ok(SearchResponse {
            data,
            meta: SearchMeta {
                total,
                took_ms: total_ms,
                mode: request.mode.as_str(),
                paths: executed,
                filtered: reranked.filtered,
                fallback: reranked.fallback,
            },
            latency: LatencyReport {
                vector_ms,
                entity_ms,
                cluster_ms,
                actor_ms,
                rerank_ms,
                max_parallel_ms,
                total_ms,
            },
        })
    }

    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.clone();
        let text = query.to_string();
        let deadline = Duration::from_millis(self.config.search.path_timeout_ms);
        let task = tokio::task::spawn_blocking(move || embedder.embed(&text));
        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(Ok(embedding))) => Some(embedding),
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "query embedding failed; vector-backed paths degrade");
                None
            }
            Ok(Err(e)) => {
                warn!(error = %e, "query embedding task panicked");
                None
            }
            Err(_) => {
                warn!("query embedding timed out");
                None
            }
        }
    }

    /// Run one path's blocking body with timing, timeout, and degradation.
    /// Bodies receive the connection mutex, not a held guard: they must lock
    /// only around relational reads and never across a vector-store call,
    /// which takes the same lock internally.
    async fn run_path(
        &self,
        name: &'static str,
        body: impl FnOnce(&Mutex<Connection>, &dyn VectorStore) -> Result<Vec<PathHit>> + Send + 'static,
    ) -> (Vec<PathHit>, u64) {
        let started = Instant::now();
        let db = self.db.clone();
        let vectors = self.vectors.clone();
        let deadline = Duration::from_millis(self.config.search.path_timeout_ms);

        let task = tokio::task::spawn_blocking(move || body(&db, vectors.as_ref()));

        let hits = match tokio::time::timeout(deadline, task).await {
            Ok(Ok(Ok(hits))) => hits,
            Ok(Ok(Err(e))) => {
                warn!(path = name, error = %e, "search path failed; degrading to empty");
                Vec::new()
            }
            Ok(Err(e)) => {
                warn!(path = name, error = %e, "search path panicked; degrading to empty");
                Vec::new()
            }
            Err(_) => {
                warn!(path = name, "search path timed out; degrading to empty");
                Vec::new()
            }
        };
        (hits, started.elapsed().as_millis() as u64)
    }

    async fn vector_path(
        &self,
        workspace_id: i64,
        embedding: Option<Vec<f32>>,
        k: usize,
    ) -> (Vec<PathHit>, u64) {
        self.run_path("vector", move |db, vectors| {
            let Some(embedding) = embedding else {
                return Ok(Vec::new());
            };
            let matches = vectors.query(
                VectorLayer::Observations,
                &embedding,
                k,
                &workspace::vector_prefix(workspace_id),
            )?;

            let conn = lock(db)?;
            let mut hits = Vec::new();
            for m in matches {
                let id: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM observations
                         WHERE workspace_id = ?1
                           AND (title_vector_id = ?2 OR content_vector_id = ?2
                                OR summary_vector_id = ?2)",
                        params![workspace_id, m.key],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(id) = id {
                    hits.push(PathHit {
                        observation_id: id,
                        score: m.cosine().clamp(0.0, 1.0),
                    });
                }
            }
            Ok(hits)
        })
        .await
    }

    async fn entity_path(
        &self,
        workspace_id: i64,
        terms: Vec<String>,
        k: usize,
    ) -> (Vec<PathHit>, u64) {
        self.run_path("entity", move |db, _| {
            let conn = lock(db)?;
            entity_hits(&conn, workspace_id, &terms, k)
        })
        .await
    }

    async fn cluster_path(
        &self,
        workspace_id: i64,
        embedding: Option<Vec<f32>>,
        k: usize,
    ) -> (Vec<PathHit>, u64) {
        self.run_path("cluster", move |db, vectors| {
            let Some(embedding) = embedding else {
                return Ok(Vec::new());
            };
            let matches = vectors.query(
                VectorLayer::Clusters,
                &embedding,
                INDIRECT_TOP_K,
                &workspace::vector_prefix(workspace_id),
            )?;

            let conn = lock(db)?;
            let mut hits = Vec::new();
            for m in matches {
                let cluster_id: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM clusters
                         WHERE workspace_id = ?1 AND centroid_vector_id = ?2",
                        params![workspace_id, m.key],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(cluster_id) = cluster_id else { continue };

                let score = m.cosine().clamp(0.0, 1.0);
                let mut stmt = conn.prepare(
                    "SELECT id FROM observations WHERE cluster_id = ?1
                     ORDER BY occurred_at DESC LIMIT ?2",
                )?;
                let members = stmt
                    .query_map(params![cluster_id, k as i64], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                for observation_id in members {
                    hits.push(PathHit {
                        observation_id,
                        score,
                    });
                }
            }
            Ok(hits)
        })
        .await
    }

    async fn actor_path(
        &self,
        workspace_id: i64,
        embedding: Option<Vec<f32>>,
        terms: Vec<String>,
        k: usize,
    ) -> (Vec<PathHit>, u64) {
        self.run_path("actor", move |db, vectors| {
            // Actors by profile similarity. KNN runs before the guard.
            let mut actor_scores: HashMap<i64, f64> = HashMap::new();
            if let Some(embedding) = embedding {
                let prefix = format!("ws{workspace_id}:actor:");
                let matches =
                    vectors.query(VectorLayer::Profiles, &embedding, INDIRECT_TOP_K, &prefix)?;
                for m in matches {
                    if let Some(actor_id) = m
                        .key
                        .strip_prefix(&prefix)
                        .and_then(|s| s.parse::<i64>().ok())
                    {
                        actor_scores.insert(actor_id, m.cosine().clamp(0.0, 1.0));
                    }
                }
            }

            let conn = lock(db)?;

            // Actors named in the query.
            for term in &terms {
                let id: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM actor_identities
                         WHERE workspace_id = ?1
                           AND (lower(username) = ?2
                                OR instr(lower(display_name), ?2) > 0)",
                        params![workspace_id, term],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(id) = id {
                    let score = actor_scores.entry(id).or_insert(NAME_MATCH_SCORE);
                    *score = score.max(NAME_MATCH_SCORE);
                }
            }

            let mut hits = Vec::new();
            let per_actor = (k / actor_scores.len().max(1)).max(1);
            for (actor_id, score) in actor_scores {
                let mut stmt = conn.prepare(
                    "SELECT id FROM observations
                     WHERE workspace_id = ?1 AND actor_id = ?2
                     ORDER BY occurred_at DESC LIMIT ?3",
                )?;
                let recent = stmt
                    .query_map(params![workspace_id, actor_id, per_actor as i64], |row| {
                        row.get::<_, i64>(0)
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                for observation_id in recent {
                    hits.push(PathHit {
                        observation_id,
                        score,
                    });
                }
            }
            Ok(hits)
        })
        .await
    }
}

fn lock(db: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))
}

/// Observations whose entities match the query terms, scored by the share of
/// distinct terms each one hit. Placeholders are numbered explicitly so the
/// trailing workspace and limit slots cannot collide with the IN list.
fn entity_hits(
    conn: &Connection,
    workspace_id: i64,
    terms: &[String],
    k: usize,
) -> Result<Vec<PathHit>> {
    if terms.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = (1..=terms.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT observation_id, COUNT(DISTINCT lower(value))
         FROM entities
         WHERE workspace_id = ?{ws} AND lower(value) IN ({placeholders})
         GROUP BY observation_id
         ORDER BY 2 DESC
         LIMIT ?{limit}",
        ws = terms.len() + 1,
        limit = terms.len() + 2,
    );
    let mut stmt = conn.prepare(&sql)?;

    let k = k as i64;
    let mut binds: Vec<&dyn rusqlite::ToSql> =
        terms.iter().map(|t| t as &dyn rusqlite::ToSql).collect();
    binds.push(&workspace_id);
    binds.push(&k);

    let term_count = terms.len() as f64;
    let hits = stmt
        .query_map(binds.as_slice(), |row| {
            Ok(PathHit {
                observation_id: row.get(0)?,
                score: (row.get::<_, i64>(1)? as f64 / term_count).min(1.0),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(hits)
}

/// Lowercased query tokens of useful length.
fn query_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| t.len() >= 2)
        .map(String::from)
        .collect()
}

fn empty_response(mode: SearchMode, started: Instant) -> SearchResponse {
    let total_ms = started.elapsed().as_millis() as u64;
    SearchResponse {
        data: Vec::new(),
        meta: SearchMeta {
            total: 0,
            took_ms: total_ms,
            mode: mode.as_str(),
            paths: Vec::new(),
            filtered: 0,
            fallback: false,
        },
        latency: LatencyReport {
            vector_ms: 0,
            entity_ms: 0,
            cluster_ms: 0,
            actor_ms: 0,
            rerank_ms: 0,
            max_parallel_ms: 0,
            total_ms,
        },
    }
}

/// Hydrated observation row, post-filter.
#[derive(Debug, Clone)]
struct ObservationRow {
    id: i64,
    public_id: String,
    title: String,
    content: String,
    observation_type: String,
    occurred_at: String,
    actor_name: Option<String>,
    cluster_public_id: Option<String>,
    source: String,
    source_type: String,
    topics: String,
    significance: i64,
}

impl ObservationRow {
    fn to_result(&self, score: f64, paths: Vec<&'static str>) -> SearchResult {
        const SNIPPET_CHARS: usize = 240;
        let snippet: String = self.content.chars().take(SNIPPET_CHARS).collect();
        SearchResult {
            id: self.public_id.clone(),
            title: self.title.clone(),
            snippet,
            observation_type: self.observation_type.clone(),
            occurred_at: self.occurred_at.clone(),
            actor: self.actor_name.clone(),
            cluster: self.cluster_public_id.clone(),
            source: self.source.clone(),
            source_type: self.source_type.clone(),
            topics: serde_json::from_str(&self.topics).unwrap_or_default(),
            significance: self.significance,
            score,
            paths,
        }
    }
}

/// Load merged candidates and apply the request filters.
fn hydrate(
    conn: &Connection,
    workspace_id: i64,
    ids: &[i64],
    filters: &SearchFilters,
) -> Result<HashMap<i64, ObservationRow>> {
    let mut rows = HashMap::with_capacity(ids.len());
    let mut stmt = conn.prepare(
        "SELECT o.id, o.public_id, o.title, o.content, o.observation_type,
                o.occurred_at, o.actor_name, c.public_id, o.source, o.source_type,
                o.topics, o.significance
         FROM observations o
         LEFT JOIN clusters c ON c.id = o.cluster_id
         WHERE o.id = ?1 AND o.workspace_id = ?2",
    )?;

    for &id in ids {
        let row = stmt
            .query_row(params![id, workspace_id], |r| {
                Ok(ObservationRow {
                    id: r.get(0)?,
                    public_id: r.get(1)?,
                    title: r.get(2)?,
                    content: r.get(3)?,
                    observation_type: r.get(4)?,
                    occurred_at: r.get(5)?,
                    actor_name: r.get(6)?,
                    cluster_public_id: r.get(7)?,
                    source: r.get(8)?,
                    source_type: r.get(9)?,
                    topics: r.get(10)?,
                    significance: r.get(11)?,
                })
            })
            .optional()?;
        let Some(row) = row else { continue };
        if filters.is_empty() || passes_filters(&row, filters) {
            rows.insert(id, row);
        }
    }
    Ok(rows)
}

fn passes_filters(row: &ObservationRow, filters: &SearchFilters) -> bool {
    if !filters.source_types.is_empty()
        && !filters
            .source_types
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&row.source_type) || s.eq_ignore_ascii_case(&row.source))
    {
        return false;
    }
    if !filters.observation_types.is_empty()
        && !filters
            .observation_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(&row.observation_type))
    {
        return false;
    }
    if !filters.actor_names.is_empty() {
        let Some(actor) = &row.actor_name else {
            return false;
        };
        let actor = actor.to_lowercase();
        if !filters
            .actor_names
            .iter()
            .any(|n| actor.contains(&n.to_lowercase()))
        {
            return false;
        }
    }
    if filters.date_from.is_some() || filters.date_to.is_some() {
        let Ok(occurred) = row.occurred_at.parse::<DateTime<Utc>>() else {
            return false;
        };
        if let Some(from) = filters.date_from {
            if occurred < from {
                return false;
            }
        }
        if let Some(to) = filters.date_to {
            if occurred > to {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_terms_drop_short_tokens() {
        assert_eq!(
            query_terms("Fix a auth, MEM-204"),
            vec!["fix", "auth", "mem-204"]
        );
        assert!(query_terms("a b").is_empty());
    }

    #[test]
    fn mode_defaults_to_balanced() {
        let req: SearchRequest = serde_json::from_str(r#"{"query": "auth"}"#).unwrap();
        assert_eq!(req.mode, SearchMode::Balanced);
        assert!(req.filters.is_empty());
        assert_eq!(req.offset, 0);
    }

    #[test]
    fn entity_hits_bind_terms_workspace_and_limit() {
        let conn = crate::db::open_memory_database().unwrap();
        conn.execute(
            "INSERT INTO workspaces (slug, created_at) VALUES ('acme', '2026-08-01T00:00:00Z')",
            [],
        )
        .unwrap();
        for (id, source_id) in [(1, "pr-1"), (2, "pr-2")] {
            conn.execute(
                "INSERT INTO observations
                     (public_id, workspace_id, occurred_at, captured_at, observation_type,
                      title, content, significance, source, source_type, source_id)
                 VALUES (?1, 1, '2026-08-10T12:00:00Z', '2026-08-10T12:00:01Z',
                     'code-change', 't', 'c', 70, 'github', 'pull_request.merged', ?2)",
                params![format!("obs_{id}"), source_id],
            )
            .unwrap();
        }
        // Observation 1 hits both terms, observation 2 only one.
        for (obs, value) in [(1, "mem-204"), (1, "auth-service"), (2, "mem-204")] {
            conn.execute(
                "INSERT INTO entities (workspace_id, observation_id, kind, value)
                 VALUES (1, ?1, 'ticket', ?2)",
                params![obs, value],
            )
            .unwrap();
        }

        let terms = vec!["mem-204".to_string(), "auth-service".to_string()];
        let hits = entity_hits(&conn, 1, &terms, 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].observation_id, 1);
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert!((hits[1].score - 0.5).abs() < 1e-9);

        // The limit slot binds after the IN list.
        let capped = entity_hits(&conn, 1, &terms, 1).unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].observation_id, 1);

        // So does the workspace slot.
        assert!(entity_hits(&conn, 2, &terms, 10).unwrap().is_empty());
    }

    #[test]
    fn filters_match_rows() {
        let row = ObservationRow {
            id: 1,
            public_id: "obs_1".into(),
            title: "t".into(),
            content: "c".into(),
            observation_type: "code-change".into(),
            occurred_at: "2026-08-10T12:00:00Z".into(),
            actor_name: Some("Maria Kowalski".into()),
            cluster_public_id: None,
            source: "github".into(),
            source_type: "pull_request.merged".into(),
            topics: r#"["auth"]"#.into(),
            significance: 70,
        };

        let mut filters = SearchFilters::default();
        assert!(passes_filters(&row, &filters));

        filters.observation_types = vec!["deployment".into()];
        assert!(!passes_filters(&row, &filters));
        filters.observation_types = vec!["code-change".into()];
        assert!(passes_filters(&row, &filters));

        filters.actor_names = vec!["kowalski".into()];
        assert!(passes_filters(&row, &filters));
        filters.actor_names = vec!["smith".into()];
        assert!(!passes_filters(&row, &filters));
        filters.actor_names.clear();

        filters.date_from = Some("2026-08-11T00:00:00Z".parse().unwrap());
        assert!(!passes_filters(&row, &filters));
        filters.date_from = Some("2026-08-01T00:00:00Z".parse().unwrap());
        filters.date_to = Some("2026-08-20T00:00:00Z".parse().unwrap());
        assert!(passes_filters(&row, &filters));
    }
}
