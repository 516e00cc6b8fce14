//! HTTP API server.
//!
//! Wires the database, embedding provider, vector store, capture pipeline,
//! searcher, and fanout worker into an axum router. Capture outcomes map
//! onto status codes the delivering side can act on: stored and deduplicated
//! events return 200, gated discards 202, malformed payloads 422, and
//! transient failures 503 (safe to redeliver — capture is idempotent).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::capability::CapabilityIndex;
use crate::config::MnemaConfig;
use crate::db;
use crate::embedding;
use crate::error::CaptureError;
use crate::event::SourceEvent;
use crate::pipeline::{fanout, CaptureOutcome, Pipeline};
use crate::search::{SearchRequest, Searcher};
use crate::stats;
use crate::vector::{SqliteVectorStore, VectorStore};
use crate::workspace;

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Connection>>,
    vectors: Arc<dyn VectorStore>,
    capabilities: Arc<CapabilityIndex>,
    pipeline: Arc<Pipeline>,
    searcher: Arc<Searcher>,
}

/// Shared setup: open DB, create the embedding provider and vector store,
/// start the fanout worker, and assemble the pipeline and searcher.
fn build_state(config: MnemaConfig) -> Result<(AppState, JoinHandle<()>)> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path)?;
    info!(db = %db_path.display(), "database ready");
    db::check_embedding_model(&conn, &config.embedding.model)?;

    let db = Arc::new(Mutex::new(conn));
    let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(db.clone()));

    let embedder: Arc<dyn embedding::EmbeddingProvider> =
        Arc::from(embedding::create_provider(&config.embedding)?);
    info!("embedding provider ready");

    let config = Arc::new(config);
    let capabilities = Arc::new(CapabilityIndex::new(db.clone()));
    let (fanout_handle, fanout_worker) = fanout::spawn(config.clone(), db.clone(), vectors.clone());

    let pipeline = Arc::new(Pipeline::new(
        config.clone(),
        db.clone(),
        embedder.clone(),
        vectors.clone(),
        capabilities.clone(),
        fanout_handle,
    ));
    let searcher = Arc::new(Searcher::new(
        config,
        db.clone(),
        embedder,
        vectors.clone(),
        capabilities.clone(),
    ));

    Ok((
        AppState {
            db,
            vectors,
            capabilities,
            pipeline,
            searcher,
        },
        fanout_worker,
    ))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/workspaces/{ws}/events", post(capture_event))
        .route("/v1/workspaces/{ws}/search", post(search))
        .route("/v1/workspaces/{ws}/observations/{id}", get(get_observation))
        .route("/v1/workspaces/{ws}/stats", get(workspace_stats))
        .route("/v1/workspaces/{ws}", delete(delete_workspace))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Run the HTTP server until ctrl-c, then drain the fanout queue.
pub async fn serve(config: MnemaConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let (state, fanout_worker) = build_state(config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "mnema listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutting down");
        })
        .await?;

    // The pipeline (last fanout sender) is gone once the router drops, so
    // the worker exits after draining whatever is queued.
    if tokio::time::timeout(Duration::from_secs(10), fanout_worker)
        .await
        .is_err()
    {
        error!("fanout worker did not drain in time; abandoning queue");
    }
    Ok(())
}

async fn capture_event(
    State(state): State<AppState>,
    Path(ws): Path<String>,
    Json(event): Json<SourceEvent>,
) -> Response {
    match state.pipeline.capture(&ws, event).await {
        Ok(CaptureOutcome::Stored {
            public_id,
            observation_type,
            significance,
            cluster_public_id,
            cluster_created,
            entity_count,
        }) => (
            StatusCode::OK,
            Json(json!({
                "outcome": "stored",
                "deduplicated": false,
                "id": public_id,
                "observation_type": observation_type,
                "significance": significance,
                "cluster": cluster_public_id,
                "cluster_created": cluster_created,
                "entity_count": entity_count,
            })),
        )
            .into_response(),
        Ok(CaptureOutcome::Deduplicated { public_id }) => (
            StatusCode::OK,
            Json(json!({
                "outcome": "stored",
                "deduplicated": true,
                "id": public_id,
            })),
        )
            .into_response(),
        Ok(CaptureOutcome::Discarded { significance }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "outcome": "discarded",
                "significance": significance,
            })),
        )
            .into_response(),
        Err(CaptureError::Invalid(msg)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": msg })),
        )
            .into_response(),
        Err(e @ CaptureError::Retryable { .. }) => {
            error!(workspace = %ws, error = %e, "capture failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string(), "retryable": true })),
            )
                .into_response()
        }
    }
}

async fn search(
    State(state): State<AppState>,
    Path(ws): Path<String>,
    Json(request): Json<SearchRequest>,
) -> Response {
    match state.searcher.search(&ws, request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => internal(&ws, "search", e),
    }
}

async fn get_observation(
    State(state): State<AppState>,
    Path((ws, id)): Path<(String, String)>,
) -> Response {
    let db = state.db.clone();
    let slug = ws.clone();
    let result = blocking(move || {
        let conn = lock(&db)?;
        let Some(workspace_id) = workspace::find(&conn, &slug)? else {
            return Ok(None);
        };
        observation_detail(&conn, workspace_id, &id)
    })
    .await;

    match result {
        Ok(Some(detail)) => Json(detail).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "observation not found" })),
        )
            .into_response(),
        Err(e) => internal(&ws, "observation", e),
    }
}

async fn workspace_stats(State(state): State<AppState>, Path(ws): Path<String>) -> Response {
    let db = state.db.clone();
    let slug = ws.clone();
    let result = blocking(move || {
        let conn = lock(&db)?;
        let Some(workspace_id) = workspace::find(&conn, &slug)? else {
            return Ok(None);
        };
        stats::collect(&conn, workspace_id, &slug).map(Some)
    })
    .await;

    match result {
        Ok(Some(stats)) => Json(stats).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "workspace not found" })),
        )
            .into_response(),
        Err(e) => internal(&ws, "stats", e),
    }
}

async fn delete_workspace(State(state): State<AppState>, Path(ws): Path<String>) -> Response {
    let db = state.db.clone();
    let vectors = state.vectors.clone();
    let slug = ws.clone();
    let result = blocking(move || {
        let deleted = {
            let conn = lock(&db)?;
            workspace::delete_rows(&conn, &slug)?
        };
        // Sweep outside the guard; the vector store re-locks the connection.
        if let Some(workspace_id) = deleted {
            workspace::sweep_vectors(vectors.as_ref(), workspace_id)?;
        }
        Ok(deleted)
    })
    .await;

    match result {
        Ok(Some(workspace_id)) => {
            state.capabilities.invalidate(workspace_id);
            info!(workspace = %ws, "workspace deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "workspace not found" })),
        )
            .into_response(),
        Err(e) => internal(&ws, "delete", e),
    }
}

async fn healthz(State(state): State<AppState>) -> Response {
    let db = state.db.clone();
    let result = blocking(move || {
        let conn = lock(&db)?;
        let version: String = conn.query_row("SELECT vec_version()", [], |r| r.get(0))?;
        Ok(version)
    })
    .await;

    match result {
        Ok(vec_version) => Json(json!({ "status": "ok", "vec_version": vec_version })).into_response(),
        Err(e) => {
            error!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded" })),
            )
                .into_response()
        }
    }
}

/// Full observation payload for the detail endpoint.
fn observation_detail(
    conn: &Connection,
    workspace_id: i64,
    public_id: &str,
) -> Result<Option<serde_json::Value>> {
    let row = conn
        .query_row(
            "SELECT o.id, o.public_id, o.title, o.content, o.observation_type,
                    o.occurred_at, o.captured_at, o.significance, o.topics,
                    o.actor_name, o.actor_confidence, o.source, o.source_type,
                    o.source_id, o.source_refs, c.public_id, c.topic_label
             FROM observations o
             LEFT JOIN clusters c ON c.id = o.cluster_id
             WHERE o.workspace_id = ?1 AND o.public_id = ?2",
            params![workspace_id, public_id],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    json!({
                        "id": r.get::<_, String>(1)?,
                        "title": r.get::<_, String>(2)?,
                        "content": r.get::<_, String>(3)?,
                        "observation_type": r.get::<_, String>(4)?,
                        "occurred_at": r.get::<_, String>(5)?,
                        "captured_at": r.get::<_, String>(6)?,
                        "significance": r.get::<_, i64>(7)?,
                        "topics": parse_json_array(r.get::<_, String>(8)?),
                        "actor": r.get::<_, Option<String>>(9)?,
                        "actor_confidence": r.get::<_, Option<f64>>(10)?,
                        "source": r.get::<_, String>(11)?,
                        "source_type": r.get::<_, String>(12)?,
                        "source_id": r.get::<_, String>(13)?,
                        "references": parse_json_array(r.get::<_, String>(14)?),
                        "cluster": r.get::<_, Option<String>>(15)?,
                        "cluster_topic": r.get::<_, Option<String>>(16)?,
                    }),
                ))
            },
        )
        .optional()?;

    let Some((row_id, mut detail)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT kind, value FROM entities WHERE observation_id = ?1 ORDER BY id",
    )?;
    let entities: Vec<serde_json::Value> = stmt
        .query_map(params![row_id], |r| {
            Ok(json!({
                "kind": r.get::<_, String>(0)?,
                "value": r.get::<_, String>(1)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    detail["entities"] = serde_json::Value::Array(entities);
    Ok(Some(detail))
}

fn parse_json_array(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap_or_else(|_| json!([]))
}

fn internal(ws: &str, op: &str, e: anyhow::Error) -> Response {
    error!(workspace = %ws, op, error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
        .into_response()
}

fn lock(db: &Arc<Mutex<Connection>>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T> + Send + 'static,
) -> Result<T> {
    tokio::task::spawn_blocking(f).await?
}
