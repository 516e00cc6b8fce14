#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tempfile::TempDir;

use mnema::capability::CapabilityIndex;
use mnema::config::MnemaConfig;
use mnema::db;
use mnema::embedding::{EmbeddingProvider, EMBEDDING_DIM};
use mnema::event::{EventActor, SourceEvent};
use mnema::pipeline::{fanout, Pipeline};
use mnema::search::Searcher;
use mnema::vector::{SqliteVectorStore, VectorStore};

/// Deterministic bag-of-words embedder. Each lowercase token hashes to a
/// dimension; the vector is L2-normalized. Identical text embeds identically
/// and texts sharing tokens land close, which is all the pipeline needs.
pub struct HashEmbedder;

impl EmbeddingProvider for HashEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            v[(hasher.finish() as usize) % EMBEDDING_DIM] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

/// Full capture + search stack on a temp-file database.
pub struct TestStack {
    pub config: Arc<MnemaConfig>,
    pub db: Arc<Mutex<Connection>>,
    pub vectors: Arc<dyn VectorStore>,
    pub capabilities: Arc<CapabilityIndex>,
    pub pipeline: Pipeline,
    pub searcher: Searcher,
    _dir: TempDir,
}

pub fn stack() -> TestStack {
    stack_with(MnemaConfig::default())
}

pub fn stack_with(config: MnemaConfig) -> TestStack {
    stack_with_embedder(config, Arc::new(HashEmbedder))
}

pub fn stack_with_embedder(
    config: MnemaConfig,
    embedder: Arc<dyn EmbeddingProvider>,
) -> TestStack {
    let dir = TempDir::new().unwrap();
    let conn = db::open_database(dir.path().join("mnema.db")).unwrap();
    let db = Arc::new(Mutex::new(conn));
    let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(db.clone()));
    let config = Arc::new(config);
    let capabilities = Arc::new(CapabilityIndex::new(db.clone()));
    let (handle, _worker) = fanout::spawn(config.clone(), db.clone(), vectors.clone());

    let pipeline = Pipeline::new(
        config.clone(),
        db.clone(),
        embedder.clone(),
        vectors.clone(),
        capabilities.clone(),
        handle,
    );
    let searcher = Searcher::new(
        config.clone(),
        db.clone(),
        embedder,
        vectors.clone(),
        capabilities.clone(),
    );

    TestStack {
        config,
        db,
        vectors,
        capabilities,
        pipeline,
        searcher,
        _dir: dir,
    }
}

pub fn base_time() -> DateTime<Utc> {
    "2026-08-10T12:00:00Z".parse().unwrap()
}

/// A merged-PR shaped event: passes the gate comfortably.
pub fn event(source_id: &str, title: &str, body: &str) -> SourceEvent {
    typed_event(source_id, "pull_request.merged", title, body, base_time())
}

pub fn typed_event(
    source_id: &str,
    source_type: &str,
    title: &str,
    body: &str,
    occurred_at: DateTime<Utc>,
) -> SourceEvent {
    SourceEvent {
        source: "github".into(),
        source_type: source_type.into(),
        source_id: source_id.into(),
        title: title.into(),
        body: body.into(),
        actor: None,
        occurred_at,
        references: Vec::new(),
        metadata: None,
    }
}

pub fn with_actor(mut event: SourceEvent, login: &str, display_name: &str) -> SourceEvent {
    event.actor = Some(EventActor {
        login: login.into(),
        display_name: Some(display_name.into()),
        email: None,
        avatar_url: None,
    });
    event
}

pub fn minutes_later(base: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    base + Duration::minutes(minutes)
}

/// Count rows a scalar query returns.
pub fn count(stack: &TestStack, sql: &str) -> i64 {
    let conn = stack.db.lock().unwrap();
    conn.query_row(sql, [], |r| r.get(0)).unwrap()
}
