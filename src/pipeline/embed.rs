//! Observation view embedding fan-out.
//!
//! Each observation is embedded up to three times: a title view, a content
//! view, and a summary view derived for long bodies. Views run concurrently,
//! each under its own deadline. The content view is load-bearing (cluster
//! assignment and vector search depend on it) so its failure is retryable;
//! title and summary failures degrade to a null key. Keys are deterministic
//! so a redelivered event overwrites instead of duplicating.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::time::timeout;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::CaptureError;
use crate::event::SourceEvent;
use crate::pipeline::gate::ObservationType;
use crate::vector::{VectorLayer, VectorStore};

/// Bodies at or above this length get a summary view.
const SUMMARY_MIN_BODY_CHARS: usize = 800;
/// The summary view keeps roughly this many characters of the body.
const SUMMARY_TARGET_CHARS: usize = 400;

/// Vector keys produced for one observation, plus the content embedding the
/// cluster assigner consumes.
#[derive(Debug, Clone)]
pub struct EmbeddedViews {
    pub title_key: Option<String>,
    pub content_key: String,
    pub summary_key: Option<String>,
    pub content_embedding: Vec<f32>,
}

/// Deterministic vector key for one observation view.
pub fn view_key(
    workspace_id: i64,
    observation_type: ObservationType,
    source_id: &str,
    view: &str,
) -> String {
    format!("ws{workspace_id}:{observation_type}:{source_id}:{view}")
}

/// Derive the summary view text: the title plus the head of the body,
/// cut at a sentence boundary where one exists. Deterministic; returns
/// `None` for bodies short enough that content and summary would coincide.
pub fn summary_text(title: &str, body: &str) -> Option<String> {
    if body.chars().count() < SUMMARY_MIN_BODY_CHARS {
        return None;
    }
    let head: String = body.chars().take(SUMMARY_TARGET_CHARS).collect();
    let cut = head
        .rfind(['.', '!', '?', '\n'])
        .map(|i| i + 1)
        .unwrap_or(head.len());
    Some(format!("{title}\n{}", head[..cut].trim()))
}

/// Embed and upsert all views for one event. Returns the keys written and
/// the raw content embedding.
pub async fn embed_views(
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    config: &EmbeddingConfig,
    workspace_id: i64,
    observation_type: ObservationType,
    event: &SourceEvent,
) -> Result<EmbeddedViews, CaptureError> {
    let deadline = Duration::from_millis(config.timeout_ms);

    let title_text = event.title.clone();
    let content_text = if event.body.is_empty() {
        event.title.clone()
    } else {
        format!("{}\n{}", event.title, event.body)
    };
    let summary = summary_text(&event.title, &event.body);

    let title_key = view_key(workspace_id, observation_type, &event.source_id, "title");
    let content_key = view_key(workspace_id, observation_type, &event.source_id, "content");
    let summary_key = view_key(workspace_id, observation_type, &event.source_id, "summary");

    let (title_res, content_res, summary_res) = tokio::join!(
        embed_one(
            embedder.clone(),
            vectors.clone(),
            deadline,
            title_key.clone(),
            title_text,
        ),
        embed_one(
            embedder.clone(),
            vectors.clone(),
            deadline,
            content_key.clone(),
            content_text,
        ),
        async {
            match summary {
                Some(text) => embed_one(
                    embedder.clone(),
                    vectors.clone(),
                    deadline,
                    summary_key.clone(),
                    text,
                )
                .await
                .map(Some),
                None => Ok(None),
            }
        },
    );

    // The content view is required.
    let content_embedding = content_res.map_err(|e| CaptureError::retryable("embed", e))?;

    let title_key = match title_res {
        Ok(_) => Some(title_key),
        Err(e) => {
            warn!(source_id = %event.source_id, error = %e, "title view failed; degrading");
            None
        }
    };
    let summary_key = match summary_res {
        Ok(Some(_)) => Some(summary_key),
        Ok(None) => None,
        Err(e) => {
            warn!(source_id = %event.source_id, error = %e, "summary view failed; degrading");
            None
        }
    };

    Ok(EmbeddedViews {
        title_key,
        content_key,
        summary_key,
        content_embedding,
    })
}

/// Embed one view and upsert it, all inside `spawn_blocking`, bounded by
/// `deadline`. Returns the embedding.
async fn embed_one(
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    deadline: Duration,
    key: String,
    text: String,
) -> Result<Vec<f32>> {
    let task = tokio::task::spawn_blocking(move || -> Result<Vec<f32>> {
        let embedding = embedder.embed(&text).context("embedding failed")?;
        vectors
            .upsert(VectorLayer::Observations, &key, &embedding)
            .context("vector upsert failed")?;
        Ok(embedding)
    });

    match timeout(deadline, task).await {
        Ok(joined) => joined.map_err(|e| anyhow!("embed task panicked: {e}"))?,
        Err(_) => Err(anyhow!("view embedding timed out after {deadline:?}")),
    }
}
