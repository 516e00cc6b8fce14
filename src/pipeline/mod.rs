//! Capture pipeline.
//!
//! [`Pipeline::capture`] drives one event through the state machine:
//! validate → gate → parallel{embed views, extract entities, resolve actor}
//! → cluster assign → atomic store → post-commit fanout. The parallel phase
//! is a barrier: all three branches finish (successfully or degraded)
//! before cluster assignment runs. The fanout is fire-and-forget; its
//! failures never reach the caller.

pub mod actor;
pub mod cluster;
pub mod embed;
pub mod entities;
pub mod fanout;
pub mod gate;
pub mod store;

use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::capability::CapabilityIndex;
use crate::config::MnemaConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::CaptureError;
use crate::event::SourceEvent;
use crate::vector::{VectorLayer, VectorStore};
use crate::workspace;

use fanout::{FanoutEvent, FanoutHandle};
use store::StoreOutcome;

/// What one capture produced.
#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    Stored {
        public_id: String,
        observation_type: String,
        significance: u8,
        cluster_public_id: String,
        cluster_created: bool,
        entity_count: usize,
    },
    /// The idempotency key already existed.
    Deduplicated { public_id: String },
    /// Below the significance floor; nothing was written except the audit row.
    Discarded { significance: u8 },
}

/// The capture coordinator. Cheap to clone pieces out of; one instance
/// serves all workspaces.
pub struct Pipeline {
    config: Arc<MnemaConfig>,
    db: Arc<Mutex<Connection>>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    capabilities: Arc<CapabilityIndex>,
    fanout: FanoutHandle,
}

impl Pipeline {
    pub fn new(
        config: Arc<MnemaConfig>,
        db: Arc<Mutex<Connection>>,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        capabilities: Arc<CapabilityIndex>,
        fanout: FanoutHandle,
    ) -> Self {
        Self {
            config,
            db,
            embedder,
            vectors,
            capabilities,
            fanout,
        }
    }

    /// Capture one event into a workspace.
    pub async fn capture(
        &self,
        workspace_slug: &str,
        mut event: SourceEvent,
    ) -> Result<CaptureOutcome, CaptureError> {
        event.validate().map_err(CaptureError::invalid)?;
        event.normalize();

        // Gate before any expensive work.
        let gating = gate::evaluate(&event);

        let workspace_id = {
            let db = self.db.clone();
            let slug = workspace_slug.to_string();
            run_blocking("workspace", move || {
                let conn = lock(&db)?;
                workspace::ensure(&conn, &slug)
            })
            .await?
        };

        if !gating.passes(&self.config.gate) {
            let db = self.db.clone();
            let significance = gating.significance;
            let event_for_log = event.clone();
            run_blocking("discard-log", move || {
                let conn = lock(&db)?;
                store::log_discard(&conn, workspace_id, &event_for_log, significance)
            })
            .await?;
            debug!(
                source_id = %event.source_id,
                significance,
                floor = self.config.gate.significance_floor,
                "event discarded below significance floor"
            );
            return Ok(CaptureOutcome::Discarded { significance });
        }

        let event = Arc::new(event);

        // Parallel phase: embedding, extraction, and actor resolution are
        // independent; join all three before clustering.
        let (views_res, entities_res, resolved_actor) = tokio::join!(
            embed::embed_views(
                self.embedder.clone(),
                self.vectors.clone(),
                &self.config.embedding,
                workspace_id,
                gating.observation_type,
                &event,
            ),
            {
                let event = event.clone();
                tokio::task::spawn_blocking(move || entities::extract(&event))
            },
            {
                let db = self.db.clone();
                let event = event.clone();
                tokio::task::spawn_blocking(move || match db.lock() {
                    Ok(conn) => {
                        actor::resolve(&conn, workspace_id, &event.source, event.actor.as_ref())
                    }
                    Err(e) => {
                        warn!(error = %e, "db lock poisoned during actor resolution");
                        actor::ResolvedActor::unlinked()
                    }
                })
            },
        );

        let views = views_res?;
        let extracted = entities_res.unwrap_or_else(|e| {
            warn!(error = %e, "entity extraction task panicked; degrading to none");
            Vec::new()
        });
        let resolved_actor = resolved_actor.unwrap_or_else(|e| {
            warn!(error = %e, "actor resolution task panicked; storing unlinked");
            actor::ResolvedActor::unlinked()
        });

        // Cluster assignment depends on the barrier's outputs.
        let decision = {
            let db = self.db.clone();
            let vectors = self.vectors.clone();
            let config = self.config.clone();
            let embedding = views.content_embedding.clone();
            let gating = gating.clone();
            let extracted = extracted.clone();
            let resolved = resolved_actor.clone();
            let occurred_at = event.occurred_at;
            run_blocking("cluster", move || {
                // KNN first, without the connection guard: the embedded
                // vector store locks the same connection internally.
                let matches = cluster::nearest_centroids(
                    vectors.as_ref(),
                    workspace_id,
                    &embedding,
                    &config.cluster,
                )?;
                let candidates = {
                    let conn = lock(&db)?;
                    cluster::hydrate_candidates(&conn, workspace_id, &matches)?
                };
                Ok(cluster::decide(
                    &candidates,
                    &gating,
                    &extracted,
                    &resolved,
                    occurred_at,
                    &config.cluster,
                ))
            })
            .await?
        };

        // Atomic store, then the post-commit centroid seed for new clusters.
        let outcome = {
            let db = self.db.clone();
            let vectors = self.vectors.clone();
            let event = event.clone();
            let gating_for_store = gating.clone();
            let resolved = resolved_actor.clone();
            let extracted_for_store = extracted.clone();
            let views_for_store = views.clone();
            run_blocking("store", move || {
                let outcome = {
                    let mut conn = lock(&db)?;
                    store::persist(
                        &mut *conn,
                        store::NewObservation {
                            workspace_id,
                            event: &event,
                            gating: &gating_for_store,
                            actor: &resolved,
                            entities: &extracted_for_store,
                            views: &views_for_store,
                            decision,
                        },
                    )?
                };

                // Centroid seed runs with the guard released; the vector
                // store takes the connection lock itself.
                if let StoreOutcome::Stored(stored) = &outcome {
                    if stored.cluster_created {
                        // A failure here only delays the cluster becoming a
                        // candidate; the fanout drift writes the same key.
                        if let Err(e) = vectors.upsert(
                            VectorLayer::Clusters,
                            &stored.centroid_key,
                            &views_for_store.content_embedding,
                        ) {
                            warn!(
                                key = %stored.centroid_key,
                                error = %e,
                                "centroid seed failed; fanout will repair"
                            );
                        }
                    }
                }
                Ok(outcome)
            })
            .await?
        };

        let stored = match outcome {
            StoreOutcome::Deduplicated { public_id } => {
                return Ok(CaptureOutcome::Deduplicated { public_id });
            }
            StoreOutcome::Stored(stored) => stored,
        };

        self.capabilities.invalidate(workspace_id);

        if let Some(actor_id) = resolved_actor.actor_id {
            self.fanout.emit(FanoutEvent::ProfileUpdate {
                workspace_id,
                actor_id,
                observation_embedding: views.content_embedding.clone(),
            });
        }
        self.fanout.emit(FanoutEvent::ClusterSummaryCheck {
            workspace_id,
            cluster_id: stored.cluster_id,
            observation_embedding: views.content_embedding.clone(),
        });

        info!(
            public_id = %stored.public_id,
            workspace = workspace_slug,
            observation_type = %gating.observation_type,
            significance = gating.significance,
            cluster = %stored.cluster_public_id,
            cluster_created = stored.cluster_created,
            "observation captured"
        );

        Ok(CaptureOutcome::Stored {
            public_id: stored.public_id,
            observation_type: gating.observation_type.to_string(),
            significance: gating.significance,
            cluster_public_id: stored.cluster_public_id,
            cluster_created: stored.cluster_created,
            entity_count: extracted.len(),
        })
    }
}

fn lock(db: &Arc<Mutex<Connection>>) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
    db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))
}

/// Run a blocking closure, mapping both task panics and closure errors into
/// the retryable bucket tagged with the pipeline stage.
async fn run_blocking<T: Send + 'static>(
    stage: &'static str,
    f: impl FnOnce() -> anyhow::Result<T> + Send + 'static,
) -> Result<T, CaptureError> {
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CaptureError::retryable(stage, e)),
        Err(e) => Err(CaptureError::retryable(stage, anyhow::anyhow!(e))),
    }
}

// End-to-end capture behavior (gate discard, idempotency, cluster joining)
// is exercised in tests/capture_test.rs against the full stack.
