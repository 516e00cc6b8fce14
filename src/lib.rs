//! Ambient memory for engineering teams.
//!
//! mnema turns the event exhaust of development tools (pushes, merged pull
//! requests, deploys, incident messages) into durable, searchable
//! observations. Every event flows through one capture pipeline:
//!
//! 1. **Gate** — score significance from the event type and content signals;
//!    events below the floor are discarded before any expensive work.
//! 2. **Parallel phase** — embed the title/content/summary views, extract
//!    typed entities, and resolve the actor to a canonical identity, all
//!    concurrently.
//! 3. **Cluster** — assign the observation to a narrative cluster (or open
//!    a new one) by blending vector similarity, entity and actor overlap,
//!    and temporal proximity.
//! 4. **Store** — one transaction writes the observation, its entities, and
//!    the cluster bookkeeping; capture is idempotent on
//!    `(workspace, source, source_id)`.
//! 5. **Fanout** — fire-and-forget updates to actor profiles, cluster
//!    centroids, and summaries.
//!
//! Retrieval fans a query out over four concurrent paths (vector, entity,
//! cluster, actor), merges the candidates, and reranks per the requested
//! mode.
//!
//! # Architecture
//!
//! - **Storage**: SQLite with [sqlite-vec](https://github.com/asg017/sqlite-vec)
//!   vec0 virtual tables for vector search
//! - **Embeddings**: Local ONNX Runtime with all-MiniLM-L6-v2 (384 dimensions)
//! - **Transport**: JSON over HTTP (axum)

pub mod capability;
pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod search;
pub mod server;
pub mod stats;
pub mod vector;
pub mod workspace;
