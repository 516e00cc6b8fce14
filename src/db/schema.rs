//! SQL DDL for all mnema tables.
//!
//! Defines the relational tables (`workspaces`, `observations`, `entities`,
//! `clusters`, `actor_identities`, `oauth_connections`, `actor_profiles`,
//! `capture_log`, `schema_meta`) and the vec0 virtual tables
//! (`observations_vec`, `clusters_vec`, `profiles_vec`). All DDL uses
//! `IF NOT EXISTS` for idempotent initialization.

use rusqlite::Connection;

/// All schema DDL statements for mnema's relational tables.
const SCHEMA_SQL: &str = r#"
-- Tenancy root. Everything below cascades from here.
CREATE TABLE IF NOT EXISTS workspaces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

-- Canonical person identities, provisioned on first sight.
CREATE TABLE IF NOT EXISTS actor_identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    display_name TEXT NOT NULL,
    username TEXT NOT NULL,
    email TEXT,
    avatar_url TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(workspace_id, username)
);

-- Externally-populated provider login directory (tier-1 actor evidence).
CREATE TABLE IF NOT EXISTS oauth_connections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    actor_id INTEGER NOT NULL REFERENCES actor_identities(id) ON DELETE CASCADE,
    provider TEXT NOT NULL,
    provider_login TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(workspace_id, provider, provider_login)
);

-- Narrative groupings of related observations.
CREATE TABLE IF NOT EXISTS clusters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    topic_label TEXT NOT NULL,
    keywords TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'open' CHECK(status IN ('open','closed')),
    observation_count INTEGER NOT NULL DEFAULT 0,
    centroid_vector_id TEXT,
    summary TEXT,
    summary_generated_at TEXT,
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_clusters_workspace_status ON clusters(workspace_id, status);
CREATE INDEX IF NOT EXISTS idx_clusters_activity ON clusters(last_activity_at);

-- Core observation storage.
CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_id TEXT NOT NULL UNIQUE,
    workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    occurred_at TEXT NOT NULL,
    captured_at TEXT NOT NULL,
    observation_type TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    topics TEXT NOT NULL DEFAULT '[]',
    significance INTEGER NOT NULL CHECK(significance >= 0 AND significance <= 100),
    actor_id INTEGER REFERENCES actor_identities(id) ON DELETE SET NULL,
    actor_name TEXT,
    actor_confidence REAL,
    source TEXT NOT NULL,
    source_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    source_refs TEXT NOT NULL DEFAULT '[]',
    cluster_id INTEGER REFERENCES clusters(id) ON DELETE SET NULL,
    title_vector_id TEXT,
    content_vector_id TEXT,
    summary_vector_id TEXT,
    UNIQUE(workspace_id, source, source_id)
);

CREATE INDEX IF NOT EXISTS idx_observations_workspace ON observations(workspace_id);
CREATE INDEX IF NOT EXISTS idx_observations_cluster ON observations(cluster_id);
CREATE INDEX IF NOT EXISTS idx_observations_actor ON observations(actor_id);
CREATE INDEX IF NOT EXISTS idx_observations_occurred ON observations(occurred_at);
CREATE INDEX IF NOT EXISTS idx_observations_type ON observations(observation_type);

-- Extracted entity mentions. No lifecycle of their own.
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    observation_id INTEGER NOT NULL REFERENCES observations(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    value TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_observation ON entities(observation_id);
CREATE INDEX IF NOT EXISTS idx_entities_lookup ON entities(workspace_id, kind, value);

-- Eventually-consistent per-actor aggregates, written only by the fanout worker.
CREATE TABLE IF NOT EXISTS actor_profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id INTEGER NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    actor_id INTEGER NOT NULL REFERENCES actor_identities(id) ON DELETE CASCADE,
    expertise TEXT NOT NULL DEFAULT '{}',
    contribution_counts TEXT NOT NULL DEFAULT '{}',
    active_hours TEXT NOT NULL DEFAULT '[]',
    collaborators TEXT NOT NULL DEFAULT '{}',
    profile_vector_id TEXT,
    observation_count INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    UNIQUE(workspace_id, actor_id)
);

-- Capture audit log
CREATE TABLE IF NOT EXISTS capture_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workspace_id INTEGER NOT NULL,
    outcome TEXT NOT NULL CHECK(outcome IN ('store','dedup','discard')),
    source TEXT NOT NULL,
    source_id TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

-- Schema metadata
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// vec0 virtual tables must be created separately (sqlite-vec syntax).
/// Observation view vectors, cluster centroids, and actor-profile centroids
/// live in separate tables so a KNN query never crosses layers.
const VEC_TABLE_SQL: &str = r#"
CREATE VIRTUAL TABLE IF NOT EXISTS observations_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);

CREATE VIRTUAL TABLE IF NOT EXISTS clusters_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);

CREATE VIRTUAL TABLE IF NOT EXISTS profiles_vec USING vec0(
    id TEXT PRIMARY KEY,
    embedding FLOAT[384]
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute_batch(VEC_TABLE_SQL)?;

    // Set initial schema version if not already present
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', '1')",
        [],
    )?;

    Ok(())
}
