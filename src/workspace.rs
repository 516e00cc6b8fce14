//! Workspace lifecycle.
//!
//! Workspaces are the tenancy root: every observation, entity, cluster,
//! identity, and profile hangs off one. Capture ensures the workspace row
//! exists; deletion cascades through the relational tables and sweeps the
//! workspace's key prefix out of every vector layer.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::vector::{VectorLayer, VectorStore};

/// Key prefix for everything this workspace owns in the vector store.
pub fn vector_prefix(workspace_id: i64) -> String {
    format!("ws{workspace_id}:")
}

/// Look up a workspace by slug.
pub fn find(conn: &Connection, slug: &str) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM workspaces WHERE slug = ?1",
        params![slug],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

/// Look up a workspace by slug, creating it if absent. INSERT OR IGNORE on
/// the unique slug keeps concurrent first captures idempotent.
pub fn ensure(conn: &Connection, slug: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO workspaces (slug, created_at) VALUES (?1, ?2)",
        params![slug, chrono::Utc::now().to_rfc3339()],
    )?;
    find(conn, slug)?.ok_or_else(|| anyhow::anyhow!("workspace {slug} not found after insert"))
}

/// Delete a workspace's relational rows (FK cascade does the fan-out).
/// Returns the deleted workspace's id, or `None` if the slug did not exist.
/// Callers follow up with [`sweep_vectors`] AFTER releasing the connection
/// guard; the embedded vector store locks the same connection.
pub fn delete_rows(conn: &Connection, slug: &str) -> Result<Option<i64>> {
    let Some(workspace_id) = find(conn, slug)? else {
        return Ok(None);
    };

    conn.execute("DELETE FROM workspaces WHERE id = ?1", params![workspace_id])?;
    conn.execute(
        "DELETE FROM capture_log WHERE workspace_id = ?1",
        params![workspace_id],
    )?;
    Ok(Some(workspace_id))
}

/// Sweep the workspace's key prefix out of every vector layer. Returns the
/// number of vectors removed.
pub fn sweep_vectors(vectors: &dyn VectorStore, workspace_id: i64) -> Result<usize> {
    let prefix = vector_prefix(workspace_id);
    let mut removed = 0;
    for layer in [
        VectorLayer::Observations,
        VectorLayer::Clusters,
        VectorLayer::Profiles,
    ] {
        removed += vectors.delete_prefix(layer, &prefix)?;
    }
    tracing::info!(workspace_id, vectors_removed = removed, "workspace vectors swept");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::SqliteVectorStore;
    use std::sync::{Arc, Mutex};

    fn setup() -> (Arc<Mutex<Connection>>, SqliteVectorStore) {
        let conn = Arc::new(Mutex::new(crate::db::open_memory_database().unwrap()));
        let vectors = SqliteVectorStore::new(conn.clone());
        (conn, vectors)
    }

    #[test]
    fn ensure_is_idempotent() {
        let (conn, _) = setup();
        let conn = conn.lock().unwrap();
        let a = ensure(&conn, "acme").unwrap();
        let b = ensure(&conn, "acme").unwrap();
        assert_eq!(a, b);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM workspaces", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn delete_cascades_rows_and_vectors() {
        let (conn_arc, vectors) = setup();
        let workspace_id = {
            let conn = conn_arc.lock().unwrap();
            let id = ensure(&conn, "acme").unwrap();
            conn.execute(
                "INSERT INTO actor_identities
                     (public_id, workspace_id, display_name, username, created_at)
                 VALUES ('act_1', ?1, 'Maria', 'mkowalski', '2026-08-01T00:00:00Z')",
                params![id],
            )
            .unwrap();
            id
        };

        let mut spike = vec![0.0f32; 384];
        spike[0] = 1.0;
        vectors
            .upsert(
                VectorLayer::Observations,
                &format!("ws{workspace_id}:code-change:e1:content"),
                &spike,
            )
            .unwrap();

        let deleted = {
            let conn = conn_arc.lock().unwrap();
            let deleted = delete_rows(&conn, "acme").unwrap();

            let actors: i64 = conn
                .query_row("SELECT COUNT(*) FROM actor_identities", [], |r| r.get(0))
                .unwrap();
            assert_eq!(actors, 0);
            deleted
        };

        // Vector sweep runs after the guard is released, like the server does.
        let removed = sweep_vectors(&vectors, deleted.unwrap()).unwrap();
        assert_eq!(removed, 1);

        let hits = vectors
            .query(VectorLayer::Observations, &spike, 10, "")
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn delete_missing_slug_is_none() {
        let (conn, _) = setup();
        let conn = conn.lock().unwrap();
        assert!(delete_rows(&conn, "nope").unwrap().is_none());
    }
}
