//! Workspace capability flags.
//!
//! A young workspace has no clusters and no resolved actors, so the cluster
//! and actor search paths would always come back empty. The governor asks
//! this index before fanning out and skips paths that cannot produce
//! results. Flags are cached per workspace and invalidated after any
//! capture commit or workspace deletion.

use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkspaceCapabilities {
    pub has_clusters: bool,
    pub has_actors: bool,
}

pub struct CapabilityIndex {
    conn: Arc<Mutex<Connection>>,
    cache: RwLock<HashMap<i64, WorkspaceCapabilities>>,
}

impl CapabilityIndex {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            conn,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Read-through lookup. Cache miss costs two EXISTS queries.
    pub fn get(&self, workspace_id: i64) -> Result<WorkspaceCapabilities> {
        if let Some(caps) = self
            .cache
            .read()
            .map_err(|e| anyhow::anyhow!("capability cache poisoned: {e}"))?
            .get(&workspace_id)
        {
            return Ok(*caps);
        }

        let caps = {
            let conn = self
                .conn
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            WorkspaceCapabilities {
                has_clusters: exists(&conn, "SELECT 1 FROM clusters WHERE workspace_id = ?1 LIMIT 1", workspace_id)?,
                has_actors: exists(&conn, "SELECT 1 FROM actor_identities WHERE workspace_id = ?1 LIMIT 1", workspace_id)?,
            }
        };

        self.cache
            .write()
            .map_err(|e| anyhow::anyhow!("capability cache poisoned: {e}"))?
            .insert(workspace_id, caps);
        Ok(caps)
    }

    /// Drop the cached entry so the next lookup re-reads the database.
    pub fn invalidate(&self, workspace_id: i64) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&workspace_id);
        }
    }
}

fn exists(conn: &Connection, sql: &str, workspace_id: i64) -> Result<bool> {
    use rusqlite::OptionalExtension;
    let hit: Option<i64> = conn
        .query_row(sql, [workspace_id], |row| row.get(0))
        .optional()?;
    Ok(hit.is_some())
}
