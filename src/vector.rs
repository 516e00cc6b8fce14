//! Vector persistence behind a narrow seam.
//!
//! Defines [`VectorStore`] (upsert/query/delete on keyed float vectors) and
//! the default sqlite-vec implementation. Observation views, cluster
//! centroids, and actor-profile centroids live in separate vec0 tables
//! ([`VectorLayer`]) so KNN never crosses layers. Workspace scoping rides on
//! (`ws{id}:...`) because vec0 KNN cannot take relational predicates.

use anyhow::Result;
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

/// Which vector partition to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorLayer {
    /// Per-view observation embeddings.
    Observations,
    /// Cluster centroid embeddings.
    Clusters,
    /// Actor-profile centroid embeddings.
    Profiles,
}

impl VectorLayer {
    fn table(&self) -> &'static str {
        match self {
            Self::Observations => "observations_vec",
            Self::Clusters => "clusters_vec",
            Self::Profiles => "profiles_vec",
        }
    }
}

/// One KNN hit. `distance` is L2; for normalized vectors use [`VectorMatch::cosine`].
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub key: String,
    pub distance: f64,
}

impl VectorMatch {
    /// Cosine similarity, assuming both vectors were L2-normalized
    /// (`cos = 1 - d^2 / 2`).
    pub fn cosine(&self) -> f64 {
        1.0 - (self.distance * self.distance) / 2.0
    }
}

/// Keyed vector storage. Synchronous like [`crate::embedding::EmbeddingProvider`];
/// async callers go through `tokio::task::spawn_blocking`.
pub trait VectorStore: Send + Sync {
    /// Insert or replace the vector stored under `key`.
    fn upsert(&self, layer: VectorLayer, key: &str, embedding: &[f32]) -> Result<()>;

    /// Nearest neighbors to `embedding`, restricted to keys starting with
    /// `key_prefix` (pass `""` for no restriction). Results are ordered by
    /// ascending distance and truncated to `top_k`.
    fn query(
        &self,
        layer: VectorLayer,
        embedding: &[f32],
        top_k: usize,
        key_prefix: &str,
    ) -> Result<Vec<VectorMatch>>;

    /// Read back the vector stored under `key`, if any. Used for
    /// incremental centroid updates.
    fn fetch(&self, layer: VectorLayer, key: &str) -> Result<Option<Vec<f32>>>;

    /// Remove a single key. Missing keys are not an error.
    fn delete(&self, layer: VectorLayer, key: &str) -> Result<()>;

    /// Remove every key starting with `prefix`. Returns the number removed.
    fn delete_prefix(&self, layer: VectorLayer, prefix: &str) -> Result<usize>;
}

/// How many extra KNN candidates to fetch per requested result when a key
/// prefix must be filtered app-side.
const PREFIX_OVERFETCH: usize = 4;

/// sqlite-vec implementation sharing the relational connection.
pub struct SqliteVectorStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteVectorStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))
    }
}

impl VectorStore for SqliteVectorStore {
    fn upsert(&self, layer: VectorLayer, key: &str, embedding: &[f32]) -> Result<()> {
        let conn = self.lock()?;
        // vec0 has no ON CONFLICT; delete-then-insert is the replace idiom.
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", layer.table()),
            params![key],
        )?;
        conn.execute(
            &format!(
                "INSERT INTO {} (id, embedding) VALUES (?1, ?2)",
                layer.table()
            ),
            params![key, embedding_to_bytes(embedding)],
        )?;
        Ok(())
    }

    fn query(
        &self,
        layer: VectorLayer,
        embedding: &[f32],
        top_k: usize,
        key_prefix: &str,
    ) -> Result<Vec<VectorMatch>> {
        if top_k == 0 {
            return Ok(vec![]);
        }
        let fetch = if key_prefix.is_empty() {
            top_k
        } else {
            top_k * PREFIX_OVERFETCH
        };

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, distance FROM {} WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
            layer.table()
        ))?;
        let candidates: Vec<VectorMatch> = stmt
            .query_map(params![embedding_to_bytes(embedding), fetch as i64], |row| {
                Ok(VectorMatch {
                    key: row.get(0)?,
                    distance: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(candidates
            .into_iter()
            .filter(|m| m.key.starts_with(key_prefix))
            .take(top_k)
            .collect())
    }

    fn fetch(&self, layer: VectorLayer, key: &str) -> Result<Option<Vec<f32>>> {
        use rusqlite::OptionalExtension;
        let conn = self.lock()?;
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                &format!("SELECT embedding FROM {} WHERE id = ?1", layer.table()),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes.map(|b| bytes_to_embedding(&b)))
    }

    fn delete(&self, layer: VectorLayer, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", layer.table()),
            params![key],
        )?;
        Ok(())
    }

    fn delete_prefix(&self, layer: VectorLayer, prefix: &str) -> Result<usize> {
        let conn = self.lock()?;
        let keys: Vec<String> = {
            let mut stmt = conn.prepare(&format!("SELECT id FROM {}", layer.table()))?;
            let all = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            all.into_iter()
                .filter(|k| k.starts_with(prefix))
                .collect()
        };

        for key in &keys {
            conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", layer.table()),
                params![key],
            )?;
        }
        Ok(keys.len())
    }
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Convert raw bytes from sqlite-vec back to an f32 embedding.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors. Returns 0.0 if either is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x * y) as f64).sum();
    let norm_a: f64 = a.iter().map(|x| (x * x) as f64).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (x * x) as f64).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteVectorStore {
        let conn = crate::db::open_memory_database().unwrap();
        SqliteVectorStore::new(Arc::new(Mutex::new(conn)))
    }

    fn spike(pos: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 384];
        v[pos % 384] = 1.0;
        v
    }

    #[test]
    fn upsert_replaces_existing_key() {
        let store = store();
        store
            .upsert(VectorLayer::Observations, "ws1:code-change:e1:content", &spike(0))
            .unwrap();
        store
            .upsert(VectorLayer::Observations, "ws1:code-change:e1:content", &spike(5))
            .unwrap();

        let hits = store
            .query(VectorLayer::Observations, &spike(5), 10, "")
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].distance < 1e-6);
    }

    #[test]
    fn query_filters_by_prefix() {
        let store = store();
        store
            .upsert(VectorLayer::Observations, "ws1:deployment:a:content", &spike(0))
            .unwrap();
        store
            .upsert(VectorLayer::Observations, "ws2:deployment:b:content", &spike(0))
            .unwrap();

        let hits = store
            .query(VectorLayer::Observations, &spike(0), 10, "ws1:")
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].key.starts_with("ws1:"));
    }

    #[test]
    fn layers_do_not_leak() {
        let store = store();
        store
            .upsert(VectorLayer::Observations, "ws1:release:x:content", &spike(3))
            .unwrap();

        let cluster_hits = store
            .query(VectorLayer::Clusters, &spike(3), 10, "")
            .unwrap();
        assert!(cluster_hits.is_empty());
    }

    #[test]
    fn delete_prefix_scopes_to_workspace() {
        let store = store();
        store
            .upsert(VectorLayer::Clusters, "ws1:cl_a", &spike(1))
            .unwrap();
        store
            .upsert(VectorLayer::Clusters, "ws1:cl_b", &spike(2))
            .unwrap();
        store
            .upsert(VectorLayer::Clusters, "ws10:cl_c", &spike(3))
            .unwrap();

        let removed = store.delete_prefix(VectorLayer::Clusters, "ws1:").unwrap();
        assert_eq!(removed, 2);

        let survivors = store
            .query(VectorLayer::Clusters, &spike(3), 10, "")
            .unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].key, "ws10:cl_c");
    }

    #[test]
    fn cosine_from_l2_distance_of_normalized_vectors() {
        let store = store();
        store
            .upsert(VectorLayer::Observations, "ws1:a", &spike(0))
            .unwrap();

        // Orthogonal unit vectors: l2 distance sqrt(2), cosine 0.
        let hits = store
            .query(VectorLayer::Observations, &spike(1), 1, "")
            .unwrap();
        assert!((hits[0].distance - std::f64::consts::SQRT_2).abs() < 1e-5);
        assert!(hits[0].cosine().abs() < 1e-5);
    }

    #[test]
    fn fetch_reads_back_stored_vector() {
        let store = store();
        assert!(store
            .fetch(VectorLayer::Profiles, "ws1:act_1")
            .unwrap()
            .is_none());

        store
            .upsert(VectorLayer::Profiles, "ws1:act_1", &spike(7))
            .unwrap();
        let fetched = store.fetch(VectorLayer::Profiles, "ws1:act_1").unwrap();
        assert_eq!(fetched, Some(spike(7)));
    }

    #[test]
    fn byte_round_trip() {
        let v = vec![0.25f32, -1.5, 3.75];
        let bytes = embedding_to_bytes(&v).to_vec();
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes_to_embedding(&bytes), v);
    }

    #[test]
    fn cosine_similarity_basics() {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.0f32, 1.0];
        assert!(cosine_similarity(&a, &a) > 0.999);
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0]), 0.0);
    }
}
