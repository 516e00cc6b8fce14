//! Fire-and-forget fanout.
//!
//! After a capture commits, the coordinator publishes events onto a bounded
//! mpsc channel and moves on. One worker task consumes them and maintains
//! the eventually-consistent aggregates: actor profiles, cluster centroid
//! drift, cluster summaries, and idle-cluster closing. Worker failures are
//! retried a bounded number of times and then logged; they never reach the
//! capture path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::MnemaConfig;
use crate::vector::{VectorLayer, VectorStore};

/// Events the capture path emits after commit.
#[derive(Debug, Clone)]
pub enum FanoutEvent {
    /// Recompute the actor's aggregate profile after a new attribution.
    ProfileUpdate {
        workspace_id: i64,
        actor_id: i64,
        observation_embedding: Vec<f32>,
    },
    /// Drift the cluster centroid and refresh the summary if stale.
    ClusterSummaryCheck {
        workspace_id: i64,
        cluster_id: i64,
        observation_embedding: Vec<f32>,
    },
}

/// Sending side of the fanout channel. Emission never blocks: a full queue
/// drops the event with a warning (the aggregates are self-healing — the
/// next event for the same actor/cluster recomputes them).
#[derive(Clone)]
pub struct FanoutHandle {
    tx: mpsc::Sender<FanoutEvent>,
}

impl FanoutHandle {
    pub fn emit(&self, event: FanoutEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "fanout queue rejected event; dropping");
        }
    }
}

/// Spawn the fanout worker. Returns the handle captures emit through and
/// the worker's join handle (held by the server for shutdown).
pub fn spawn(
    config: Arc<MnemaConfig>,
    db: Arc<Mutex<Connection>>,
    vectors: Arc<dyn VectorStore>,
) -> (FanoutHandle, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<FanoutEvent>(config.fanout.queue_capacity);

    let worker = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let attempts = config.fanout.retry_attempts.max(1);
            for attempt in 1..=attempts {
                let config_clone = config.clone();
                let db = db.clone();
                let vectors = vectors.clone();
                let event_clone = event.clone();

                let result = tokio::task::spawn_blocking(move || {
                    process(&db, vectors.as_ref(), &config_clone, &event_clone)
                })
                .await;

                match result {
                    Ok(Ok(())) => break,
                    Ok(Err(e)) if attempt < attempts => {
                        debug!(attempt, error = %e, "fanout step failed; retrying");
                        tokio::time::sleep(Duration::from_millis(config.fanout.retry_delay_ms))
                            .await;
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, event = ?event, "fanout step gave up");
                    }
                    Err(e) => {
                        warn!(error = %e, "fanout task panicked");
                        break;
                    }
                }
            }
        }
        debug!("fanout worker stopped");
    });

    (FanoutHandle { tx }, worker)
}

/// Process one fanout event. Public so tests can drive the aggregates
/// synchronously instead of racing the worker. Takes the connection mutex
/// rather than a guard: each step locks only around its relational work, and
/// the embedded vector store locks the same connection internally.
pub fn process(
    db: &Mutex<Connection>,
    vectors: &dyn VectorStore,
    config: &MnemaConfig,
    event: &FanoutEvent,
) -> Result<()> {
    match event {
        FanoutEvent::ProfileUpdate {
            workspace_id,
            actor_id,
            observation_embedding,
        } => update_profile(db, vectors, *workspace_id, *actor_id, observation_embedding),
        FanoutEvent::ClusterSummaryCheck {
            workspace_id,
            cluster_id,
            observation_embedding,
        } => {
            check_cluster(db, vectors, config, *workspace_id, *cluster_id, observation_embedding)?;
            let conn = lock(db)?;
            close_idle_clusters(&conn, *workspace_id, config.cluster.close_after_days)
        }
    }
}

fn lock(db: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>> {
    db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))
}

/// Vector-store key for an actor's profile centroid.
pub fn profile_key(workspace_id: i64, actor_id: i64) -> String {
    format!("ws{workspace_id}:actor:{actor_id}")
}

/// Running-mean update: `new = old + (x - old) / n`. With no prior centroid
/// the observation becomes it.
fn drift(old: Option<Vec<f32>>, x: &[f32], n: i64) -> Vec<f32> {
    match old {
        Some(mut c) if n > 1 => {
            let n = n as f32;
            for (ci, xi) in c.iter_mut().zip(x.iter()) {
                *ci += (xi - *ci) / n;
            }
            c
        }
        _ => x.to_vec(),
    }
}

fn update_profile(
    db: &Mutex<Connection>,
    vectors: &dyn VectorStore,
    workspace_id: i64,
    actor_id: i64,
    embedding: &[f32],
) -> Result<()> {
    // All aggregate reads under one guard, released before the vector work.
    let (observation_count, contribution_counts, expertise, active_hours, collaborators) = {
        let conn = lock(db)?;
        let observation_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM observations WHERE workspace_id = ?1 AND actor_id = ?2",
            params![workspace_id, actor_id],
            |r| r.get(0),
        )?;
        if observation_count == 0 {
            return Ok(());
        }

        let contribution_counts = count_map(
            &conn,
            "SELECT observation_type, COUNT(*) FROM observations
             WHERE workspace_id = ?1 AND actor_id = ?2 GROUP BY observation_type",
            workspace_id,
            actor_id,
        )?;

        // Topic weights from the actor's observations (JSON1 over the topics array).
        let expertise = count_map(
            &conn,
            "SELECT je.value, COUNT(*) FROM observations o, json_each(o.topics) je
             WHERE o.workspace_id = ?1 AND o.actor_id = ?2 GROUP BY je.value",
            workspace_id,
            actor_id,
        )?;

        // 24-bucket histogram of activity by hour (UTC).
        let mut active_hours = [0i64; 24];
        {
            let mut stmt = conn.prepare(
                "SELECT CAST(strftime('%H', occurred_at) AS INTEGER), COUNT(*)
                 FROM observations WHERE workspace_id = ?1 AND actor_id = ?2
                 GROUP BY 1",
            )?;
            let rows = stmt.query_map(params![workspace_id, actor_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (hour, count) = row?;
                if (0..24).contains(&hour) {
                    active_hours[hour as usize] = count;
                }
            }
        }

        // Frequent collaborators: other actors sharing this actor's clusters.
        let collaborators = count_map(
            &conn,
            "SELECT a.username, COUNT(*)
             FROM observations mine
             JOIN observations theirs
                 ON theirs.cluster_id = mine.cluster_id AND theirs.actor_id != mine.actor_id
             JOIN actor_identities a ON a.id = theirs.actor_id
             WHERE mine.workspace_id = ?1 AND mine.actor_id = ?2
             GROUP BY theirs.actor_id ORDER BY COUNT(*) DESC LIMIT 8",
            workspace_id,
            actor_id,
        )?;

        (observation_count, contribution_counts, expertise, active_hours, collaborators)
    };

    let key = profile_key(workspace_id, actor_id);
    let centroid = drift(
        vectors.fetch(VectorLayer::Profiles, &key)?,
        embedding,
        observation_count,
    );
    vectors.upsert(VectorLayer::Profiles, &key, &centroid)?;

    let conn = lock(db)?;
    conn.execute(
        "INSERT INTO actor_profiles
             (workspace_id, actor_id, expertise, contribution_counts, active_hours,
              collaborators, profile_vector_id, observation_count, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(workspace_id, actor_id) DO UPDATE SET
             expertise = excluded.expertise,
             contribution_counts = excluded.contribution_counts,
             active_hours = excluded.active_hours,
             collaborators = excluded.collaborators,
             profile_vector_id = excluded.profile_vector_id,
             observation_count = excluded.observation_count,
             updated_at = excluded.updated_at",
        params![
            workspace_id,
            actor_id,
            serde_json::to_string(&expertise)?,
            serde_json::to_string(&contribution_counts)?,
            serde_json::to_string(&active_hours.to_vec())?,
            serde_json::to_string(&collaborators)?,
            key,
            observation_count,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;

    debug!(workspace_id, actor_id, observation_count, "actor profile updated");
    Ok(())
}

fn count_map(
    conn: &Connection,
    sql: &str,
    workspace_id: i64,
    actor_id: i64,
) -> Result<std::collections::BTreeMap<String, i64>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![workspace_id, actor_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<std::collections::BTreeMap<_, _>, _>>()?;
    Ok(rows)
}

fn check_cluster(
    db: &Mutex<Connection>,
    vectors: &dyn VectorStore,
    config: &MnemaConfig,
    workspace_id: i64,
    cluster_id: i64,
    embedding: &[f32],
) -> Result<()> {
    let row: Option<(String, String, i64, Option<String>)> = {
        let conn = lock(db)?;
        conn.query_row(
            "SELECT centroid_vector_id, topic_label, observation_count, summary_generated_at
             FROM clusters WHERE id = ?1 AND workspace_id = ?2",
            params![cluster_id, workspace_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?
    };
    let Some((centroid_key, topic_label, observation_count, summary_generated_at)) = row else {
        // Cluster deleted between commit and fanout; nothing to do.
        return Ok(());
    };

    // Incremental centroid drift toward the new member.
    let centroid = drift(
        vectors.fetch(VectorLayer::Clusters, &centroid_key)?,
        embedding,
        observation_count,
    );
    vectors.upsert(VectorLayer::Clusters, &centroid_key, &centroid)?;

    // Summary refresh when the cluster is big enough and the summary is
    // missing or stale.
    let stale = match summary_generated_at.as_deref() {
        None => true,
        Some(ts) => ts
            .parse::<chrono::DateTime<chrono::Utc>>()
            .map(|t| {
                chrono::Utc::now() - t
                    > chrono::Duration::hours(config.fanout.summary_staleness_hours)
            })
            .unwrap_or(true),
    };
    if observation_count >= config.fanout.summary_min_observations as i64 && stale {
        let conn = lock(db)?;
        regenerate_summary(&conn, cluster_id, &topic_label)?;
    }
    Ok(())
}

/// Extractive summary: the topic label plus the most recent member titles,
/// and a keyword refresh from member topics. No model call.
fn regenerate_summary(conn: &Connection, cluster_id: i64, topic_label: &str) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT title FROM observations WHERE cluster_id = ?1
         ORDER BY occurred_at DESC LIMIT 5",
    )?;
    let titles: Vec<String> = stmt
        .query_map(params![cluster_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut keyword_stmt = conn.prepare(
        "SELECT je.value, COUNT(*) FROM observations o, json_each(o.topics) je
         WHERE o.cluster_id = ?1 GROUP BY je.value ORDER BY COUNT(*) DESC LIMIT 12",
    )?;
    let keywords: Vec<String> = keyword_stmt
        .query_map(params![cluster_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let summary = format!("{topic_label}: {}", titles.join("; "));
    conn.execute(
        "UPDATE clusters SET summary = ?2, summary_generated_at = ?3, keywords = ?4
         WHERE id = ?1",
        params![
            cluster_id,
            summary,
            chrono::Utc::now().to_rfc3339(),
            serde_json::to_string(&keywords)?
        ],
    )
    .context("failed to update cluster summary")?;
    debug!(cluster_id, "cluster summary regenerated");
    Ok(())
}

/// Close clusters idle past the configured horizon. Closed clusters take no
/// new members; the assigner only considers open ones.
fn close_idle_clusters(conn: &Connection, workspace_id: i64, close_after_days: u64) -> Result<()> {
    let cutoff =
        (chrono::Utc::now() - chrono::Duration::days(close_after_days as i64)).to_rfc3339();
    let closed = conn.execute(
        "UPDATE clusters SET status = 'closed'
         WHERE workspace_id = ?1 AND status = 'open' AND last_activity_at < ?2",
        params![workspace_id, cutoff],
    )?;
    if closed > 0 {
        debug!(workspace_id, closed, "idle clusters closed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::SqliteVectorStore;

    fn setup() -> (Arc<Mutex<Connection>>, SqliteVectorStore, Arc<MnemaConfig>) {
        let conn = Arc::new(Mutex::new(crate::db::open_memory_database().unwrap()));
        let vectors = SqliteVectorStore::new(conn.clone());
        (conn, vectors, Arc::new(MnemaConfig::default()))
    }

    fn seed_observation(
        conn: &Connection,
        source_id: &str,
        actor_id: Option<i64>,
        cluster_id: Option<i64>,
        topics: &str,
        occurred_at: &str,
    ) {
        conn.execute(
            "INSERT INTO observations
                 (public_id, workspace_id, occurred_at, captured_at, observation_type,
                  title, content, topics, significance, actor_id, source, source_type,
                  source_id, cluster_id)
             VALUES (?1, 1, ?2, ?2, 'code-change', ?3, 'body', ?4, 70, ?5,
                 'github', 'pull_request.merged', ?1, ?6)",
            params![
                format!("obs_{source_id}"),
                occurred_at,
                format!("title {source_id}"),
                topics,
                actor_id,
                cluster_id
            ],
        )
        .unwrap();
    }

    fn spike(pos: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 384];
        v[pos % 384] = 1.0;
        v
    }

    #[test]
    fn drift_moves_centroid_toward_new_member() {
        let old = spike(0);
        let updated = drift(Some(old.clone()), &spike(1), 2);
        assert!((updated[0] - 0.5).abs() < 1e-6);
        assert!((updated[1] - 0.5).abs() < 1e-6);

        // First member becomes the centroid outright.
        assert_eq!(drift(None, &spike(3), 1), spike(3));
    }

    #[test]
    fn profile_update_builds_aggregates() {
        let (conn, vectors, config) = setup();
        {
            let guard = conn.lock().unwrap();
            guard
                .execute(
                    "INSERT INTO workspaces (slug, created_at) VALUES ('acme', '2026-08-01T00:00:00Z')",
                    [],
                )
                .unwrap();
            guard
                .execute(
                    "INSERT INTO actor_identities
                         (public_id, workspace_id, display_name, username, created_at)
                     VALUES ('act_1', 1, 'Maria', 'mkowalski', '2026-08-01T00:00:00Z')",
                    [],
                )
                .unwrap();
            seed_observation(
                &guard,
                "pr-1",
                Some(1),
                None,
                r#"["auth","database"]"#,
                "2026-08-01T09:15:00Z",
            );
            seed_observation(
                &guard,
                "pr-2",
                Some(1),
                None,
                r#"["auth"]"#,
                "2026-08-02T09:45:00Z",
            );
        }

        // The store shares the connection mutex, so process runs unguarded.
        process(
            &conn,
            &vectors,
            &config,
            &FanoutEvent::ProfileUpdate {
                workspace_id: 1,
                actor_id: 1,
                observation_embedding: spike(2),
            },
        )
        .unwrap();

        let guard = conn.lock().unwrap();
        let (expertise, hours, count): (String, String, i64) = guard
            .query_row(
                "SELECT expertise, active_hours, observation_count FROM actor_profiles
                 WHERE workspace_id = 1 AND actor_id = 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert!(expertise.contains("auth"));
        assert_eq!(count, 2);
        let hours: Vec<i64> = serde_json::from_str(&hours).unwrap();
        assert_eq!(hours.len(), 24);
        assert_eq!(hours[9], 2);
        drop(guard);

        // Profile vector landed in the profiles layer.
        assert!(vectors
            .fetch(VectorLayer::Profiles, &profile_key(1, 1))
            .unwrap()
            .is_some());
    }

    #[test]
    fn summary_regenerates_once_threshold_met() {
        let (conn, vectors, config) = setup();
        {
            let guard = conn.lock().unwrap();
            guard
                .execute(
                    "INSERT INTO workspaces (slug, created_at) VALUES ('acme', '2026-08-01T00:00:00Z')",
                    [],
                )
                .unwrap();
            guard
                .execute(
                    "INSERT INTO clusters
                         (public_id, workspace_id, topic_label, status, observation_count,
                          centroid_vector_id, created_at, last_activity_at)
                     VALUES ('cl_1', 1, 'auth', 'open', 3, 'ws1:cl_1',
                         '2026-08-01T00:00:00Z', '2026-08-20T00:00:00Z')",
                    [],
                )
                .unwrap();
            for (i, day) in [1, 2, 3].iter().enumerate() {
                seed_observation(
                    &guard,
                    &format!("pr-{i}"),
                    None,
                    Some(1),
                    r#"["auth"]"#,
                    &format!("2026-08-0{day}T10:00:00Z"),
                );
            }
        }
        vectors
            .upsert(VectorLayer::Clusters, "ws1:cl_1", &spike(0))
            .unwrap();

        process(
            &conn,
            &vectors,
            &config,
            &FanoutEvent::ClusterSummaryCheck {
                workspace_id: 1,
                cluster_id: 1,
                observation_embedding: spike(1),
            },
        )
        .unwrap();

        let (summary, keywords): (String, String) = {
            let guard = conn.lock().unwrap();
            guard
                .query_row(
                    "SELECT summary, keywords FROM clusters WHERE id = 1",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .unwrap()
        };
        assert!(summary.starts_with("auth:"));
        assert!(summary.contains("title pr-2"));
        assert!(keywords.contains("auth"));

        // Centroid drifted off the pure spike.
        let centroid = vectors
            .fetch(VectorLayer::Clusters, "ws1:cl_1")
            .unwrap()
            .unwrap();
        assert!(centroid[0] < 1.0 && centroid[0] > 0.0);
        assert!(centroid[1] > 0.0);
    }

    #[test]
    fn idle_clusters_get_closed() {
        let (conn, vectors, config) = setup();
        {
            let guard = conn.lock().unwrap();
            guard
                .execute(
                    "INSERT INTO workspaces (slug, created_at) VALUES ('acme', '2026-08-01T00:00:00Z')",
                    [],
                )
                .unwrap();
            // One ancient cluster, one current.
            guard
                .execute(
                    "INSERT INTO clusters
                         (public_id, workspace_id, topic_label, status, observation_count,
                          centroid_vector_id, created_at, last_activity_at)
                     VALUES ('cl_old', 1, 'stale', 'open', 1, 'ws1:cl_old',
                         '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                    [],
                )
                .unwrap();
            guard
                .execute(
                    "INSERT INTO clusters
                         (public_id, workspace_id, topic_label, status, observation_count,
                          centroid_vector_id, created_at, last_activity_at)
                     VALUES ('cl_new', 1, 'fresh', 'open', 1, 'ws1:cl_new', ?1, ?1)",
                    params![chrono::Utc::now().to_rfc3339()],
                )
                .unwrap();
        }
        vectors
            .upsert(VectorLayer::Clusters, "ws1:cl_new", &spike(0))
            .unwrap();

        process(
            &conn,
            &vectors,
            &config,
            &FanoutEvent::ClusterSummaryCheck {
                workspace_id: 1,
                cluster_id: 2,
                observation_embedding: spike(0),
            },
        )
        .unwrap();

        let guard = conn.lock().unwrap();
        let status_old: String = guard
            .query_row("SELECT status FROM clusters WHERE public_id = 'cl_old'", [], |r| {
                r.get(0)
            })
            .unwrap();
        let status_new: String = guard
            .query_row("SELECT status FROM clusters WHERE public_id = 'cl_new'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(status_old, "closed");
        assert_eq!(status_new, "open");
    }
}
