//! Per-workspace statistics.

use std::collections::BTreeMap;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct WorkspaceStats {
    pub workspace: String,
    pub observations: i64,
    pub clusters: ClusterStats,
    pub actors: i64,
    pub entities: i64,
    pub by_type: BTreeMap<String, i64>,
    pub by_source: BTreeMap<String, i64>,
    pub capture: CaptureStats,
    /// Earliest and latest `occurred_at` across stored observations.
    pub time_range: Option<TimeRange>,
    pub db_size_bytes: i64,
}

#[derive(Debug, Serialize)]
pub struct ClusterStats {
    pub total: i64,
    pub open: i64,
}

/// Capture audit counts, straight from `capture_log`.
#[derive(Debug, Default, Serialize)]
pub struct CaptureStats {
    pub stored: i64,
    pub deduplicated: i64,
    pub discarded: i64,
}

#[derive(Debug, Serialize)]
pub struct TimeRange {
    pub from: String,
    pub to: String,
}

pub fn collect(conn: &Connection, workspace_id: i64, slug: &str) -> Result<WorkspaceStats> {
    let observations = count(
        conn,
        "SELECT COUNT(*) FROM observations WHERE workspace_id = ?1",
        workspace_id,
    )?;
    let clusters = ClusterStats {
        total: count(
            conn,
            "SELECT COUNT(*) FROM clusters WHERE workspace_id = ?1",
            workspace_id,
        )?,
        open: count(
            conn,
            "SELECT COUNT(*) FROM clusters WHERE workspace_id = ?1 AND status = 'open'",
            workspace_id,
        )?,
    };
    let actors = count(
        conn,
        "SELECT COUNT(*) FROM actor_identities WHERE workspace_id = ?1",
        workspace_id,
    )?;
    let entities = count(
        conn,
        "SELECT COUNT(*) FROM entities WHERE workspace_id = ?1",
        workspace_id,
    )?;

    let by_type = grouped(
        conn,
        "SELECT observation_type, COUNT(*) FROM observations
         WHERE workspace_id = ?1 GROUP BY observation_type",
        workspace_id,
    )?;
    let by_source = grouped(
        conn,
        "SELECT source, COUNT(*) FROM observations
         WHERE workspace_id = ?1 GROUP BY source",
        workspace_id,
    )?;

    let mut capture = CaptureStats::default();
    for (outcome, n) in grouped(
        conn,
        "SELECT outcome, COUNT(*) FROM capture_log
         WHERE workspace_id = ?1 GROUP BY outcome",
        workspace_id,
    )? {
        match outcome.as_str() {
            "store" => capture.stored = n,
            "dedup" => capture.deduplicated = n,
            "discard" => capture.discarded = n,
            _ => {}
        }
    }

    let time_range = conn
        .query_row(
            "SELECT MIN(occurred_at), MAX(occurred_at) FROM observations
             WHERE workspace_id = ?1",
            params![workspace_id],
            |row| {
                Ok(match (row.get::<_, Option<String>>(0)?, row.get(1)?) {
                    (Some(from), Some(to)) => Some(TimeRange { from, to }),
                    _ => None,
                })
            },
        )
        .optional()?
        .flatten();

    let db_size_bytes: i64 = conn.query_row(
        "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        [],
        |row| row.get(0),
    )?;

    Ok(WorkspaceStats {
        workspace: slug.to_string(),
        observations,
        clusters,
        actors,
        entities,
        by_type,
        by_source,
        capture,
        time_range,
        db_size_bytes,
    })
}

fn count(conn: &Connection, sql: &str, workspace_id: i64) -> Result<i64> {
    Ok(conn.query_row(sql, params![workspace_id], |row| row.get(0))?)
}

fn grouped(conn: &Connection, sql: &str, workspace_id: i64) -> Result<BTreeMap<String, i64>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params![workspace_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    Ok(rows)
}
