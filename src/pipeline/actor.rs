//! Actor identity resolution.
//!
//! Maps an event's raw actor hints to a canonical [`actor identity`] row.
//! Evidence tiers, strongest first: OAuth provider login (1.0), email match
//! (0.85), exact username re-sight (1.0), fuzzy username similarity (0.60),
//! and finally idempotent provisioning of a new identity (1.0). Resolution
//! failures degrade to an unlinked observation; they never fail a capture.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::event::EventActor;

/// Outcome of resolving an event's actor hints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedActor {
    pub actor_id: Option<i64>,
    /// Display-name snapshot denormalized onto the observation row.
    pub actor_name: Option<String>,
    pub confidence: Option<f64>,
}

impl ResolvedActor {
    pub fn unlinked() -> Self {
        Self::default()
    }

    fn linked(actor_id: i64, actor_name: String, confidence: f64) -> Self {
        Self {
            actor_id: Some(actor_id),
            actor_name: Some(actor_name),
            confidence: Some(confidence),
        }
    }
}

/// Minimum folded-username similarity for a fuzzy match.
const SIMILARITY_FLOOR: f64 = 0.8;

const CONFIDENCE_OAUTH: f64 = 1.0;
const CONFIDENCE_EMAIL: f64 = 0.85;
const CONFIDENCE_FUZZY: f64 = 0.60;
const CONFIDENCE_PROVISIONED: f64 = 1.0;

/// Resolve the event actor within a workspace. `source` is the event's
/// originating system and doubles as the OAuth provider name.
pub fn resolve(
    conn: &Connection,
    workspace_id: i64,
    source: &str,
    actor: Option<&EventActor>,
) -> ResolvedActor {
    let Some(actor) = actor else {
        return ResolvedActor::unlinked();
    };
    match try_resolve(conn, workspace_id, source, actor) {
        Ok(resolved) => resolved,
        Err(e) => {
            warn!(
                workspace_id,
                login = %actor.login,
                error = %e,
                "actor resolution failed; storing observation unlinked"
            );
            ResolvedActor::unlinked()
        }
    }
}

fn try_resolve(
    conn: &Connection,
    workspace_id: i64,
    source: &str,
    actor: &EventActor,
) -> Result<ResolvedActor> {
    // 1. OAuth connection directory
    if let Some((id, name)) = match_oauth(conn, workspace_id, source, &actor.login)? {
        return Ok(ResolvedActor::linked(id, name, CONFIDENCE_OAUTH));
    }

    // 2. Email match
    if let Some(email) = actor.email.as_deref() {
        if let Some((id, name)) = match_email(conn, workspace_id, email)? {
            return Ok(ResolvedActor::linked(id, name, CONFIDENCE_EMAIL));
        }
    }

    // 3. Exact username re-sight. Same outcome provisioning would reach,
    // surfaced early so repeat actors skip the fuzzy scan.
    if let Some((id, name)) = match_username(conn, workspace_id, &actor.login)? {
        return Ok(ResolvedActor::linked(id, name, CONFIDENCE_PROVISIONED));
    }

    // 4. Fuzzy username similarity
    if let Some((id, name)) = match_similar_username(conn, workspace_id, &actor.login)? {
        return Ok(ResolvedActor::linked(id, name, CONFIDENCE_FUZZY));
    }

    // 5. Provision a new identity
    let (id, name) = provision(conn, workspace_id, actor)?;
    Ok(ResolvedActor::linked(id, name, CONFIDENCE_PROVISIONED))
}

fn match_oauth(
    conn: &Connection,
    workspace_id: i64,
    provider: &str,
    login: &str,
) -> Result<Option<(i64, String)>> {
    conn.query_row(
        "SELECT a.id, a.display_name
         FROM oauth_connections o
         JOIN actor_identities a ON a.id = o.actor_id
         WHERE o.workspace_id = ?1 AND o.provider = ?2 AND o.provider_login = ?3",
        params![workspace_id, provider, login],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(Into::into)
}

fn match_email(
    conn: &Connection,
    workspace_id: i64,
    email: &str,
) -> Result<Option<(i64, String)>> {
    conn.query_row(
        "SELECT id, display_name FROM actor_identities
         WHERE workspace_id = ?1 AND email IS NOT NULL AND lower(email) = lower(?2)",
        params![workspace_id, email],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(Into::into)
}

fn match_username(
    conn: &Connection,
    workspace_id: i64,
    login: &str,
) -> Result<Option<(i64, String)>> {
    conn.query_row(
        "SELECT id, display_name FROM actor_identities
         WHERE workspace_id = ?1 AND username = ?2",
        params![workspace_id, login],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(Into::into)
}

/// Scan the workspace's identities for the best folded-username match at or
/// above [`SIMILARITY_FLOOR`].
fn match_similar_username(
    conn: &Connection,
    workspace_id: i64,
    login: &str,
) -> Result<Option<(i64, String)>> {
    let mut stmt = conn.prepare(
        "SELECT id, username, display_name FROM actor_identities WHERE workspace_id = ?1",
    )?;
    let identities: Vec<(i64, String, String)> = stmt
        .query_map(params![workspace_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut best: Option<(i64, String, f64)> = None;
    for (id, username, display_name) in identities {
        let score = username_similarity(login, &username);
        if score >= SIMILARITY_FLOOR && best.as_ref().map(|b| score > b.2).unwrap_or(true) {
            best = Some((id, display_name, score));
        }
    }
    Ok(best.map(|(id, name, _)| (id, name)))
}

/// Create the identity if it does not exist, then read it back. INSERT OR
/// IGNORE on the `(workspace_id, username)` natural key keeps concurrent
/// first sights idempotent.
fn provision(conn: &Connection, workspace_id: i64, actor: &EventActor) -> Result<(i64, String)> {
    let public_id = format!("act_{}", uuid::Uuid::now_v7());
    let display_name = actor
        .display_name
        .clone()
        .unwrap_or_else(|| actor.login.clone());
    let now = chrono::Utc::now().to_rfc3339();

    conn.execute(
        "INSERT OR IGNORE INTO actor_identities
             (public_id, workspace_id, display_name, username, email, avatar_url, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            public_id,
            workspace_id,
            display_name,
            actor.login,
            actor.email,
            actor.avatar_url,
            now
        ],
    )?;

    conn.query_row(
        "SELECT id, display_name FROM actor_identities
         WHERE workspace_id = ?1 AND username = ?2",
        params![workspace_id, actor.login],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .map_err(Into::into)
}

/// Normalized similarity between two usernames after case and separator
/// folding. 1.0 means identical once folded.
pub fn username_similarity(a: &str, b: &str) -> f64 {
    let fa = fold_username(a);
    let fb = fold_username(b);
    if fa.is_empty() || fb.is_empty() {
        return 0.0;
    }
    if fa == fb {
        return 1.0;
    }
    let dist = levenshtein(&fa, &fb) as f64;
    let max_len = fa.chars().count().max(fb.chars().count()) as f64;
    1.0 - dist / max_len
}

fn fold_username(username: &str) -> String {
    username
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1)
                .min(curr[j - 1] + 1)
                .min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}
