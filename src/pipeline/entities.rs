//! Entity extraction.
//!
//! Pure pattern matching over event text plus a direct mapping of the
//! event's typed references. Produces [`ExtractedEntity`] rows that are
//! stored alongside the observation and drive the entity search path and
//! cluster overlap scoring. Extraction never fails; at worst it returns an
//! empty list.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::event::{RefKind, SourceEvent};

/// The entity kinds extraction can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Person,
    Repo,
    Ticket,
    Issue,
    Commit,
    Branch,
    Deployment,
    Release,
    Url,
    Email,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Repo => "repo",
            Self::Ticket => "ticket",
            Self::Issue => "issue",
            Self::Commit => "commit",
            Self::Branch => "branch",
            Self::Deployment => "deployment",
            Self::Release => "release",
            Self::Url => "url",
            Self::Email => "email",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "person" => Ok(Self::Person),
            "repo" => Ok(Self::Repo),
            "ticket" => Ok(Self::Ticket),
            "issue" => Ok(Self::Issue),
            "commit" => Ok(Self::Commit),
            "branch" => Ok(Self::Branch),
            "deployment" => Ok(Self::Deployment),
            "release" => Ok(Self::Release),
            "url" => Ok(Self::Url),
            "email" => Ok(Self::Email),
            _ => Err(format!("unknown entity kind: {s}")),
        }
    }
}

/// One extracted mention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntity {
    pub kind: EntityKind,
    pub value: String,
}

/// Static regex for ticket IDs (ABC-123, PROJ-4567).
fn ticket_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Z]{2,10}-\d+)\b").unwrap())
}

/// Static regex for @mentions.
fn mention_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@([A-Za-z0-9][A-Za-z0-9-]{1,38})\b").unwrap())
}

/// Static regex for #123 issue references.
fn issue_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[\s(])#(\d{1,8})\b").unwrap())
}

/// Static regex for owner/repo slugs.
fn repo_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([A-Za-z0-9][A-Za-z0-9_.-]*/[A-Za-z0-9][A-Za-z0-9_.-]*)\b").unwrap()
    })
}

/// Static regex for commit SHAs (7-40 hex chars, word-bounded).
fn sha_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([0-9a-f]{7,40})\b").unwrap())
}

/// Static regex for URLs.
fn url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"')]+"#).unwrap())
}

/// Static regex for email addresses.
fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
    })
}

/// Extract entities from an event's text and typed references.
/// Deduplicated case-insensitively by (kind, value), first spelling kept.
pub fn extract(event: &SourceEvent) -> Vec<ExtractedEntity> {
    let mut out = Vec::new();
    let mut seen: HashSet<(EntityKind, String)> = HashSet::new();

    let mut push = |kind: EntityKind, value: &str, out: &mut Vec<ExtractedEntity>| {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        if seen.insert((kind, value.to_lowercase())) {
            out.push(ExtractedEntity {
                kind,
                value: value.to_string(),
            });
        }
    };

    // 1. Typed references straight from the connector
    for r in &event.references {
        let kind = match r.kind {
            RefKind::Commit => EntityKind::Commit,
            RefKind::Branch => EntityKind::Branch,
            RefKind::PullRequest | RefKind::Issue => EntityKind::Issue,
            RefKind::Deployment => EntityKind::Deployment,
            RefKind::Release => EntityKind::Release,
            RefKind::Url => EntityKind::Url,
        };
        push(kind, &r.value, &mut out);
    }

    // 2. The reported actor is a person entity
    if let Some(actor) = &event.actor {
        push(EntityKind::Person, &actor.login, &mut out);
    }

    // 3. Pattern extraction over title + body
    let text = format!("{} {}", event.title, event.body);

    // Emails before mentions so `a@b.com` is not half-captured as a mention.
    for m in email_regex().find_iter(&text) {
        push(EntityKind::Email, m.as_str(), &mut out);
    }
    for caps in ticket_regex().captures_iter(&text) {
        push(EntityKind::Ticket, &caps[1], &mut out);
    }
    for caps in mention_regex().captures_iter(&text) {
        let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
        // Skip the domain half of an email address
        if start > 0 && text.as_bytes()[start - 1].is_ascii_alphanumeric() {
            continue;
        }
        push(EntityKind::Person, &caps[1], &mut out);
    }
    for caps in issue_ref_regex().captures_iter(&text) {
        push(EntityKind::Issue, &caps[1], &mut out);
    }
    for m in url_regex().find_iter(&text) {
        push(EntityKind::Url, m.as_str(), &mut out);
    }
    for caps in repo_regex().captures_iter(&text) {
        let Some(m) = caps.get(1) else { continue };
        // URL hosts and paths match the slug shape; skip anything that sits
        // inside an already-captured URL.
        if text[..m.start()].ends_with("//") || text[..m.start()].ends_with('.') {
            continue;
        }
        if out
            .iter()
            .any(|e| e.kind == EntityKind::Url && e.value.contains(m.as_str()))
        {
            continue;
        }
        push(EntityKind::Repo, m.as_str(), &mut out);
    }
    for caps in sha_regex().captures_iter(&text) {
        let value = &caps[1];
        // Plain numbers match the hex class; require at least one letter
        if value.bytes().any(|b| b.is_ascii_alphabetic()) {
            push(EntityKind::Commit, value, &mut out);
        }
    }

    out
}
