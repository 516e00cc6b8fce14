//! Normalized source event model.
//!
//! Defines [`SourceEvent`] (the inbound shape every connector reduces to),
//! [`EventActor`] (raw actor hints used by identity resolution), and
//! [`EventRef`]/[`RefKind`] (typed references carried alongside free text).
//! Events arrive pre-validated upstream but are re-checked and re-truncated
//! here because this crate is the last stop before durable storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hard cap on event titles, in characters.
pub const MAX_TITLE_CHARS: usize = 200;
/// Hard cap on event bodies, in characters.
pub const MAX_BODY_CHARS: usize = 50_000;

/// One normalized event from an external source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEvent {
    /// Originating system, e.g. `"github"` or `"vercel"`.
    pub source: String,
    /// Dotted event name within the source, e.g. `"pull_request.merged"`.
    pub source_type: String,
    /// Source-unique identifier; the idempotency key together with `source`.
    pub source_id: String,
    /// Short human-readable headline.
    pub title: String,
    /// Full event text. May be empty for terse events (pushes, deploys).
    #[serde(default)]
    pub body: String,
    /// Raw actor hints, if the source attributes the event to a person.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<EventActor>,
    /// When the event happened at the source (not when we received it).
    pub occurred_at: DateTime<Utc>,
    /// Typed references extracted by the connector, in source order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<EventRef>,
    /// Source-specific extras, passed through opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Actor hints as the source reported them. Resolution into a canonical
/// identity happens later; these fields are evidence, not truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventActor {
    /// Login/username at the source, e.g. a GitHub handle.
    pub login: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// A typed reference attached to an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub kind: RefKind,
    pub value: String,
}

/// The reference kinds connectors emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefKind {
    Commit,
    Branch,
    PullRequest,
    Issue,
    Deployment,
    Release,
    Url,
}

impl RefKind {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Branch => "branch",
            Self::PullRequest => "pull-request",
            Self::Issue => "issue",
            Self::Deployment => "deployment",
            Self::Release => "release",
            Self::Url => "url",
        }
    }
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RefKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Self::Commit),
            "branch" => Ok(Self::Branch),
            "pull-request" => Ok(Self::PullRequest),
            "issue" => Ok(Self::Issue),
            "deployment" => Ok(Self::Deployment),
            "release" => Ok(Self::Release),
            "url" => Ok(Self::Url),
            _ => Err(format!("unknown reference kind: {s}")),
        }
    }
}

impl SourceEvent {
    /// Re-apply the size limits the connectors are supposed to enforce.
    /// Truncation lands on a clean char boundary.
    pub fn normalize(&mut self) {
        self.title = truncate_chars(&self.title, MAX_TITLE_CHARS);
        self.body = truncate_chars(&self.body, MAX_BODY_CHARS);
    }

    /// Check the fields capture cannot proceed without. Returns the first
    /// problem found, phrased for the rejection message.
    pub fn validate(&self) -> Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("source must not be empty".into());
        }
        if self.source_type.trim().is_empty() {
            return Err("source_type must not be empty".into());
        }
        if self.source_id.trim().is_empty() {
            return Err("source_id must not be empty".into());
        }
        if self.title.trim().is_empty() {
            return Err("title must not be empty".into());
        }
        if let Some(actor) = &self.actor {
            if actor.login.trim().is_empty() {
                return Err("actor.login must not be empty when actor is present".into());
            }
        }
        Ok(())
    }
}

fn truncate_chars(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        content.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> SourceEvent {
        SourceEvent {
            source: "github".into(),
            source_type: "pull_request.merged".into(),
            source_id: "pr-4821".into(),
            title: "Merge feature branch".into(),
            body: "Adds retry logic to the sync worker".into(),
            actor: Some(EventActor {
                login: "mkowalski".into(),
                display_name: Some("Maria Kowalski".into()),
                email: Some("maria@example.com".into()),
                avatar_url: None,
            }),
            occurred_at: Utc::now(),
            references: vec![EventRef {
                kind: RefKind::PullRequest,
                value: "4821".into(),
            }],
            metadata: None,
        }
    }

    #[test]
    fn valid_event_passes() {
        assert!(sample_event().validate().is_ok());
    }

    #[test]
    fn empty_source_id_rejected() {
        let mut event = sample_event();
        event.source_id = "  ".into();
        let err = event.validate().unwrap_err();
        assert!(err.contains("source_id"));
    }

    #[test]
    fn actor_without_login_rejected() {
        let mut event = sample_event();
        event.actor = Some(EventActor {
            login: String::new(),
            display_name: None,
            email: None,
            avatar_url: None,
        });
        assert!(event.validate().is_err());
    }

    #[test]
    fn normalize_truncates_on_char_boundary() {
        let mut event = sample_event();
        event.title = "é".repeat(MAX_TITLE_CHARS + 50);
        event.body = "x".repeat(MAX_BODY_CHARS + 1);
        event.normalize();
        assert_eq!(event.title.chars().count(), MAX_TITLE_CHARS);
        assert_eq!(event.body.len(), MAX_BODY_CHARS);
    }

    #[test]
    fn ref_kind_round_trips() {
        for kind in [
            RefKind::Commit,
            RefKind::Branch,
            RefKind::PullRequest,
            RefKind::Issue,
            RefKind::Deployment,
            RefKind::Release,
            RefKind::Url,
        ] {
            let parsed: RefKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("pull_request".parse::<RefKind>().is_err());
    }

    #[test]
    fn deserializes_minimal_payload() {
        let json = r#"{
            "source": "vercel",
            "source_type": "deployment.succeeded",
            "source_id": "dpl_91",
            "title": "Deployed web to production",
            "occurred_at": "2026-08-01T12:30:00Z"
        }"#;
        let event: SourceEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.body, "");
        assert!(event.actor.is_none());
        assert!(event.references.is_empty());
    }
}
