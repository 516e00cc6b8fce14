//! Significance gate and observation classifier.
//!
//! [`evaluate`] is the cheap, pure front of the capture pipeline: it scores
//! an event 0-100, names its observation type, and tags topics. No I/O, no
//! allocation beyond the result. Events scoring below the configured floor
//! never reach embedding or storage.

use serde::{Deserialize, Serialize};

use crate::config::GateConfig;
use crate::event::{RefKind, SourceEvent};

/// The observation type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObservationType {
    CommitActivity,
    CodeReview,
    CodeChange,
    IssueActivity,
    Deployment,
    Incident,
    Release,
    Discussion,
    /// Generic fallback; classification never fails.
    Activity,
}

impl ObservationType {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommitActivity => "commit-activity",
            Self::CodeReview => "code-review",
            Self::CodeChange => "code-change",
            Self::IssueActivity => "issue-activity",
            Self::Deployment => "deployment",
            Self::Incident => "incident",
            Self::Release => "release",
            Self::Discussion => "discussion",
            Self::Activity => "activity",
        }
    }
}

impl std::fmt::Display for ObservationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObservationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit-activity" => Ok(Self::CommitActivity),
            "code-review" => Ok(Self::CodeReview),
            "code-change" => Ok(Self::CodeChange),
            "issue-activity" => Ok(Self::IssueActivity),
            "deployment" => Ok(Self::Deployment),
            "incident" => Ok(Self::Incident),
            "release" => Ok(Self::Release),
            "discussion" => Ok(Self::Discussion),
            "activity" => Ok(Self::Activity),
            _ => Err(format!("unknown observation type: {s}")),
        }
    }
}

/// Result of gating one event.
#[derive(Debug, Clone)]
pub struct Gating {
    /// 0-100. Compare against `GateConfig::significance_floor`.
    pub significance: u8,
    pub observation_type: ObservationType,
    /// Lowercase topic tags, deduplicated, in lexicon order.
    pub topics: Vec<String>,
}

impl Gating {
    pub fn passes(&self, config: &GateConfig) -> bool {
        self.significance >= config.significance_floor
    }
}

/// Base significance by source event family. Unlisted types land on
/// [`NEUTRAL_BASE`].
const BASE_SCORES: &[(&str, i32)] = &[
    ("incident", 85),
    ("deployment.failed", 80),
    ("release", 75),
    ("pull_request.merged", 70),
    ("deployment.succeeded", 60),
    ("pull_request.opened", 55),
    ("issue.closed", 55),
    ("deployment", 55),
    ("pull_request_review", 50),
    ("issue.opened", 50),
    ("pull_request", 50),
    ("issue", 45),
    ("discussion", 35),
    ("comment", 35),
    ("push", 30),
];

const NEUTRAL_BASE: i32 = 45;

const SEVERITY_TERMS: &[&str] = &[
    "fail", "error", "outage", "critical", "urgent", "broken", "down", "regression",
];

const FIX_TERMS: &[&str] = &["fix", "resolve", "patch", "hotfix"];

/// Topic lexicon. First match per topic wins; order is presentation order.
const TOPIC_LEXICON: &[(&str, &[&str])] = &[
    ("auth", &["auth", "login", "oauth", "session", "token"]),
    ("database", &["database", "sql", "migration", "schema", "postgres", "sqlite"]),
    ("api", &["api", "endpoint", "route", "graphql"]),
    ("frontend", &["frontend", "ui", "css", "component", "layout"]),
    ("testing", &["test", "coverage", "flaky", "ci pipeline"]),
    ("performance", &["performance", "latency", "slow", "optimiz", "memory leak"]),
    ("security", &["security", "vulnerability", "cve", "xss", "injection"]),
    ("infrastructure", &["docker", "kubernetes", "terraform", "infra", "dns"]),
    ("documentation", &["docs", "documentation", "readme", "changelog"]),
    ("deployment", &["deploy", "rollout", "rollback", "production"]),
];

/// Score, classify, and tag one event. Deterministic; the floor is applied
/// by the caller via [`Gating::passes`].
pub fn evaluate(event: &SourceEvent) -> Gating {
    let text = lowercase_text(event);

    // 1. Base score by source type family
    let mut score = base_score(&event.source_type);

    // 2. Bounded content boosts
    if SEVERITY_TERMS.iter().any(|t| text.contains(t)) {
        score += 15;
    }
    if FIX_TERMS.iter().any(|t| text.contains(t)) {
        score += 8;
    }
    score += (event.references.len() as i32 * 2).min(10);
    if event.body.len() >= 500 {
        score += 5;
    }
    if event.actor.is_some() {
        score += 2;
    }

    let significance = score.clamp(0, 100) as u8;

    // 3. Classify
    let observation_type = classify(&event.source_type, &text);

    // 4. Topics
    let topics = extract_topics(&text, &event.references);

    Gating {
        significance,
        observation_type,
        topics,
    }
}

fn lowercase_text(event: &SourceEvent) -> String {
    let mut text = String::with_capacity(event.title.len() + event.body.len() + 1);
    text.push_str(&event.title.to_lowercase());
    text.push(' ');
    text.push_str(&event.body.to_lowercase());
    text
}

fn base_score(source_type: &str) -> i32 {
    // Exact entries first, then the dotted family prefix.
    for (pattern, score) in BASE_SCORES {
        if source_type == *pattern {
            return *score;
        }
    }
    let family = source_type.split('.').next().unwrap_or(source_type);
    for (pattern, score) in BASE_SCORES {
        if family == *pattern {
            return *score;
        }
    }
    NEUTRAL_BASE
}

fn classify(source_type: &str, text: &str) -> ObservationType {
    let family = source_type.split('.').next().unwrap_or(source_type);
    match family {
        "push" | "commit" => return ObservationType::CommitActivity,
        "pull_request_review" | "review" => return ObservationType::CodeReview,
        "pull_request" => return ObservationType::CodeChange,
        "issue" => return ObservationType::IssueActivity,
        "deployment" => return ObservationType::Deployment,
        "incident" | "alert" => return ObservationType::Incident,
        "release" => return ObservationType::Release,
        "discussion" | "comment" | "message" => return ObservationType::Discussion,
        _ => {}
    }

    // Unknown family: fall back to content keywords.
    if text.contains("outage") || text.contains("incident") {
        ObservationType::Incident
    } else if text.contains("deploy") {
        ObservationType::Deployment
    } else if text.contains("review") {
        ObservationType::CodeReview
    } else if text.contains("release") {
        ObservationType::Release
    } else {
        ObservationType::Activity
    }
}

fn extract_topics(text: &str, references: &[crate::event::EventRef]) -> Vec<String> {
    let mut topics = Vec::new();
    for (topic, terms) in TOPIC_LEXICON {
        if terms.iter().any(|t| text.contains(t)) {
            topics.push(topic.to_string());
        }
    }
    if references.iter().any(|r| r.kind == RefKind::Deployment)
        && !topics.iter().any(|t| t == "deployment")
    {
        topics.push("deployment".to_string());
    }
    topics
}
