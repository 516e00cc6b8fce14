//! Candidate reranking.
//!
//! [`RerankBackend`] is a tagged set of strategies sharing one contract:
//! score the merged candidates, threshold-filter, truncate. All variants
//! run the same post-processing, which carries the minimum-results
//! guarantee — when the threshold would leave fewer than `min_results`
//! hits (and any candidates existed), the threshold is discarded and the
//! top raw-scored candidates are returned with `fallback: true`.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::RerankConfig;

/// One candidate entering rerank: the merged path score plus the text the
/// cross-scorers look at.
#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub observation_id: i64,
    /// Best per-path score from the merge, 0..1.
    pub raw_score: f64,
    pub title: String,
    pub content: String,
}

/// Rerank tuning for one call.
#[derive(Debug, Clone, Copy)]
pub struct RerankOptions {
    pub top_k: usize,
    pub threshold: f64,
    pub min_results: usize,
}

/// Final ranking plus the accounting the response surfaces.
#[derive(Debug)]
pub struct Reranked {
    /// `(observation_id, final_score)` in descending score order.
    pub results: Vec<(i64, f64)>,
    /// Candidates dropped by the threshold.
    pub filtered: usize,
    /// True when the minimum-results fallback bypassed the threshold.
    pub fallback: bool,
}

/// Rerank strategies. Fast mode uses `Passthrough`; balanced uses the local
/// lexical cross-scorer; thorough uses the remote cross-encoder when an
/// endpoint is configured and falls back to lexical otherwise.
pub enum RerankBackend {
    Passthrough,
    Lexical,
    Remote {
        endpoint: String,
        client: reqwest::Client,
        timeout: Duration,
    },
}

impl RerankBackend {
    /// Strategy and threshold for a search mode.
    pub fn for_mode(mode: crate::search::SearchMode, config: &RerankConfig) -> (Self, f64) {
        use crate::search::SearchMode;
        match mode {
            SearchMode::Fast => (Self::Passthrough, 0.0),
            SearchMode::Balanced => (Self::Lexical, config.balanced_threshold),
            SearchMode::Thorough => {
                let backend = if config.endpoint.is_empty() {
                    Self::Lexical
                } else {
                    Self::Remote {
                        endpoint: config.endpoint.clone(),
                        client: reqwest::Client::new(),
                        timeout: Duration::from_millis(config.timeout_ms),
                    }
                };
                (backend, config.thorough_threshold)
            }
        }
    }

    /// Score and rank `candidates` for `query`.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
        opts: RerankOptions,
    ) -> Reranked {
        let scored = match self {
            Self::Passthrough => candidates
                .iter()
                .map(|c| (c.observation_id, c.raw_score))
                .collect(),
            Self::Lexical => lexical_scores(query, &candidates),
            Self::Remote {
                endpoint,
                client,
                timeout,
            } => match remote_scores(client, endpoint, *timeout, query, &candidates).await {
                Ok(scores) => scores,
                Err(e) => {
                    warn!(error = %e, "remote reranker failed; falling back to lexical scoring");
                    lexical_scores(query, &candidates)
                }
            },
        };
        finish_ranking(scored, opts)
    }
}

/// Shared post-processing: sort, threshold, truncate, and apply the
/// minimum-results guarantee.
fn finish_ranking(mut scored: Vec<(i64, f64)>, opts: RerankOptions) -> Reranked {
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let passing = scored.iter().filter(|(_, s)| *s >= opts.threshold).count();
    let filtered = scored.len() - passing;

    if passing < opts.min_results && !scored.is_empty() {
        // Threshold bypass: never return fewer than min(top_k, min_results)
        // results while candidates exist.
        let keep = opts.top_k.min(opts.min_results).min(scored.len());
        scored.truncate(keep);
        return Reranked {
            results: scored,
            filtered,
            fallback: true,
        };
    }

    let results: Vec<(i64, f64)> = scored
        .into_iter()
        .filter(|(_, s)| *s >= opts.threshold)
        .take(opts.top_k)
        .collect();
    Reranked {
        results,
        filtered,
        fallback: false,
    }
}

/// Local cross-scorer: blend the raw path score with query-term coverage of
/// the candidate's text. Cheap, deterministic, no network.
fn lexical_scores(query: &str, candidates: &[RerankCandidate]) -> Vec<(i64, f64)> {
    let terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .filter(|t| t.len() >= 3)
        .map(String::from)
        .collect();

    candidates
        .iter()
        .map(|c| {
            let overlap = if terms.is_empty() {
                0.0
            } else {
                let text = format!("{} {}", c.title, c.content).to_lowercase();
                let hit = terms.iter().filter(|t| text.contains(t.as_str())).count();
                hit as f64 / terms.len() as f64
            };
            (c.observation_id, 0.5 * c.raw_score + 0.5 * overlap)
        })
        .collect()
}

#[derive(Serialize)]
struct RemoteRequest<'a> {
    query: &'a str,
    documents: Vec<String>,
    top_n: usize,
}

#[derive(Deserialize)]
struct RemoteResponse {
    results: Vec<RemoteResult>,
}

#[derive(Deserialize)]
struct RemoteResult {
    index: usize,
    relevance_score: f64,
}

/// Cross-encoder scoring over HTTP. Request/response shapes follow the
/// common rerank-API convention: documents in, (index, relevance_score) out.
async fn remote_scores(
    client: &reqwest::Client,
    endpoint: &str,
    timeout: Duration,
    query: &str,
    candidates: &[RerankCandidate],
) -> Result<Vec<(i64, f64)>> {
    let request = RemoteRequest {
        query,
        documents: candidates
            .iter()
            .map(|c| format!("{}\n{}", c.title, c.content))
            .collect(),
        top_n: candidates.len(),
    };

    let response: RemoteResponse = client
        .post(endpoint)
        .timeout(timeout)
        .json(&request)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let mut scored = Vec::with_capacity(candidates.len());
    for r in response.results {
        let Some(candidate) = candidates.get(r.index) else {
            anyhow::bail!("reranker returned out-of-range index {}", r.index);
        };
        scored.push((candidate.observation_id, r.relevance_score));
    }
    anyhow::ensure!(
        scored.len() == candidates.len(),
        "reranker scored {} of {} documents",
        scored.len(),
        candidates.len()
    );
    Ok(scored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: i64, raw: f64, title: &str) -> RerankCandidate {
        RerankCandidate {
            observation_id: id,
            raw_score: raw,
            title: title.into(),
            content: String::new(),
        }
    }

    fn opts(top_k: usize, threshold: f64, min_results: usize) -> RerankOptions {
        RerankOptions {
            top_k,
            threshold,
            min_results,
        }
    }

    #[tokio::test]
    async fn passthrough_keeps_raw_order() {
        let reranked = RerankBackend::Passthrough
            .rerank(
                "anything",
                vec![candidate(1, 0.2, "a"), candidate(2, 0.9, "b")],
                opts(10, 0.0, 3),
            )
            .await;
        assert_eq!(reranked.results[0].0, 2);
        assert_eq!(reranked.filtered, 0);
        assert!(!reranked.fallback);
    }

    #[tokio::test]
    async fn threshold_filters_and_reports() {
        let reranked = RerankBackend::Passthrough
            .rerank(
                "q",
                vec![
                    candidate(1, 0.9, "a"),
                    candidate(2, 0.8, "b"),
                    candidate(3, 0.7, "c"),
                    candidate(4, 0.1, "d"),
                ],
                opts(10, 0.5, 3),
            )
            .await;
        assert_eq!(reranked.results.len(), 3);
        assert_eq!(reranked.filtered, 1);
        assert!(!reranked.fallback);
    }

    #[tokio::test]
    async fn strict_threshold_triggers_min_results_fallback() {
        let reranked = RerankBackend::Passthrough
            .rerank(
                "q",
                vec![
                    candidate(1, 0.4, "a"),
                    candidate(2, 0.3, "b"),
                    candidate(3, 0.2, "c"),
                    candidate(4, 0.1, "d"),
                ],
                opts(10, 0.95, 3),
            )
            .await;
        // Nothing passes 0.95, but three candidates come back anyway.
        assert!(reranked.fallback);
        assert_eq!(reranked.results.len(), 3);
        assert_eq!(reranked.results[0].0, 1);
        assert_eq!(reranked.filtered, 4);
    }

    #[tokio::test]
    async fn fallback_respects_candidate_count() {
        let reranked = RerankBackend::Passthrough
            .rerank("q", vec![candidate(1, 0.1, "a")], opts(10, 0.9, 3))
            .await;
        assert!(reranked.fallback);
        assert_eq!(reranked.results.len(), 1);
    }

    #[tokio::test]
    async fn empty_candidates_stay_empty() {
        let reranked = RerankBackend::Passthrough
            .rerank("q", vec![], opts(10, 0.9, 3))
            .await;
        assert!(reranked.results.is_empty());
        assert!(!reranked.fallback);
    }

    #[tokio::test]
    async fn lexical_rewards_term_coverage() {
        let reranked = RerankBackend::Lexical
            .rerank(
                "auth login timeout",
                vec![
                    candidate(1, 0.5, "Fixed the auth login timeout"),
                    candidate(2, 0.5, "Bumped marketing fonts"),
                ],
                opts(10, 0.0, 1),
            )
            .await;
        assert_eq!(reranked.results[0].0, 1);
        assert!(reranked.results[0].1 > reranked.results[1].1);
    }

    #[test]
    fn mode_selection_honors_endpoint() {
        let config = RerankConfig::default();
        let (backend, threshold) =
            RerankBackend::for_mode(crate::search::SearchMode::Fast, &config);
        assert!(matches!(backend, RerankBackend::Passthrough));
        assert_eq!(threshold, 0.0);

        let (backend, _) = RerankBackend::for_mode(crate::search::SearchMode::Thorough, &config);
        assert!(matches!(backend, RerankBackend::Lexical));

        let config = RerankConfig {
            endpoint: "https://rerank.example.com/v1".into(),
            ..RerankConfig::default()
        };
        let (backend, threshold) =
            RerankBackend::for_mode(crate::search::SearchMode::Thorough, &config);
        assert!(matches!(backend, RerankBackend::Remote { .. }));
        assert_eq!(threshold, config.thorough_threshold);
    }
}
