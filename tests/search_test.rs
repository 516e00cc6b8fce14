mod helpers;

use mnema::config::MnemaConfig;
use mnema::search::{SearchFilters, SearchMode, SearchRequest};

fn request(query: &str, mode: SearchMode) -> SearchRequest {
    SearchRequest {
        query: query.into(),
        limit: None,
        offset: 0,
        mode,
        filters: SearchFilters::default(),
    }
}

async fn seed(stack: &helpers::TestStack) {
    for (id, title, body) in [
        (
            "pr-1",
            "Fix auth login timeout on session refresh",
            "The oauth token refresh in MEM-204 raced the session store. \
             Serialized the refresh path per session.",
        ),
        (
            "pr-2",
            "Harden auth token rotation",
            "Rotation now revokes the previous session token. Follow-up to MEM-204.",
        ),
        (
            "pr-3",
            "Rewrite marketing landing page hero banner",
            "Swapped hero imagery and updated typography scale.",
        ),
    ] {
        let event = helpers::with_actor(
            helpers::event(id, title, body),
            "mkowalski",
            "Maria Kowalski",
        );
        stack.pipeline.capture("acme", event).await.unwrap();
    }
}

#[tokio::test]
async fn all_four_paths_run_and_find_the_relevant_observation() {
    let stack = helpers::stack();
    seed(&stack).await;

    let response = stack
        .searcher
        .search("acme", request("auth login timeout MEM-204", SearchMode::Balanced))
        .await
        .unwrap();

    // Clusters and actors exist, so every path executes.
    assert_eq!(
        response.meta.paths,
        vec!["vector", "entity", "cluster", "actor"]
    );
    assert!(!response.data.is_empty());
    assert!(
        response.data[0].title.contains("auth"),
        "expected an auth result first, got '{}'",
        response.data[0].title
    );
    assert!(!response.data[0].paths.is_empty());

    // The parallel-phase bottleneck is the max of the path latencies, and
    // the whole request takes at least that long.
    let l = &response.latency;
    let max = l
        .vector_ms
        .max(l.entity_ms)
        .max(l.cluster_ms)
        .max(l.actor_ms);
    assert_eq!(l.max_parallel_ms, max);
    assert!(l.total_ms >= l.max_parallel_ms);
}

#[tokio::test]
async fn skipped_paths_report_exactly_zero_latency() {
    let stack = helpers::stack();
    // One discarded event: the workspace exists but holds no clusters and
    // no actors, so those paths must be skipped outright.
    stack
        .pipeline
        .capture(
            "acme",
            helpers::typed_event(
                "push-1",
                "push",
                "chore: bump dependency versions",
                "",
                helpers::base_time(),
            ),
        )
        .await
        .unwrap();

    let response = stack
        .searcher
        .search("acme", request("anything at all", SearchMode::Fast))
        .await
        .unwrap();

    assert_eq!(response.meta.paths, vec!["vector", "entity"]);
    assert_eq!(response.latency.cluster_ms, 0);
    assert_eq!(response.latency.actor_ms, 0);
    assert!(response.data.is_empty());
}

#[tokio::test]
async fn unknown_workspace_returns_an_empty_set() {
    let stack = helpers::stack();
    let response = stack
        .searcher
        .search("nonexistent", request("auth", SearchMode::Balanced))
        .await
        .unwrap();
    assert_eq!(response.meta.total, 0);
    assert!(response.data.is_empty());
    assert!(response.meta.paths.is_empty());
}

#[tokio::test]
async fn strict_threshold_falls_back_to_minimum_results() {
    let mut config = MnemaConfig::default();
    config.rerank.balanced_threshold = 0.99;
    let stack = helpers::stack_with(config);
    seed(&stack).await;

    // Off-topic query: nothing clears 0.99, but KNN still yields candidates,
    // so the minimum-results guarantee kicks in.
    let response = stack
        .searcher
        .search(
            "acme",
            request("quarterly forecast spreadsheet", SearchMode::Balanced),
        )
        .await
        .unwrap();

    assert!(response.meta.fallback);
    assert!(!response.data.is_empty());
    assert!(response.data.len() <= stack.config.rerank.min_results);
}

#[tokio::test]
async fn filters_narrow_the_result_set() {
    let stack = helpers::stack();
    seed(&stack).await;

    let mut req = request("auth session token", SearchMode::Fast);
    req.filters.observation_types = vec!["deployment".into()];
    let response = stack.searcher.search("acme", req).await.unwrap();
    assert!(
        response.data.is_empty(),
        "no deployments were captured, filter must drop everything"
    );

    let mut req = request("auth session token", SearchMode::Fast);
    req.filters.observation_types = vec!["code-change".into()];
    let response = stack.searcher.search("acme", req).await.unwrap();
    assert!(!response.data.is_empty());
}

#[tokio::test]
async fn pagination_slices_the_ranked_list() {
    let stack = helpers::stack();
    seed(&stack).await;

    let mut req = request("auth session token refresh", SearchMode::Fast);
    req.limit = Some(1);
    let first_page = stack.searcher.search("acme", req).await.unwrap();
    assert_eq!(first_page.data.len(), 1);
    assert!(first_page.meta.total >= 2);

    let mut req = request("auth session token refresh", SearchMode::Fast);
    req.limit = Some(1);
    req.offset = 1;
    let second_page = stack.searcher.search("acme", req).await.unwrap();
    assert_eq!(second_page.data.len(), 1);
    assert_ne!(second_page.data[0].id, first_page.data[0].id);
}
