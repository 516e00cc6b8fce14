use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::capability::CapabilityIndex;
use crate::config::MnemaConfig;
use crate::search::{SearchFilters, SearchMode, SearchRequest, Searcher};
use crate::vector::SqliteVectorStore;

pub fn parse_mode(raw: &str) -> Result<SearchMode> {
    match raw {
        "fast" => Ok(SearchMode::Fast),
        "balanced" => Ok(SearchMode::Balanced),
        "thorough" => Ok(SearchMode::Thorough),
        other => anyhow::bail!("unknown mode '{other}' (expected fast, balanced, or thorough)"),
    }
}

/// Run a search from the terminal.
pub async fn search(
    config: MnemaConfig,
    workspace: &str,
    query: &str,
    mode: SearchMode,
    limit: Option<usize>,
) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = crate::db::open_database(&db_path)?;
    let db = Arc::new(Mutex::new(conn));
    let vectors: Arc<dyn crate::vector::VectorStore> =
        Arc::new(SqliteVectorStore::new(db.clone()));
    let embedder: Arc<dyn crate::embedding::EmbeddingProvider> =
        Arc::from(crate::embedding::create_provider(&config.embedding)?);
    let capabilities = Arc::new(CapabilityIndex::new(db.clone()));
    let searcher = Searcher::new(Arc::new(config), db, embedder, vectors, capabilities);

    let response = searcher
        .search(
            workspace,
            SearchRequest {
                query: query.to_string(),
                limit,
                offset: 0,
                mode,
                filters: SearchFilters::default(),
            },
        )
        .await?;

    if response.data.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!(
        "Found {} result(s) in {}ms (mode: {}, paths: {})\n",
        response.meta.total,
        response.meta.took_ms,
        response.meta.mode,
        response.meta.paths.join("+"),
    );
    if response.meta.fallback {
        println!("  (relevance threshold relaxed to honor the minimum result count)\n");
    }

    for (i, result) in response.data.iter().enumerate() {
        println!(
            "  {}. [{}] {} (score: {:.4}, via {})",
            i + 1,
            result.observation_type,
            result.title,
            result.score,
            result.paths.join("+"),
        );
        println!("     {} | {} | {}", result.id, result.occurred_at, result.source);
        if let Some(actor) = &result.actor {
            println!("     actor: {actor}");
        }
        println!("     {}", result.snippet.replace('\n', " "));
        println!();
    }

    Ok(())
}
