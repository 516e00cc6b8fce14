pub mod capture;
pub mod search;
pub mod stats;

use std::path::Path;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tokio::io::AsyncWriteExt;

use crate::config::MnemaConfig;
use crate::db::{self, migrations};

/// Fetch the embedding model and tokenizer named in the config, then pin the
/// model identifier in the database so stored vectors and the runtime model
/// cannot drift apart silently.
pub async fn model_download(config: &MnemaConfig) -> Result<()> {
    let model = &config.embedding.model;
    let cache_dir = crate::config::expand_tilde(&config.embedding.cache_dir);
    std::fs::create_dir_all(&cache_dir)
        .with_context(|| format!("failed to create cache dir: {}", cache_dir.display()))?;

    let base = format!("https://huggingface.co/sentence-transformers/{model}/resolve/main");
    let client = reqwest::Client::new();

    for (remote, local, note) in [
        (format!("{base}/onnx/model.onnx"), "model.onnx", " (~90MB)"),
        (format!("{base}/tokenizer.json"), "tokenizer.json", ""),
    ] {
        let dest = cache_dir.join(local);
        if dest.exists() {
            println!("{local} already present at {}", dest.display());
            continue;
        }
        println!("Fetching {local}{note}...");
        download_file(&client, &remote, &dest).await?;
        println!("Saved {}", dest.display());
    }

    pin_model(config)?;
    println!("Embedding model '{model}' ready.");
    Ok(())
}

/// Pin the configured model in an existing database. A database that has
/// never been opened records its pin on first open instead.
fn pin_model(config: &MnemaConfig) -> Result<()> {
    let db_path = config.resolved_db_path();
    if !db_path.exists() {
        return Ok(());
    }
    let conn = db::open_database(&db_path)?;
    record_model_pin(&conn, &config.embedding.model)
}

/// Record the model identifier, refusing to repoint a database whose vectors
/// were built by a different model. Mixed-model KNN distances are meaningless.
fn record_model_pin(conn: &Connection, configured: &str) -> Result<()> {
    match migrations::get_embedding_model(conn)? {
        None => {
            migrations::set_embedding_model(conn, configured)?;
            Ok(())
        }
        Some(stored) if stored == configured => Ok(()),
        Some(stored) => bail!(
            "database vectors were embedded with '{stored}' but the config names \
             '{configured}'; re-embed the database or change embedding.model"
        ),
    }
}

/// Stream a download to `dest` with a progress bar, writing through a temp
/// file so an interrupted fetch never leaves a partial model behind.
async fn download_file(client: &reqwest::Client, url: &str, dest: &Path) -> Result<()> {
    let mut response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("request failed for {url}"))?
        .error_for_status()
        .with_context(|| format!("download rejected for {url}"))?;

    let pb = match response.content_length() {
        Some(size) => {
            let pb = ProgressBar::new(size);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {bytes}/{total_bytes} {wide_bar:.green} {eta}")
                    .expect("valid template")
                    .progress_chars("=> "),
            );
            pb
        }
        None => ProgressBar::new_spinner(),
    };

    let tmp_path = dest.with_extension("partial");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    while let Some(chunk) = response.chunk().await.context("error reading response")? {
        file.write_all(&chunk).await.context("error writing chunk")?;
        pb.inc(chunk.len() as u64);
    }
    file.flush().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, dest)
        .await
        .context("failed to move download into place")?;
    pb.finish_and_clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_pin_guards_against_mismatch() {
        let conn = crate::db::open_memory_database().unwrap();

        // Fresh databases are pinned by the migration.
        assert!(record_model_pin(&conn, "all-MiniLM-L6-v2").is_ok());
        assert!(record_model_pin(&conn, "all-mpnet-base-v2").is_err());

        // An unpinned database adopts the configured model.
        conn.execute("DELETE FROM schema_meta WHERE key = 'embedding_model'", [])
            .unwrap();
        record_model_pin(&conn, "all-mpnet-base-v2").unwrap();
        assert_eq!(
            migrations::get_embedding_model(&conn).unwrap().as_deref(),
            Some("all-mpnet-base-v2")
        );
    }
}
